#[derive(Clone, Debug)]
pub struct Config {
    /// Queue hot routines for recompilation with the full-graph pipeline on a background thread.
    pub enable_optimized_tier: bool,

    /// Call optimized callees directly instead of returning to the driver.
    pub enable_direct_calls: bool,

    /// Graphs with at most this many blocks use the exhaustive liveness analysis.
    pub exhaustive_liveness_limit: usize,

    pub max_ops_per_block: usize,
    pub max_graph_blocks: usize,

    /// A routine with `n` guest operations is queued for promotion after
    /// `promote_op_budget / n` uses.
    pub promote_op_budget: u64,

    /// Maximum nesting of direct calls between compiled routines on a single thread.
    pub max_direct_call_depth: u32,

    /// Number of operations the driver lets a thread execute before polling its control state.
    pub fuel_quantum: u64,

    /// Run the Cranelift verifier on every emitted function.
    pub enable_verifier: bool,
}

impl Config {
    /// Returns the default configuration with overrides from `GLACIER_*` environment variables
    /// applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if std::env::var_os("GLACIER_DISABLE_OPTIMIZED_TIER").is_some() {
            config.enable_optimized_tier = false;
        }
        if std::env::var_os("GLACIER_DISABLE_DIRECT_CALLS").is_some() {
            config.enable_direct_calls = false;
        }
        if std::env::var_os("GLACIER_ENABLE_JIT_VERIFIER").is_some() {
            config.enable_verifier = true;
        }

        let parse = |name: &str| std::env::var(name).ok().and_then(|x| x.parse::<u64>().ok());
        if let Some(value) = parse("GLACIER_EXHAUSTIVE_LIVENESS_LIMIT") {
            config.exhaustive_liveness_limit = value as usize;
        }
        if let Some(value) = parse("GLACIER_MAX_GRAPH_BLOCKS") {
            config.max_graph_blocks = value.max(1) as usize;
        }
        if let Some(value) = parse("GLACIER_PROMOTE_OP_BUDGET") {
            config.promote_op_budget = value;
        }

        config
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enable_optimized_tier: true,
            enable_direct_calls: true,
            exhaustive_liveness_limit: 40,
            max_ops_per_block: 128,
            max_graph_blocks: 512,
            promote_op_budget: 4096,
            max_direct_call_depth: 64,
            fuel_quantum: 0x10000,
            enable_verifier: false,
        }
    }
}
