pub mod a64;
mod debug;
pub mod runtime;
mod translate;


use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use cranelift::prelude::*;
use cranelift_codegen::Context as CodeContext;
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{FuncId, Linkage, Module, ModuleError, ModuleResult};

use glacier_cpu::{
    graph::TranslateError,
    regs::{RegKind, Register},
    Config, ExecutionMode, Graph, Liveness, ThreadState,
};

pub use crate::translate::{CodegenFn, CodegenTable, EmitterContext};

/// The generic entry point of a compiled routine: loads the routine's parameters from the register
/// file then runs the body. Returns the next guest address, `0` to stop, or
/// [glacier_cpu::PAUSED_ADDR].
pub type EntryFn = unsafe extern "C" fn(*mut ThreadState) -> u64;

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tier {
    /// Single block, fast liveness, no backend optimizations.
    Fast,

    /// Full graph, exhaustive liveness (for small graphs), optimized by the backend.
    Optimized,
}

impl Tier {
    fn opt_level(self) -> &'static str {
        match self {
            Self::Fast => "none",
            Self::Optimized => "speed",
        }
    }
}

/// A call to another routine's body that was emitted into a routine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectCall {
    pub target: u64,

    /// The registers passed to the callee, in parameter order.
    pub args: Vec<Register>,
}

pub struct CompiledRoutine {
    pub address: u64,
    pub mode: ExecutionMode,
    pub tier: Tier,

    entry: EntryFn,

    /// The routine body, taking the state pointer followed by `params`.
    direct: *const u8,

    /// The registers loaded by the entry point, integer registers as `i64` then vector registers
    /// as `i64x2`.
    pub params: Vec<Register>,

    /// Number of times the routine has been entered from the driver.
    pub uses: AtomicU64,

    /// The guest address ranges the routine was translated from.
    pub ranges: Vec<(u64, u64)>,

    pub direct_calls: Vec<DirectCall>,

    /// Number of guest operations in the routine.
    pub guest_ops: usize,

    pub code_size: u32,
}

// Safety: the code pointers refer to finalized code that is never freed or modified.
unsafe impl Send for CompiledRoutine {}
unsafe impl Sync for CompiledRoutine {}

impl CompiledRoutine {
    /// Runs the routine.
    ///
    /// # Safety
    ///
    /// The caller must ensure that the guest code the routine was compiled from has not been
    /// modified since it was compiled.
    pub unsafe fn call(&self, state: &mut ThreadState) -> u64 {
        (self.entry)(state)
    }

    pub fn direct_ptr(&self) -> *const u8 {
        self.direct
    }

    /// Increments the use counter, returning the new count.
    pub fn record_use(&self) -> u64 {
        self.uses.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        self.ranges.iter().any(|&(a, b)| a < end && start < b)
    }

    pub fn calls(&self, target: u64) -> bool {
        self.direct_calls.iter().any(|call| call.target == target)
    }
}

impl std::fmt::Debug for CompiledRoutine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledRoutine")
            .field("address", &format_args!("{:#x}", self.address))
            .field("tier", &self.tier)
            .field("params", &self.params)
            .field("direct_calls", &self.direct_calls)
            .field("guest_ops", &self.guest_ops)
            .field("code_size", &self.code_size)
            .finish()
    }
}

/// Looks up the routines that calls may be emitted against.
pub trait CalleeResolver {
    fn resolve(&self, address: u64, mode: ExecutionMode) -> Option<Arc<CompiledRoutine>>;
}

impl CalleeResolver for () {
    fn resolve(&self, _: u64, _: ExecutionMode) -> Option<Arc<CompiledRoutine>> {
        None
    }
}

impl<F> CalleeResolver for F
where
    F: Fn(u64, ExecutionMode) -> Option<Arc<CompiledRoutine>>,
{
    fn resolve(&self, address: u64, mode: ExecutionMode) -> Option<Arc<CompiledRoutine>> {
        self(address, mode)
    }
}

#[derive(Debug)]
pub enum EmitError {
    Translate(TranslateError),
    Module(ModuleError),
    UnsupportedHost(String),
}

impl EmitError {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Translate(_) => "invalid graph",
            Self::Module(_) => "backend error",
            Self::UnsupportedHost(_) => "unsupported host",
        }
    }
}

impl std::fmt::Display for EmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Translate(e) => write!(f, "{}: {e}", self.as_str()),
            Self::Module(e) => write!(f, "{}: {e}", self.as_str()),
            Self::UnsupportedHost(e) => write!(f, "{}: {e}", self.as_str()),
        }
    }
}

impl std::error::Error for EmitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Translate(e) => Some(e),
            Self::Module(e) => Some(e),
            Self::UnsupportedHost(_) => None,
        }
    }
}

impl From<ModuleError> for EmitError {
    fn from(e: ModuleError) -> Self {
        Self::Module(e)
    }
}

impl From<TranslateError> for EmitError {
    fn from(e: TranslateError) -> Self {
        Self::Translate(e)
    }
}

#[derive(Clone, Debug)]
pub struct EmitterOptions {
    pub enable_direct_calls: bool,
    pub max_direct_call_depth: u32,
    pub enable_verifier: bool,

    /// Keep the annotated IR of the most recently emitted routine in [RoutineEmitter::il_dump].
    pub dump_il: bool,
}

impl EmitterOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            enable_direct_calls: config.enable_direct_calls,
            max_direct_call_depth: config.max_direct_call_depth,
            enable_verifier: config.enable_verifier,
            dump_il: false,
        }
    }
}

impl Default for EmitterOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

pub(crate) struct RuntimeFunctions {
    pub load8: FuncId,
    pub load16: FuncId,
    pub load32: FuncId,
    pub load64: FuncId,

    pub store8: FuncId,
    pub store16: FuncId,
    pub store32: FuncId,
    pub store64: FuncId,

    pub undefined_instruction: FuncId,
}

/// Compiles graphs to native routines at a single tier.
pub struct RoutineEmitter {
    tier: Tier,
    options: EmitterOptions,
    codegen: Arc<CodegenTable>,

    /// The function builder context, which is reused across multiple FunctionBuilder instances.
    builder_ctx: FunctionBuilderContext,

    /// Cranelift codegen context.
    code_ctx: CodeContext,

    /// The module that owns the generated code. Code memory is never freed: routines evicted from
    /// the cache may still be running on another thread.
    module: JITModule,

    functions: RuntimeFunctions,

    /// (debugging) The annotated IR of the most recently emitted routine, if enabled with
    /// [EmitterOptions::dump_il].
    pub il_dump: Option<String>,

    /// Total number of routines emitted.
    pub compiled: u64,
}

// Safety: the module's code memory is only accessed through `&mut self`, and finalized code is
// never freed or modified.
unsafe impl Send for RoutineEmitter {}

impl RoutineEmitter {
    pub fn new(
        tier: Tier,
        codegen: Arc<CodegenTable>,
        options: EmitterOptions,
    ) -> Result<Self, EmitError> {
        let (module, functions) = init_module(tier, options.enable_verifier)?;
        Ok(Self {
            tier,
            options,
            codegen,
            builder_ctx: FunctionBuilderContext::new(),
            code_ctx: CodeContext::new(),
            module,
            functions,
            il_dump: None,
            compiled: 0,
        })
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn options(&self) -> &EmitterOptions {
        &self.options
    }

    /// Compiles `graph` to a routine whose parameters are the load set of the graph's root.
    pub fn emit(
        &mut self,
        graph: &Graph,
        liveness: &Liveness,
        resolver: &dyn CalleeResolver,
    ) -> Result<CompiledRoutine, EmitError> {
        if graph.is_empty() {
            return Err(TranslateError::EmptyGraph.into());
        }
        if graph.root >= graph.len() || liveness.blocks.len() != graph.len() {
            return Err(TranslateError::RootNotInGraph(graph.entry()).into());
        }

        let params: Vec<Register> = liveness.root_inputs(graph.root).iter().collect();
        let call_conv = self.module.isa().default_call_conv();
        let direct_sig = direct_signature(call_conv, &params);

        // Routine body.
        self.module.clear_context(&mut self.code_ctx);
        self.code_ctx.func.signature = direct_sig.clone();
        let body = {
            let builder = FunctionBuilder::new(&mut self.code_ctx.func, &mut self.builder_ctx);
            let input = translate::RoutineInput {
                graph,
                liveness,
                resolver,
                options: &self.options,
                params: &params,
            };
            translate::translate_routine(&mut self.module, builder, &self.functions, &self.codegen, input)
        };

        if self.options.dump_il {
            self.il_dump = Some(debug::debug_il(&self.code_ctx.func, graph, &body.srclocs));
        }

        let direct_id = self.module.declare_anonymous_function(&direct_sig)?;
        self.define(direct_id, graph)?;
        let code_size = self.code_ctx.compiled_code().map_or(0, |code| code.code_info().total_size);

        // Generic entry point.
        self.module.clear_context(&mut self.code_ctx);
        let entry_sig = entry_signature(call_conv);
        self.code_ctx.func.signature = entry_sig.clone();
        {
            let builder = FunctionBuilder::new(&mut self.code_ctx.func, &mut self.builder_ctx);
            translate::translate_entry(&mut self.module, builder, direct_id, &params);
        }
        let entry_id = self.module.declare_anonymous_function(&entry_sig)?;
        self.define(entry_id, graph)?;

        self.module.finalize_definitions()?;
        let direct = self.module.get_finalized_function(direct_id);
        // Safety: the entry function was generated with the signature of `EntryFn`.
        let entry: EntryFn = unsafe { std::mem::transmute(self.module.get_finalized_function(entry_id)) };

        self.compiled += 1;
        tracing::debug!(
            "compiled {:#x} ({:?}, {} blocks, {} ops, {} params, {} direct calls, {code_size} bytes)",
            graph.entry(),
            self.tier,
            graph.len(),
            graph.guest_ops(),
            params.len(),
            body.direct_calls.len(),
        );

        Ok(CompiledRoutine {
            address: graph.entry(),
            mode: graph.mode,
            tier: self.tier,
            entry,
            direct,
            params,
            uses: AtomicU64::new(0),
            ranges: graph.ranges(),
            direct_calls: body.direct_calls,
            guest_ops: graph.guest_ops(),
            code_size,
        })
    }

    fn define(&mut self, func: FuncId, graph: &Graph) -> ModuleResult<()> {
        self.module.define_function(func, &mut self.code_ctx).map_err(|err| {
            tracing::error!(
                "failed to define routine for {:#x}: {err:?}\n{}",
                graph.entry(),
                self.code_ctx.func.display()
            );
            err
        })
    }
}

/// The signature of a routine body: `(state, params...) -> next`.
pub(crate) fn direct_signature(call_conv: isa::CallConv, params: &[Register]) -> Signature {
    let mut sig = Signature::new(call_conv);
    sig.params.push(AbiParam::new(types::I64)); // state_ptr
    for reg in params {
        sig.params.push(AbiParam::new(register_type(*reg)));
    }
    sig.returns.push(AbiParam::new(types::I64)); // next_addr
    sig
}

fn entry_signature(call_conv: isa::CallConv) -> Signature {
    let mut sig = Signature::new(call_conv);
    sig.params.push(AbiParam::new(types::I64)); // state_ptr
    sig.returns.push(AbiParam::new(types::I64)); // next_addr
    sig
}

pub(crate) fn register_type(reg: Register) -> Type {
    match reg.kind {
        RegKind::Int => types::I64,
        RegKind::Vector => types::I64X2,
    }
}

fn init_module(tier: Tier, enable_verifier: bool) -> Result<(JITModule, RuntimeFunctions), EmitError> {
    let setting_error = |e: settings::SetError| EmitError::UnsupportedHost(e.to_string());

    let mut flag_builder = cranelift_codegen::settings::builder();

    // We will never relocate the JITed code, so we don't use position-independent-code to avoid
    // needing a GOT.
    flag_builder.set("is_pic", "false").map_err(setting_error)?;

    // Always enable frame pointers to make debugging easier.
    flag_builder.set("preserve_frame_pointers", "true").map_err(setting_error)?;

    let verifier = if enable_verifier { "true" } else { "false" };
    flag_builder.set("enable_verifier", verifier).map_err(setting_error)?;
    flag_builder.set("opt_level", tier.opt_level()).map_err(setting_error)?;

    let flags = settings::Flags::new(flag_builder);
    tracing::trace!("cranelift flags: {}", flags.to_string());

    let isa_builder =
        cranelift_native::builder().map_err(|e| EmitError::UnsupportedHost(e.to_string()))?;
    let isa = isa_builder.finish(flags).map_err(|e| EmitError::UnsupportedHost(e.to_string()))?;
    let mut builder = JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());

    macro_rules! define_fn_symbol {
        ($name:expr, $func:path) => {{
            builder.symbol($name, $func as *const u8);
        }};
    }

    define_fn_symbol!("glacier_load8", runtime::load8);
    define_fn_symbol!("glacier_load16", runtime::load16);
    define_fn_symbol!("glacier_load32", runtime::load32);
    define_fn_symbol!("glacier_load64", runtime::load64);
    define_fn_symbol!("glacier_store8", runtime::store8);
    define_fn_symbol!("glacier_store16", runtime::store16);
    define_fn_symbol!("glacier_store32", runtime::store32);
    define_fn_symbol!("glacier_store64", runtime::store64);
    define_fn_symbol!("glacier_undefined_instruction", runtime::undefined_instruction);

    let mut module = JITModule::new(builder);
    tracing::debug!(
        "JIT module created for {tier:?} tier with isa={:?}, calling conv={:?}",
        module.isa().triple(),
        module.isa().default_call_conv()
    );

    let functions = declare_runtime_functions(&mut module)?;
    Ok((module, functions))
}

fn declare_runtime_functions(module: &mut JITModule) -> ModuleResult<RuntimeFunctions> {
    use types::{I16, I32, I64, I8};

    let call_conv = module.isa().default_call_conv();

    macro_rules! import_fn {
        ($name:expr, ($($arg_ty:expr),*) -> ($($ret_ty:expr),*)) => {{
            let mut sig = Signature::new(call_conv);
            for arg in &[$($arg_ty),*] {
                sig.params.push(AbiParam::new(*arg));
            }
            for ret in &[$($ret_ty),*] {
                sig.returns.push(AbiParam::new(*ret));
            }
            module.declare_function($name, Linkage::Import, &sig)?
        }};
    }

    Ok(RuntimeFunctions {
        load8: import_fn!("glacier_load8", (I64, I64) -> (I8)),
        load16: import_fn!("glacier_load16", (I64, I64) -> (I16)),
        load32: import_fn!("glacier_load32", (I64, I64) -> (I32)),
        load64: import_fn!("glacier_load64", (I64, I64) -> (I64)),

        store8: import_fn!("glacier_store8", (I64, I64, I8) -> ()),
        store16: import_fn!("glacier_store16", (I64, I64, I16) -> ()),
        store32: import_fn!("glacier_store32", (I64, I64, I32) -> ()),
        store64: import_fn!("glacier_store64", (I64, I64, I64) -> ()),

        undefined_instruction: import_fn!("glacier_undefined_instruction", (I64, I64) -> ()),
    })
}
