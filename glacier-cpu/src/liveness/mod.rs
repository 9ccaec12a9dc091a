//! Register liveness across the blocks of a graph.
//!
//! Compiled routines keep guest registers in host locals, loading them from the register file
//! when a routine is entered and storing them back whenever control leaves the routine. This
//! module computes those load and store sets:
//!
//! - The *load set* of a root (the graph entry, or the block a call returns to) is every register
//!   that may be read, or may be stored back, before it is written on some path from that root.
//! - The *store set* of a block (`outputs`) is every register that may have been written when
//!   control leaves the routine at the end of the block.
//! - The *entry store set* (`entry_outputs`) is the same for exits taken part way through a block:
//!   preemption checkpoints, memory faults and traps.
//!
//! Every register in a store set is either written on every path reaching the store or is part of
//! the load set of the root the path started from, so stores never write back undefined values.


use crate::{
    graph::{Block, BlockId, Graph},
    regs::RegisterMask,
};

#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct LivenessInfo {
    /// For roots, the registers loaded on entry. For other blocks, the registers the block reads
    /// before writing them.
    pub int_inputs: u64,
    pub vec_inputs: u64,

    /// The registers stored when control leaves the routine at the end of the block.
    pub int_outputs: u64,
    pub vec_outputs: u64,

    /// The registers stored when control leaves the routine before the block has completed.
    pub int_entry_outputs: u64,
    pub vec_entry_outputs: u64,

    /// The block passes its register state to another routine (via a call or a return).
    pub has_external_state_store: bool,
}

impl LivenessInfo {
    pub fn inputs(&self) -> RegisterMask {
        RegisterMask { int: self.int_inputs, vec: self.vec_inputs }
    }

    pub fn outputs(&self) -> RegisterMask {
        RegisterMask { int: self.int_outputs, vec: self.vec_outputs }
    }

    pub fn entry_outputs(&self) -> RegisterMask {
        RegisterMask { int: self.int_entry_outputs, vec: self.vec_entry_outputs }
    }

    fn set_inputs(&mut self, mask: RegisterMask) {
        self.int_inputs = mask.int;
        self.vec_inputs = mask.vec;
    }

    fn set_outputs(&mut self, mask: RegisterMask) {
        self.int_outputs = mask.int;
        self.vec_outputs = mask.vec;
    }

    fn set_entry_outputs(&mut self, mask: RegisterMask) {
        self.int_entry_outputs = mask.int;
        self.vec_entry_outputs = mask.vec;
    }
}

impl std::fmt::Debug for LivenessInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LivenessInfo")
            .field("inputs", &self.inputs())
            .field("outputs", &self.outputs())
            .field("entry_outputs", &self.entry_outputs())
            .field("has_external_state_store", &self.has_external_state_store)
            .finish()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Strategy {
    Exhaustive,
    Fast,
}

#[derive(Clone, Debug)]
pub struct Liveness {
    pub blocks: Vec<LivenessInfo>,

    /// The blocks that can be entered from outside of the routine body, the graph root first.
    pub roots: Vec<BlockId>,

    pub strategy: Strategy,
}

impl Liveness {
    pub fn is_root(&self, id: BlockId) -> bool {
        self.roots.contains(&id)
    }

    /// The load set of the root at `id`.
    pub fn root_inputs(&self, id: BlockId) -> RegisterMask {
        self.blocks[id].inputs()
    }
}

/// Computes liveness for `graph`, using the exhaustive analysis for graphs with at most
/// `threshold` blocks.
pub fn analyze(graph: &Graph, threshold: usize) -> Liveness {
    let liveness = match graph.len() <= threshold {
        true => analyze_exhaustive(graph),
        false => analyze_fast(graph),
    };
    tracing::trace!(
        "liveness for {:#x} ({:?}): roots={:?} inputs={:?}",
        graph.entry(),
        liveness.strategy,
        liveness.roots,
        liveness.root_inputs(graph.root)
    );
    liveness
}

/// Returns the registers `block` reads before writing them, and the registers it writes.
///
/// Each operation's reads are only satisfied by writes of earlier operations.
pub fn local_usage(block: &Block) -> (RegisterMask, RegisterMask) {
    let mut inputs = RegisterMask::EMPTY;
    let mut outputs = RegisterMask::EMPTY;
    for op in &block.ops {
        let usage = op.usage();
        inputs |= usage.reads - outputs;
        outputs |= usage.writes;
    }
    (inputs, outputs)
}

/// The blocks that can be entered from outside the routine body: the graph root, and the block
/// each call returns to.
pub fn find_roots(graph: &Graph) -> Vec<BlockId> {
    let mut roots = vec![graph.root];
    for block in &graph.blocks {
        if block.flow().is_call() {
            if let Some(next) = block.next {
                if !roots.contains(&next) {
                    roots.push(next);
                }
            }
        }
    }
    roots
}

/// Whether a compiled routine may exit part way through `block`.
pub(crate) fn has_early_exit(block: &Block, is_root: bool, is_loop_header: bool) -> bool {
    is_root
        || is_loop_header
        || block.flow() == crate::decoder::Flow::Trap
        || block.ops.iter().any(|op| op.kind.may_fault())
}

/// Unions all local usage. Every exit stores everything any block writes, so for graphs with more
/// than one block (or with a cycle) everything written must also be loaded.
pub fn analyze_fast(graph: &Graph) -> Liveness {
    let local: Vec<_> = graph.blocks.iter().map(local_usage).collect();
    let mut inputs = RegisterMask::EMPTY;
    let mut outputs = RegisterMask::EMPTY;
    for (block_inputs, block_outputs) in &local {
        inputs |= *block_inputs;
        outputs |= *block_outputs;
    }

    let has_edges = graph.blocks.iter().any(|block| block.successors().next().is_some());
    let merged = graph.len() > 1 || has_edges;
    if merged {
        inputs |= outputs;
    }
    let entry_outputs = if merged { outputs } else { RegisterMask::EMPTY };

    let roots = find_roots(graph);
    let mut blocks: Vec<LivenessInfo> = graph
        .blocks
        .iter()
        .zip(&local)
        .map(|(block, (block_inputs, _))| {
            let mut info = LivenessInfo {
                has_external_state_store: block.has_external_state_store(),
                ..LivenessInfo::default()
            };
            info.set_inputs(*block_inputs);
            info.set_outputs(outputs);
            info.set_entry_outputs(entry_outputs);
            info
        })
        .collect();
    for &root in &roots {
        blocks[root].set_inputs(inputs);
    }

    Liveness { blocks, roots, strategy: Strategy::Fast }
}

/// The registers read before being written, definitely written and possibly written along the
/// paths reaching a program point from a root.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct PathState {
    inputs: RegisterMask,
    must: RegisterMask,
    may: RegisterMask,
}

impl PathState {
    const ENTRY: Self =
        Self { inputs: RegisterMask::EMPTY, must: RegisterMask::EMPTY, may: RegisterMask::EMPTY };

    fn merge(self, other: Self) -> Self {
        Self {
            inputs: self.inputs | other.inputs,
            must: self.must & other.must,
            may: self.may | other.may,
        }
    }

    fn transfer(self, (inputs, outputs): (RegisterMask, RegisterMask)) -> Self {
        Self {
            inputs: self.inputs | (inputs - self.must),
            must: self.must | outputs,
            may: self.may | outputs,
        }
    }
}

/// The entry and exit state of every block reached from a single root.
struct RootPaths {
    entry: Vec<Option<PathState>>,
    exit: Vec<Option<PathState>>,
}

fn trace_root(graph: &Graph, local: &[(RegisterMask, RegisterMask)], root: BlockId) -> RootPaths {
    let n = graph.len();
    let mut entry: Vec<Option<PathState>> = vec![None; n];
    let mut exit: Vec<Option<PathState>> = vec![None; n];

    entry[root] = Some(PathState::ENTRY);
    let mut queue = vec![root];
    let mut queued = vec![false; n];
    queued[root] = true;

    while let Some(id) = queue.pop() {
        queued[id] = false;
        let Some(state) = entry[id]
        else {
            continue;
        };
        let out = state.transfer(local[id]);
        exit[id] = Some(out);

        let block = &graph.blocks[id];
        if block.has_external_state_store() {
            // Calls continue at a separate root.
            continue;
        }
        for succ in block.successors() {
            let merged = match entry[succ] {
                Some(prev) => prev.merge(out),
                None => out,
            };
            if entry[succ] != Some(merged) {
                entry[succ] = Some(merged);
                if !queued[succ] {
                    queued[succ] = true;
                    queue.push(succ);
                }
            }
        }
    }

    RootPaths { entry, exit }
}

/// Traces every path from every root, recording exactly which registers are read before they are
/// written and which may be written at each exit.
pub fn analyze_exhaustive(graph: &Graph) -> Liveness {
    let n = graph.len();
    let local: Vec<_> = graph.blocks.iter().map(local_usage).collect();
    let roots = find_roots(graph);
    let loop_headers = graph.loop_headers();

    let paths: Vec<RootPaths> = roots.iter().map(|&root| trace_root(graph, &local, root)).collect();

    // The store sets are shared between every root that reaches a block.
    let mut outputs = vec![RegisterMask::EMPTY; n];
    let mut entry_outputs = vec![RegisterMask::EMPTY; n];
    for root_paths in &paths {
        for id in 0..n {
            if let Some(state) = root_paths.exit[id] {
                outputs[id] |= state.may;
            }
            if let Some(state) = root_paths.entry[id] {
                entry_outputs[id] |= state.may;
            }
        }
    }

    let mut blocks: Vec<LivenessInfo> = graph
        .blocks
        .iter()
        .enumerate()
        .map(|(id, block)| {
            let mut info = LivenessInfo {
                has_external_state_store: block.has_external_state_store(),
                ..LivenessInfo::default()
            };
            info.set_inputs(local[id].0);
            info.set_outputs(outputs[id]);
            info.set_entry_outputs(entry_outputs[id]);
            info
        })
        .collect();

    for (&root, root_paths) in roots.iter().zip(&paths) {
        let mut inputs = RegisterMask::EMPTY;
        for (id, block) in graph.blocks.iter().enumerate() {
            let (Some(entry), Some(exit)) = (root_paths.entry[id], root_paths.exit[id])
            else {
                continue;
            };
            inputs |= exit.inputs;
            if block.leaves_routine() {
                inputs |= outputs[id] - exit.must;
            }
            if has_early_exit(block, roots.contains(&id), loop_headers[id]) {
                inputs |= entry_outputs[id] - entry.must;
            }
        }
        blocks[root].set_inputs(inputs);
    }

    Liveness { blocks, roots, strategy: Strategy::Exhaustive }
}
