//! Control-flow graphs of guest basic blocks.


use std::collections::VecDeque;

use hashbrown::HashMap;

use crate::{
    decoder::{self, Flow, Operation, INSTRUCTION_SIZE},
    Config, ExecutionMode, InstructionSource,
};

pub type BlockId = usize;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TranslateError {
    /// The graph ended up with no blocks.
    EmptyGraph,

    /// The requested entry point was not one of the blocks in the graph.
    RootNotInGraph(u64),
}

impl TranslateError {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EmptyGraph => "graph contains no blocks",
            Self::RootNotInGraph(_) => "root is not part of the graph",
        }
    }
}

impl std::fmt::Display for TranslateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RootNotInGraph(addr) => write!(f, "{} (root={addr:#x})", self.as_str()),
            _ => f.write_str(self.as_str()),
        }
    }
}

impl std::error::Error for TranslateError {}

#[derive(Clone)]
pub struct Block {
    /// The address of the first operation in the block.
    pub start: u64,

    /// The address immediately after the last operation in the block.
    pub end: u64,

    pub ops: Vec<Operation>,

    /// The block control falls through to, if it is part of the graph.
    pub next: Option<BlockId>,

    /// The block a direct branch at the end of this block jumps to, if it is part of the graph.
    pub branch: Option<BlockId>,

    /// The guest address control falls through to. A `Some` address with `next` set to `None`
    /// leaves the routine.
    pub next_addr: Option<u64>,

    /// The guest address of the taken branch. A `Some` address with `branch` set to `None`
    /// leaves the routine.
    pub branch_addr: Option<u64>,
}

impl Block {
    /// Returns the control-flow class of the block's final operation. Blocks that were truncated,
    /// or cut at the operation limit, end in [Flow::None].
    pub fn flow(&self) -> Flow {
        self.ops.last().map_or(Flow::None, |op| op.flow())
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.start <= addr && addr < self.end
    }

    /// Whether the block hands its register state to code outside of the routine (by calling
    /// another routine or by returning).
    pub fn has_external_state_store(&self) -> bool {
        matches!(self.flow(), Flow::Call | Flow::IndirectCall | Flow::Return)
    }

    /// Whether any path out of the block leaves the routine.
    pub fn leaves_routine(&self) -> bool {
        let exits = |addr: Option<u64>, link: Option<BlockId>| addr.is_some() && link.is_none();
        if exits(self.next_addr, self.next) || exits(self.branch_addr, self.branch) {
            return true;
        }
        matches!(self.flow(), Flow::IndirectJump | Flow::Call | Flow::IndirectCall | Flow::Return)
            || (self.next_addr.is_none() && self.branch_addr.is_none())
    }

    /// Returns the in-graph successors of the block.
    pub fn successors(&self) -> impl Iterator<Item = BlockId> {
        self.next.into_iter().chain(self.branch)
    }

    fn truncate(&mut self, end: u64) {
        self.ops.retain(|op| op.address < end);
        self.end = end;
        self.next_addr = Some(end);
        self.branch_addr = None;
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "[{:#x}..{:#x}]", self.start, self.end)?;
        for op in &self.ops {
            writeln!(f, "    {op:?}")?;
        }
        let link = |id: Option<BlockId>, addr: Option<u64>| match (id, addr) {
            (Some(id), _) => format!("block{id}"),
            (None, Some(addr)) => format!("exit({addr:#x})"),
            (None, None) => "-".into(),
        };
        write!(
            f,
            "    next: {}, branch: {}",
            link(self.next, self.next_addr),
            link(self.branch, self.branch_addr)
        )
    }
}

/// The blocks reachable from an entry point, sorted by start address.
#[derive(Clone)]
pub struct Graph {
    pub blocks: Vec<Block>,
    pub root: BlockId,
    pub mode: ExecutionMode,
}

impl Graph {
    /// Creates a graph containing only `block`. Branches back into the block are treated as exits.
    pub fn single(mut block: Block, mode: ExecutionMode) -> Self {
        block.next = None;
        block.branch = None;
        Self { blocks: vec![block], root: 0, mode }
    }

    pub fn root_block(&self) -> &Block {
        &self.blocks[self.root]
    }

    pub fn entry(&self) -> u64 {
        self.blocks[self.root].start
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Returns the block starting at `addr`.
    pub fn find(&self, addr: u64) -> Option<BlockId> {
        self.blocks.binary_search_by_key(&addr, |block| block.start).ok()
    }

    /// The total number of guest operations in the graph.
    pub fn guest_ops(&self) -> usize {
        self.blocks.iter().map(|block| block.ops.len()).sum()
    }

    /// Returns the merged guest address ranges covered by the graph.
    pub fn ranges(&self) -> Vec<(u64, u64)> {
        let mut ranges: Vec<(u64, u64)> = vec![];
        for block in &self.blocks {
            match ranges.last_mut() {
                Some(last) if block.start <= last.1 => last.1 = last.1.max(block.end),
                _ => ranges.push((block.start, block.end)),
            }
        }
        ranges
    }

    /// Marks each block that is the target of an edge from a block at the same or a higher
    /// address.
    pub fn loop_headers(&self) -> Vec<bool> {
        let mut headers = vec![false; self.blocks.len()];
        for (id, block) in self.blocks.iter().enumerate() {
            for succ in block.successors() {
                if succ <= id {
                    headers[succ] = true;
                }
            }
        }
        headers
    }

    /// Returns the statically known targets of every call in the graph.
    pub fn call_targets(&self) -> impl Iterator<Item = u64> + '_ {
        self.blocks
            .iter()
            .filter_map(|block| block.ops.last())
            .filter(|op| op.flow() == Flow::Call)
            .filter_map(|op| op.target())
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "root: block{}", self.root)?;
        for (id, block) in self.blocks.iter().enumerate() {
            writeln!(f, "block{id}: {block:?}")?;
        }
        Ok(())
    }
}

pub struct GraphBuilder {
    pub max_ops_per_block: usize,
    pub max_blocks: usize,
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new(&Config::default())
    }
}

impl GraphBuilder {
    pub fn new(config: &Config) -> Self {
        Self {
            max_ops_per_block: config.max_ops_per_block.max(1),
            max_blocks: config.max_graph_blocks,
        }
    }

    /// Decodes operations starting at `address` until a control transfer, a trap, or the
    /// operation limit.
    pub fn build_block<S>(&self, src: &S, address: u64, mode: ExecutionMode) -> Block
    where
        S: InstructionSource + ?Sized,
    {
        let mut ops = vec![];
        let mut addr = address;
        loop {
            src.mark_code(addr, INSTRUCTION_SIZE);
            let op = decoder::decode(src, addr, mode);
            addr = op.next_address();
            let flow = op.flow();
            ops.push(op);
            if flow.ends_block() || ops.len() >= self.max_ops_per_block {
                break;
            }
        }

        let last = ops[ops.len() - 1];
        let (next_addr, branch_addr) = match last.flow() {
            Flow::None | Flow::Call | Flow::IndirectCall => (Some(addr), None),
            Flow::CondJump => (Some(addr), last.target()),
            Flow::Jump => (None, last.target()),
            Flow::IndirectJump | Flow::Return | Flow::Trap => (None, None),
        };

        Block {
            start: address,
            end: addr,
            ops,
            next: None,
            branch: None,
            next_addr,
            branch_addr,
        }
    }

    /// Builds a graph containing just the block at `address`.
    pub fn build_single<S>(
        &self,
        src: &S,
        address: u64,
        mode: ExecutionMode,
    ) -> Result<Graph, TranslateError>
    where
        S: InstructionSource + ?Sized,
    {
        Ok(Graph::single(self.build_block(src, address, mode), mode))
    }

    /// Builds the graph of every block reachable from `address` without following calls.
    pub fn build_graph<S>(
        &self,
        src: &S,
        address: u64,
        mode: ExecutionMode,
    ) -> Result<Graph, TranslateError>
    where
        S: InstructionSource + ?Sized,
    {
        let mut blocks: Vec<Block> = vec![];
        let mut seen: HashMap<u64, BlockId> = HashMap::new();
        let mut queue = VecDeque::new();
        queue.push_back(address);

        while let Some(addr) = queue.pop_front() {
            if seen.contains_key(&addr) || blocks.len() >= self.max_blocks {
                continue;
            }
            let block = self.build_block(src, addr, mode);
            queue.extend(block.branch_addr);
            queue.extend(block.next_addr);
            seen.insert(addr, blocks.len());
            blocks.push(block);
        }

        if blocks.is_empty() {
            return Err(TranslateError::EmptyGraph);
        }

        repair_overlaps(&mut blocks);

        blocks.sort_unstable_by_key(|block| block.start);
        let index: HashMap<u64, BlockId> =
            blocks.iter().enumerate().map(|(id, block)| (block.start, id)).collect();
        for block in &mut blocks {
            block.next = block.next_addr.and_then(|addr| index.get(&addr).copied());
            block.branch = block.branch_addr.and_then(|addr| index.get(&addr).copied());
        }

        let root = *index.get(&address).ok_or(TranslateError::RootNotInGraph(address))?;
        let graph = Graph { blocks, root, mode };
        tracing::trace!("graph for {address:#x} ({} blocks):\n{graph:?}", graph.len());
        Ok(graph)
    }
}

/// Splits blocks that share an end address: the block with the lower start address is truncated
/// to fall through into the other one. Repeats until every block has a distinct end.
fn repair_overlaps(blocks: &mut [Block]) {
    loop {
        let mut by_end: HashMap<u64, Vec<BlockId>> = HashMap::new();
        for (id, block) in blocks.iter().enumerate() {
            by_end.entry(block.end).or_default().push(id);
        }

        let mut changed = false;
        for group in by_end.values_mut().filter(|group| group.len() > 1) {
            group.sort_unstable_by_key(|id| std::cmp::Reverse(blocks[*id].start));
            for pair in group.windows(2) {
                let split = blocks[pair[0]].start;
                tracing::trace!("truncating block at {:#x} to {split:#x}", blocks[pair[1]].start);
                blocks[pair[1]].truncate(split);
            }
            changed = true;
        }

        if !changed {
            break;
        }
    }
    debug_assert!(blocks.iter().all(|block| !block.ops.is_empty()));
    debug_assert!(blocks.iter().all(|block| block.end - block.start
        == block.ops.len() as u64 * INSTRUCTION_SIZE));
}
