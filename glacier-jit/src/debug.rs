use hashbrown::HashSet;

use cranelift::prelude::*;
use cranelift_codegen::{
    entity::SecondaryMap,
    ir::{Function, Inst},
    write::{self, FuncWriter, PlainWriter},
};

use glacier_cpu::Graph;

/// Renders the IL of `func` with the guest operation each group of instructions was generated
/// from.
pub(crate) fn debug_il(func: &Function, graph: &Graph, srclocs: &[u64]) -> String {
    let mut out = String::new();
    let mut decorator = GuestDecorator { seen: HashSet::new(), graph, srclocs };
    if let Err(e) = write::decorate_function(&mut decorator, &mut out, func) {
        tracing::warn!("failed to write IL for {:#x}: {e}", graph.entry());
    }
    out
}

struct GuestDecorator<'a> {
    seen: HashSet<u32>,
    graph: &'a Graph,
    srclocs: &'a [u64],
}

impl<'a> GuestDecorator<'a> {
    fn describe(&self, srcloc: u32) -> String {
        let Some(&addr) = self.srclocs.get(srcloc as usize)
        else {
            return "<unknown>".into();
        };
        let op = self
            .graph
            .find(addr)
            .and_then(|id| self.graph.blocks[id].ops.iter().find(|op| op.address == addr));
        match op {
            Some(op) => format!("{op:?}"),
            None => format!("[{addr:#x}]"),
        }
    }
}

impl<'a> FuncWriter for GuestDecorator<'a> {
    fn write_block_header(
        &mut self,
        w: &mut dyn std::fmt::Write,
        func: &Function,
        block: Block,
        indent: usize,
    ) -> std::fmt::Result {
        write::write_block_header(w, func, block, indent)
    }

    fn write_instruction(
        &mut self,
        w: &mut dyn std::fmt::Write,
        func: &Function,
        aliases: &SecondaryMap<Value, Vec<Value>>,
        inst: Inst,
        indent: usize,
    ) -> std::fmt::Result {
        let srcloc = func.srcloc(inst);
        if !srcloc.is_default() && self.seen.insert(srcloc.bits()) {
            w.write_fmt(format_args!("    ; {}\n", self.describe(srcloc.bits())))?;
        }
        PlainWriter.write_instruction(w, func, aliases, inst, indent)
    }
}
