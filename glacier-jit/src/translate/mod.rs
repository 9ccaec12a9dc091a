//! Module for translating guest block graphs to cranelift IL

use cranelift::prelude::*;
use cranelift_codegen::ir::{FuncRef, SourceLoc};
use cranelift_jit::JITModule;
use cranelift_module::{FuncId, Module};

use glacier_cpu::{
    decoder::{Flow, OpKind, Operation, RegSize},
    layout,
    regs::{Register, RegKind, RegisterMask, NUM_INT_REGS, NUM_VEC_REGS, REG_ZR},
    ExceptionCode, Graph, Liveness, PAUSED_ADDR,
};

use crate::{CalleeResolver, DirectCall, EmitterOptions, RuntimeFunctions, Tier};

/// Emits the IL for a single operation.
pub type CodegenFn = fn(&mut EmitterContext<'_>, &Operation);

/// Per-opcode code generation callbacks.
pub struct CodegenTable {
    handlers: [Option<CodegenFn>; OpKind::COUNT],
}

impl Default for CodegenTable {
    fn default() -> Self {
        Self::new()
    }
}

impl CodegenTable {
    pub fn new() -> Self {
        Self { handlers: [None; OpKind::COUNT] }
    }

    pub fn register(&mut self, kind: OpKind, handler: CodegenFn) {
        self.handlers[kind.index()] = Some(handler);
    }

    pub fn get(&self, kind: OpKind) -> Option<CodegenFn> {
        self.handlers[kind.index()]
    }
}

struct Symbols {
    load8: FuncRef,
    load16: FuncRef,
    load32: FuncRef,
    load64: FuncRef,

    store8: FuncRef,
    store16: FuncRef,
    store32: FuncRef,
    store64: FuncRef,

    undefined_instruction: FuncRef,
}

impl Symbols {
    fn import(module: &mut JITModule, builder: &mut FunctionBuilder, funcs: &RuntimeFunctions) -> Self {
        let mut import = |id: FuncId| module.declare_func_in_func(id, &mut builder.func);
        Self {
            load8: import(funcs.load8),
            load16: import(funcs.load16),
            load32: import(funcs.load32),
            load64: import(funcs.load64),
            store8: import(funcs.store8),
            store16: import(funcs.store16),
            store32: import(funcs.store32),
            store64: import(funcs.store64),
            undefined_instruction: import(funcs.undefined_instruction),
        }
    }

    fn load(&self, bytes: u8) -> (FuncRef, Type) {
        match bytes {
            1 => (self.load8, types::I8),
            2 => (self.load16, types::I16),
            4 => (self.load32, types::I32),
            8 => (self.load64, types::I64),
            _ => panic!("Invalid size {bytes}"),
        }
    }

    fn store(&self, bytes: u8) -> (FuncRef, Type) {
        match bytes {
            1 => (self.store8, types::I8),
            2 => (self.store16, types::I16),
            4 => (self.store32, types::I32),
            8 => (self.store64, types::I64),
            _ => panic!("Invalid size {bytes}"),
        }
    }
}

fn var(reg: Register) -> Variable {
    match reg.kind {
        RegKind::Int => Variable::from_u32(reg.index as u32),
        RegKind::Vector => Variable::from_u32(NUM_INT_REGS as u32 + reg.index as u32),
    }
}

pub(crate) struct RoutineInput<'a> {
    pub graph: &'a Graph,
    pub liveness: &'a Liveness,
    pub resolver: &'a dyn CalleeResolver,
    pub options: &'a EmitterOptions,
    pub params: &'a [Register],
}

pub(crate) struct TranslatedBody {
    /// The guest address of each source location used in the function.
    pub srclocs: Vec<u64>,
    pub direct_calls: Vec<DirectCall>,
}

/// The state available to code generation callbacks while an operation is being emitted.
pub struct EmitterContext<'a> {
    pub builder: FunctionBuilder<'a>,

    /// Pointer to the `ThreadState` of the running thread.
    pub state: Value,

    symbols: Symbols,

    /// Registers that are defined if the routine exits before the current block completes.
    entry_outputs: RegisterMask,

    /// Registers written so far in the current block.
    written: RegisterMask,

    op: Operation,
    condition: Option<Value>,
    indirect_target: Option<Value>,
}

impl<'a> EmitterContext<'a> {
    /// The operation currently being emitted.
    pub fn op(&self) -> &Operation {
        &self.op
    }

    pub fn iconst(&mut self, value: u64) -> Value {
        self.builder.ins().iconst(types::I64, value as i64)
    }

    /// Reads an integer-file register as an `i64`. The zero register reads as zero.
    pub fn read_int(&mut self, index: u8) -> Value {
        if index == REG_ZR {
            return self.iconst(0);
        }
        self.builder.use_var(var(Register::int(index)))
    }

    /// Writes an `i64` to an integer-file register. Writes to the zero register are discarded.
    pub fn write_int(&mut self, index: u8, value: Value) {
        if index == REG_ZR {
            return;
        }
        let reg = Register::int(index);
        self.builder.def_var(var(reg), value);
        self.written.insert(reg);
    }

    /// Reads a general purpose register at the operand size of the current operation.
    pub fn read_operand(&mut self, index: u8, size: RegSize) -> Value {
        let value = self.read_int(index);
        match size {
            RegSize::Int32 => self.builder.ins().ireduce(types::I32, value),
            _ => value,
        }
    }

    /// Writes an operand-sized result, zero extending 32-bit values.
    pub fn write_result(&mut self, index: u8, size: RegSize, value: Value) {
        let value = match size {
            RegSize::Int32 => self.builder.ins().uextend(types::I64, value),
            _ => value,
        };
        self.write_int(index, value);
    }

    /// Reads a condition flag as an `i64` that is either 0 or 1.
    pub fn read_flag(&mut self, flag: u8) -> Value {
        self.read_int(flag)
    }

    /// Sets a condition flag from a boolean (`i8`) value.
    pub fn write_flag(&mut self, flag: u8, value: Value) {
        let value = self.builder.ins().uextend(types::I64, value);
        self.write_int(flag, value);
    }

    pub fn write_flag_const(&mut self, flag: u8, value: bool) {
        let value = self.iconst(value as u64);
        self.write_int(flag, value);
    }

    pub fn read_vec(&mut self, index: u8) -> Value {
        self.builder.use_var(var(Register::vec(index)))
    }

    pub fn write_vec(&mut self, index: u8, value: Value) {
        let reg = Register::vec(index);
        self.builder.def_var(var(reg), value);
        self.written.insert(reg);
    }

    /// Sets the condition a conditional branch at the end of the block is taken on.
    pub fn set_condition(&mut self, value: Value) {
        self.condition = Some(value);
    }

    /// Sets the target of an indirect branch, call or return at the end of the block.
    pub fn set_indirect_target(&mut self, value: Value) {
        self.indirect_target = Some(value);
    }

    fn flush(&mut self, regs: RegisterMask) {
        for reg in regs.iter() {
            let value = self.builder.use_var(var(reg));
            self.builder.ins().store(MemFlags::trusted(), value, self.state, layout::reg(reg));
        }
    }

    fn reload(&mut self, regs: RegisterMask) {
        for reg in regs.iter() {
            let ty = crate::register_type(reg);
            let value = self.builder.ins().load(ty, MemFlags::trusted(), self.state, layout::reg(reg));
            self.builder.def_var(var(reg), value);
        }
    }

    fn store_pc(&mut self, pc: u64) {
        let pc = self.iconst(pc);
        self.builder.ins().store(MemFlags::trusted(), pc, self.state, layout::pc());
    }

    fn load_exception_code(&mut self) -> Value {
        self.builder.ins().load(types::I32, MemFlags::trusted(), self.state, layout::exception_code())
    }

    fn return_addr(&mut self, addr: u64) {
        let addr = self.iconst(addr);
        self.builder.ins().return_(&[addr]);
    }

    /// Starts a block that has no predecessors, code emitted after the current block was
    /// terminated ends up here.
    fn switch_to_dead_block(&mut self) {
        let dead = self.builder.create_block();
        self.builder.set_cold_block(dead);
        self.builder.switch_to_block(dead);
    }

    /// Leaves the routine with an exception. The current register state is written back and
    /// `pc` is set to the address to resume at.
    pub fn raise(&mut self, code: ExceptionCode, value: u64, pc: u64) {
        self.flush(self.entry_outputs | self.written);

        let code = self.builder.ins().iconst(types::I32, code as u32 as i64);
        self.builder.ins().store(MemFlags::trusted(), code, self.state, layout::exception_code());
        let value = self.iconst(value);
        self.builder.ins().store(MemFlags::trusted(), value, self.state, layout::exception_value());
        self.store_pc(pc);
        self.return_addr(0);

        self.switch_to_dead_block();
    }

    /// Leaves the routine with the exception for the current operation not being a valid
    /// instruction.
    pub fn raise_undefined(&mut self) {
        let address = self.op.address;
        let addr = self.iconst(address);
        self.builder.ins().call(self.symbols.undefined_instruction, &[self.state, addr]);

        self.flush(self.entry_outputs | self.written);
        self.store_pc(address);
        self.return_addr(0);

        self.switch_to_dead_block();
    }

    /// Generates code that leaves the routine if the last memory access raised an exception.
    fn exit_on_fault(&mut self) {
        let code = self.load_exception_code();

        let ok_block = self.builder.create_block();
        let fault_block = self.builder.create_block();
        self.builder.set_cold_block(fault_block);

        assert_eq!(ExceptionCode::None as u32, 0);
        self.builder.ins().brif(code, fault_block, &[], ok_block, &[]);

        // fault:
        {
            self.builder.switch_to_block(fault_block);
            self.flush(self.entry_outputs | self.written);
            self.store_pc(self.op.address);
            self.return_addr(0);
        }

        self.builder.switch_to_block(ok_block);
    }

    /// Loads `bytes` bytes from guest memory, returning the value zero extended to an `i64`.
    pub fn load_mem(&mut self, addr: Value, bytes: u8) -> Value {
        let (func, ty) = self.symbols.load(bytes);
        let call = self.builder.ins().call(func, &[self.state, addr]);
        let value = self.builder.inst_results(call)[0];
        self.exit_on_fault();

        match ty {
            types::I64 => value,
            _ => self.builder.ins().uextend(types::I64, value),
        }
    }

    /// Stores the low `bytes` bytes of an `i64` to guest memory.
    pub fn store_mem(&mut self, addr: Value, value: Value, bytes: u8) {
        let (func, ty) = self.symbols.store(bytes);
        let value = match ty {
            types::I64 => value,
            _ => self.builder.ins().ireduce(ty, value),
        };
        self.builder.ins().call(func, &[self.state, addr, value]);
        self.exit_on_fault();
    }
}

pub(crate) fn translate_routine<'a>(
    module: &mut JITModule,
    mut builder: FunctionBuilder<'a>,
    functions: &RuntimeFunctions,
    codegen: &CodegenTable,
    input: RoutineInput,
) -> TranslatedBody {
    let symbols = Symbols::import(module, &mut builder, functions);

    for i in 0..NUM_INT_REGS {
        builder.declare_var(var(Register::int(i as u8)), types::I64);
    }
    for i in 0..NUM_VEC_REGS {
        builder.declare_var(var(Register::vec(i as u8)), types::I64X2);
    }

    let entry_block = builder.create_block();
    builder.append_block_params_for_function_params(entry_block);
    builder.switch_to_block(entry_block);

    let state = builder.block_params(entry_block)[0];
    let params: Vec<Value> = builder.block_params(entry_block)[1..].to_vec();
    for (reg, value) in input.params.iter().zip(params) {
        builder.def_var(var(*reg), value);
    }

    let blocks: Vec<Block> = input.graph.blocks.iter().map(|_| builder.create_block()).collect();
    builder.ins().jump(blocks[input.graph.root], &[]);

    let mut translator = Translator {
        ctx: EmitterContext {
            builder,
            state,
            symbols,
            entry_outputs: RegisterMask::EMPTY,
            written: RegisterMask::EMPTY,
            op: Operation::undefined(input.graph.entry(), 0),
            condition: None,
            indirect_target: None,
        },
        codegen,
        call_conv: module.isa().default_call_conv(),
        loop_headers: input.graph.loop_headers(),
        blocks,
        srclocs: vec![],
        direct_calls: vec![],
        input,
    };

    for id in 0..translator.blocks.len() {
        translator.translate_block(id);
    }

    translator.ctx.builder.seal_all_blocks();
    translator.ctx.builder.finalize();

    TranslatedBody { srclocs: translator.srclocs, direct_calls: translator.direct_calls }
}

/// Emits the generic entry point of a routine: loads the parameters of the routine from the
/// register file, then calls the routine body.
pub(crate) fn translate_entry(
    module: &mut JITModule,
    mut builder: FunctionBuilder,
    body: FuncId,
    params: &[Register],
) {
    let body = module.declare_func_in_func(body, &mut builder.func);

    let entry_block = builder.create_block();
    builder.append_block_params_for_function_params(entry_block);
    builder.switch_to_block(entry_block);
    builder.seal_block(entry_block);

    let state = builder.block_params(entry_block)[0];
    let mut args = vec![state];
    for reg in params {
        let ty = crate::register_type(*reg);
        args.push(builder.ins().load(ty, MemFlags::trusted(), state, layout::reg(*reg)));
    }
    let call = builder.ins().call(body, &args);
    let next = builder.inst_results(call)[0];
    builder.ins().return_(&[next]);

    builder.finalize();
}

struct Translator<'a, 'b> {
    ctx: EmitterContext<'a>,
    codegen: &'b CodegenTable,
    input: RoutineInput<'b>,
    call_conv: isa::CallConv,
    loop_headers: Vec<bool>,
    blocks: Vec<Block>,
    srclocs: Vec<u64>,
    direct_calls: Vec<DirectCall>,
}

impl<'a, 'b> Translator<'a, 'b> {
    fn builder(&mut self) -> &mut FunctionBuilder<'a> {
        &mut self.ctx.builder
    }

    fn translate_block(&mut self, id: usize) {
        let graph = self.input.graph;
        let block = &graph.blocks[id];
        let info = &self.input.liveness.blocks[id];

        let clif_block = self.blocks[id];
        self.builder().switch_to_block(clif_block);

        self.ctx.entry_outputs = info.entry_outputs();
        self.ctx.written = RegisterMask::EMPTY;
        self.ctx.condition = None;
        self.ctx.indirect_target = None;

        let ops = block.ops.len() as i64;
        if self.input.liveness.is_root(id) || self.loop_headers[id] {
            self.checkpoint(block.start, ops);
        }
        self.consume_fuel(ops);

        for op in &block.ops {
            self.ctx.op = *op;
            let srcloc = SourceLoc::new(self.srclocs.len() as u32);
            self.srclocs.push(op.address);
            self.builder().set_srcloc(srcloc);
            self.builder().ins().nop();

            match self.codegen.get(op.kind) {
                Some(handler) => handler(&mut self.ctx, op),
                None => {
                    tracing::warn!("no code generator for {op:?}");
                    self.ctx.raise_undefined();
                }
            }
        }
        self.builder().set_srcloc(SourceLoc::default());

        self.translate_exit(id);
    }

    /// Generates code that pauses the routine if the thread has been interrupted or does not have
    /// enough fuel left to execute the block.
    fn checkpoint(&mut self, start: u64, ops: i64) {
        let state = self.ctx.state;
        let builder = self.builder();

        let interrupt_ptr =
            builder.ins().load(types::I64, MemFlags::trusted(), state, layout::interrupt_ptr());
        let interrupt = builder.ins().atomic_load(types::I32, MemFlags::trusted(), interrupt_ptr);
        let interrupted = builder.ins().icmp_imm(IntCC::NotEqual, interrupt, 0);

        let fuel = builder.ins().load(types::I64, MemFlags::trusted(), state, layout::fuel_remaining());
        let out_of_fuel = builder.ins().icmp_imm(IntCC::SignedLessThan, fuel, ops);
        let pause = builder.ins().bor(interrupted, out_of_fuel);

        let pause_block = builder.create_block();
        let continue_block = builder.create_block();
        builder.set_cold_block(pause_block);
        builder.ins().brif(pause, pause_block, &[], continue_block, &[]);

        // pause:
        {
            self.builder().switch_to_block(pause_block);
            self.ctx.flush(self.ctx.entry_outputs);
            self.ctx.store_pc(start);
            self.ctx.return_addr(PAUSED_ADDR);
        }

        self.builder().switch_to_block(continue_block);
    }

    fn consume_fuel(&mut self, ops: i64) {
        let state = self.ctx.state;
        let builder = self.builder();
        let fuel = builder.ins().load(types::I64, MemFlags::trusted(), state, layout::fuel_remaining());
        let fuel = builder.ins().iadd_imm(fuel, -ops);
        builder.ins().store(MemFlags::trusted(), fuel, state, layout::fuel_remaining());
    }

    /// Leaves the routine at the end of block `id`, continuing at `addr`.
    fn exit_to(&mut self, id: usize, addr: Value) {
        let outputs = self.input.liveness.blocks[id].outputs();
        self.ctx.flush(outputs);
        self.builder().ins().return_(&[addr]);
    }

    /// Returns the target of an edge leaving block `id`. Edges that leave the graph get a cold
    /// block that exits the routine, which is recorded in `exits` to be filled in later.
    fn edge_target(
        &mut self,
        link: Option<usize>,
        addr: Option<u64>,
        exits: &mut Vec<(Block, u64)>,
    ) -> Block {
        if let Some(target) = link {
            return self.blocks[target];
        }
        let exit = self.builder().create_block();
        self.builder().set_cold_block(exit);
        exits.push((exit, addr.unwrap_or(0)));
        exit
    }

    fn translate_exit(&mut self, id: usize) {
        let graph = self.input.graph;
        let block = &graph.blocks[id];
        let mut exits = vec![];

        match block.flow() {
            Flow::None | Flow::Jump => {
                let (link, addr) = match block.flow() {
                    Flow::None => (block.next, block.next_addr),
                    _ => (block.branch, block.branch_addr),
                };
                match (link, addr) {
                    (Some(target), _) => {
                        let target = self.blocks[target];
                        self.builder().ins().jump(target, &[]);
                    }
                    (None, Some(addr)) => {
                        let addr = self.ctx.iconst(addr);
                        self.exit_to(id, addr);
                    }
                    (None, None) => {
                        self.builder().ins().trap(TrapCode::UnreachableCodeReached);
                    }
                }
            }
            Flow::CondJump => {
                let taken = self.edge_target(block.branch, block.branch_addr, &mut exits);
                let not_taken = self.edge_target(block.next, block.next_addr, &mut exits);
                let condition = match self.ctx.condition {
                    Some(condition) => condition,
                    None => self.builder().ins().iconst(types::I8, 0),
                };
                self.builder().ins().brif(condition, taken, &[], not_taken, &[]);
            }
            Flow::IndirectJump | Flow::IndirectCall | Flow::Return => {
                let target = match self.ctx.indirect_target {
                    Some(target) => target,
                    None => self.ctx.iconst(0),
                };
                self.exit_to(id, target);
            }
            Flow::Call => self.translate_call(id),
            Flow::Trap => {
                // The operation already left the routine.
                self.builder().ins().trap(TrapCode::UnreachableCodeReached);
            }
        }

        for (exit, addr) in exits {
            self.builder().switch_to_block(exit);
            let addr = self.ctx.iconst(addr);
            self.exit_to(id, addr);
        }
    }

    /// Emits the end of a block ending in a direct call. Calls to optimized routines are made
    /// directly, continuing in this routine if the callee returns to the instruction after the
    /// call. All other calls leave the routine.
    fn translate_call(&mut self, id: usize) {
        let graph = self.input.graph;
        let block = &graph.blocks[id];
        let Some(target) = block.ops.last().and_then(|op| op.target())
        else {
            let addr = self.ctx.iconst(0);
            self.exit_to(id, addr);
            return;
        };

        let outputs = self.input.liveness.blocks[id].outputs();
        self.ctx.flush(outputs);

        let options = self.input.options;
        let callee = match options.enable_direct_calls {
            true => self.input.resolver.resolve(target, graph.mode),
            false => None,
        };
        let Some(callee) =
            callee.filter(|callee| callee.tier == Tier::Optimized && callee.mode == graph.mode)
        else {
            self.ctx.return_addr(target);
            return;
        };

        let state = self.ctx.state;
        let return_addr = block.end;

        // Fall back to the driver once the chain of direct calls gets too deep.
        let depth =
            self.builder().ins().load(types::I32, MemFlags::trusted(), state, layout::call_depth());
        let too_deep = self.builder().ins().icmp_imm(
            IntCC::UnsignedGreaterThanOrEqual,
            depth,
            options.max_direct_call_depth as i64,
        );
        let call_block = self.builder().create_block();
        let too_deep_block = self.builder().create_block();
        self.builder().set_cold_block(too_deep_block);
        self.builder().ins().brif(too_deep, too_deep_block, &[], call_block, &[]);

        // too_deep:
        {
            self.builder().switch_to_block(too_deep_block);
            self.ctx.return_addr(target);
        }

        self.builder().switch_to_block(call_block);
        let new_depth = self.builder().ins().iadd_imm(depth, 1);
        self.builder().ins().store(MemFlags::trusted(), new_depth, state, layout::call_depth());

        let mut args = vec![state];
        for reg in &callee.params {
            let value = match outputs.contains(*reg) {
                true => self.builder().use_var(var(*reg)),
                false => {
                    let ty = crate::register_type(*reg);
                    self.builder().ins().load(ty, MemFlags::trusted(), state, layout::reg(*reg))
                }
            };
            args.push(value);
        }

        let sig = crate::direct_signature(self.call_conv, &callee.params);
        let sig_ref = self.builder().import_signature(sig);
        let callee_ptr = self.ctx.iconst(callee.direct_ptr() as u64);
        let call = self.builder().ins().call_indirect(sig_ref, callee_ptr, &args);
        let next = self.builder().inst_results(call)[0];
        self.builder().ins().store(MemFlags::trusted(), depth, state, layout::call_depth());

        self.direct_calls.push(DirectCall { target, args: callee.params.clone() });

        let Some(continuation) = block.next
        else {
            self.builder().ins().return_(&[next]);
            return;
        };

        let returned = self.builder().ins().icmp_imm(IntCC::Equal, next, return_addr as i64);
        let resume_block = self.builder().create_block();
        let leave_block = self.builder().create_block();
        self.builder().ins().brif(returned, resume_block, &[], leave_block, &[]);

        // leave:
        {
            self.builder().switch_to_block(leave_block);
            self.builder().ins().return_(&[next]);
        }

        // The callee may have modified any register, reload the registers the continuation uses.
        self.builder().switch_to_block(resume_block);
        self.ctx.reload(self.input.liveness.root_inputs(continuation));
        let continuation = self.blocks[continuation];
        self.builder().ins().jump(continuation, &[]);
    }
}
