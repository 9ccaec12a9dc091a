//! Code generators for AArch64 operations.

use cranelift::prelude::*;

use glacier_cpu::{
    decoder::{Cond, Fields, OpKind, Operation, RegSize, Shift},
    regs::{FLAG_C, FLAG_N, FLAG_V, FLAG_Z, REG_LR},
    ExceptionCode,
};

use crate::translate::{CodegenTable, EmitterContext};

pub fn codegen_table() -> CodegenTable {
    let mut table = CodegenTable::new();

    table.register(OpKind::Undefined, undefined);

    table.register(OpKind::AddImm, alu_imm);
    table.register(OpKind::AddsImm, alu_imm);
    table.register(OpKind::SubImm, alu_imm);
    table.register(OpKind::SubsImm, alu_imm);

    table.register(OpKind::AddReg, alu_reg);
    table.register(OpKind::AddsReg, alu_reg);
    table.register(OpKind::SubReg, alu_reg);
    table.register(OpKind::SubsReg, alu_reg);
    table.register(OpKind::AndReg, alu_reg);
    table.register(OpKind::OrrReg, alu_reg);
    table.register(OpKind::EorReg, alu_reg);
    table.register(OpKind::AndsReg, alu_reg);

    table.register(OpKind::Movn, move_wide);
    table.register(OpKind::Movz, move_wide);
    table.register(OpKind::Movk, move_wide);

    table.register(OpKind::B, nop);
    table.register(OpKind::Bl, branch_link);
    table.register(OpKind::BCond, cond_branch);
    table.register(OpKind::Cbz, compare_branch);
    table.register(OpKind::Cbnz, compare_branch);
    table.register(OpKind::Br, branch_reg);
    table.register(OpKind::Blr, branch_reg);
    table.register(OpKind::Ret, branch_reg);

    table.register(OpKind::Ldr, load_store);
    table.register(OpKind::Str, load_store);

    table.register(OpKind::Nop, nop);
    table.register(OpKind::Brk, exception);
    table.register(OpKind::Svc, exception);

    table.register(OpKind::AndV, vector3);
    table.register(OpKind::OrrV, vector3);
    table.register(OpKind::EorV, vector3);
    table.register(OpKind::AddV, vector3);
    table.register(OpKind::Dup, vector_dup);
    table.register(OpKind::Umov, vector_umov);

    table
}

fn int_type(size: RegSize) -> Type {
    match size {
        RegSize::Int32 => types::I32,
        _ => types::I64,
    }
}

fn undefined(ctx: &mut EmitterContext, _: &Operation) {
    ctx.raise_undefined();
}

fn nop(_: &mut EmitterContext, _: &Operation) {}

fn set_nz(ctx: &mut EmitterContext, result: Value) {
    let n = ctx.builder.ins().icmp_imm(IntCC::SignedLessThan, result, 0);
    ctx.write_flag(FLAG_N, n);
    let z = ctx.builder.ins().icmp_imm(IntCC::Equal, result, 0);
    ctx.write_flag(FLAG_Z, z);
}

/// Sets the flags for `result = a + b`.
fn set_add_flags(ctx: &mut EmitterContext, a: Value, b: Value, result: Value) {
    set_nz(ctx, result);

    let c = ctx.builder.ins().icmp(IntCC::UnsignedLessThan, result, a);
    ctx.write_flag(FLAG_C, c);

    // Overflow if both inputs have a different sign to the result.
    let a_res = ctx.builder.ins().bxor(a, result);
    let b_res = ctx.builder.ins().bxor(b, result);
    let overflow = ctx.builder.ins().band(a_res, b_res);
    let v = ctx.builder.ins().icmp_imm(IntCC::SignedLessThan, overflow, 0);
    ctx.write_flag(FLAG_V, v);
}

/// Sets the flags for `result = a - b`.
fn set_sub_flags(ctx: &mut EmitterContext, a: Value, b: Value, result: Value) {
    set_nz(ctx, result);

    // Carry is set when there is no borrow.
    let c = ctx.builder.ins().icmp(IntCC::UnsignedGreaterThanOrEqual, a, b);
    ctx.write_flag(FLAG_C, c);

    let a_b = ctx.builder.ins().bxor(a, b);
    let a_res = ctx.builder.ins().bxor(a, result);
    let overflow = ctx.builder.ins().band(a_b, a_res);
    let v = ctx.builder.ins().icmp_imm(IntCC::SignedLessThan, overflow, 0);
    ctx.write_flag(FLAG_V, v);
}

fn add_sub(ctx: &mut EmitterContext, kind: OpKind, a: Value, b: Value) -> Value {
    match kind {
        OpKind::AddImm | OpKind::AddReg => ctx.builder.ins().iadd(a, b),
        OpKind::AddsImm | OpKind::AddsReg => {
            let result = ctx.builder.ins().iadd(a, b);
            set_add_flags(ctx, a, b, result);
            result
        }
        OpKind::SubImm | OpKind::SubReg => ctx.builder.ins().isub(a, b),
        OpKind::SubsImm | OpKind::SubsReg => {
            let result = ctx.builder.ins().isub(a, b);
            set_sub_flags(ctx, a, b, result);
            result
        }
        _ => unreachable!("not an add/sub operation: {kind:?}"),
    }
}

fn alu_imm(ctx: &mut EmitterContext, op: &Operation) {
    let Fields::AluImm { rd, rn, imm } = op.fields
    else {
        return ctx.raise_undefined();
    };
    let a = ctx.read_operand(rn, op.size);
    let b = ctx.builder.ins().iconst(int_type(op.size), imm as i64);
    let result = add_sub(ctx, op.kind, a, b);
    ctx.write_result(rd, op.size, result);
}

fn shifted(ctx: &mut EmitterContext, value: Value, shift: Shift, amount: u8) -> Value {
    if amount == 0 {
        return value;
    }
    let amount = amount as i64;
    match shift {
        Shift::Lsl => ctx.builder.ins().ishl_imm(value, amount),
        Shift::Lsr => ctx.builder.ins().ushr_imm(value, amount),
        Shift::Asr => ctx.builder.ins().sshr_imm(value, amount),
        Shift::Ror => ctx.builder.ins().rotr_imm(value, amount),
    }
}

fn alu_reg(ctx: &mut EmitterContext, op: &Operation) {
    let Fields::AluReg { rd, rn, rm, shift, amount, invert } = op.fields
    else {
        return ctx.raise_undefined();
    };
    let a = ctx.read_operand(rn, op.size);
    let b = ctx.read_operand(rm, op.size);
    let mut b = shifted(ctx, b, shift, amount);
    if invert {
        b = ctx.builder.ins().bnot(b);
    }

    let result = match op.kind {
        OpKind::AndReg => ctx.builder.ins().band(a, b),
        OpKind::OrrReg => ctx.builder.ins().bor(a, b),
        OpKind::EorReg => ctx.builder.ins().bxor(a, b),
        OpKind::AndsReg => {
            let result = ctx.builder.ins().band(a, b);
            set_nz(ctx, result);
            ctx.write_flag_const(FLAG_C, false);
            ctx.write_flag_const(FLAG_V, false);
            result
        }
        kind => add_sub(ctx, kind, a, b),
    };
    ctx.write_result(rd, op.size, result);
}

fn move_wide(ctx: &mut EmitterContext, op: &Operation) {
    let Fields::MovWide { rd, imm, shift } = op.fields
    else {
        return ctx.raise_undefined();
    };
    let mask = match op.size {
        RegSize::Int32 => 0xffff_ffff,
        _ => u64::MAX,
    };
    let value = (imm as u64) << shift;

    let result = match op.kind {
        OpKind::Movz => ctx.iconst(value),
        OpKind::Movn => ctx.iconst(!value & mask),
        _ => {
            let old = ctx.read_int(rd);
            let cleared = ctx.builder.ins().band_imm(old, !(0xffff_u64 << shift) as i64);
            let merged = ctx.builder.ins().bor_imm(cleared, value as i64);
            match op.size {
                RegSize::Int32 => ctx.builder.ins().band_imm(merged, mask as i64),
                _ => merged,
            }
        }
    };
    ctx.write_int(rd, result);
}

fn branch_link(ctx: &mut EmitterContext, op: &Operation) {
    let link = ctx.iconst(op.next_address());
    ctx.write_int(REG_LR, link);
}

fn flag_set(ctx: &mut EmitterContext, flag: u8) -> Value {
    let value = ctx.read_flag(flag);
    ctx.builder.ins().icmp_imm(IntCC::NotEqual, value, 0)
}

/// Evaluates a condition code, returning an `i8` boolean.
pub(crate) fn condition(ctx: &mut EmitterContext, cond: Cond) -> Value {
    let result = match cond.0 >> 1 {
        0b000 => flag_set(ctx, FLAG_Z),
        0b001 => flag_set(ctx, FLAG_C),
        0b010 => flag_set(ctx, FLAG_N),
        0b011 => flag_set(ctx, FLAG_V),
        0b100 => {
            let c = flag_set(ctx, FLAG_C);
            let z = flag_set(ctx, FLAG_Z);
            let not_z = ctx.builder.ins().bxor_imm(z, 1);
            ctx.builder.ins().band(c, not_z)
        }
        0b101 => {
            let n = ctx.read_flag(FLAG_N);
            let v = ctx.read_flag(FLAG_V);
            ctx.builder.ins().icmp(IntCC::Equal, n, v)
        }
        0b110 => {
            let n = ctx.read_flag(FLAG_N);
            let v = ctx.read_flag(FLAG_V);
            let ge = ctx.builder.ins().icmp(IntCC::Equal, n, v);
            let z = flag_set(ctx, FLAG_Z);
            let not_z = ctx.builder.ins().bxor_imm(z, 1);
            ctx.builder.ins().band(ge, not_z)
        }
        _ => return ctx.builder.ins().iconst(types::I8, 1),
    };

    match cond.0 & 1 {
        1 => ctx.builder.ins().bxor_imm(result, 1),
        _ => result,
    }
}

fn cond_branch(ctx: &mut EmitterContext, op: &Operation) {
    let Fields::CondBranch { cond, .. } = op.fields
    else {
        return ctx.raise_undefined();
    };
    let taken = condition(ctx, cond);
    ctx.set_condition(taken);
}

fn compare_branch(ctx: &mut EmitterContext, op: &Operation) {
    let Fields::CompareBranch { rt, .. } = op.fields
    else {
        return ctx.raise_undefined();
    };
    let value = ctx.read_operand(rt, op.size);
    let cc = match op.kind {
        OpKind::Cbz => IntCC::Equal,
        _ => IntCC::NotEqual,
    };
    let taken = ctx.builder.ins().icmp_imm(cc, value, 0);
    ctx.set_condition(taken);
}

fn branch_reg(ctx: &mut EmitterContext, op: &Operation) {
    let Fields::BranchReg { rn } = op.fields
    else {
        return ctx.raise_undefined();
    };
    // The target is read before the link register is written, `blr x30` is valid.
    let target = ctx.read_int(rn);
    if op.kind == OpKind::Blr {
        branch_link(ctx, op);
    }
    ctx.set_indirect_target(target);
}

fn load_store(ctx: &mut EmitterContext, op: &Operation) {
    let Fields::Mem { rt, rn, offset, bytes } = op.fields
    else {
        return ctx.raise_undefined();
    };
    let base = ctx.read_int(rn);
    let addr = ctx.builder.ins().iadd_imm(base, offset as i64);

    match op.kind {
        OpKind::Ldr => {
            let value = ctx.load_mem(addr, bytes);
            ctx.write_int(rt, value);
        }
        _ => {
            let value = ctx.read_int(rt);
            ctx.store_mem(addr, value, bytes);
        }
    }
}

fn exception(ctx: &mut EmitterContext, op: &Operation) {
    let Fields::Exception { imm } = op.fields
    else {
        return ctx.raise_undefined();
    };
    match op.kind {
        // Syscalls resume after the instruction.
        OpKind::Svc => ctx.raise(ExceptionCode::Syscall, imm as u64, op.next_address()),
        _ => ctx.raise(ExceptionCode::SoftwareBreakpoint, imm as u64, op.address),
    }
}

fn vector3(ctx: &mut EmitterContext, op: &Operation) {
    let Fields::Vector3 { rd, rn, rm } = op.fields
    else {
        return ctx.raise_undefined();
    };
    let a = ctx.read_vec(rn);
    let b = ctx.read_vec(rm);
    let result = match op.kind {
        OpKind::AndV => ctx.builder.ins().band(a, b),
        OpKind::OrrV => ctx.builder.ins().bor(a, b),
        OpKind::EorV => ctx.builder.ins().bxor(a, b),
        _ => ctx.builder.ins().iadd(a, b),
    };
    ctx.write_vec(rd, result);
}

fn vector_dup(ctx: &mut EmitterContext, op: &Operation) {
    let Fields::VectorDup { rd, rn } = op.fields
    else {
        return ctx.raise_undefined();
    };
    let value = ctx.read_int(rn);
    let result = ctx.builder.ins().splat(types::I64X2, value);
    ctx.write_vec(rd, result);
}

fn vector_umov(ctx: &mut EmitterContext, op: &Operation) {
    let Fields::VectorMov { rd, rn, lane } = op.fields
    else {
        return ctx.raise_undefined();
    };
    let vector = ctx.read_vec(rn);
    let value = ctx.builder.ins().extractlane(vector, lane);
    ctx.write_int(rd, value);
}
