//! A minimal assembler for the supported instruction subset.
//!
//! Register operands are raw encoding numbers (`31` is SP or XZR depending on the instruction).
//! Branch helpers take the address of the instruction being encoded and the target address.

use crate::decoder::Cond;

pub const SP: u32 = 31;
pub const XZR: u32 = 31;
pub const LR: u32 = 30;

fn rd_rn(rd: u32, rn: u32) -> u32 {
    (rd & 0x1f) | ((rn & 0x1f) << 5)
}

fn add_sub_imm(base: u32, rd: u32, rn: u32, imm: u32) -> u32 {
    let (imm, sh) = match imm {
        x if x < 0x1000 => (x, 0),
        x if x & 0xfff == 0 && x < 0x100_0000 => (x >> 12, 1),
        x => panic!("immediate {x:#x} cannot be encoded"),
    };
    base | (sh << 22) | (imm << 10) | rd_rn(rd, rn)
}

pub fn add_imm(rd: u32, rn: u32, imm: u32) -> u32 {
    add_sub_imm(0x9100_0000, rd, rn, imm)
}

pub fn adds_imm(rd: u32, rn: u32, imm: u32) -> u32 {
    add_sub_imm(0xb100_0000, rd, rn, imm)
}

pub fn sub_imm(rd: u32, rn: u32, imm: u32) -> u32 {
    add_sub_imm(0xd100_0000, rd, rn, imm)
}

pub fn subs_imm(rd: u32, rn: u32, imm: u32) -> u32 {
    add_sub_imm(0xf100_0000, rd, rn, imm)
}

pub fn cmp_imm(rn: u32, imm: u32) -> u32 {
    subs_imm(XZR, rn, imm)
}

/// 32-bit `add wd, wn, #imm`.
pub fn add_imm_w(rd: u32, rn: u32, imm: u32) -> u32 {
    add_sub_imm(0x1100_0000, rd, rn, imm)
}

/// 32-bit `subs wd, wn, #imm`.
pub fn subs_imm_w(rd: u32, rn: u32, imm: u32) -> u32 {
    add_sub_imm(0x7100_0000, rd, rn, imm)
}

fn reg3(base: u32, rd: u32, rn: u32, rm: u32) -> u32 {
    base | ((rm & 0x1f) << 16) | rd_rn(rd, rn)
}

pub fn add_reg(rd: u32, rn: u32, rm: u32) -> u32 {
    reg3(0x8b00_0000, rd, rn, rm)
}

pub fn adds_reg(rd: u32, rn: u32, rm: u32) -> u32 {
    reg3(0xab00_0000, rd, rn, rm)
}

pub fn sub_reg(rd: u32, rn: u32, rm: u32) -> u32 {
    reg3(0xcb00_0000, rd, rn, rm)
}

pub fn subs_reg(rd: u32, rn: u32, rm: u32) -> u32 {
    reg3(0xeb00_0000, rd, rn, rm)
}

pub fn cmp_reg(rn: u32, rm: u32) -> u32 {
    subs_reg(XZR, rn, rm)
}

/// `add xd, xn, xm, lsl #amount`
pub fn add_reg_lsl(rd: u32, rn: u32, rm: u32, amount: u32) -> u32 {
    add_reg(rd, rn, rm) | ((amount & 0x3f) << 10)
}

/// `sub xd, xn, xm, asr #amount`
pub fn sub_reg_asr(rd: u32, rn: u32, rm: u32, amount: u32) -> u32 {
    sub_reg(rd, rn, rm) | (0b10 << 22) | ((amount & 0x3f) << 10)
}

/// 32-bit `adds wd, wn, wm`.
pub fn adds_reg_w(rd: u32, rn: u32, rm: u32) -> u32 {
    reg3(0x2b00_0000, rd, rn, rm)
}

pub fn and_reg(rd: u32, rn: u32, rm: u32) -> u32 {
    reg3(0x8a00_0000, rd, rn, rm)
}

pub fn orr_reg(rd: u32, rn: u32, rm: u32) -> u32 {
    reg3(0xaa00_0000, rd, rn, rm)
}

pub fn eor_reg(rd: u32, rn: u32, rm: u32) -> u32 {
    reg3(0xca00_0000, rd, rn, rm)
}

pub fn ands_reg(rd: u32, rn: u32, rm: u32) -> u32 {
    reg3(0xea00_0000, rd, rn, rm)
}

/// `bic xd, xn, xm`
pub fn bic_reg(rd: u32, rn: u32, rm: u32) -> u32 {
    and_reg(rd, rn, rm) | (1 << 21)
}

/// `eor xd, xn, xm, ror #amount`
pub fn eor_reg_ror(rd: u32, rn: u32, rm: u32, amount: u32) -> u32 {
    eor_reg(rd, rn, rm) | (0b11 << 22) | ((amount & 0x3f) << 10)
}

pub fn mov_reg(rd: u32, rm: u32) -> u32 {
    orr_reg(rd, XZR, rm)
}

fn move_wide(base: u32, rd: u32, imm: u16, shift: u32) -> u32 {
    assert!(shift % 16 == 0 && shift < 64, "invalid move wide shift: {shift}");
    base | ((shift / 16) << 21) | ((imm as u32) << 5) | (rd & 0x1f)
}

pub fn movz(rd: u32, imm: u16, shift: u32) -> u32 {
    move_wide(0xd280_0000, rd, imm, shift)
}

pub fn movk(rd: u32, imm: u16, shift: u32) -> u32 {
    move_wide(0xf280_0000, rd, imm, shift)
}

pub fn movn(rd: u32, imm: u16, shift: u32) -> u32 {
    move_wide(0x9280_0000, rd, imm, shift)
}

/// 32-bit `movz wd, #imm`.
pub fn movz_w(rd: u32, imm: u16) -> u32 {
    move_wide(0x5280_0000, rd, imm, 0)
}

/// Returns the `movz`/`movk` sequence that loads `value` into `rd`.
pub fn mov_imm64(rd: u32, value: u64) -> Vec<u32> {
    let mut out = vec![movz(rd, value as u16, 0)];
    for shift in [16, 32, 48] {
        let chunk = (value >> shift) as u16;
        if chunk != 0 {
            out.push(movk(rd, chunk, shift));
        }
    }
    out
}

fn offset(from: u64, to: u64, len: u32) -> u32 {
    let delta = (to.wrapping_sub(from) as i64) >> 2;
    let limit = 1_i64 << (len - 1);
    assert!((-limit..limit).contains(&delta), "branch from {from:#x} to {to:#x} out of range");
    (delta as u32) & ((1 << len) - 1)
}

pub fn b(from: u64, to: u64) -> u32 {
    0x1400_0000 | offset(from, to, 26)
}

pub fn bl(from: u64, to: u64) -> u32 {
    0x9400_0000 | offset(from, to, 26)
}

pub fn b_cond(from: u64, to: u64, cond: Cond) -> u32 {
    0x5400_0000 | (offset(from, to, 19) << 5) | (cond.0 as u32 & 0xf)
}

pub fn cbz(rt: u32, from: u64, to: u64) -> u32 {
    0xb400_0000 | (offset(from, to, 19) << 5) | (rt & 0x1f)
}

pub fn cbnz(rt: u32, from: u64, to: u64) -> u32 {
    0xb500_0000 | (offset(from, to, 19) << 5) | (rt & 0x1f)
}

pub fn br(rn: u32) -> u32 {
    0xd61f_0000 | ((rn & 0x1f) << 5)
}

pub fn blr(rn: u32) -> u32 {
    0xd63f_0000 | ((rn & 0x1f) << 5)
}

pub fn ret() -> u32 {
    0xd65f_0000 | (LR << 5)
}

fn load_store(base: u32, scale: u32, rt: u32, rn: u32, offset: u32) -> u32 {
    let bytes = 1 << scale;
    assert!(offset % bytes == 0 && offset / bytes < 0x1000, "invalid offset: {offset:#x}");
    base | (scale << 30) | ((offset / bytes) << 10) | rd_rn(rt, rn)
}

pub fn ldr(rt: u32, rn: u32, offset: u32) -> u32 {
    load_store(0x3940_0000, 3, rt, rn, offset)
}

pub fn str(rt: u32, rn: u32, offset: u32) -> u32 {
    load_store(0x3900_0000, 3, rt, rn, offset)
}

pub fn ldr_w(rt: u32, rn: u32, offset: u32) -> u32 {
    load_store(0x3940_0000, 2, rt, rn, offset)
}

pub fn str_w(rt: u32, rn: u32, offset: u32) -> u32 {
    load_store(0x3900_0000, 2, rt, rn, offset)
}

pub fn ldrh(rt: u32, rn: u32, offset: u32) -> u32 {
    load_store(0x3940_0000, 1, rt, rn, offset)
}

pub fn strh(rt: u32, rn: u32, offset: u32) -> u32 {
    load_store(0x3900_0000, 1, rt, rn, offset)
}

pub fn ldrb(rt: u32, rn: u32, offset: u32) -> u32 {
    load_store(0x3940_0000, 0, rt, rn, offset)
}

pub fn strb(rt: u32, rn: u32, offset: u32) -> u32 {
    load_store(0x3900_0000, 0, rt, rn, offset)
}

pub fn nop() -> u32 {
    0xd503_201f
}

pub fn brk(imm: u16) -> u32 {
    0xd420_0000 | ((imm as u32) << 5)
}

pub fn svc(imm: u16) -> u32 {
    0xd400_0001 | ((imm as u32) << 5)
}

pub fn and_v(rd: u32, rn: u32, rm: u32) -> u32 {
    reg3(0x4e20_1c00, rd, rn, rm)
}

pub fn orr_v(rd: u32, rn: u32, rm: u32) -> u32 {
    reg3(0x4ea0_1c00, rd, rn, rm)
}

pub fn eor_v(rd: u32, rn: u32, rm: u32) -> u32 {
    reg3(0x6e20_1c00, rd, rn, rm)
}

/// `add vd.2d, vn.2d, vm.2d`
pub fn add_v2d(rd: u32, rn: u32, rm: u32) -> u32 {
    reg3(0x4ee0_8400, rd, rn, rm)
}

/// `dup vd.2d, xn`
pub fn dup_2d(rd: u32, rn: u32) -> u32 {
    0x4e08_0c00 | rd_rn(rd, rn)
}

/// `umov xd, vn.d[lane]`
pub fn umov_d(rd: u32, rn: u32, lane: u32) -> u32 {
    0x4e08_3c00 | ((lane & 1) << 20) | rd_rn(rd, rn)
}

/// Converts a sequence of instructions to little-endian bytes.
pub fn assemble(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|word| word.to_le_bytes()).collect()
}
