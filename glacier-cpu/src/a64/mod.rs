//! Encodings for the supported subset of the AArch64 instruction set.

pub mod asm;

use std::sync::OnceLock;

use crate::{
    decoder::{Cond, Encoding, Fields, OpKind, OpcodeTable, RegSize, Shift},
    regs::{REG_SP, REG_ZR},
};

pub fn opcode_table() -> &'static OpcodeTable {
    static TABLE: OnceLock<OpcodeTable> = OnceLock::new();
    TABLE.get_or_init(|| OpcodeTable::new(ENCODINGS))
}

macro_rules! encoding {
    ($mask:expr, $value:expr, $kind:ident, $extract:expr) => {
        Encoding { mask: $mask, value: $value, kind: OpKind::$kind, extract: $extract }
    };
}

static ENCODINGS: &[Encoding] = &[
    // Add/subtract (immediate)
    encoding!(0x7f80_0000, 0x1100_0000, AddImm, add_sub_imm),
    encoding!(0x7f80_0000, 0x3100_0000, AddsImm, adds_subs_imm),
    encoding!(0x7f80_0000, 0x5100_0000, SubImm, add_sub_imm),
    encoding!(0x7f80_0000, 0x7100_0000, SubsImm, adds_subs_imm),
    // Add/subtract (shifted register)
    encoding!(0x7f20_0000, 0x0b00_0000, AddReg, add_sub_reg),
    encoding!(0x7f20_0000, 0x2b00_0000, AddsReg, add_sub_reg),
    encoding!(0x7f20_0000, 0x4b00_0000, SubReg, add_sub_reg),
    encoding!(0x7f20_0000, 0x6b00_0000, SubsReg, add_sub_reg),
    // Logical (shifted register)
    encoding!(0x7f00_0000, 0x0a00_0000, AndReg, logical_reg),
    encoding!(0x7f00_0000, 0x2a00_0000, OrrReg, logical_reg),
    encoding!(0x7f00_0000, 0x4a00_0000, EorReg, logical_reg),
    encoding!(0x7f00_0000, 0x6a00_0000, AndsReg, logical_reg),
    // Move wide (immediate)
    encoding!(0x7f80_0000, 0x1280_0000, Movn, move_wide),
    encoding!(0x7f80_0000, 0x5280_0000, Movz, move_wide),
    encoding!(0x7f80_0000, 0x7280_0000, Movk, move_wide),
    // Branches
    encoding!(0xfc00_0000, 0x1400_0000, B, branch_imm),
    encoding!(0xfc00_0000, 0x9400_0000, Bl, branch_imm),
    encoding!(0xff00_0010, 0x5400_0000, BCond, cond_branch),
    encoding!(0x7f00_0000, 0x3400_0000, Cbz, compare_branch),
    encoding!(0x7f00_0000, 0x3500_0000, Cbnz, compare_branch),
    encoding!(0xffff_fc1f, 0xd61f_0000, Br, branch_reg),
    encoding!(0xffff_fc1f, 0xd63f_0000, Blr, branch_reg),
    encoding!(0xffff_fc1f, 0xd65f_0000, Ret, branch_reg),
    // Load/store (unsigned immediate offset)
    encoding!(0x3fc0_0000, 0x3900_0000, Str, load_store_uimm),
    encoding!(0x3fc0_0000, 0x3940_0000, Ldr, load_store_uimm),
    // System
    encoding!(0xffff_ffff, 0xd503_201f, Nop, no_fields),
    encoding!(0xffe0_001f, 0xd420_0000, Brk, exception),
    encoding!(0xffe0_001f, 0xd400_0001, Svc, exception),
    // Advanced SIMD (128-bit forms only)
    encoding!(0xffe0_fc00, 0x4e20_1c00, AndV, vector3),
    encoding!(0xffe0_fc00, 0x4ea0_1c00, OrrV, vector3),
    encoding!(0xffe0_fc00, 0x6e20_1c00, EorV, vector3),
    encoding!(0xffe0_fc00, 0x4ee0_8400, AddV, vector3),
    encoding!(0xffff_fc00, 0x4e08_0c00, Dup, vector_dup),
    encoding!(0xffef_fc00, 0x4e08_3c00, Umov, vector_umov),
];

#[inline(always)]
fn bits(word: u32, lo: u32, len: u32) -> u32 {
    (word >> lo) & ((1 << len) - 1)
}

#[inline(always)]
fn sign_extend(value: u32, len: u32) -> i64 {
    let shift = 64 - len;
    ((value as i64) << shift) >> shift
}

#[inline(always)]
fn reg_or_zr(index: u32) -> u8 {
    if index == 31 { REG_ZR } else { index as u8 }
}

#[inline(always)]
fn reg_or_sp(index: u32) -> u8 {
    if index == 31 { REG_SP } else { index as u8 }
}

#[inline(always)]
fn sf(word: u32) -> RegSize {
    if word >> 31 != 0 { RegSize::Int64 } else { RegSize::Int32 }
}

fn pc_relative(address: u64, imm: u32, len: u32) -> u64 {
    address.wrapping_add((sign_extend(imm, len) * 4) as u64)
}

fn no_fields(_: u32, _: u64) -> Option<(RegSize, Fields)> {
    Some((RegSize::Int64, Fields::None))
}

fn imm12(word: u32) -> u64 {
    let imm = bits(word, 10, 12) as u64;
    if bits(word, 22, 1) != 0 { imm << 12 } else { imm }
}

fn add_sub_imm(word: u32, _: u64) -> Option<(RegSize, Fields)> {
    let (rd, rn) = (reg_or_sp(bits(word, 0, 5)), reg_or_sp(bits(word, 5, 5)));
    Some((sf(word), Fields::AluImm { rd, rn, imm: imm12(word) }))
}

fn adds_subs_imm(word: u32, _: u64) -> Option<(RegSize, Fields)> {
    let (rd, rn) = (reg_or_zr(bits(word, 0, 5)), reg_or_sp(bits(word, 5, 5)));
    Some((sf(word), Fields::AluImm { rd, rn, imm: imm12(word) }))
}

fn shifted_operands(word: u32, allow_ror: bool) -> Option<(RegSize, Fields)> {
    let size = sf(word);
    let amount = bits(word, 10, 6);
    if size == RegSize::Int32 && amount >= 32 {
        return None;
    }
    let shift = match bits(word, 22, 2) {
        0b00 => Shift::Lsl,
        0b01 => Shift::Lsr,
        0b10 => Shift::Asr,
        _ if allow_ror => Shift::Ror,
        _ => return None,
    };
    Some((size, Fields::AluReg {
        rd: reg_or_zr(bits(word, 0, 5)),
        rn: reg_or_zr(bits(word, 5, 5)),
        rm: reg_or_zr(bits(word, 16, 5)),
        shift,
        amount: amount as u8,
        invert: allow_ror && bits(word, 21, 1) != 0,
    }))
}

fn add_sub_reg(word: u32, _: u64) -> Option<(RegSize, Fields)> {
    shifted_operands(word, false)
}

fn logical_reg(word: u32, _: u64) -> Option<(RegSize, Fields)> {
    shifted_operands(word, true)
}

fn move_wide(word: u32, _: u64) -> Option<(RegSize, Fields)> {
    let size = sf(word);
    let hw = bits(word, 21, 2);
    if size == RegSize::Int32 && hw >= 2 {
        return None;
    }
    let rd = reg_or_zr(bits(word, 0, 5));
    Some((size, Fields::MovWide { rd, imm: bits(word, 5, 16) as u16, shift: (hw * 16) as u8 }))
}

fn branch_imm(word: u32, address: u64) -> Option<(RegSize, Fields)> {
    let target = pc_relative(address, bits(word, 0, 26), 26);
    Some((RegSize::Int64, Fields::Branch { target }))
}

fn cond_branch(word: u32, address: u64) -> Option<(RegSize, Fields)> {
    let target = pc_relative(address, bits(word, 5, 19), 19);
    Some((RegSize::Int64, Fields::CondBranch { cond: Cond(bits(word, 0, 4) as u8), target }))
}

fn compare_branch(word: u32, address: u64) -> Option<(RegSize, Fields)> {
    let target = pc_relative(address, bits(word, 5, 19), 19);
    Some((sf(word), Fields::CompareBranch { rt: reg_or_zr(bits(word, 0, 5)), target }))
}

fn branch_reg(word: u32, _: u64) -> Option<(RegSize, Fields)> {
    Some((RegSize::Int64, Fields::BranchReg { rn: reg_or_zr(bits(word, 5, 5)) }))
}

fn load_store_uimm(word: u32, _: u64) -> Option<(RegSize, Fields)> {
    let scale = bits(word, 30, 2);
    let bytes = 1_u8 << scale;
    let size = if scale == 3 { RegSize::Int64 } else { RegSize::Int32 };
    Some((size, Fields::Mem {
        rt: reg_or_zr(bits(word, 0, 5)),
        rn: reg_or_sp(bits(word, 5, 5)),
        offset: (bits(word, 10, 12) as u64) << scale,
        bytes,
    }))
}

fn exception(word: u32, _: u64) -> Option<(RegSize, Fields)> {
    Some((RegSize::Int64, Fields::Exception { imm: bits(word, 5, 16) as u16 }))
}

fn vector3(word: u32, _: u64) -> Option<(RegSize, Fields)> {
    Some((RegSize::Simd128, Fields::Vector3 {
        rd: bits(word, 0, 5) as u8,
        rn: bits(word, 5, 5) as u8,
        rm: bits(word, 16, 5) as u8,
    }))
}

fn vector_dup(word: u32, _: u64) -> Option<(RegSize, Fields)> {
    Some((RegSize::Simd128, Fields::VectorDup {
        rd: bits(word, 0, 5) as u8,
        rn: reg_or_zr(bits(word, 5, 5)),
    }))
}

fn vector_umov(word: u32, _: u64) -> Option<(RegSize, Fields)> {
    Some((RegSize::Int64, Fields::VectorMov {
        rd: reg_or_zr(bits(word, 0, 5)),
        rn: bits(word, 5, 5) as u8,
        lane: bits(word, 20, 1) as u8,
    }))
}
