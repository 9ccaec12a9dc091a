use glacier_mem::{perm, GuestMemory};

use super::*;
use crate::{
    a64::asm,
    regs::{REG_SP, REG_ZR},
    test_util::load_program,
};

/// An instruction source holding a single word.
struct Word {
    address: u64,
    word: u32,
}

impl InstructionSource for Word {
    fn read_word(&self, addr: u64) -> Option<u32> {
        (addr == self.address).then_some(self.word)
    }

    fn is_executable(&self, addr: u64, len: u64) -> bool {
        addr == self.address && len == INSTRUCTION_SIZE
    }
}

fn decode_word(address: u64, word: u32) -> Operation {
    decode(&Word { address, word }, address, ExecutionMode::Aarch64)
}

#[test]
fn add_sub_immediate() {
    let op = decode_word(0x1000, asm::add_imm(0, 1, 5));
    assert_eq!(op.kind, OpKind::AddImm);
    assert_eq!(op.size, RegSize::Int64);
    assert_eq!(op.fields, Fields::AluImm { rd: 0, rn: 1, imm: 5 });

    // Register 31 is the stack pointer for the non flag-setting forms...
    let op = decode_word(0x1000, asm::add_imm(31, 31, 0x10));
    assert_eq!(op.fields, Fields::AluImm { rd: REG_SP, rn: REG_SP, imm: 0x10 });

    // ... and the zero register for the destination of the flag-setting forms.
    let op = decode_word(0x1000, asm::cmp_imm(2, 7));
    assert_eq!(op.kind, OpKind::SubsImm);
    assert_eq!(op.fields, Fields::AluImm { rd: REG_ZR, rn: 2, imm: 7 });
    assert_eq!(op.usage().writes, RegisterMask::FLAGS);

    let op = decode_word(0x1000, asm::sub_imm(3, 3, 0x3000));
    assert_eq!(op.fields, Fields::AluImm { rd: 3, rn: 3, imm: 0x3000 });

    let op = decode_word(0x1000, asm::add_imm_w(1, 1, 1));
    assert_eq!(op.size, RegSize::Int32);
}

#[test]
fn shifted_register() {
    let op = decode_word(0x1000, asm::add_reg_lsl(0, 1, 2, 4));
    assert_eq!(op.kind, OpKind::AddReg);
    assert_eq!(op.fields, Fields::AluReg {
        rd: 0,
        rn: 1,
        rm: 2,
        shift: Shift::Lsl,
        amount: 4,
        invert: false
    });

    let op = decode_word(0x1000, asm::bic_reg(0, 1, 2));
    assert_eq!(op.kind, OpKind::AndReg);
    assert!(matches!(op.fields, Fields::AluReg { invert: true, .. }));

    let op = decode_word(0x1000, asm::eor_reg_ror(0, 1, 2, 8));
    assert!(matches!(op.fields, Fields::AluReg { shift: Shift::Ror, amount: 8, .. }));

    let op = decode_word(0x1000, asm::mov_reg(4, 5));
    assert_eq!(op.kind, OpKind::OrrReg);
    assert_eq!(op.usage().reads, RegisterMask::from_registers([Register::int(5)]));
}

#[test]
fn reserved_field_combinations() {
    // ROR is not a valid shift for add/subtract.
    let op = decode_word(0x1000, asm::add_reg(0, 1, 2) | (0b11 << 22));
    assert_eq!(op.kind, OpKind::Undefined);
    assert_eq!(op.fields, Fields::None);

    // 32-bit forms cannot shift by 32 or more.
    let op = decode_word(0x1000, asm::adds_reg_w(0, 1, 2) | (40 << 10));
    assert_eq!(op.kind, OpKind::Undefined);

    // 32-bit move wide cannot use the upper half-words.
    let op = decode_word(0x1000, asm::movz_w(3, 0x1234) | (2 << 21));
    assert_eq!(op.kind, OpKind::Undefined);

    assert_eq!(decode_word(0x1000, 0x0000_0000).kind, OpKind::Undefined);
}

#[test]
fn move_wide() {
    let op = decode_word(0x1000, asm::movz_w(3, 0x1234));
    assert_eq!(op.kind, OpKind::Movz);
    assert_eq!(op.size, RegSize::Int32);
    assert_eq!(op.fields, Fields::MovWide { rd: 3, imm: 0x1234, shift: 0 });

    let op = decode_word(0x1000, asm::movk(4, 0xbeef, 48));
    assert_eq!(op.kind, OpKind::Movk);
    assert_eq!(op.fields, Fields::MovWide { rd: 4, imm: 0xbeef, shift: 48 });
    // movk keeps the other bits of the destination.
    assert!(op.usage().reads.contains(Register::int(4)));

    let op = decode_word(0x1000, asm::movn(5, 0, 0));
    assert_eq!(op.kind, OpKind::Movn);
}

#[test]
fn branches() {
    let op = decode_word(0x1000, asm::b(0x1000, 0x0ff0));
    assert_eq!(op.kind, OpKind::B);
    assert_eq!(op.flow(), Flow::Jump);
    assert_eq!(op.target(), Some(0x0ff0));

    let op = decode_word(0x1000, asm::bl(0x1000, 0x2000));
    assert_eq!(op.flow(), Flow::Call);
    assert_eq!(op.target(), Some(0x2000));
    assert_eq!(op.usage().writes, RegisterMask::from_registers([Register::int(REG_LR)]));

    let op = decode_word(0x1000, asm::b_cond(0x1000, 0x1010, Cond::NE));
    assert_eq!(op.fields, Fields::CondBranch { cond: Cond::NE, target: 0x1010 });
    assert_eq!(op.usage().reads, RegisterMask::from_registers([Register::int(FLAG_Z)]));

    let op = decode_word(0x1000, asm::cbnz(2, 0x1000, 0x1008));
    assert_eq!(op.kind, OpKind::Cbnz);
    assert_eq!(op.fields, Fields::CompareBranch { rt: 2, target: 0x1008 });

    let op = decode_word(0x1000, asm::ret());
    assert_eq!(op.flow(), Flow::Return);
    assert_eq!(op.fields, Fields::BranchReg { rn: REG_LR });

    assert_eq!(decode_word(0x1000, asm::br(3)).flow(), Flow::IndirectJump);
    assert_eq!(decode_word(0x1000, asm::blr(3)).flow(), Flow::IndirectCall);
}

#[test]
fn loads_and_stores() {
    let op = decode_word(0x1000, asm::ldr(0, 1, 8));
    assert_eq!(op.kind, OpKind::Ldr);
    assert_eq!(op.size, RegSize::Int64);
    assert_eq!(op.fields, Fields::Mem { rt: 0, rn: 1, offset: 8, bytes: 8 });
    assert!(op.kind.may_fault());

    let op = decode_word(0x1000, asm::strb(5, 31, 3));
    assert_eq!(op.kind, OpKind::Str);
    assert_eq!(op.size, RegSize::Int32);
    assert_eq!(op.fields, Fields::Mem { rt: 5, rn: REG_SP, offset: 3, bytes: 1 });
    let usage = op.usage();
    assert_eq!(usage.reads, RegisterMask::from_registers([Register::int(5), Register::int(REG_SP)]));
    assert!(usage.writes.is_empty());

    let op = decode_word(0x1000, asm::ldr_w(2, 3, 0x10));
    assert_eq!(op.fields, Fields::Mem { rt: 2, rn: 3, offset: 0x10, bytes: 4 });
}

#[test]
fn system_and_vector() {
    assert_eq!(decode_word(0x1000, asm::nop()).kind, OpKind::Nop);
    assert_eq!(decode_word(0x1000, asm::nop()).flow(), Flow::None);

    let op = decode_word(0x1000, asm::svc(0x10));
    assert_eq!(op.fields, Fields::Exception { imm: 0x10 });
    assert_eq!(op.flow(), Flow::Trap);
    assert_eq!(decode_word(0x1000, asm::brk(1)).kind, OpKind::Brk);

    let op = decode_word(0x1000, asm::add_v2d(1, 2, 3));
    assert_eq!(op.kind, OpKind::AddV);
    let usage = op.usage();
    assert_eq!(usage.reads, RegisterMask::from_registers([Register::vec(2), Register::vec(3)]));
    assert_eq!(usage.writes, RegisterMask::from_registers([Register::vec(1)]));

    let op = decode_word(0x1000, asm::umov_d(0, 4, 1));
    assert_eq!(op.fields, Fields::VectorMov { rd: 0, rn: 4, lane: 1 });

    let op = decode_word(0x1000, asm::dup_2d(5, 31));
    assert_eq!(op.fields, Fields::VectorDup { rd: 5, rn: REG_ZR });
    assert!(op.usage().reads.is_empty());
}

#[test]
fn fetch_failures_are_undefined() {
    let mem = load_program(0x1000, &[asm::nop(), asm::nop()]);
    assert_eq!(decode(&mem, 0x1000, ExecutionMode::Aarch64).kind, OpKind::Nop);
    assert_eq!(decode(&mem, 0x1002, ExecutionMode::Aarch64).kind, OpKind::Undefined);
    assert_eq!(decode(&mem, 0x9000, ExecutionMode::Aarch64).kind, OpKind::Undefined);
    assert_eq!(decode(&mem, 0x1000, ExecutionMode::Aarch32).kind, OpKind::Undefined);

    let data = GuestMemory::new();
    assert!(data.map_memory_len(0x1000, 0x1000, perm::RW));
    data.write_bytes(0x1000, &asm::assemble(&[asm::nop()]), perm::NONE).unwrap();
    assert_eq!(decode(&data, 0x1000, ExecutionMode::Aarch64).kind, OpKind::Undefined);
}

#[test]
fn decode_is_deterministic() {
    fn check(word: u32, slot: u16) -> bool {
        let address = 0x10_0000 + slot as u64 * INSTRUCTION_SIZE;
        let src = Word { address, word };
        let a = decode(&src, address, ExecutionMode::Aarch64);
        let b = decode(&src, address, ExecutionMode::Aarch64);
        let from_table = crate::a64::opcode_table().decode(address, word);
        a == b && a == from_table && a.address == address && a.word == word
    }
    quickcheck::quickcheck(check as fn(u32, u16) -> bool);
}

#[test]
fn bucketed_lookup_matches_linear_scan() {
    fn check(word: u32) -> bool {
        let table = crate::a64::opcode_table();
        let linear = table.encodings.iter().find(|e| e.matches(word)).map(|e| e.kind);
        table.lookup(word).map(|e| e.kind) == linear
    }
    quickcheck::quickcheck(check as fn(u32) -> bool);
}
