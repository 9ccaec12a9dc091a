use glacier_mem::{perm, GuestMemory};
use quickcheck::{Arbitrary, Gen};

use crate::{
    a64::asm,
    decoder::{Cond, INSTRUCTION_SIZE},
    InstructionSource,
};

/// Maps a fresh executable region at `base` containing `code`.
pub fn load_program(base: u64, code: &[u32]) -> GuestMemory {
    let mem = GuestMemory::new();
    let len = (code.len() as u64 * 4).max(1);
    assert!(mem.map_memory_len(base, len, perm::RX));
    mem.write_bytes(base, &asm::assemble(code), perm::NONE).unwrap();
    mem
}

pub const BASE: u64 = 0x1000;

/// Instruction words placed at [BASE]. Addresses outside of the program are not executable.
#[derive(Clone)]
pub struct Program {
    pub code: Vec<u32>,
}

impl Program {
    pub fn new(code: Vec<u32>) -> Self {
        Self { code }
    }

    pub fn addr(index: usize) -> u64 {
        BASE + index as u64 * INSTRUCTION_SIZE
    }

    fn generate(g: &mut Gen, forward_only: bool) -> Self {
        let len = 1 + usize::arbitrary(g) % 24;
        let reg = |g: &mut Gen| u32::arbitrary(g) % 4;
        let mut code = Vec::with_capacity(len);
        for i in 0..len {
            let from = Self::addr(i);
            let target = match forward_only {
                true => Self::addr(i + 1 + usize::arbitrary(g) % (len - i)),
                false => Self::addr(usize::arbitrary(g) % (len + 1)),
            };
            let word = match u8::arbitrary(g) % 12 {
                0 => asm::add_imm(reg(g), reg(g), 1),
                1 => asm::add_reg(reg(g), reg(g), reg(g)),
                2 => asm::cmp_imm(reg(g), 1),
                3 => asm::b_cond(from, target, *g.choose(&[Cond::EQ, Cond::NE, Cond::GT]).unwrap()),
                4 => asm::cbz(reg(g), from, target),
                5 => asm::b(from, target),
                6 => asm::bl(from, 0x8000),
                7 => asm::ret(),
                8 => asm::ldr(reg(g), reg(g), 0),
                9 => asm::movz(reg(g), 7, 0),
                10 => asm::svc(0),
                _ => asm::eor_reg(reg(g), reg(g), reg(g)),
            };
            code.push(word);
        }
        Self { code }
    }
}

impl std::fmt::Debug for Program {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut list = f.debug_list();
        for (i, word) in self.code.iter().enumerate() {
            list.entry(&crate::a64::opcode_table().decode(Self::addr(i), *word));
        }
        list.finish()
    }
}

impl InstructionSource for Program {
    fn read_word(&self, addr: u64) -> Option<u32> {
        let index = addr.checked_sub(BASE)? / INSTRUCTION_SIZE;
        self.code.get(index as usize).copied()
    }

    fn is_executable(&self, addr: u64, len: u64) -> bool {
        addr >= BASE && addr + len <= Self::addr(self.code.len())
    }
}

/// A random program whose branches may go anywhere in the program (or just past the end).
#[derive(Clone, Debug)]
pub struct AnyProgram(pub Program);

impl Arbitrary for AnyProgram {
    fn arbitrary(g: &mut Gen) -> Self {
        Self(Program::generate(g, false))
    }
}

/// A random program where every branch goes forward, so the graph is acyclic.
#[derive(Clone, Debug)]
pub struct ForwardProgram(pub Program);

impl Arbitrary for ForwardProgram {
    fn arbitrary(g: &mut Gen) -> Self {
        Self(Program::generate(g, true))
    }
}
