//! Instruction decoding: raw words to typed operations.

#[cfg(test)]
mod tests;

use crate::{
    regs::{Register, RegisterMask, FLAG_C, FLAG_N, FLAG_V, FLAG_Z, REG_LR},
    ExecutionMode, InstructionSource,
};

/// The width of every guest instruction.
pub const INSTRUCTION_SIZE: u64 = 4;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OpKind {
    Undefined,

    AddImm,
    AddsImm,
    SubImm,
    SubsImm,

    AddReg,
    AddsReg,
    SubReg,
    SubsReg,

    AndReg,
    OrrReg,
    EorReg,
    AndsReg,

    Movn,
    Movz,
    Movk,

    B,
    Bl,
    BCond,
    Cbz,
    Cbnz,
    Br,
    Blr,
    Ret,

    Ldr,
    Str,

    Nop,
    Brk,
    Svc,

    AndV,
    OrrV,
    EorV,
    AddV,
    Dup,
    Umov,
}

impl OpKind {
    pub const COUNT: usize = OpKind::Umov as usize + 1;

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn flow(self) -> Flow {
        match self {
            Self::B => Flow::Jump,
            Self::BCond | Self::Cbz | Self::Cbnz => Flow::CondJump,
            Self::Br => Flow::IndirectJump,
            Self::Bl => Flow::Call,
            Self::Blr => Flow::IndirectCall,
            Self::Ret => Flow::Return,
            Self::Undefined | Self::Brk | Self::Svc => Flow::Trap,
            _ => Flow::None,
        }
    }

    pub fn sets_flags(self) -> bool {
        matches!(self, Self::AddsImm | Self::SubsImm | Self::AddsReg | Self::SubsReg | Self::AndsReg)
    }

    /// Whether the operation accesses guest memory and can therefore fault part way through a
    /// block.
    pub fn may_fault(self) -> bool {
        matches!(self, Self::Ldr | Self::Str)
    }
}

/// How an operation affects control flow.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Flow {
    None,
    Jump,
    CondJump,
    IndirectJump,
    Call,
    IndirectCall,
    Return,
    Trap,
}

impl Flow {
    pub fn ends_block(self) -> bool {
        self != Flow::None
    }

    /// Whether control never continues to the next sequential instruction within the routine.
    pub fn is_terminal(self) -> bool {
        matches!(self, Flow::Jump | Flow::IndirectJump | Flow::Return | Flow::Trap)
    }

    pub fn is_call(self) -> bool {
        matches!(self, Flow::Call | Flow::IndirectCall)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum RegSize {
    Int32,
    Int64,
    Simd128,
}

impl RegSize {
    pub fn bits(self) -> u32 {
        match self {
            Self::Int32 => 32,
            Self::Int64 => 64,
            Self::Simd128 => 128,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Shift {
    Lsl,
    Lsr,
    Asr,
    Ror,
}

/// A guest condition code.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Cond(pub u8);

impl Cond {
    pub const EQ: Cond = Cond(0b0000);
    pub const NE: Cond = Cond(0b0001);
    pub const CS: Cond = Cond(0b0010);
    pub const CC: Cond = Cond(0b0011);
    pub const MI: Cond = Cond(0b0100);
    pub const PL: Cond = Cond(0b0101);
    pub const VS: Cond = Cond(0b0110);
    pub const VC: Cond = Cond(0b0111);
    pub const HI: Cond = Cond(0b1000);
    pub const LS: Cond = Cond(0b1001);
    pub const GE: Cond = Cond(0b1010);
    pub const LT: Cond = Cond(0b1011);
    pub const GT: Cond = Cond(0b1100);
    pub const LE: Cond = Cond(0b1101);
    pub const AL: Cond = Cond(0b1110);
    pub const NV: Cond = Cond(0b1111);

    /// The flags the condition depends on.
    pub fn flags_read(self) -> RegisterMask {
        let mut mask = RegisterMask::EMPTY;
        match self.0 >> 1 {
            0b000 => mask.insert_int(FLAG_Z),
            0b001 => mask.insert_int(FLAG_C),
            0b010 => mask.insert_int(FLAG_N),
            0b011 => mask.insert_int(FLAG_V),
            0b100 => {
                mask.insert_int(FLAG_C);
                mask.insert_int(FLAG_Z);
            }
            0b101 => {
                mask.insert_int(FLAG_N);
                mask.insert_int(FLAG_V);
            }
            0b110 => {
                mask.insert_int(FLAG_N);
                mask.insert_int(FLAG_V);
                mask.insert_int(FLAG_Z);
            }
            _ => {}
        }
        mask
    }

    pub fn name(self) -> &'static str {
        const NAMES: [&str; 16] = [
            "eq", "ne", "cs", "cc", "mi", "pl", "vs", "vc", "hi", "ls", "ge", "lt", "gt", "le",
            "al", "nv",
        ];
        NAMES[(self.0 & 0xf) as usize]
    }
}

impl std::fmt::Debug for Cond {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Operation specific decoded fields. Integer register operands use the indices from
/// [crate::regs], with [crate::regs::REG_ZR] standing in for the zero register.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Fields {
    None,
    AluImm { rd: u8, rn: u8, imm: u64 },
    AluReg { rd: u8, rn: u8, rm: u8, shift: Shift, amount: u8, invert: bool },
    MovWide { rd: u8, imm: u16, shift: u8 },
    Branch { target: u64 },
    CondBranch { cond: Cond, target: u64 },
    CompareBranch { rt: u8, target: u64 },
    BranchReg { rn: u8 },
    Mem { rt: u8, rn: u8, offset: u64, bytes: u8 },
    Exception { imm: u16 },
    Vector3 { rd: u8, rn: u8, rm: u8 },
    VectorDup { rd: u8, rn: u8 },
    VectorMov { rd: u8, rn: u8, lane: u8 },
}

/// The registers an operation reads and writes. All reads happen before any writes.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Usage {
    pub reads: RegisterMask,
    pub writes: RegisterMask,
}

#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Operation {
    pub address: u64,
    pub word: u32,
    pub kind: OpKind,
    pub size: RegSize,
    pub fields: Fields,
}

impl Operation {
    pub fn undefined(address: u64, word: u32) -> Self {
        Self { address, word, kind: OpKind::Undefined, size: RegSize::Int64, fields: Fields::None }
    }

    #[inline]
    pub fn flow(&self) -> Flow {
        self.kind.flow()
    }

    #[inline]
    pub fn next_address(&self) -> u64 {
        self.address.wrapping_add(INSTRUCTION_SIZE)
    }

    /// Returns the statically known target of a branch or call.
    pub fn target(&self) -> Option<u64> {
        match self.fields {
            Fields::Branch { target }
            | Fields::CondBranch { target, .. }
            | Fields::CompareBranch { target, .. } => Some(target),
            _ => None,
        }
    }

    pub fn usage(&self) -> Usage {
        let mut usage = Usage::default();
        let (reads, writes) = (&mut usage.reads, &mut usage.writes);
        match self.fields {
            Fields::None | Fields::Branch { .. } | Fields::Exception { .. } => {}
            Fields::AluImm { rd, rn, .. } => {
                reads.insert_int(rn);
                writes.insert_int(rd);
            }
            Fields::AluReg { rd, rn, rm, .. } => {
                reads.insert_int(rn);
                reads.insert_int(rm);
                writes.insert_int(rd);
            }
            Fields::MovWide { rd, .. } => {
                if self.kind == OpKind::Movk {
                    reads.insert_int(rd);
                }
                writes.insert_int(rd);
            }
            Fields::CondBranch { cond, .. } => *reads |= cond.flags_read(),
            Fields::CompareBranch { rt, .. } => reads.insert_int(rt),
            Fields::BranchReg { rn } => reads.insert_int(rn),
            Fields::Mem { rt, rn, .. } => {
                reads.insert_int(rn);
                match self.kind {
                    OpKind::Str => reads.insert_int(rt),
                    _ => writes.insert_int(rt),
                }
            }
            Fields::Vector3 { rd, rn, rm } => {
                reads.insert_vec(rn);
                reads.insert_vec(rm);
                writes.insert_vec(rd);
            }
            Fields::VectorDup { rd, rn } => {
                reads.insert_int(rn);
                writes.insert_vec(rd);
            }
            Fields::VectorMov { rd, rn, .. } => {
                reads.insert_vec(rn);
                writes.insert_int(rd);
            }
        }

        if self.kind.sets_flags() {
            *writes |= RegisterMask::FLAGS;
        }
        if matches!(self.kind, OpKind::Bl | OpKind::Blr) {
            writes.insert(Register::int(REG_LR));
        }

        usage
    }
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:#x}] {:08x} {:?} {:?}", self.address, self.word, self.kind, self.fields)
    }
}

/// Extracts the fields of an operation from its encoding, returning `None` for reserved
/// encodings that share the kind's bit pattern.
pub type ExtractFn = fn(word: u32, address: u64) -> Option<(RegSize, Fields)>;

pub struct Encoding {
    pub mask: u32,
    pub value: u32,
    pub kind: OpKind,
    pub extract: ExtractFn,
}

impl Encoding {
    #[inline]
    pub fn matches(&self, word: u32) -> bool {
        word & self.mask == self.value
    }
}

const BUCKET_SHIFT: u32 = 20;
const BUCKET_COUNT: usize = 1 << (32 - BUCKET_SHIFT);

/// A bit-pattern table mapping instruction words to encodings.
///
/// Encodings are grouped by the top 12 bits of the word they can match, so a lookup only scans the
/// handful of encodings that share a bucket. Within a bucket the first matching encoding in table
/// order wins.
pub struct OpcodeTable {
    encodings: &'static [Encoding],
    buckets: Box<[Box<[u16]>]>,
}

impl OpcodeTable {
    pub fn new(encodings: &'static [Encoding]) -> Self {
        let buckets = (0..BUCKET_COUNT as u32)
            .map(|bucket| {
                let prefix = bucket << BUCKET_SHIFT;
                let high_bits = !0_u32 << BUCKET_SHIFT;
                encodings
                    .iter()
                    .enumerate()
                    .filter(|(_, e)| (prefix ^ e.value) & e.mask & high_bits == 0)
                    .map(|(i, _)| i as u16)
                    .collect()
            })
            .collect();
        Self { encodings, buckets }
    }

    pub fn lookup(&self, word: u32) -> Option<&Encoding> {
        self.buckets[(word >> BUCKET_SHIFT) as usize]
            .iter()
            .map(|&i| &self.encodings[i as usize])
            .find(|e| e.matches(word))
    }

    pub fn decode(&self, address: u64, word: u32) -> Operation {
        let Some(encoding) = self.lookup(word)
        else {
            return Operation::undefined(address, word);
        };
        match (encoding.extract)(word, address) {
            Some((size, fields)) => Operation { address, word, kind: encoding.kind, size, fields },
            None => Operation::undefined(address, word),
        }
    }
}

/// Returns the opcode table for `mode`, if the mode is supported.
pub fn opcode_table(mode: ExecutionMode) -> Option<&'static OpcodeTable> {
    match mode {
        ExecutionMode::Aarch64 => Some(crate::a64::opcode_table()),
        ExecutionMode::Aarch32 => None,
    }
}

/// Decodes the instruction at `address`. Never fails: anything that cannot be fetched or is not
/// recognized decodes to [OpKind::Undefined].
pub fn decode<S: InstructionSource + ?Sized>(
    src: &S,
    address: u64,
    mode: ExecutionMode,
) -> Operation {
    let Some(table) = opcode_table(mode)
    else {
        return Operation::undefined(address, 0);
    };

    if address % INSTRUCTION_SIZE != 0 || !src.is_executable(address, INSTRUCTION_SIZE) {
        return Operation::undefined(address, 0);
    }
    match src.read_word(address) {
        Some(word) => table.decode(address, word),
        None => Operation::undefined(address, 0),
    }
}
