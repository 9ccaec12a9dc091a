//! Guest register file layout.
//!
//! The integer file holds the general purpose registers followed by the condition flags, each
//! stored as a full `u64` so that every integer-file register has the same host storage type. The
//! vector file holds 128-bit registers.

pub const NUM_GPRS: usize = 32;
pub const NUM_INT_REGS: usize = 36;
pub const NUM_VEC_REGS: usize = 32;

pub const REG_LR: u8 = 30;
pub const REG_SP: u8 = 31;

pub const FLAG_N: u8 = 32;
pub const FLAG_Z: u8 = 33;
pub const FLAG_C: u8 = 34;
pub const FLAG_V: u8 = 35;

/// Marker used in decoded operands for the zero register. It never appears in a register mask and
/// is never stored to the register file.
pub const REG_ZR: u8 = 0xff;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RegKind {
    Int,
    Vector,
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Register {
    pub kind: RegKind,
    pub index: u8,
}

impl Register {
    pub const fn int(index: u8) -> Self {
        Self { kind: RegKind::Int, index }
    }

    pub const fn vec(index: u8) -> Self {
        Self { kind: RegKind::Vector, index }
    }

    pub fn is_flag(&self) -> bool {
        self.kind == RegKind::Int && (FLAG_N..=FLAG_V).contains(&self.index)
    }
}

impl std::fmt::Display for Register {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.kind, self.index) {
            (RegKind::Int, REG_SP) => f.write_str("sp"),
            (RegKind::Int, FLAG_N) => f.write_str("n"),
            (RegKind::Int, FLAG_Z) => f.write_str("z"),
            (RegKind::Int, FLAG_C) => f.write_str("c"),
            (RegKind::Int, FLAG_V) => f.write_str("v"),
            (RegKind::Int, index) => write!(f, "x{index}"),
            (RegKind::Vector, index) => write!(f, "v{index}"),
        }
    }
}

impl std::fmt::Debug for Register {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

/// A set of guest registers, one bit per integer-file and vector-file register.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct RegisterMask {
    pub int: u64,
    pub vec: u64,
}

impl RegisterMask {
    pub const EMPTY: Self = Self { int: 0, vec: 0 };
    pub const FLAGS: Self = Self {
        int: (1 << FLAG_N) | (1 << FLAG_Z) | (1 << FLAG_C) | (1 << FLAG_V),
        vec: 0,
    };

    pub fn from_registers(regs: impl IntoIterator<Item = Register>) -> Self {
        let mut mask = Self::EMPTY;
        for reg in regs {
            mask.insert(reg);
        }
        mask
    }

    #[inline]
    pub fn insert(&mut self, reg: Register) {
        match reg.kind {
            RegKind::Int if (reg.index as usize) < NUM_INT_REGS => self.int |= 1 << reg.index,
            RegKind::Vector if (reg.index as usize) < NUM_VEC_REGS => self.vec |= 1 << reg.index,
            // The zero register (and anything else out of range) has no storage.
            _ => {}
        }
    }

    #[inline]
    pub fn insert_int(&mut self, index: u8) {
        self.insert(Register::int(index))
    }

    #[inline]
    pub fn insert_vec(&mut self, index: u8) {
        self.insert(Register::vec(index))
    }

    pub fn contains(&self, reg: Register) -> bool {
        match reg.kind {
            RegKind::Int => reg.index < 64 && self.int & (1 << reg.index) != 0,
            RegKind::Vector => reg.index < 64 && self.vec & (1 << reg.index) != 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.int == 0 && self.vec == 0
    }

    pub fn count(&self) -> usize {
        (self.int.count_ones() + self.vec.count_ones()) as usize
    }

    pub fn difference(self, other: Self) -> Self {
        Self { int: self.int & !other.int, vec: self.vec & !other.vec }
    }

    /// Iterates over the registers in the set, integer registers first, each in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = Register> + '_ {
        let ints = (0..NUM_INT_REGS as u8).filter(|i| self.int & (1 << i) != 0).map(Register::int);
        let vecs = (0..NUM_VEC_REGS as u8).filter(|i| self.vec & (1 << i) != 0).map(Register::vec);
        ints.chain(vecs)
    }
}

impl std::ops::BitOr for RegisterMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self { int: self.int | rhs.int, vec: self.vec | rhs.vec }
    }
}

impl std::ops::BitOrAssign for RegisterMask {
    fn bitor_assign(&mut self, rhs: Self) {
        *self = *self | rhs;
    }
}

impl std::ops::BitAnd for RegisterMask {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self { int: self.int & rhs.int, vec: self.vec & rhs.vec }
    }
}

impl std::ops::BitAndAssign for RegisterMask {
    fn bitand_assign(&mut self, rhs: Self) {
        *self = *self & rhs;
    }
}

impl std::ops::Sub for RegisterMask {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        self.difference(rhs)
    }
}

impl std::fmt::Debug for RegisterMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Host storage for the guest register file.
#[derive(Clone, PartialEq, Eq)]
#[repr(C, align(16))]
pub struct Regs {
    pub vec: [u128; NUM_VEC_REGS],
    pub int: [u64; NUM_INT_REGS],
}

impl Default for Regs {
    fn default() -> Self {
        Self { vec: [0; NUM_VEC_REGS], int: [0; NUM_INT_REGS] }
    }
}

impl Regs {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn read(&self, reg: Register) -> u128 {
        match reg.kind {
            RegKind::Int => self.int.get(reg.index as usize).map_or(0, |x| *x as u128),
            RegKind::Vector => self.vec.get(reg.index as usize).copied().unwrap_or(0),
        }
    }

    #[inline]
    pub fn write(&mut self, reg: Register, value: u128) {
        match reg.kind {
            RegKind::Int => {
                if let Some(slot) = self.int.get_mut(reg.index as usize) {
                    *slot = value as u64;
                }
            }
            RegKind::Vector => {
                if let Some(slot) = self.vec.get_mut(reg.index as usize) {
                    *slot = value;
                }
            }
        }
    }

    /// Returns the flags packed the same way as the guest's NZCV system register.
    pub fn nzcv(&self) -> u32 {
        let flag = |i: u8| (self.int[i as usize] & 1) as u32;
        (flag(FLAG_N) << 31) | (flag(FLAG_Z) << 30) | (flag(FLAG_C) << 29) | (flag(FLAG_V) << 28)
    }

    pub fn set_nzcv(&mut self, value: u32) {
        self.int[FLAG_N as usize] = ((value >> 31) & 1) as u64;
        self.int[FLAG_Z as usize] = ((value >> 30) & 1) as u64;
        self.int[FLAG_C as usize] = ((value >> 29) & 1) as u64;
        self.int[FLAG_V as usize] = ((value >> 28) & 1) as u64;
    }
}

impl std::fmt::Debug for Regs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for (i, value) in self.int.iter().enumerate().filter(|(_, x)| **x != 0) {
            map.entry(&Register::int(i as u8), &format_args!("{value:#x}"));
        }
        for (i, value) in self.vec.iter().enumerate().filter(|(_, x)| **x != 0) {
            map.entry(&Register::vec(i as u8), &format_args!("{value:#x}"));
        }
        map.finish()
    }
}
