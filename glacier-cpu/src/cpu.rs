use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc,
};

use glacier_mem::{GuestMemory, MemError};

use crate::regs::{Register, Regs};

/// Upper bound on a single fuel slice, leaves headroom for blocks that overdraw the budget.
const MAX_FUEL: u64 = (i64::MAX / 2) as u64;

/// Returned by a compiled routine that stopped at a preemption checkpoint. The address to resume
/// at is stored in [ThreadState::pc].
pub const PAUSED_ADDR: u64 = u64::MAX;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum ExecutionMode {
    Aarch64 = 0,
    Aarch32 = 1,
}

impl Default for ExecutionMode {
    fn default() -> Self {
        Self::Aarch64
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ExceptionCode {
    None = 0x0000,

    InvalidInstruction = 0x0001,
    SoftwareBreakpoint = 0x0002,
    Syscall = 0x0003,

    ReadUnmapped = 0x0101,
    ReadViolation = 0x0102,
    WriteUnmapped = 0x0201,
    WriteViolation = 0x0202,
    ExecViolation = 0x0301,
    AddressOverflow = 0x0401,

    JitError = 0x1000,
    UnknownError = 0xffff,
}

impl ExceptionCode {
    pub fn from_u32(code: u32) -> Self {
        match code {
            0x0000 => Self::None,
            0x0001 => Self::InvalidInstruction,
            0x0002 => Self::SoftwareBreakpoint,
            0x0003 => Self::Syscall,
            0x0101 => Self::ReadUnmapped,
            0x0102 => Self::ReadViolation,
            0x0201 => Self::WriteUnmapped,
            0x0202 => Self::WriteViolation,
            0x0301 => Self::ExecViolation,
            0x0401 => Self::AddressOverflow,
            0x1000 => Self::JitError,
            _ => Self::UnknownError,
        }
    }

    pub fn from_load_error(err: MemError) -> Self {
        match err {
            MemError::Unmapped => Self::ReadUnmapped,
            MemError::ReadViolation => Self::ReadViolation,
            MemError::AddressOverflow => Self::AddressOverflow,
            _ => Self::UnknownError,
        }
    }

    pub fn from_store_error(err: MemError) -> Self {
        match err {
            MemError::Unmapped => Self::WriteUnmapped,
            MemError::WriteViolation => Self::WriteViolation,
            MemError::AddressOverflow => Self::AddressOverflow,
            _ => Self::UnknownError,
        }
    }
}

#[derive(Copy, Clone, Default, PartialEq, Eq)]
#[repr(C)]
pub struct Exception {
    pub code: u32,
    pub value: u64,
}

impl Exception {
    pub fn new(code: ExceptionCode, value: u64) -> Self {
        Self { code: code as u32, value }
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.code = ExceptionCode::None as u32;
        self.value = 0;
    }

    pub fn kind(&self) -> ExceptionCode {
        ExceptionCode::from_u32(self.code)
    }
}

impl From<(ExceptionCode, u64)> for Exception {
    fn from((code, value): (ExceptionCode, u64)) -> Self {
        Self::new(code, value)
    }
}

impl std::fmt::Debug for Exception {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}({:#x})", self.kind(), self.value)
    }
}

/// State shared between an execution thread and whoever controls it.
#[derive(Debug)]
pub struct ThreadControl {
    running: AtomicBool,
    interrupt: AtomicU32,
}

impl Default for ThreadControl {
    fn default() -> Self {
        Self { running: AtomicBool::new(true), interrupt: AtomicU32::new(0) }
    }
}

impl ThreadControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    /// Clears the running flag and forces the thread out of any compiled routine at its next
    /// preemption checkpoint.
    pub fn stop(&self) {
        self.set_running(false);
        self.interrupt();
    }

    pub fn interrupt(&self) {
        self.interrupt.fetch_add(1, Ordering::AcqRel);
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupt.load(Ordering::Acquire) != 0
    }

    /// Clears the interrupt counter, returning whether it was set.
    pub fn clear_interrupt(&self) -> bool {
        self.interrupt.swap(0, Ordering::AcqRel) != 0
    }

    pub(crate) fn interrupt_ptr(&self) -> *const AtomicU32 {
        &self.interrupt
    }
}

#[derive(Copy, Clone, Debug, Default)]
#[repr(C)]
pub struct Fuel {
    /// The number of operations remaining before the routine must return to the driver. Blocks
    /// that are not preemption points subtract from this without checking, so it may briefly
    /// become negative.
    pub remaining: i64,

    /// The value `remaining` was set to when the driver last refilled it.
    pub start: i64,
}

/// The per-thread guest state that compiled routines operate on.
///
/// The layout is `repr(C)` because compiled code accesses fields at fixed offsets (see
/// [layout]).
#[repr(C, align(16))]
pub struct ThreadState {
    pub regs: Regs,
    pub pc: u64,
    pub fuel: Fuel,
    pub exception: Exception,
    pub call_depth: u32,
    pub mode: ExecutionMode,

    /// Points at `control.interrupt`, polled by compiled code.
    interrupt: *const AtomicU32,

    /// Total number of operations executed, excluding those counted in the current `fuel` slice.
    pub icount: u64,

    /// The driver stops with `VmExit::InstructionLimit` once `icount` reaches this value.
    pub icount_limit: u64,

    /// Private so that `interrupt` always points into it, see [ThreadState::set_control].
    control: Arc<ThreadControl>,
    pub mem: Arc<GuestMemory>,
}

// Safety: `interrupt` points into the `ThreadControl` owned by `control`, which moves with the
// state and is itself `Sync`.
unsafe impl Send for ThreadState {}

impl ThreadState {
    pub fn new(mem: Arc<GuestMemory>) -> Self {
        Self::with_control(mem, ThreadControl::new())
    }

    pub fn with_control(mem: Arc<GuestMemory>, control: Arc<ThreadControl>) -> Self {
        Self {
            regs: Regs::new(),
            pc: 0,
            fuel: Fuel::default(),
            exception: Exception::none(),
            call_depth: 0,
            mode: ExecutionMode::default(),
            interrupt: control.interrupt_ptr(),
            icount: 0,
            icount_limit: u64::MAX,
            control,
            mem,
        }
    }

    pub fn read_reg(&self, reg: Register) -> u128 {
        self.regs.read(reg)
    }

    pub fn write_reg(&mut self, reg: Register, value: u128) {
        self.regs.write(reg, value)
    }

    /// Reads a general purpose register or flag.
    pub fn read_int(&self, index: u8) -> u64 {
        self.regs.read(Register::int(index)) as u64
    }

    pub fn write_int(&mut self, index: u8, value: u64) {
        self.regs.write(Register::int(index), value as u128)
    }

    pub fn read_vec(&self, index: u8) -> u128 {
        self.regs.read(Register::vec(index))
    }

    pub fn write_vec(&mut self, index: u8, value: u128) {
        self.regs.write(Register::vec(index), value)
    }

    pub fn control(&self) -> &Arc<ThreadControl> {
        &self.control
    }

    /// Replaces the control block, redirecting the interrupt polled by compiled code to it.
    pub fn set_control(&mut self, control: Arc<ThreadControl>) {
        self.interrupt = control.interrupt_ptr();
        self.control = control;
    }

    #[inline]
    pub fn icount(&self) -> u64 {
        self.icount + (self.fuel.start - self.fuel.remaining).max(0) as u64
    }

    /// Accounts for the fuel consumed since the last refill, then refills the budget to `fuel`.
    pub fn update_fuel(&mut self, fuel: u64) {
        self.icount = self.icount();
        let fuel = fuel.min(MAX_FUEL) as i64;
        self.fuel.start = fuel;
        self.fuel.remaining = fuel;
    }

    pub fn reset(&mut self) {
        self.regs = Regs::new();
        self.pc = 0;
        self.fuel = Fuel::default();
        self.exception.clear();
        self.call_depth = 0;
        self.icount = 0;
    }
}

impl std::fmt::Debug for ThreadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadState")
            .field("pc", &format_args!("{:#x}", self.pc))
            .field("mode", &self.mode)
            .field("exception", &self.exception)
            .field("icount", &self.icount())
            .field("regs", &self.regs)
            .finish()
    }
}

/// Byte offsets of the fields of [ThreadState] accessed by compiled code.
pub mod layout {
    use memoffset::offset_of;

    use super::{Exception, Fuel, ThreadState};
    use crate::regs::{Register, RegKind, Regs};

    pub fn reg(reg: Register) -> i32 {
        let base = offset_of!(ThreadState, regs);
        let offset = match reg.kind {
            RegKind::Int => offset_of!(Regs, int) + 8 * reg.index as usize,
            RegKind::Vector => offset_of!(Regs, vec) + 16 * reg.index as usize,
        };
        (base + offset) as i32
    }

    pub fn pc() -> i32 {
        offset_of!(ThreadState, pc) as i32
    }

    pub fn fuel_remaining() -> i32 {
        (offset_of!(ThreadState, fuel) + offset_of!(Fuel, remaining)) as i32
    }

    pub fn exception_code() -> i32 {
        (offset_of!(ThreadState, exception) + offset_of!(Exception, code)) as i32
    }

    pub fn exception_value() -> i32 {
        (offset_of!(ThreadState, exception) + offset_of!(Exception, value)) as i32
    }

    pub fn call_depth() -> i32 {
        offset_of!(ThreadState, call_depth) as i32
    }

    pub fn interrupt_ptr() -> i32 {
        offset_of!(ThreadState, interrupt) as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regs::{FLAG_C, NUM_INT_REGS};

    #[test]
    fn register_offsets_match_storage() {
        let mut state = ThreadState::new(Arc::new(GuestMemory::new()));
        state.write_int(5, 0x1234);
        state.write_int(FLAG_C, 1);
        state.write_vec(7, 0xdead_beef_u128 << 64);

        let base = &state as *const ThreadState as *const u8;
        let read_u64 = |offset: i32| unsafe { base.add(offset as usize).cast::<u64>().read() };
        let read_u128 = |offset: i32| unsafe { base.add(offset as usize).cast::<u128>().read() };

        assert_eq!(read_u64(layout::reg(Register::int(5))), 0x1234);
        assert_eq!(read_u64(layout::reg(Register::int(FLAG_C))), 1);
        assert_eq!(read_u128(layout::reg(Register::vec(7))), 0xdead_beef_u128 << 64);
        assert_eq!(layout::reg(Register::vec(0)) % 16, 0);
        assert!(layout::reg(Register::int(NUM_INT_REGS as u8 - 1)) < layout::pc());
    }

    #[test]
    fn fuel_accounting() {
        let mut state = ThreadState::new(Arc::new(GuestMemory::new()));
        state.update_fuel(100);
        state.fuel.remaining -= 30;
        assert_eq!(state.icount(), 30);
        state.update_fuel(10);
        assert_eq!(state.icount, 30);
        state.fuel.remaining -= 12;
        assert_eq!(state.icount(), 42);
    }

    #[test]
    fn interrupt_counter() {
        let control = ThreadControl::new();
        let state = ThreadState::with_control(Arc::new(GuestMemory::new()), control.clone());
        control.interrupt();
        assert_eq!(unsafe { (*state.interrupt).load(Ordering::Relaxed) }, 1);
        assert!(control.clear_interrupt());
        assert!(!control.is_interrupted());
        control.stop();
        assert!(!control.is_running());
        assert!(control.is_interrupted());
    }

    #[test]
    fn replaced_control_is_polled() {
        let old = ThreadControl::new();
        let mut state = ThreadState::with_control(Arc::new(GuestMemory::new()), old.clone());
        let new = ThreadControl::new();
        state.set_control(new.clone());
        drop(old);

        assert!(Arc::ptr_eq(state.control(), &new));
        new.interrupt();
        assert_eq!(unsafe { (*state.interrupt).load(Ordering::Relaxed) }, 1);
    }
}
