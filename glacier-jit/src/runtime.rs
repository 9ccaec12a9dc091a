//! Functions called from compiled code. Every function takes a pointer to the [ThreadState] of
//! the thread running the routine, failures are reported through [ThreadState::exception].

use glacier_cpu::{decoder::INSTRUCTION_SIZE, Exception, ExceptionCode, ThreadState};
use glacier_mem::perm;

fn load<const N: usize>(state: *mut ThreadState, addr: u64) -> [u8; N] {
    // Safety: compiled code only calls runtime functions with the state it was entered with.
    let state = unsafe { &mut *state };
    match state.mem.read(addr, perm::READ) {
        Ok(value) => value,
        Err(e) => {
            state.exception = Exception::new(ExceptionCode::from_load_error(e), addr);
            [0; N]
        }
    }
}

macro_rules! load_ty {
    ($name:ident, $ty:ty) => {
        pub extern "C" fn $name(state: *mut ThreadState, addr: u64) -> $ty {
            <$ty>::from_le_bytes(load(state, addr))
        }
    };
}

load_ty!(load8, u8);
load_ty!(load16, u16);
load_ty!(load32, u32);
load_ty!(load64, u64);

fn store<const N: usize>(state: *mut ThreadState, addr: u64, value: [u8; N]) {
    // Safety: see `load`.
    let state = unsafe { &mut *state };
    if let Err(e) = state.mem.write(addr, value, perm::WRITE) {
        state.exception = Exception::new(ExceptionCode::from_store_error(e), addr);
    }
}

macro_rules! store_ty {
    ($name:ident, $ty:ty) => {
        pub extern "C" fn $name(state: *mut ThreadState, addr: u64, value: $ty) {
            store(state, addr, value.to_le_bytes())
        }
    };
}

store_ty!(store8, u8);
store_ty!(store16, u16);
store_ty!(store32, u32);
store_ty!(store64, u64);

/// Raises the exception for an instruction that could not be decoded at `addr`: either the bytes
/// were not executable, or they do not encode a supported instruction.
pub extern "C" fn undefined_instruction(state: *mut ThreadState, addr: u64) {
    // Safety: see `load`.
    let state = unsafe { &mut *state };
    let executable =
        addr % INSTRUCTION_SIZE == 0 && state.mem.is_executable(addr, INSTRUCTION_SIZE);
    let code = match executable {
        true => ExceptionCode::InvalidInstruction,
        false => ExceptionCode::ExecViolation,
    };
    state.exception = Exception::new(code, addr);
}
