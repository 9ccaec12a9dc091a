pub mod a64;
pub mod config;
pub mod cpu;
pub mod decoder;
pub mod exit;
pub mod graph;
pub mod liveness;
pub mod regs;

#[cfg(test)]
mod test_util;

pub use crate::{
    config::Config,
    cpu::{
        layout, Exception, ExceptionCode, ExecutionMode, Fuel, ThreadControl, ThreadState,
        PAUSED_ADDR,
    },
    decoder::{decode, Operation},
    exit::VmExit,
    graph::{Block, BlockId, Graph, TranslateError},
    liveness::{Liveness, LivenessInfo},
    regs::{Register, RegisterMask},
};

use glacier_mem::GuestMemory;

/// Where the decoder fetches instruction words from.
pub trait InstructionSource {
    /// Reads the little-endian instruction word at `addr`.
    fn read_word(&self, addr: u64) -> Option<u32>;

    /// Returns whether every byte in `[addr, addr + len)` may be executed.
    fn is_executable(&self, addr: u64, len: u64) -> bool;

    /// Called before `[addr, addr + len)` is read for translation, so that writes from that point
    /// on are reported as modifying translated code.
    fn mark_code(&self, _addr: u64, _len: u64) {}
}

impl InstructionSource for GuestMemory {
    fn read_word(&self, addr: u64) -> Option<u32> {
        GuestMemory::read_word(self, addr).ok()
    }

    fn is_executable(&self, addr: u64, len: u64) -> bool {
        GuestMemory::is_executable(self, addr, len)
    }

    fn mark_code(&self, addr: u64, len: u64) {
        GuestMemory::mark_code(self, addr, len)
    }
}

impl<T: InstructionSource + ?Sized> InstructionSource for std::sync::Arc<T> {
    fn read_word(&self, addr: u64) -> Option<u32> {
        (**self).read_word(addr)
    }

    fn is_executable(&self, addr: u64, len: u64) -> bool {
        (**self).is_executable(addr, len)
    }

    fn mark_code(&self, addr: u64, len: u64) {
        (**self).mark_code(addr, len)
    }
}
