use glacier_cpu::{ThreadState, VmExit};

/// Hooks that let an embedder service guest events without leaving
/// [crate::Translator::execute_with_env].
pub trait Environment {
    /// Called when a routine exits with `state.exception` set.
    ///
    /// Returning `Some(VmExit::Running)` resumes execution at `state.pc` with the exception
    /// cleared, any other exit is returned to the caller. `None` leaves the exception to the
    /// default handling.
    fn handle_exception(&mut self, state: &mut ThreadState) -> Option<VmExit>;

    /// Called after the thread was paused by [glacier_cpu::ThreadControl::interrupt] while still
    /// running. `None` resumes execution.
    fn handle_interrupt(&mut self, _state: &mut ThreadState) -> Option<VmExit> {
        None
    }
}

impl Environment for () {
    fn handle_exception(&mut self, _: &mut ThreadState) -> Option<VmExit> {
        None
    }
}
