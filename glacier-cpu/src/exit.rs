use crate::ExceptionCode;

#[derive(PartialEq, Eq, Copy, Clone)]
pub enum VmExit {
    /// The thread is still running.
    Running,

    /// The thread exited because it reached its instruction count limit.
    InstructionLimit,

    /// The thread exited because it executed a breakpoint instruction.
    Breakpoint,

    /// The thread exited because it was interrupted and the environment asked it to stop.
    Interrupted,

    /// The guest transferred control to address zero.
    Halt,

    /// The `running` flag of the thread was cleared.
    Stopped,

    /// The thread exited due to an unhandled exception.
    UnhandledException((ExceptionCode, u64)),
}

impl Default for VmExit {
    fn default() -> Self {
        Self::Running
    }
}

impl std::fmt::Debug for VmExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "Running"),
            Self::InstructionLimit => write!(f, "InstructionLimit"),
            Self::Breakpoint => write!(f, "Breakpoint"),
            Self::Interrupted => write!(f, "Interrupted"),
            Self::Halt => write!(f, "Halt"),
            Self::Stopped => write!(f, "Stopped"),
            Self::UnhandledException((code, value)) => {
                write!(f, "UnhandledException(code={code:?}, value={value:#0x})")
            }
        }
    }
}
