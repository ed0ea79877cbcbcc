use crate::registers::Registers;
use libc::pid_t;
use std::fmt::{self, Display, Formatter};

/// Global monotonic event counter identifying a frame in the trace.
pub type FrameTime = u64;

/// Why the recorded task stopped at this frame.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum StopReason {
    /// The recorder set up its scratch region here; the replay mirrors the
    /// mapping (PROT_NONE) so the address-space layouts agree.
    InitScratchMem,
    /// Syscall-buffer flush pseudo-event.
    Flush,
    /// The task exited; no more frames for it follow.
    Exit,
    /// An asynchronous signal was delivered (the recorded value is the
    /// signal number, stored here un-negated).
    Signal(i32),
    /// A syscall boundary.
    Syscall(i32),
}

impl Display for StopReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::InitScratchMem => write!(f, "INIT_SCRATCH_MEM"),
            StopReason::Flush => write!(f, "FLUSH"),
            StopReason::Exit => write!(f, "EXIT"),
            StopReason::Signal(sig) => write!(f, "signal {}", sig),
            StopReason::Syscall(no) => write!(f, "syscall {}", no),
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ExecState {
    SyscallEntry,
    SyscallExit,
}

/// One recorded event, as handed out by the trace layer.
#[derive(Clone)]
pub struct TraceFrame {
    pub global_time: FrameTime,
    pub tid: pid_t,
    pub stop_reason: StopReason,
    pub state: ExecState,
    pub recorded_regs: Registers,
}

impl Default for TraceFrame {
    fn default() -> Self {
        // Placeholder until the first frame for the task is read.
        TraceFrame {
            global_time: 0,
            tid: 0,
            stop_reason: StopReason::Flush,
            state: ExecState::SyscallEntry,
            recorded_regs: Registers::default(),
        }
    }
}

/// What the trace interpreter asks the scheduler to do in order to retire
/// the current frame.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum TraceStep {
    /// Nothing left to do; the frame is retired as-is.
    Retire,
    /// Advance to the next syscall entry (or emulated entry).
    EnterSyscall { syscallno: i32, emu: bool },
    /// Advance past the syscall exit, re-applying recorded side effects.
    ExitSyscall {
        syscallno: i32,
        emu: bool,
        /// Recorded memory-side-effect blobs to write back into the tracee.
        num_side_effects: usize,
        /// Whether the recorded return value is installed rather than
        /// produced by the kernel.
        emu_ret: bool,
    },
}
