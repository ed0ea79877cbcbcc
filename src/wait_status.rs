use crate::kernel_metadata::signal_name;
use libc::{SIGSTOP, SIGTRAP};
use libc::{WEXITSTATUS, WIFEXITED, WIFSIGNALED, WIFSTOPPED, WSTOPSIG, WTERMSIG};
use std::fmt::{self, Display, Formatter};

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum WaitType {
    /// Task exited normally.
    Exit,
    /// Task exited due to fatal signal.
    FatalSignal,
    /// Task is in a signal-delivery-stop.
    SignalStop,
    /// Task is in a syscall-stop triggered by PTRACE_SYSCALL
    /// and PTRACE_O_TRACESYSGOOD.
    SyscallStop,
    /// Task is in a PTRACE_EVENT stop.
    PtraceEvent,
}

/// A decoded `waitpid` status word.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct WaitStatus {
    status: i32,
}

impl Default for WaitStatus {
    fn default() -> Self {
        Self::new(0)
    }
}

impl WaitStatus {
    pub fn new(status: i32) -> WaitStatus {
        WaitStatus { status }
    }

    pub fn wait_type(&self) -> WaitType {
        if self.exit_code().is_some() {
            return WaitType::Exit;
        }

        if self.fatal_sig().is_some() {
            return WaitType::FatalSignal;
        }

        if self.stop_sig().is_some() {
            return WaitType::SignalStop;
        }

        if self.is_syscall() {
            return WaitType::SyscallStop;
        }

        if self.ptrace_event().is_some() {
            return WaitType::PtraceEvent;
        }

        fatal!("Status {:#x} not understood", self.status);
    }

    /// Exit code if wait_type() == Exit, otherwise None.
    pub fn exit_code(&self) -> Option<i32> {
        unsafe {
            if WIFEXITED(self.status) {
                Some(WEXITSTATUS(self.status))
            } else {
                None
            }
        }
    }

    /// Fatal signal if wait_type() == FatalSignal, otherwise None.
    pub fn fatal_sig(&self) -> Option<i32> {
        unsafe {
            let termsig = WTERMSIG(self.status);
            if WIFSIGNALED(self.status) && termsig > 0 {
                Some(termsig)
            } else {
                None
            }
        }
    }

    /// Stop signal if wait_type() == SignalStop, otherwise None. A zero
    /// signal (rare but observed via PTRACE_INTERRUPT) is converted to
    /// SIGSTOP. Syscall-stops (SIGTRAP | 0x80, from PTRACE_O_TRACESYSGOOD)
    /// are not signal-stops.
    pub fn stop_sig(&self) -> Option<i32> {
        unsafe {
            // (status >> 16) & 0xff nonzero means some ptrace event.
            if !WIFSTOPPED(self.status) || ((self.status >> 16) & 0xff != 0) {
                return None;
            }
        }

        let mut sig: i32 = unsafe { WSTOPSIG(self.status) };
        if sig == (SIGTRAP | 0x80) {
            return None;
        }

        sig &= !0x80;
        if sig != 0 {
            Some(sig)
        } else {
            Some(SIGSTOP)
        }
    }

    pub fn is_syscall(&self) -> bool {
        unsafe {
            if self.ptrace_event().is_some() || !WIFSTOPPED(self.status) {
                return false;
            }

            WSTOPSIG(self.status) == (SIGTRAP | 0x80)
        }
    }

    /// ptrace event if wait_type() == PtraceEvent, None otherwise.
    pub fn ptrace_event(&self) -> Option<u32> {
        let event: u32 = ((self.status >> 16) & 0xff) as u32;
        if event == 0 {
            None
        } else {
            Some(event)
        }
    }

    /// Return a WaitStatus for a process exit.
    pub fn for_exit_code(code: i32) -> WaitStatus {
        debug_assert!(code >= 0 && code < 0x100);
        WaitStatus { status: code << 8 }
    }

    /// Return a WaitStatus for a fatal signal.
    pub fn for_fatal_sig(sig: i32) -> WaitStatus {
        debug_assert!(sig >= 1 && sig < 0x80);
        WaitStatus { status: sig }
    }

    /// Return a WaitStatus for a stop signal.
    pub fn for_stop_sig(sig: i32) -> WaitStatus {
        debug_assert!(sig >= 1 && sig < 0x80);
        WaitStatus {
            status: (sig << 8) | 0x7f,
        }
    }

    /// Return a WaitStatus for a PTRACE_O_TRACESYSGOOD syscall-stop.
    pub fn for_syscall_stop() -> WaitStatus {
        WaitStatus {
            status: (((SIGTRAP | 0x80) << 8) | 0x7f),
        }
    }

    pub fn get(&self) -> i32 {
        self.status
    }
}

impl Display for WaitStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.status)?;
        match self.wait_type() {
            WaitType::Exit => write!(f, " (EXIT-{})", self.exit_code().unwrap()),
            WaitType::FatalSignal => {
                write!(f, " (FATAL-{})", signal_name(self.fatal_sig().unwrap()))
            }
            WaitType::SignalStop => write!(f, " (STOP-{})", signal_name(self.stop_sig().unwrap())),
            WaitType::SyscallStop => write!(f, " (SYSCALL)"),
            WaitType::PtraceEvent => {
                write!(f, " (PTRACE_EVENT({}))", self.ptrace_event().unwrap())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_round_trip() {
        let status = WaitStatus::for_exit_code(3);
        assert_eq!(WaitType::Exit, status.wait_type());
        assert_eq!(Some(3), status.exit_code());
        assert_eq!(None, status.stop_sig());
    }

    #[test]
    fn fatal_sig_round_trip() {
        let status = WaitStatus::for_fatal_sig(libc::SIGKILL);
        assert_eq!(WaitType::FatalSignal, status.wait_type());
        assert_eq!(Some(libc::SIGKILL), status.fatal_sig());
    }

    #[test]
    fn stop_sig_round_trip() {
        let status = WaitStatus::for_stop_sig(libc::SIGCHLD);
        assert_eq!(WaitType::SignalStop, status.wait_type());
        assert_eq!(Some(libc::SIGCHLD), status.stop_sig());
        assert!(!status.is_syscall());
    }

    #[test]
    fn syscall_stop_is_not_a_signal_stop() {
        let status = WaitStatus::for_syscall_stop();
        assert_eq!(WaitType::SyscallStop, status.wait_type());
        assert!(status.is_syscall());
        assert_eq!(None, status.stop_sig());
    }
}
