use crate::log::LogLevel::LogWarn;
use crate::trace_frame::{ExecState, FrameTime, StopReason, TraceFrame};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

/// When to checksum tracee memory against the recording: at every frame, at
/// every syscall exit, or from a given frame time onwards.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Checksum {
    ChecksumSyscall,
    ChecksumAll,
    ChecksumAt(FrameTime),
}

impl Checksum {
    /// Should this frame's memory be validated? Only meaningful once the
    /// recorded image has been exec'd (the caller gates on that).
    pub fn applies_to(self, frame: &TraceFrame) -> bool {
        match self {
            Checksum::ChecksumAll => true,
            Checksum::ChecksumSyscall => frame.state == ExecState::SyscallExit,
            Checksum::ChecksumAt(time) => time <= frame.global_time,
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum DumpOn {
    DumpOnAll,
    DumpOnSignal(i32),
    DumpOnSyscall(i32),
}

impl DumpOn {
    pub fn applies_to(self, reason: StopReason) -> bool {
        match self {
            DumpOn::DumpOnAll => true,
            DumpOn::DumpOnSignal(sig) => reason == StopReason::Signal(sig),
            DumpOn::DumpOnSyscall(no) => reason == StopReason::Syscall(no),
        }
    }
}

/// Process-wide configuration. The replay core has no CLI of its own; the
/// embedding front-end parses whatever surface it exposes and hands the
/// result to `Flags::init` exactly once, before any session is built.
#[derive(Clone, Default)]
pub struct Flags {
    /// User override for architecture detection, e.g. when running under
    /// a hypervisor that scrambles CPUID.
    pub forced_uarch: Option<String>,
    /// Suppress warnings about environmental features outside our control.
    pub suppress_environment_warnings: bool,
    /// Force the tool to do some things that it otherwise wouldn't, for
    /// example continuing after IN_TX ticks were observed under the KVM
    /// PMU bug.
    pub force_things: bool,
    /// Drive the whole trace to completion without a debugger attached.
    pub autopilot: bool,
    /// TCP port the debugger transport listens on.
    pub dbgport: Option<u16>,
    /// When to checksum tracee memory during replay.
    pub checksum: Option<Checksum>,
    /// Dump tracee memory at frames with this stop reason.
    pub dump_on: Option<DumpOn>,
    /// Dump tracee memory at this frame time.
    pub dump_at: Option<FrameTime>,
    /// Echo tracee stdio writes to the console.
    pub redirect: bool,
    /// Also count hardware interrupts, retired instructions and page
    /// faults alongside ticks.
    pub extra_perf_counters: bool,
}

lazy_static! {
    static ref FLAGS: RwLock<Flags> = RwLock::new(Flags::default());
}

static FLAGS_INITIALIZED: AtomicBool = AtomicBool::new(false);

impl Flags {
    pub fn get() -> Flags {
        FLAGS.read().unwrap().clone()
    }

    /// Install the process-wide configuration. Only the first call takes
    /// effect; PMU attribute templates and quirk caches are derived from
    /// these values once and never recomputed.
    pub fn init(flags: Flags) {
        if FLAGS_INITIALIZED.swap(true, Ordering::SeqCst) {
            log!(LogWarn, "Flags already initialized; ignoring");
            return;
        }
        *FLAGS.write().unwrap() = flags;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace_frame::{ExecState, StopReason, TraceFrame};

    fn frame(reason: StopReason, state: ExecState, time: FrameTime) -> TraceFrame {
        TraceFrame {
            global_time: time,
            tid: 1,
            stop_reason: reason,
            state,
            ..TraceFrame::default()
        }
    }

    #[test]
    fn checksum_schedules() {
        let entry = frame(StopReason::Syscall(1), ExecState::SyscallEntry, 50);
        let exit = frame(StopReason::Syscall(1), ExecState::SyscallExit, 50);
        assert!(Checksum::ChecksumAll.applies_to(&entry));
        assert!(!Checksum::ChecksumSyscall.applies_to(&entry));
        assert!(Checksum::ChecksumSyscall.applies_to(&exit));
        assert!(Checksum::ChecksumAt(50).applies_to(&entry));
        assert!(Checksum::ChecksumAt(51).applies_to(&entry) == false);
    }

    #[test]
    fn dump_on_matching() {
        assert!(DumpOn::DumpOnAll.applies_to(StopReason::Flush));
        assert!(DumpOn::DumpOnSignal(11).applies_to(StopReason::Signal(11)));
        assert!(!DumpOn::DumpOnSignal(11).applies_to(StopReason::Signal(6)));
        assert!(DumpOn::DumpOnSyscall(1).applies_to(StopReason::Syscall(1)));
        assert!(!DumpOn::DumpOnSyscall(1).applies_to(StopReason::Flush));
    }
}
