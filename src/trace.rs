//! The consumed surface of the trace layer. Reading and decoding the
//! on-disk trace, replaying the per-syscall semantics, signal delivery and
//! buffer flushes, and the memory checksum/dump machinery all live behind
//! this trait; the scheduler only sequences them.

use crate::remote_ptr::RemotePtr;
use crate::task::ReplayTask;
use crate::trace_frame::{TraceFrame, TraceStep};

/// Recorded bounds of a memory mapping, as stored alongside the trace.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MmappedFileStats {
    pub start: RemotePtr<u8>,
    pub end: RemotePtr<u8>,
}

impl MmappedFileStats {
    pub fn num_bytes(&self) -> usize {
        self.end - self.start
    }
}

pub trait TraceInterpreter {
    /// The next recorded frame, in trace order, or None at end of trace.
    fn read_next_trace_frame(&mut self) -> Option<TraceFrame>;

    /// Interpret the syscall frame current on `t` and say how to retire it.
    /// `redirect` requests that recorded stdio writes be echoed.
    fn process_syscall(&mut self, t: &mut ReplayTask, redirect: bool) -> TraceStep;

    /// Replay an asynchronous signal delivery, using the hardware tick
    /// counters to land on the recorded instruction. Register state is
    /// only validated when `validate` holds.
    fn process_signal(&mut self, t: &mut ReplayTask, validate: bool);

    /// Replay a syscall-buffer flush.
    fn process_flush(&mut self, t: &mut ReplayTask);

    /// Bounds of the scratch region recorded at the scratch-init marker.
    fn read_next_mmapped_file_stats(&mut self) -> MmappedFileStats;

    /// Write the next recorded memory-side-effect blob back into the
    /// tracee.
    fn apply_syscall_side_effect(&mut self, t: &mut ReplayTask);

    /// Note a scratch region so checksumming skips it.
    fn register_scratch(&mut self, addr: RemotePtr<u8>, num_bytes: usize);

    /// Dump the tracee's memory map under `tag` for offline comparison.
    fn dump_process_memory(&mut self, t: &ReplayTask, tag: &str);

    /// Checksum the tracee's memory against the recording; diverging
    /// contents are fatal inside.
    fn validate_process_memory(&mut self, t: &ReplayTask);
}
