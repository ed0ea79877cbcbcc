use crate::breakpoints::TraceeMem;
use crate::kernel_metadata::{ptrace_req_name, signal_name};
use crate::log::LogLevel::LogDebug;
use crate::perf_counters::PerfCounters;
use crate::registers::Registers;
use crate::remote_ptr::RemotePtr;
use crate::ticks::Ticks;
use crate::trace_frame::TraceFrame;
use crate::wait_status::WaitStatus;
use libc::{c_long, c_uint, pid_t};
use nix::errno::errno;
use std::mem::{size_of, zeroed};
use std::ptr;

// Not part of the official ptrace-request enum; x86-only.
const PTRACE_SYSEMU: c_uint = 31;
const PTRACE_SYSEMU_SINGLESTEP: c_uint = 32;

/// How to resume a stopped tracee.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ResumeRequest {
    /// Run to the next syscall boundary.
    ResumeSyscall,
    /// Execute one instruction.
    ResumeSinglestep,
    /// Run to the next syscall boundary without the kernel executing the
    /// syscall.
    ResumeSysemu,
    /// One instruction, suppressing any syscall it performs.
    ResumeSysemuSinglestep,
}

/// The replay-side image of one recorded task: the stable recorded thread
/// id, the live thread actually being driven, signal bookkeeping, the
/// hardware counters and the trace frame being retired.
pub struct ReplayTask {
    /// Thread id recorded in the trace; stable across replays.
    pub rec_tid: pid_t,
    /// Live thread id of the tracee.
    pub tid: pid_t,
    /// Signal to deliver at the next resume, 0 for none.
    pub replay_sig: i32,
    /// Signal observed at the last stop, 0 for none.
    pub child_sig: i32,
    /// Last observed waitpid status.
    pub status: WaitStatus,
    /// Ticks harvested from the counters so far, accumulated at each stop.
    pub ticks: Ticks,
    pub hpc: PerfCounters,
    pub trace_frame: TraceFrame,
}

impl ReplayTask {
    pub fn new(rec_tid: pid_t, tid: pid_t) -> ReplayTask {
        ReplayTask {
            rec_tid,
            tid,
            replay_sig: 0,
            child_sig: 0,
            status: WaitStatus::default(),
            ticks: 0,
            hpc: PerfCounters::new(tid),
            trace_frame: TraceFrame::default(),
        }
    }

    fn ptrace_fallible(
        &self,
        request: c_uint,
        addr: *mut libc::c_void,
        data: *mut libc::c_void,
    ) -> c_long {
        unsafe {
            *libc::__errno_location() = 0;
            libc::ptrace(request, self.tid, addr, data)
        }
    }

    fn ptrace_or_die(&self, request: c_uint, addr: *mut libc::c_void, data: *mut libc::c_void) {
        if self.ptrace_fallible(request, addr, data) == -1 && errno() != 0 {
            fatal!(
                "{} failed for tid {}",
                ptrace_req_name(request),
                self.tid
            );
        }
    }

    /// Resume execution, delivering `sig` to the tracee if nonzero.
    pub fn resume(&mut self, how: ResumeRequest, sig: i32) {
        let request = match how {
            ResumeRequest::ResumeSyscall => libc::PTRACE_SYSCALL,
            ResumeRequest::ResumeSinglestep => libc::PTRACE_SINGLESTEP,
            ResumeRequest::ResumeSysemu => PTRACE_SYSEMU,
            ResumeRequest::ResumeSysemuSinglestep => PTRACE_SYSEMU_SINGLESTEP,
        };
        log!(
            LogDebug,
            "resuming {} with {} (sig: {})",
            self.tid,
            ptrace_req_name(request),
            signal_name(sig)
        );
        self.ptrace_or_die(request, ptr::null_mut(), sig as usize as *mut libc::c_void);
    }

    /// Block until the tracee stops (or dies), recording the status and
    /// harvesting the ticks the interval produced.
    pub fn wait(&mut self) -> WaitStatus {
        let mut raw_status: i32 = 0;
        let ret = unsafe { libc::waitpid(self.tid, &mut raw_status, libc::__WALL) };
        if ret != self.tid {
            fatal!("waitpid({}) failed", self.tid);
        }
        self.status = WaitStatus::new(raw_status);

        let more_ticks = self.hpc.read_ticks(self);
        // We stop counting here because there may be things we want to do
        // to the tracee that would otherwise generate ticks.
        self.hpc.stop_counting();
        self.ticks += more_ticks;

        self.status
    }

    pub fn regs(&self) -> Registers {
        let mut regs: libc::user_regs_struct = unsafe { zeroed() };
        self.ptrace_or_die(
            libc::PTRACE_GETREGS,
            ptr::null_mut(),
            &mut regs as *mut libc::user_regs_struct as *mut libc::c_void,
        );
        Registers::from_ptrace(regs)
    }

    pub fn set_regs(&mut self, regs: &Registers) {
        let mut raw = *regs.ptrace_regs();
        self.ptrace_or_die(
            libc::PTRACE_SETREGS,
            ptr::null_mut(),
            &mut raw as *mut libc::user_regs_struct as *mut libc::c_void,
        );
    }

    pub fn ip(&self) -> RemotePtr<u8> {
        self.regs().ip()
    }

    fn peek_word(&self, addr: usize) -> c_long {
        let val = self.ptrace_fallible(
            libc::PTRACE_PEEKDATA,
            addr as *mut libc::c_void,
            ptr::null_mut(),
        );
        if val == -1 && errno() != 0 {
            fatal!("PTRACE_PEEKDATA at {:#x} (tid {}) failed", addr, self.tid);
        }
        val
    }

    fn poke_word(&self, addr: usize, word: c_long) {
        self.ptrace_or_die(
            libc::PTRACE_POKEDATA,
            addr as *mut libc::c_void,
            word as usize as *mut libc::c_void,
        );
    }

    /// Read `len` bytes of tracee memory starting at `addr`.
    pub fn read_mem(&self, addr: RemotePtr<u8>, len: usize) -> Vec<u8> {
        const WORD: usize = size_of::<c_long>();
        let mut result = Vec::with_capacity(len);
        let mut pos = addr.as_usize();
        while result.len() < len {
            let word = self.peek_word(pos).to_ne_bytes();
            let want = std::cmp::min(WORD, len - result.len());
            result.extend_from_slice(&word[..want]);
            pos += WORD;
        }
        result
    }

    /// Write `bytes` into tracee memory at `addr`, read-modify-writing the
    /// partial word at the tail.
    pub fn write_mem(&self, addr: RemotePtr<u8>, bytes: &[u8]) {
        const WORD: usize = size_of::<c_long>();
        let mut pos = addr.as_usize();
        let mut remaining = bytes;
        while !remaining.is_empty() {
            let mut word = [0u8; WORD];
            if remaining.len() >= WORD {
                word.copy_from_slice(&remaining[..WORD]);
                remaining = &remaining[WORD..];
            } else {
                word = self.peek_word(pos).to_ne_bytes();
                word[..remaining.len()].copy_from_slice(remaining);
                remaining = &[];
            }
            self.poke_word(pos, c_long::from_ne_bytes(word));
            pos += WORD;
        }
    }

    /// Attach to an already-running thread (used to adopt diversion
    /// children) and swallow the attach stop.
    pub fn attach(&mut self) {
        self.ptrace_or_die(libc::PTRACE_ATTACH, ptr::null_mut(), ptr::null_mut());
        let status = self.wait();
        ed_assert!(
            self,
            status.stop_sig().is_some(),
            "Expected attach stop, got {}",
            status
        );
        // Make syscall-stops distinguishable from SIGTRAPs.
        self.ptrace_or_die(
            libc::PTRACE_SETOPTIONS,
            ptr::null_mut(),
            libc::PTRACE_O_TRACESYSGOOD as usize as *mut libc::c_void,
        );
    }

    /// Forcibly end the tracee and reap it.
    pub fn kill(&mut self) {
        self.hpc.stop();
        unsafe {
            libc::kill(self.tid, libc::SIGKILL);
        }
        let mut raw_status: i32 = 0;
        unsafe {
            libc::waitpid(self.tid, &mut raw_status, libc::__WALL);
        }
    }
}

impl TraceeMem for ReplayTask {
    fn read_byte(&mut self, addr: RemotePtr<u8>) -> u8 {
        self.read_mem(addr, 1)[0]
    }

    fn write_byte(&mut self, addr: RemotePtr<u8>, value: u8) {
        self.write_mem(addr, &[value]);
    }
}

/// The x86-64 `syscall` instruction.
pub const SYSCALL_INSN: [u8; 2] = [0x0f, 0x05];

/// Execute one syscall inside the stopped tracee: a syscall instruction is
/// patched over the current ip, driven through entry and exit, and the
/// original text and registers restored. Returns the syscall's result.
pub fn remote_syscall6(
    t: &mut ReplayTask,
    syscallno: i64,
    args: &[u64; 6],
) -> i64 {
    let orig_regs = t.regs();
    let ip = orig_regs.ip();
    let saved_insn = t.read_mem(ip, SYSCALL_INSN.len());
    t.write_mem(ip, &SYSCALL_INSN);

    let mut call_regs = orig_regs;
    call_regs.set_syscallno(syscallno);
    call_regs.set_arg1(args[0]);
    call_regs.set_arg2(args[1]);
    call_regs.set_arg3(args[2]);
    call_regs.set_arg4(args[3]);
    call_regs.set_arg5(args[4]);
    call_regs.set_arg6(args[5]);
    t.set_regs(&call_regs);

    // Through the entry stop and the exit stop.
    t.resume(ResumeRequest::ResumeSyscall, 0);
    let status = t.wait();
    ed_assert!(
        t,
        status.is_syscall(),
        "Expected syscall-entry stop, got {}",
        status
    );
    t.resume(ResumeRequest::ResumeSyscall, 0);
    let status = t.wait();
    ed_assert!(
        t,
        status.is_syscall(),
        "Expected syscall-exit stop, got {}",
        status
    );

    let result = t.regs().syscall_result_signed();
    t.write_mem(ip, &saved_insn);
    t.set_regs(&orig_regs);
    log!(
        LogDebug,
        "injected syscall {} in {} returned {:#x}",
        syscallno,
        t.tid,
        result
    );
    result
}
