use crate::breakpoints::BreakpointTable;
use crate::dbg_connection::{await_client_connection, DbgConnection, DbgRequest, DbgRequestKind};
use crate::flags::Flags;
use crate::log::LogLevel::{LogDebug, LogError, LogInfo, LogWarn};
use crate::registers::compare_register_files;
use crate::remote_ptr::RemotePtr;
use crate::task::{remote_syscall6, ReplayTask, ResumeRequest};
use crate::trace::{MmappedFileStats, TraceInterpreter};
use crate::trace_frame::{ExecState, StopReason, TraceStep};
use libc::pid_t;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicU32, Ordering};

static NEXT_SESSION_ID: AtomicU32 = AtomicU32::new(1);

pub(crate) fn next_session_id() -> u32 {
    NEXT_SESSION_ID.fetch_add(1, Ordering::SeqCst)
}

/// Re-borrow the debugger connection stored in `dbg` for a shorter
/// lifetime than the one it was originally handed to us with. This is
/// needed because passing `Option<&mut dyn DbgConnection>` by value into
/// a function on every loop iteration otherwise forces the borrow
/// checker to tie every reborrow to the outermost lifetime; routing the
/// reborrow through a raw pointer breaks that (spurious) dependency
/// without changing which references are ever live at once.
fn reborrow_dbg<'a>(
    dbg: &'a mut Option<&mut dyn DbgConnection>,
) -> Option<&'a mut dyn DbgConnection> {
    match dbg {
        Some(d) => {
            let raw = &mut **d as *mut dyn DbgConnection;
            Some(unsafe { &mut *raw })
        }
        None => None,
    }
}

/// Outcome of retiring one trace frame.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum FrameResult {
    Retired,
    /// The frame was a task exit; its context is gone.
    TaskExited,
    /// The client asked for a restart; this replay run is over and the
    /// front-end owns what happens next.
    Restarted,
}

/// What advancing to a syscall boundary produced.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum BoundaryOutcome {
    Reached,
    Trapped,
}

enum WaitVerdict {
    BoundaryReached,
    RetrySigchld,
    Trap,
    UnrecordedSignal(i32),
}

/// Tasks indexed by recorded tid, shared by the replay and diversion
/// dispatch loops.
pub(crate) trait TaskRegistry {
    fn find_task_mut(&mut self, rec_tid: pid_t) -> Option<&mut ReplayTask>;
    fn task_ids(&self) -> Vec<pid_t>;
    fn breakpoints(&self) -> Rc<RefCell<BreakpointTable>>;
}

fn task_mut(registry: &mut dyn TaskRegistry, rec_tid: pid_t) -> &mut ReplayTask {
    match registry.find_task_mut(rec_tid) {
        Some(t) => t,
        None => {
            fatal!("No task with recorded tid {}", rec_tid);
        }
    }
}

/// Service one non-resume debugger request against the given registry.
/// Requests that are not meaningful in this context are a protocol error.
pub(crate) fn dispatch_one_request(
    registry: &mut dyn TaskRegistry,
    dbg: &mut dyn DbgConnection,
    current: pid_t,
    req: &DbgRequest,
) {
    match &req.kind {
        DbgRequestKind::GetCurrentThread => {
            dbg.reply_get_current_thread(task_mut(registry, current).rec_tid);
        }
        DbgRequestKind::GetThreadList => {
            dbg.reply_get_thread_list(&registry.task_ids());
        }
        DbgRequestKind::GetIsThreadAlive => {
            dbg.reply_get_is_thread_alive(registry.find_task_mut(req.target).is_some());
        }
        DbgRequestKind::GetStopReason => {
            let target = if req.target > 0 { req.target } else { current };
            match registry.find_task_mut(target) {
                Some(t) => {
                    let sig = if t.child_sig != 0 { t.child_sig } else { -1 };
                    dbg.reply_get_stop_reason(t.rec_tid, sig);
                }
                None => dbg.reply_get_stop_reason(-1, -1),
            }
        }
        DbgRequestKind::GetReg { regno } => {
            let value = task_mut(registry, current).regs().read_reg(*regno);
            dbg.reply_get_reg(value);
        }
        DbgRequestKind::GetRegs => {
            let file = task_mut(registry, current).regs().dbg_regfile();
            dbg.reply_get_regs(&file);
        }
        DbgRequestKind::GetMem { addr, len } => {
            let mem = task_mut(registry, current).read_mem(*addr, *len);
            dbg.reply_get_mem(&mem);
        }
        DbgRequestKind::GetOffsets => {
            dbg.reply_get_offsets();
        }
        DbgRequestKind::Interrupt => {
            // Tell the debugger we stopped and await further instructions.
            dbg.notify_stop(current, 0, RemotePtr::null());
        }
        DbgRequestKind::SetSwBreak { addr } => {
            let breakpoints = registry.breakpoints();
            breakpoints
                .borrow_mut()
                .set(task_mut(registry, current), *addr);
            dbg.reply_watchpoint_request(0);
        }
        DbgRequestKind::RemoveSwBreak { addr } => {
            let breakpoints = registry.breakpoints();
            breakpoints
                .borrow_mut()
                .remove(task_mut(registry, current), *addr);
            dbg.reply_watchpoint_request(0);
        }
        DbgRequestKind::SetHwBreak { .. }
        | DbgRequestKind::RemoveHwBreak { .. }
        | DbgRequestKind::SetRdWatch { .. }
        | DbgRequestKind::RemoveRdWatch { .. }
        | DbgRequestKind::SetWrWatch { .. }
        | DbgRequestKind::RemoveWrWatch { .. }
        | DbgRequestKind::SetRdWrWatch { .. }
        | DbgRequestKind::RemoveRdWrWatch { .. } => {
            // Hardware breakpoints and watchpoints are not supported here.
            dbg.reply_watchpoint_request(-1);
        }
        _ => {
            fatal!("Unknown debugger request {:?}", req.kind);
        }
    }
}

/// Whether a SIGTRAP during boundary advance has one of the two legitimate
/// causes: a software breakpoint of ours at the preceding byte, or a
/// completed singlestep this task was asked to make.
pub(crate) fn trap_is_expected(
    breakpoints: &BreakpointTable,
    ip: RemotePtr<u8>,
    req: &DbgRequest,
    rec_tid: pid_t,
) -> bool {
    breakpoints.ip_is_breakpoint(ip) || req.is_step_of(rec_tid)
}

/// Drives recorded tasks from one trace frame to the next, pausing for the
/// debugger at frame boundaries and at traps.
pub struct ReplaySession {
    tasks: HashMap<pid_t, ReplayTask>,
    interpreter: Box<dyn TraceInterpreter>,
    breakpoints: Rc<RefCell<BreakpointTable>>,
    /// False until the first execve exit: before that the address space
    /// still holds our own image, so register comparison and debugger
    /// traffic are meaningless. Latched once, never reset.
    validate: bool,
    pub(crate) diversion_active: bool,
    unique_id: u32,
}

impl TaskRegistry for ReplaySession {
    fn find_task_mut(&mut self, rec_tid: pid_t) -> Option<&mut ReplayTask> {
        self.tasks.get_mut(&rec_tid)
    }

    fn task_ids(&self) -> Vec<pid_t> {
        let mut ids: Vec<pid_t> = self.tasks.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn breakpoints(&self) -> Rc<RefCell<BreakpointTable>> {
        self.breakpoints.clone()
    }
}

impl ReplaySession {
    pub fn new(interpreter: Box<dyn TraceInterpreter>) -> ReplaySession {
        ReplaySession {
            tasks: HashMap::new(),
            interpreter,
            breakpoints: Rc::new(RefCell::new(BreakpointTable::new())),
            validate: false,
            diversion_active: false,
            unique_id: next_session_id(),
        }
    }

    pub fn unique_id(&self) -> u32 {
        self.unique_id
    }

    pub fn breakpoints_handle(&self) -> Rc<RefCell<BreakpointTable>> {
        self.breakpoints.clone()
    }

    pub(crate) fn tasks_mut(&mut self) -> &mut HashMap<pid_t, ReplayTask> {
        &mut self.tasks
    }

    /// Adopt a live tracee thread under its recorded tid.
    pub fn register_task(&mut self, rec_tid: pid_t, tid: pid_t) {
        if self.tasks.insert(rec_tid, ReplayTask::new(rec_tid, tid)).is_some() {
            fatal!("Task with recorded tid {} registered twice", rec_tid);
        }
    }

    fn deregister_task(&mut self, rec_tid: pid_t) {
        if let Some(mut t) = self.tasks.remove(&rec_tid) {
            t.hpc.stop();
        }
        if self.tasks.is_empty() {
            // No tracees left for the 0xCC bytes to live in.
            self.breakpoints.borrow_mut().clear();
        }
    }

    pub fn num_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Replay the whole trace: while tasks remain registered, read the next
    /// frame and retire it, interleaving debugger requests.
    pub fn replay(&mut self, mut dbg: Option<&mut dyn DbgConnection>) {
        while !self.tasks.is_empty() {
            let rec_tid = match self.next_task() {
                Some(rec_tid) => rec_tid,
                None => {
                    log!(
                        LogWarn,
                        "Trace ended with {} tasks still registered",
                        self.tasks.len()
                    );
                    break;
                }
            };
            let d = reborrow_dbg(&mut dbg);
            if self.replay_one_trace_frame(d, rec_tid) == FrameResult::Restarted {
                log!(LogInfo, "Debugger requested restart; ending this run");
                return;
            }
        }

        if let Some(d) = dbg.as_mut() {
            d.notify_exit_code(0);
        }
        log!(LogInfo, "Replayer successfully finished.");
    }

    /// Read the next frame from the trace and hand it to its task,
    /// returning the task to run. None at end of trace.
    fn next_task(&mut self) -> Option<pid_t> {
        let frame = self.interpreter.read_next_trace_frame()?;
        let rec_tid = frame.tid;
        match self.tasks.get_mut(&rec_tid) {
            Some(t) => {
                t.trace_frame = frame;
                Some(rec_tid)
            }
            None => {
                fatal!(
                    "Trace frame at time {} names unknown task {}",
                    frame.global_time,
                    rec_tid
                );
            }
        }
    }

    /// Retire the frame current on `rec_tid`.
    pub fn replay_one_trace_frame(
        &mut self,
        mut dbg: Option<&mut dyn DbgConnection>,
        rec_tid: pid_t,
    ) -> FrameResult {
        // Advance the trace until we've exec()'d the tracee before
        // processing debugger requests.  Otherwise the debugger host will
        // be confused about the initial executable image, which is still
        // our own.
        let mut req = DbgRequest::continue_all();
        if self.validate {
            let d = reborrow_dbg(&mut dbg);
            req = self.process_debugger_requests(d, rec_tid);
            if req.kind == DbgRequestKind::Restart {
                return FrameResult::Restarted;
            }
            debug_assert!(req.is_resume());
        }

        let (time, stop_reason, state) = {
            let t = &self.tasks[&rec_tid];
            (
                t.trace_frame.global_time,
                t.trace_frame.stop_reason,
                t.trace_frame.state,
            )
        };

        if time % 10_000 == 0 {
            log!(LogInfo, "time: {}", time);
        }

        {
            let t = self.tasks.get_mut(&rec_tid).unwrap();
            if t.child_sig != 0 {
                ed_assert!(
                    t,
                    t.trace_frame.stop_reason == StopReason::Signal(t.child_sig),
                    "Pending signal {} does not match frame {}",
                    t.child_sig,
                    t.trace_frame.stop_reason
                );
                t.child_sig = 0;
            }
        }

        // Ask the trace-interpretation code what to do next in order to
        // retire the current frame.
        let mut step = TraceStep::Retire;
        match stop_reason {
            StopReason::InitScratchMem => {
                let file = self.interpreter.read_next_mmapped_file_stats();
                self.init_scratch_memory(rec_tid, &file);
                // For checksumming: make a note that this area is scratch
                // and need not be validated.
                let scratch_addr = {
                    let t = &self.tasks[&rec_tid];
                    RemotePtr::from_val(t.trace_frame.recorded_regs.syscall_result())
                };
                self.interpreter
                    .register_scratch(scratch_addr, file.num_bytes());
            }
            StopReason::Exit => {
                self.deregister_task(rec_tid);
                // Early-return because the task context is gone now.
                return FrameResult::TaskExited;
            }
            StopReason::Flush => {
                let Self {
                    tasks, interpreter, ..
                } = self;
                interpreter.process_flush(tasks.get_mut(&rec_tid).unwrap());
            }
            StopReason::Signal(_) => {
                let validate = self.validate;
                let Self {
                    tasks, interpreter, ..
                } = self;
                interpreter.process_signal(tasks.get_mut(&rec_tid).unwrap(), validate);
            }
            StopReason::Syscall(syscallno) => {
                if state == ExecState::SyscallExit && syscallno == libc::SYS_execve as i32 {
                    // The recorded image has been exec'd over our own.
                    self.validate = true;
                }
                let redirect = Flags::get().redirect;
                let Self {
                    tasks, interpreter, ..
                } = self;
                step = interpreter.process_syscall(tasks.get_mut(&rec_tid).unwrap(), redirect);
            }
        }

        // Advance until `step` has been fulfilled.
        while self.try_one_trace_step(rec_tid, step, &req) == BoundaryOutcome::Trapped {
            // We only understand software breakpoints and successful
            // stepi's; both were checked when the trap was classified.
            let ip = {
                let t = &self.tasks[&rec_tid];
                ed_assert!(t, t.child_sig == libc::SIGTRAP, "Unknown trap");
                t.regs().ip()
            };
            {
                let breakpoints = self.breakpoints.borrow();
                let t = &self.tasks[&rec_tid];
                ed_assert!(
                    t,
                    trap_is_expected(&breakpoints, ip, &req, rec_tid),
                    "Unexpected trap at {}",
                    ip
                );
            }

            // Notify the debugger and process any new requests that might
            // have triggered before resuming.
            if let Some(d) = dbg.as_mut() {
                d.notify_stop(rec_tid, 5 /* SIGTRAP: the gdb mandate */, RemotePtr::null());
            }
            let d = reborrow_dbg(&mut dbg);
            req = self.process_debugger_requests(d, rec_tid);
            if req.kind == DbgRequestKind::Restart {
                return FrameResult::Restarted;
            }
        }

        // Re-arm the counter interval after every frame except buffer
        // flushes, which don't reset the hpc in the recording either.
        if stop_reason != StopReason::Flush {
            let t = self.tasks.get_mut(&rec_tid).unwrap();
            if Flags::get().extra_perf_counters {
                let extra = t.hpc.read_extra();
                log!(
                    LogDebug,
                    "retired frame {} for task {} (ticks={}, page_faults={}, \
                     hw_interrupts={}, insns={})",
                    time,
                    rec_tid,
                    t.ticks,
                    extra.page_faults,
                    extra.hw_interrupts,
                    extra.instructions_retired
                );
            } else {
                log!(
                    LogDebug,
                    "retired frame {} for task {} (ticks={})",
                    time,
                    rec_tid,
                    t.ticks
                );
            }
            t.hpc.reset(0);
        }
        self.debug_memory(rec_tid);
        FrameResult::Retired
    }

    /// Reply to debugger requests until the debugger asks us to resume
    /// execution (or restart). With no debugger attached, every frame is
    /// implicitly "continue all".
    fn process_debugger_requests(
        &mut self,
        dbg: Option<&mut dyn DbgConnection>,
        rec_tid: pid_t,
    ) -> DbgRequest {
        let dbg = match dbg {
            Some(dbg) => dbg,
            None => return DbgRequest::continue_all(),
        };
        loop {
            let req = dbg.get_request();
            if req.is_resume() || req.kind == DbgRequestKind::Restart {
                return req;
            }
            dispatch_one_request(self, dbg, rec_tid, &req);
        }
    }

    /// Try to execute `step`, adjusting for `req` if needed. Trapped means
    /// there was a trap and `step` needs more work.
    fn try_one_trace_step(
        &mut self,
        rec_tid: pid_t,
        step: TraceStep,
        req: &DbgRequest,
    ) -> BoundaryOutcome {
        let stepi = req.is_step_of(rec_tid);
        match step {
            TraceStep::Retire => BoundaryOutcome::Reached,
            TraceStep::EnterSyscall { syscallno, emu } => {
                self.enter_syscall(rec_tid, syscallno, emu, stepi)
            }
            TraceStep::ExitSyscall {
                syscallno,
                emu,
                num_side_effects,
                emu_ret,
            } => self.exit_syscall(rec_tid, syscallno, emu, num_side_effects, emu_ret, stepi),
        }
    }

    /// Advance to the next syscall entry (or virtual entry) and validate.
    fn enter_syscall(
        &mut self,
        rec_tid: pid_t,
        syscallno: i32,
        emu: bool,
        stepi: bool,
    ) -> BoundaryOutcome {
        match self.cont_syscall_boundary(rec_tid, emu, stepi) {
            BoundaryOutcome::Trapped => BoundaryOutcome::Trapped,
            BoundaryOutcome::Reached => {
                self.validate_args(rec_tid, syscallno, ExecState::SyscallEntry);
                BoundaryOutcome::Reached
            }
        }
    }

    /// Advance past the syscall exit (or virtual exit): apply recorded
    /// memory side effects, install the recorded return value when it is
    /// emulated, validate, and for an emulated syscall step over the
    /// syscall instruction to leave the emulated entry.
    fn exit_syscall(
        &mut self,
        rec_tid: pid_t,
        syscallno: i32,
        emu: bool,
        num_side_effects: usize,
        emu_ret: bool,
        stepi: bool,
    ) -> BoundaryOutcome {
        if !emu {
            if let BoundaryOutcome::Trapped = self.cont_syscall_boundary(rec_tid, emu, stepi) {
                return BoundaryOutcome::Trapped;
            }
        }

        {
            let Self {
                tasks, interpreter, ..
            } = self;
            let t = tasks.get_mut(&rec_tid).unwrap();
            for _ in 0..num_side_effects {
                interpreter.apply_syscall_side_effect(t);
            }
            if emu_ret {
                let mut regs = t.regs();
                regs.set_syscall_result(t.trace_frame.recorded_regs.syscall_result());
                t.set_regs(&regs);
            }
        }
        self.validate_args(rec_tid, syscallno, ExecState::SyscallExit);

        if emu {
            self.step_exit_syscall_emu(rec_tid);
        }
        BoundaryOutcome::Reached
    }

    /// Step over the syscall instruction to "exit" the emulated syscall,
    /// preserving the register file across the step.
    fn step_exit_syscall_emu(&mut self, rec_tid: pid_t) {
        let t = self.tasks.get_mut(&rec_tid).unwrap();
        ed_assert!(t, t.replay_sig == 0);

        let regs = t.regs();
        t.resume(ResumeRequest::ResumeSysemuSinglestep, 0);
        t.wait();
        t.set_regs(&regs);

        t.replay_sig = 0;
        t.child_sig = 0;
    }

    /// Continue until reaching either the "entry" of an emulated syscall,
    /// or the entry or exit of an executed syscall. A pending SIGCHLD is
    /// suppressed and the advance retried: it is the only host-generated
    /// signal expected during replay, all others are emulated.
    fn cont_syscall_boundary(
        &mut self,
        rec_tid: pid_t,
        emu: bool,
        stepi: bool,
    ) -> BoundaryOutcome {
        loop {
            let verdict = {
                let t = self.tasks.get_mut(&rec_tid).unwrap();
                ed_assert!(t, t.replay_sig == 0);

                let how = match (emu, stepi) {
                    (true, true) => ResumeRequest::ResumeSysemuSinglestep,
                    (true, false) => ResumeRequest::ResumeSysemu,
                    (false, true) => ResumeRequest::ResumeSinglestep,
                    (false, false) => ResumeRequest::ResumeSyscall,
                };
                t.resume(how, t.replay_sig);
                let status = t.wait();

                if status.is_syscall() {
                    t.child_sig = 0;
                    WaitVerdict::BoundaryReached
                } else {
                    match status.stop_sig() {
                        Some(libc::SIGCHLD) => {
                            // Don't deliver it; wait for it to appear in
                            // the trace.
                            t.child_sig = 0;
                            WaitVerdict::RetrySigchld
                        }
                        Some(libc::SIGTRAP) => {
                            t.child_sig = libc::SIGTRAP;
                            WaitVerdict::Trap
                        }
                        Some(sig) => {
                            t.child_sig = sig;
                            WaitVerdict::UnrecordedSignal(sig)
                        }
                        None => {
                            ed_assert!(t, false, "Unexpected stop {}", status);
                            unreachable!()
                        }
                    }
                }
            };

            match verdict {
                WaitVerdict::BoundaryReached => return BoundaryOutcome::Reached,
                WaitVerdict::RetrySigchld => continue,
                WaitVerdict::Trap => return BoundaryOutcome::Trapped,
                WaitVerdict::UnrecordedSignal(sig) => {
                    log!(LogError, "Replay got unrecorded signal {}", sig);
                    self.emergency_debug(rec_tid);
                }
            }
        }
    }

    /// Compare the live register file against the recording. Nothing is
    /// validated before the first exec: the actual process did not start
    /// prior to that point.
    fn validate_args(&mut self, rec_tid: pid_t, syscallno: i32, state: ExecState) {
        if !self.validate {
            return;
        }
        let t = self.tasks.get_mut(&rec_tid).unwrap();
        let live = t.regs();
        let recorded = t.trace_frame.recorded_regs;
        if !compare_register_files("live", &live, "recorded", &recorded) {
            ed_assert!(
                t,
                false,
                "Register mismatch at syscall {}, state {:?}",
                syscallno,
                state
            );
        }
    }

    /// Mirror the recorder's scratch mapping, but PROT_NONE: the replayed
    /// address map should look like the recorded one if probed, while
    /// rogue reads or writes of scratch get caught.
    fn init_scratch_memory(&mut self, rec_tid: pid_t, file: &MmappedFileStats) {
        let t = self.tasks.get_mut(&rec_tid).unwrap();
        let ret = remote_syscall6(
            t,
            libc::SYS_mmap,
            &[
                file.start.as_usize() as u64,
                file.num_bytes() as u64,
                libc::PROT_NONE as u64,
                (libc::MAP_PRIVATE | libc::MAP_ANONYMOUS) as u64,
                -1i64 as u64,
                0,
            ],
        );
        ed_assert!(
            t,
            ret == file.start.as_usize() as i64,
            "Scratch mapping landed at {:#x}, recorded at {}",
            ret,
            file.start
        );
    }

    /// Dump or checksum tracee memory as the configuration asks.
    fn debug_memory(&mut self, rec_tid: pid_t) {
        let flags = Flags::get();
        let validate = self.validate;
        let Self {
            tasks, interpreter, ..
        } = self;
        let t = &tasks[&rec_tid];
        let frame = &t.trace_frame;

        if flags
            .dump_on
            .map_or(false, |d| d.applies_to(frame.stop_reason))
            || flags.dump_at == Some(frame.global_time)
        {
            let tag = format!("{}_{}_rep", t.rec_tid, frame.global_time);
            interpreter.dump_process_memory(t, &tag);
        }

        if validate
            && flags.checksum.map_or(false, |c| c.applies_to(frame))
        {
            interpreter.validate_process_memory(t);
        }
    }

    /// Replay diverged: attach an emergency debugger when interactive
    /// (listening on the tracee's pid as the port), abort in autopilot.
    fn emergency_debug(&mut self, rec_tid: pid_t) -> ! {
        if Flags::get().autopilot {
            fatal!("Replay diverged; can't resume execution from invalid state");
        }
        // The port is the live tid, verbatim; collisions with existing
        // listeners are possible and end the run.
        let port = self.tasks[&rec_tid].tid as u16;
        let mut dbg = await_client_connection(port);
        let _ = self.process_debugger_requests(Some(&mut dbg), rec_tid);
        fatal!("Can't resume execution from invalid state");
    }

    #[cfg(test)]
    pub(crate) fn force_validate(&mut self) {
        self.validate = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dbg_connection::testing::ScriptedConnection;
    use crate::trace::{MmappedFileStats, TraceInterpreter};
    use crate::trace_frame::TraceFrame;
    use std::collections::VecDeque;

    /// Replays a canned list of frames and records which hooks ran.
    struct ScriptedInterpreter {
        frames: VecDeque<TraceFrame>,
        calls: Vec<String>,
    }

    impl ScriptedInterpreter {
        fn new(frames: Vec<TraceFrame>) -> ScriptedInterpreter {
            ScriptedInterpreter {
                frames: frames.into(),
                calls: Vec::new(),
            }
        }
    }

    impl TraceInterpreter for ScriptedInterpreter {
        fn read_next_trace_frame(&mut self) -> Option<TraceFrame> {
            self.frames.pop_front()
        }

        fn process_syscall(&mut self, _t: &mut ReplayTask, _redirect: bool) -> TraceStep {
            self.calls.push("process_syscall".into());
            TraceStep::Retire
        }

        fn process_signal(&mut self, _t: &mut ReplayTask, validate: bool) {
            self.calls.push(format!("process_signal({})", validate));
        }

        fn process_flush(&mut self, _t: &mut ReplayTask) {
            self.calls.push("process_flush".into());
        }

        fn read_next_mmapped_file_stats(&mut self) -> MmappedFileStats {
            unimplemented!("not used in these tests")
        }

        fn apply_syscall_side_effect(&mut self, _t: &mut ReplayTask) {
            self.calls.push("apply_syscall_side_effect".into());
        }

        fn register_scratch(&mut self, _addr: RemotePtr<u8>, _num_bytes: usize) {
            self.calls.push("register_scratch".into());
        }

        fn dump_process_memory(&mut self, _t: &ReplayTask, tag: &str) {
            self.calls.push(format!("dump_process_memory({})", tag));
        }

        fn validate_process_memory(&mut self, _t: &ReplayTask) {
            self.calls.push("validate_process_memory".into());
        }
    }

    fn flush_frame(rec_tid: pid_t, time: u64) -> TraceFrame {
        TraceFrame {
            global_time: time,
            tid: rec_tid,
            stop_reason: StopReason::Flush,
            state: ExecState::SyscallEntry,
            ..TraceFrame::default()
        }
    }

    fn exit_frame(rec_tid: pid_t, time: u64) -> TraceFrame {
        TraceFrame {
            global_time: time,
            tid: rec_tid,
            stop_reason: StopReason::Exit,
            state: ExecState::SyscallEntry,
            ..TraceFrame::default()
        }
    }

    fn session_with_frames(frames: Vec<TraceFrame>) -> ReplaySession {
        let mut session = ReplaySession::new(Box::new(ScriptedInterpreter::new(frames)));
        // A tid no live process has; these tests never resume it.
        session.register_task(1, 4_000_000);
        session
    }

    #[test]
    fn requests_are_not_serviced_before_first_exec() {
        let mut session = session_with_frames(vec![flush_frame(1, 7), exit_frame(1, 8)]);
        // No scripted requests: any get_request would panic.
        let mut dbg = ScriptedConnection::new(vec![]);
        session.replay(Some(&mut dbg));
        assert_eq!(0, session.num_tasks());
        assert_eq!(vec!["notify_exit_code(0)".to_string()], dbg.events);
    }

    #[test]
    fn restart_ends_the_run() {
        let mut session = session_with_frames(vec![flush_frame(1, 7), exit_frame(1, 8)]);
        session.force_validate();
        let mut dbg = ScriptedConnection::new(vec![DbgRequest {
            kind: DbgRequestKind::Restart,
            target: -1,
        }]);
        session.replay(Some(&mut dbg));
        // The run stopped at the restart: the task was never deregistered
        // and no exit code was sent.
        assert_eq!(1, session.num_tasks());
        assert!(dbg.events.is_empty());
        assert!(dbg.requests.is_empty());
    }

    #[test]
    fn inspection_requests_are_serviced_inline() {
        let mut session = session_with_frames(vec![flush_frame(1, 7), exit_frame(1, 8)]);
        session.force_validate();
        let req = |kind| DbgRequest { kind, target: -1 };
        let mut dbg = ScriptedConnection::new(vec![
            req(DbgRequestKind::GetCurrentThread),
            req(DbgRequestKind::GetThreadList),
            DbgRequest {
                kind: DbgRequestKind::GetIsThreadAlive,
                target: 1,
            },
            DbgRequest {
                kind: DbgRequestKind::GetIsThreadAlive,
                target: 99,
            },
            req(DbgRequestKind::GetStopReason),
            req(DbgRequestKind::GetOffsets),
            DbgRequest {
                kind: DbgRequestKind::SetHwBreak {
                    addr: RemotePtr::from_val(0x1000),
                },
                target: 1,
            },
            req(DbgRequestKind::Interrupt),
            req(DbgRequestKind::Cont),
            // Consumed at the EXIT frame boundary.
            req(DbgRequestKind::Cont),
        ]);
        session.replay(Some(&mut dbg));
        assert_eq!(
            vec![
                "current_thread(1)".to_string(),
                "thread_list([1])".to_string(),
                "is_thread_alive(true)".to_string(),
                "is_thread_alive(false)".to_string(),
                "stop_reason(1, -1)".to_string(),
                "offsets()".to_string(),
                "watchpoint(-1)".to_string(),
                "notify_stop(1, 0, 0x0)".to_string(),
                "notify_exit_code(0)".to_string(),
            ],
            dbg.events
        );
    }

    #[test]
    fn trap_classification() {
        let breakpoints = BreakpointTable::new();
        let cont = DbgRequest::continue_all();
        let step_of_1 = DbgRequest {
            kind: DbgRequestKind::Step,
            target: 1,
        };

        // No breakpoint, continue request: unexpected.
        assert!(!trap_is_expected(
            &breakpoints,
            RemotePtr::from_val(0x1001),
            &cont,
            1
        ));
        // Stepping the trapping task: expected.
        assert!(trap_is_expected(
            &breakpoints,
            RemotePtr::from_val(0x1001),
            &step_of_1,
            1
        ));
        // Stepping some other task: unexpected.
        assert!(!trap_is_expected(
            &breakpoints,
            RemotePtr::from_val(0x1001),
            &step_of_1,
            2
        ));
    }

    #[test]
    fn breakpoint_trap_is_recognized_after_set() {
        use crate::breakpoints::TraceeMem;

        struct OneByte(u8);
        impl TraceeMem for OneByte {
            fn read_byte(&mut self, _addr: RemotePtr<u8>) -> u8 {
                self.0
            }
            fn write_byte(&mut self, _addr: RemotePtr<u8>, value: u8) {
                self.0 = value;
            }
        }

        let mut breakpoints = BreakpointTable::new();
        let mut mem = OneByte(0x90);
        let addr = RemotePtr::from_val(0x4000);
        breakpoints.set(&mut mem, addr);

        // The trap reports the byte after the int3.
        let cont = DbgRequest::continue_all();
        assert!(trap_is_expected(&breakpoints, addr + 1, &cont, 1));
        assert!(!trap_is_expected(&breakpoints, addr, &cont, 1));
    }
}
