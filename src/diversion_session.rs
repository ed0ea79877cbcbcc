//! A diversion lets the debugger run hypothetical code (e.g. `call foo()`)
//! against a copy of the replay's tracees, then throw the side effects
//! away. Tracee memory is copy-on-write from a remote fork; kernel state is
//! shared with the host, so diversions are expected to be short-lived.

use crate::breakpoints::BreakpointTable;
use crate::dbg_connection::{DbgConnection, DbgRequest, DbgRequestKind};
use crate::log::LogLevel::LogDebug;
use crate::remote_ptr::RemotePtr;
use crate::replay_session::{
    dispatch_one_request, next_session_id, ReplaySession, TaskRegistry,
};
use crate::task::{ReplayTask, ResumeRequest};
use libc::pid_t;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum DiversionStatus {
    /// Some execution was done. diversion_step() can be called again.
    DiversionContinue,
    /// All tracees are dead. diversion_step() should not be called again.
    DiversionExited,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum BreakReason {
    BreakNone,
    /// A signal stopped the task.
    BreakSignal(i32),
    /// One of our software breakpoints was hit.
    BreakBreakpoint,
    /// A requested singlestep completed.
    BreakSinglestepComplete,
    /// A watchpoint fired at the given address. The core never sets
    /// hardware watchpoints itself, but the controller reports them for
    /// session implementations that do.
    BreakWatchpoint(RemotePtr<u8>),
}

#[derive(Copy, Clone, Debug)]
pub struct DiversionResult {
    pub status: DiversionStatus,
    pub break_reason: BreakReason,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum RunCommand {
    RunContinue,
    RunSinglestep,
}

/// Syscalls whose params are namespaced identifiers: recorded values may
/// name different, live resources now, and a diversion must not shoot down
/// bystander processes. Filesystem operations are optimistically assumed to
/// be intended by the user.
fn is_destructive_syscall(syscallno: i64) -> bool {
    syscallno == libc::SYS_kill
        || syscallno == libc::SYS_tkill
        || syscallno == libc::SYS_tgkill
        || syscallno == libc::SYS_rt_sigqueueinfo
        || syscallno == libc::SYS_rt_tgsigqueueinfo
}

/// A transient session holding forked copies of the replay's tasks. Client
/// references are counted; at zero the diversion is considered dying and
/// the next resume returns control to the replay.
pub struct DiversionSession {
    tasks: HashMap<pid_t, ReplayTask>,
    /// Shared with the parent replay: the int3 bytes were forked into the
    /// diversion tasks' memory too.
    breakpoints: Rc<RefCell<BreakpointTable>>,
    pub(crate) refcount: u32,
    /// Session id of the replay this was cloned from.
    parent_id: u32,
    unique_id: u32,
    awaiting_syscall_exit: HashSet<pid_t>,
    neutered_syscall: HashSet<pid_t>,
}

impl TaskRegistry for DiversionSession {
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

impl DiversionSession {
    pub(crate) fn new(
        breakpoints: Rc<RefCell<BreakpointTable>>,
        parent_id: u32,
    ) -> DiversionSession {
        DiversionSession {
            tasks: HashMap::new(),
            breakpoints,
            refcount: 0,
            parent_id,
            unique_id: next_session_id(),
            awaiting_syscall_exit: HashSet::new(),
            neutered_syscall: HashSet::new(),
        }
    }

    /// Fork every task of `replay` into a new diversion session.
    pub fn clone_from_replay(replay: &mut ReplaySession) -> DiversionSession {
        let mut session = DiversionSession::new(replay.breakpoints_handle(), replay.unique_id());
        let mut children = Vec::new();
        for t in replay.tasks_mut().values_mut() {
            children.push(clone_task_for_diversion(t));
        }
        for child in children {
            session.adopt_task(child);
        }
        log!(
            LogDebug,
            "Cloned replay session {} into diversion session {}",
            session.parent_id,
            session.unique_id
        );
        session
    }

    pub fn unique_id(&self) -> u32 {
        self.unique_id
    }

    pub fn parent_id(&self) -> u32 {
        self.parent_id
    }

    pub fn num_tasks(&self) -> usize {
        self.tasks.len()
    }

    pub(crate) fn adopt_task(&mut self, t: ReplayTask) {
        if self.tasks.insert(t.rec_tid, t).is_some() {
            fatal!("Diversion task registered twice");
        }
    }

    fn deregister(&mut self, rec_tid: pid_t) {
        self.tasks.remove(&rec_tid);
        self.awaiting_syscall_exit.remove(&rec_tid);
        self.neutered_syscall.remove(&rec_tid);
    }

    /// Try to make progress: run `rec_tid` until the next syscall boundary
    /// (or one instruction), classify the stop, and say whether the
    /// diversion is still alive.
    pub fn diversion_step(&mut self, rec_tid: pid_t, command: RunCommand) -> DiversionResult {
        match self.tasks.get_mut(&rec_tid) {
            Some(t) => match command {
                RunCommand::RunContinue => {
                    log!(LogDebug, "Continuing to next syscall");
                    t.resume(ResumeRequest::ResumeSyscall, 0);
                }
                RunCommand::RunSinglestep => {
                    log!(LogDebug, "Stepping to next insn/syscall");
                    t.resume(ResumeRequest::ResumeSinglestep, 0);
                }
            },
            None => {
                return DiversionResult {
                    status: DiversionStatus::DiversionExited,
                    break_reason: BreakReason::BreakNone,
                }
            }
        }

        let status = self.tasks.get_mut(&rec_tid).unwrap().wait();

        if status.exit_code().is_some() || status.fatal_sig().is_some() {
            self.deregister(rec_tid);
            let session_status = if self.tasks.is_empty() {
                DiversionStatus::DiversionExited
            } else {
                DiversionStatus::DiversionContinue
            };
            return DiversionResult {
                status: session_status,
                break_reason: BreakReason::BreakNone,
            };
        }

        if status.is_syscall() {
            self.process_syscall_stop(rec_tid);
            return DiversionResult {
                status: DiversionStatus::DiversionContinue,
                break_reason: BreakReason::BreakNone,
            };
        }

        let break_reason = match status.stop_sig() {
            Some(libc::SIGTRAP) => {
                let ip = self.tasks.get_mut(&rec_tid).unwrap().regs().ip();
                if self.breakpoints.borrow().ip_is_breakpoint(ip) {
                    BreakReason::BreakBreakpoint
                } else if command == RunCommand::RunSinglestep {
                    BreakReason::BreakSinglestepComplete
                } else {
                    BreakReason::BreakSignal(libc::SIGTRAP)
                }
            }
            Some(sig) => BreakReason::BreakSignal(sig),
            // Some other ptrace stop; nothing to report to the client.
            None => BreakReason::BreakNone,
        };
        DiversionResult {
            status: DiversionStatus::DiversionContinue,
            break_reason,
        }
    }

    /// Syscalls in a diversion run natively, except the destructive set,
    /// which is neutered at entry (syscall number rewritten to -1) and
    /// given a 0 return at exit.
    fn process_syscall_stop(&mut self, rec_tid: pid_t) {
        if !self.awaiting_syscall_exit.remove(&rec_tid) {
            self.awaiting_syscall_exit.insert(rec_tid);
            let t = self.tasks.get_mut(&rec_tid).unwrap();
            let regs = t.regs();
            let syscallno = regs.original_syscallno();
            if is_destructive_syscall(syscallno) {
                log!(LogDebug, "Suppressing syscall {}", syscallno);
                let mut neutered = regs;
                neutered.set_original_syscallno(-1);
                t.set_regs(&neutered);
                self.neutered_syscall.insert(rec_tid);
            } else {
                log!(LogDebug, "Executing syscall {}", syscallno);
            }
        } else if self.neutered_syscall.remove(&rec_tid) {
            let t = self.tasks.get_mut(&rec_tid).unwrap();
            let mut regs = t.regs();
            regs.set_syscall_result(0);
            t.set_regs(&regs);
        }
    }

    pub fn kill_all_tasks(&mut self) {
        for (_, mut t) in self.tasks.drain() {
            t.kill();
        }
        self.awaiting_syscall_exit.clear();
        self.neutered_syscall.clear();
    }
}

impl Drop for DiversionSession {
    fn drop(&mut self) {
        // Sessions can be created and destroyed many times over a debugging
        // session; don't hog tracee processes past our lifetime.
        self.kill_all_tasks();
        log!(LogDebug, "Diversion session {} dropped", self.unique_id);
    }
}

/// Fork a stopped tracee and adopt the child as a diversion task. A
/// `syscall; jmp .` pad is patched over the current ip so the child parks
/// itself right after the fork until PTRACE_ATTACH lands; it never executes
/// program text with the fork's return state. Both copies of the pad are
/// restored before returning.
pub(crate) fn clone_task_for_diversion(t: &mut ReplayTask) -> ReplayTask {
    const FORK_PAD: [u8; 4] = [0x0f, 0x05, 0xeb, 0xfe];

    let orig_regs = t.regs();
    let ip = orig_regs.ip();
    let saved_text = t.read_mem(ip, FORK_PAD.len());
    t.write_mem(ip, &FORK_PAD);

    let mut call_regs = orig_regs;
    call_regs.set_syscallno(libc::SYS_fork);
    t.set_regs(&call_regs);

    t.resume(ResumeRequest::ResumeSyscall, 0);
    let status = t.wait();
    ed_assert!(t, status.is_syscall(), "Expected fork entry, got {}", status);
    t.resume(ResumeRequest::ResumeSyscall, 0);
    let status = t.wait();
    ed_assert!(t, status.is_syscall(), "Expected fork exit, got {}", status);

    let child_tid = t.regs().syscall_result_signed() as pid_t;
    ed_assert!(t, child_tid > 0, "fork into diversion failed ({})", child_tid);

    t.write_mem(ip, &saved_text);
    t.set_regs(&orig_regs);

    let mut child = ReplayTask::new(t.rec_tid, child_tid);
    child.attach();
    // The child's pages are CoW copies holding the pad; undo it there too.
    child.write_mem(ip, &saved_text);
    child.set_regs(&orig_regs);
    log!(LogDebug, "forked diversion task {} from {}", child_tid, t.tid);
    child
}

/// Run a debugging diversion for `replay` until the client lets go of it:
/// clone the session, drive it from debugger requests, tear it down when
/// the reference count reaches zero (or the tracees die), and resume the
/// replay at `task`. The last request received is left in `req`.
pub fn divert(
    replay: &mut ReplaySession,
    dbg: &mut dyn DbgConnection,
    task: pid_t,
    req: &mut DbgRequest,
) {
    log!(
        LogDebug,
        "Starting debugging diversion for replay session {}",
        replay.unique_id()
    );
    debug_assert!(!replay.diversion_active);
    replay.diversion_active = true;

    let mut session = DiversionSession::clone_from_replay(replay);
    session.refcount = 1;

    let mut current = task;
    loop {
        current = match process_diversion_requests(&mut session, dbg, current, req) {
            Some(rec_tid) => rec_tid,
            None => break,
        };

        let command = if req.is_step_of(current) {
            RunCommand::RunSinglestep
        } else {
            RunCommand::RunContinue
        };
        let result = session.diversion_step(current, command);

        if result.status == DiversionStatus::DiversionExited {
            session.refcount = 0;
            dbg.notify_exit_code(0);
            break;
        }

        debug_assert_eq!(DiversionStatus::DiversionContinue, result.status);
        match result.break_reason {
            BreakReason::BreakNone => continue,
            BreakReason::BreakSignal(sig) => dbg.notify_stop(current, sig, RemotePtr::null()),
            BreakReason::BreakWatchpoint(addr) => dbg.notify_stop(current, libc::SIGTRAP, addr),
            BreakReason::BreakBreakpoint | BreakReason::BreakSinglestepComplete => {
                dbg.notify_stop(current, libc::SIGTRAP, RemotePtr::null())
            }
        }
    }

    log!(LogDebug, "... ending debugging diversion");
    if session.refcount != 0 {
        log!(
            LogDebug,
            "diversion dropped with {} live refs",
            session.refcount
        );
    }
    session.kill_all_tasks();
    replay.diversion_active = false;
}

/// Process debugger requests made through `dbg` until action needs to be
/// taken by the caller (a resume-execution request is received). Returns
/// the task to resume, or None when control should return to the replay.
pub(crate) fn process_diversion_requests(
    session: &mut DiversionSession,
    dbg: &mut dyn DbgConnection,
    mut current: pid_t,
    req: &mut DbgRequest,
) -> Option<pid_t> {
    loop {
        *req = dbg.get_request();

        if req.is_resume() {
            if session.refcount == 0 {
                return None;
            }
            return Some(current);
        }

        match &req.kind {
            DbgRequestKind::Restart => return None,
            DbgRequestKind::ReadSiginfo { len } => {
                log!(LogDebug, "Adding ref to diversion session");
                session.refcount += 1;
                let si_bytes = vec![0u8; *len];
                dbg.reply_read_siginfo(&si_bytes);
                continue;
            }
            DbgRequestKind::WriteSiginfo => {
                log!(LogDebug, "Removing reference to diversion session ...");
                debug_assert!(session.refcount > 0);
                session.refcount -= 1;
                if session.refcount == 0 {
                    log!(LogDebug, "  ... dying at next continue request");
                }
                dbg.reply_write_siginfo();
                continue;
            }
            _ => {}
        }

        if req.is_break_or_watch() && session.refcount == 0 {
            // Setting breakpoints in a dying diversion is assumed to be a
            // user action intended for the replay session, so return to it
            // now.
            return None;
        }

        // Inspection requests may select another live task.
        if req.target > 0 && session.find_task_mut(req.target).is_some() {
            current = req.target;
        }
        dispatch_one_request(session, dbg, current, req);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dbg_connection::testing::ScriptedConnection;

    fn empty_session() -> DiversionSession {
        DiversionSession::new(Rc::new(RefCell::new(BreakpointTable::new())), 1)
    }

    fn req(kind: DbgRequestKind) -> DbgRequest {
        DbgRequest { kind, target: -1 }
    }

    #[test]
    fn siginfo_requests_drive_the_refcount() {
        let mut session = empty_session();
        session.refcount = 1;
        let mut dbg = ScriptedConnection::new(vec![
            req(DbgRequestKind::ReadSiginfo { len: 128 }),
            req(DbgRequestKind::WriteSiginfo),
            req(DbgRequestKind::WriteSiginfo),
            req(DbgRequestKind::Cont),
        ]);
        let mut last = DbgRequest::continue_all();

        let resumed = process_diversion_requests(&mut session, &mut dbg, 1, &mut last);
        // READ_SIGINFO took it to 2, the two WRITE_SIGINFOs to 0, so the
        // resume request returns to the replay.
        assert_eq!(None, resumed);
        assert_eq!(0, session.refcount);
        assert_eq!(
            vec![
                "read_siginfo(len=128, zeroed=true)".to_string(),
                "write_siginfo()".to_string(),
                "write_siginfo()".to_string(),
            ],
            dbg.events
        );
        assert!(last.is_resume());
    }

    #[test]
    fn resume_with_live_refs_stays_in_the_diversion() {
        let mut session = empty_session();
        session.refcount = 1;
        let mut dbg = ScriptedConnection::new(vec![req(DbgRequestKind::Cont)]);
        let mut last = DbgRequest::continue_all();

        let resumed = process_diversion_requests(&mut session, &mut dbg, 7, &mut last);
        assert_eq!(Some(7), resumed);
        assert_eq!(1, session.refcount);
    }

    #[test]
    fn breakpoint_request_in_dying_diversion_returns_to_replay() {
        let mut session = empty_session();
        session.refcount = 0;
        let mut dbg = ScriptedConnection::new(vec![req(DbgRequestKind::SetSwBreak {
            addr: RemotePtr::from_val(0x1000),
        })]);
        let mut last = DbgRequest::continue_all();

        let resumed = process_diversion_requests(&mut session, &mut dbg, 1, &mut last);
        assert_eq!(None, resumed);
        // The request was not serviced here; it belongs to the replay.
        assert!(dbg.events.is_empty());
    }

    #[test]
    fn restart_always_returns() {
        let mut session = empty_session();
        session.refcount = 3;
        let mut dbg = ScriptedConnection::new(vec![req(DbgRequestKind::Restart)]);
        let mut last = DbgRequest::continue_all();

        assert_eq!(
            None,
            process_diversion_requests(&mut session, &mut dbg, 1, &mut last)
        );
    }

    #[test]
    fn destructive_syscall_set() {
        assert!(is_destructive_syscall(libc::SYS_kill));
        assert!(is_destructive_syscall(libc::SYS_tgkill));
        assert!(is_destructive_syscall(libc::SYS_rt_sigqueueinfo));
        assert!(!is_destructive_syscall(libc::SYS_write));
        assert!(!is_destructive_syscall(libc::SYS_open));
    }

    #[test]
    fn stepping_into_a_dead_diversion_reports_exit() {
        let mut session = empty_session();
        let result = session.diversion_step(42, RunCommand::RunContinue);
        assert_eq!(DiversionStatus::DiversionExited, result.status);
    }
}
