//! The debugger transport: the request/reply surface the replay core
//! consumes, plus a fixed-frame codec over a TCP connection on 127.0.0.1.
//! A protocol front end (e.g. a GDB remote-serial bridge) sits on the other
//! side of the socket and translates to these frames.

use crate::dbg_register::DbgRegister;
use crate::log::LogLevel::LogInfo;
use crate::registers::DbgRegisterValue;
use crate::remote_ptr::RemotePtr;
use libc::pid_t;
use std::convert::TryInto;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};

// Request kind codes on the wire.
const DREQ_GET_CURRENT_THREAD: u32 = 0;
const DREQ_GET_THREAD_LIST: u32 = 1;
const DREQ_GET_IS_THREAD_ALIVE: u32 = 2;
const DREQ_GET_STOP_REASON: u32 = 3;
const DREQ_GET_REG: u32 = 4;
const DREQ_GET_REGS: u32 = 5;
const DREQ_GET_MEM: u32 = 6;
const DREQ_GET_OFFSETS: u32 = 7;
const DREQ_SET_MEM: u32 = 8;
const DREQ_SET_REG: u32 = 9;
const DREQ_INTERRUPT: u32 = 10;
const DREQ_SET_SW_BREAK: u32 = 11;
const DREQ_REMOVE_SW_BREAK: u32 = 12;
const DREQ_SET_HW_BREAK: u32 = 13;
const DREQ_REMOVE_HW_BREAK: u32 = 14;
const DREQ_SET_RD_WATCH: u32 = 15;
const DREQ_REMOVE_RD_WATCH: u32 = 16;
const DREQ_SET_WR_WATCH: u32 = 17;
const DREQ_REMOVE_WR_WATCH: u32 = 18;
const DREQ_SET_RDWR_WATCH: u32 = 19;
const DREQ_REMOVE_RDWR_WATCH: u32 = 20;
const DREQ_READ_SIGINFO: u32 = 21;
const DREQ_WRITE_SIGINFO: u32 = 22;
const DREQ_CONT: u32 = 23;
const DREQ_STEP: u32 = 24;
const DREQ_RESTART: u32 = 25;

// Reply tag codes.
const DREPLY_GET_CURRENT_THREAD: u32 = 0x100;
const DREPLY_GET_THREAD_LIST: u32 = 0x101;
const DREPLY_GET_IS_THREAD_ALIVE: u32 = 0x102;
const DREPLY_GET_STOP_REASON: u32 = 0x103;
const DREPLY_GET_REG: u32 = 0x104;
const DREPLY_GET_REGS: u32 = 0x105;
const DREPLY_GET_MEM: u32 = 0x106;
const DREPLY_GET_OFFSETS: u32 = 0x107;
const DREPLY_WATCHPOINT: u32 = 0x108;
const DREPLY_READ_SIGINFO: u32 = 0x109;
const DREPLY_WRITE_SIGINFO: u32 = 0x10a;
const DREPLY_NOTIFY_STOP: u32 = 0x180;
const DREPLY_NOTIFY_EXIT_CODE: u32 = 0x181;

/// A debugger request: what the client wants, and of which thread
/// (−1 meaning "all threads" / "any thread").
#[derive(Clone, Debug, PartialEq)]
pub struct DbgRequest {
    pub kind: DbgRequestKind,
    pub target: pid_t,
}

impl DbgRequest {
    /// The request the scheduler acts on when no debugger is attached.
    pub fn continue_all() -> DbgRequest {
        DbgRequest {
            kind: DbgRequestKind::Cont,
            target: -1,
        }
    }

    /// Resume-family requests hand control back to the scheduler.
    pub fn is_resume(&self) -> bool {
        matches!(self.kind, DbgRequestKind::Cont | DbgRequestKind::Step)
    }

    /// Whether this is a singlestep request targeting `rec_tid`.
    pub fn is_step_of(&self, rec_tid: pid_t) -> bool {
        self.kind == DbgRequestKind::Step && self.target == rec_tid
    }

    /// Any breakpoint or watchpoint manipulation, hardware or software.
    pub fn is_break_or_watch(&self) -> bool {
        use DbgRequestKind::*;
        matches!(
            self.kind,
            SetSwBreak { .. }
                | RemoveSwBreak { .. }
                | SetHwBreak { .. }
                | RemoveHwBreak { .. }
                | SetRdWatch { .. }
                | RemoveRdWatch { .. }
                | SetWrWatch { .. }
                | RemoveWrWatch { .. }
                | SetRdWrWatch { .. }
                | RemoveRdWrWatch { .. }
        )
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum DbgRequestKind {
    GetCurrentThread,
    GetThreadList,
    GetIsThreadAlive,
    GetStopReason,
    GetReg { regno: DbgRegister },
    GetRegs,
    GetMem { addr: RemotePtr<u8>, len: usize },
    GetOffsets,
    SetMem { addr: RemotePtr<u8>, bytes: Vec<u8> },
    SetReg { regno: DbgRegister, value: u64 },
    Interrupt,
    SetSwBreak { addr: RemotePtr<u8> },
    RemoveSwBreak { addr: RemotePtr<u8> },
    SetHwBreak { addr: RemotePtr<u8> },
    RemoveHwBreak { addr: RemotePtr<u8> },
    SetRdWatch { addr: RemotePtr<u8>, len: usize },
    RemoveRdWatch { addr: RemotePtr<u8>, len: usize },
    SetWrWatch { addr: RemotePtr<u8>, len: usize },
    RemoveWrWatch { addr: RemotePtr<u8>, len: usize },
    SetRdWrWatch { addr: RemotePtr<u8>, len: usize },
    RemoveRdWrWatch { addr: RemotePtr<u8>, len: usize },
    ReadSiginfo { len: usize },
    WriteSiginfo,
    Cont,
    Step,
    Restart,
}

/// The request/reply surface the dispatch loops drive. One implementation
/// frames these over TCP; tests script them directly.
pub trait DbgConnection {
    /// Block until the client sends the next request.
    fn get_request(&mut self) -> DbgRequest;

    /// Tell the client `thread` stopped with `sig` (0 = no signal), at
    /// `watch_addr` if a watchpoint fired.
    fn notify_stop(&mut self, thread: pid_t, sig: i32, watch_addr: RemotePtr<u8>);
    fn notify_exit_code(&mut self, code: i32);

    fn reply_get_current_thread(&mut self, thread: pid_t);
    fn reply_get_thread_list(&mut self, threads: &[pid_t]);
    fn reply_get_is_thread_alive(&mut self, alive: bool);
    /// `which` is the stopped thread's recorded tid, `sig` the last
    /// delivered signal (−1 if none).
    fn reply_get_stop_reason(&mut self, which: pid_t, sig: i32);
    fn reply_get_reg(&mut self, value: DbgRegisterValue);
    fn reply_get_regs(&mut self, file: &[DbgRegisterValue]);
    fn reply_get_mem(&mut self, mem: &[u8]);
    fn reply_get_offsets(&mut self);
    /// `code` 0 for success, negative for unsupported/failed.
    fn reply_watchpoint_request(&mut self, code: i32);
    fn reply_read_siginfo(&mut self, si_bytes: &[u8]);
    fn reply_write_siginfo(&mut self);
}

/// Little-endian fixed-header codec: 32-byte request frames, tag+length
/// reply frames. `S` is any bidirectional byte stream; production uses a
/// TcpStream.
pub struct FramedConnection<S> {
    stream: S,
}

impl<S: Read + Write> FramedConnection<S> {
    pub fn new(stream: S) -> FramedConnection<S> {
        FramedConnection { stream }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    fn read_exact_or_die(&mut self, buf: &mut [u8]) {
        if let Err(err) = self.stream.read_exact(buf) {
            fatal!("Debugger connection lost: {}", err);
        }
    }

    fn write_reply(&mut self, tag: u32, payload: &[u8]) {
        let mut frame = Vec::with_capacity(8 + payload.len());
        frame.extend_from_slice(&tag.to_le_bytes());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(payload);
        if let Err(err) = self.stream.write_all(&frame) {
            fatal!("Debugger connection lost: {}", err);
        }
        if let Err(err) = self.stream.flush() {
            fatal!("Debugger connection lost: {}", err);
        }
    }
}

impl<S: Read + Write> DbgConnection for FramedConnection<S> {
    fn get_request(&mut self) -> DbgRequest {
        let mut header = [0u8; 32];
        self.read_exact_or_die(&mut header);
        let kind = u32::from_le_bytes(header[0..4].try_into().unwrap());
        let target = i32::from_le_bytes(header[4..8].try_into().unwrap());
        let addr_raw = u64::from_le_bytes(header[8..16].try_into().unwrap());
        let len = u64::from_le_bytes(header[16..24].try_into().unwrap()) as usize;
        let regno = u32::from_le_bytes(header[24..28].try_into().unwrap());
        let addr = RemotePtr::<u8>::from_val(addr_raw as usize);

        let kind = match kind {
            DREQ_GET_CURRENT_THREAD => DbgRequestKind::GetCurrentThread,
            DREQ_GET_THREAD_LIST => DbgRequestKind::GetThreadList,
            DREQ_GET_IS_THREAD_ALIVE => DbgRequestKind::GetIsThreadAlive,
            DREQ_GET_STOP_REASON => DbgRequestKind::GetStopReason,
            DREQ_GET_REG => DbgRequestKind::GetReg { regno },
            DREQ_GET_REGS => DbgRequestKind::GetRegs,
            DREQ_GET_MEM => DbgRequestKind::GetMem { addr, len },
            DREQ_GET_OFFSETS => DbgRequestKind::GetOffsets,
            DREQ_SET_MEM => {
                let mut bytes = vec![0u8; len];
                self.read_exact_or_die(&mut bytes);
                DbgRequestKind::SetMem { addr, bytes }
            }
            DREQ_SET_REG => DbgRequestKind::SetReg {
                regno,
                value: addr_raw,
            },
            DREQ_INTERRUPT => DbgRequestKind::Interrupt,
            DREQ_SET_SW_BREAK => DbgRequestKind::SetSwBreak { addr },
            DREQ_REMOVE_SW_BREAK => DbgRequestKind::RemoveSwBreak { addr },
            DREQ_SET_HW_BREAK => DbgRequestKind::SetHwBreak { addr },
            DREQ_REMOVE_HW_BREAK => DbgRequestKind::RemoveHwBreak { addr },
            DREQ_SET_RD_WATCH => DbgRequestKind::SetRdWatch { addr, len },
            DREQ_REMOVE_RD_WATCH => DbgRequestKind::RemoveRdWatch { addr, len },
            DREQ_SET_WR_WATCH => DbgRequestKind::SetWrWatch { addr, len },
            DREQ_REMOVE_WR_WATCH => DbgRequestKind::RemoveWrWatch { addr, len },
            DREQ_SET_RDWR_WATCH => DbgRequestKind::SetRdWrWatch { addr, len },
            DREQ_REMOVE_RDWR_WATCH => DbgRequestKind::RemoveRdWrWatch { addr, len },
            DREQ_READ_SIGINFO => DbgRequestKind::ReadSiginfo { len },
            DREQ_WRITE_SIGINFO => DbgRequestKind::WriteSiginfo,
            DREQ_CONT => DbgRequestKind::Cont,
            DREQ_STEP => DbgRequestKind::Step,
            DREQ_RESTART => DbgRequestKind::Restart,
            other => {
                fatal!("Unknown debugger request {}", other);
            }
        };
        DbgRequest { kind, target }
    }

    fn notify_stop(&mut self, thread: pid_t, sig: i32, watch_addr: RemotePtr<u8>) {
        let mut payload = Vec::with_capacity(16);
        payload.extend_from_slice(&thread.to_le_bytes());
        payload.extend_from_slice(&sig.to_le_bytes());
        payload.extend_from_slice(&(watch_addr.as_usize() as u64).to_le_bytes());
        self.write_reply(DREPLY_NOTIFY_STOP, &payload);
    }

    fn notify_exit_code(&mut self, code: i32) {
        self.write_reply(DREPLY_NOTIFY_EXIT_CODE, &code.to_le_bytes());
    }

    fn reply_get_current_thread(&mut self, thread: pid_t) {
        self.write_reply(DREPLY_GET_CURRENT_THREAD, &thread.to_le_bytes());
    }

    fn reply_get_thread_list(&mut self, threads: &[pid_t]) {
        let mut payload = Vec::with_capacity(4 * threads.len());
        for tid in threads {
            payload.extend_from_slice(&tid.to_le_bytes());
        }
        self.write_reply(DREPLY_GET_THREAD_LIST, &payload);
    }

    fn reply_get_is_thread_alive(&mut self, alive: bool) {
        self.write_reply(DREPLY_GET_IS_THREAD_ALIVE, &[alive as u8]);
    }

    fn reply_get_stop_reason(&mut self, which: pid_t, sig: i32) {
        let mut payload = Vec::with_capacity(8);
        payload.extend_from_slice(&which.to_le_bytes());
        payload.extend_from_slice(&sig.to_le_bytes());
        self.write_reply(DREPLY_GET_STOP_REASON, &payload);
    }

    fn reply_get_reg(&mut self, value: DbgRegisterValue) {
        self.write_reply(DREPLY_GET_REG, &encode_reg(&value));
    }

    fn reply_get_regs(&mut self, file: &[DbgRegisterValue]) {
        let mut payload = Vec::with_capacity(13 * file.len());
        for value in file {
            payload.extend_from_slice(&encode_reg(value));
        }
        self.write_reply(DREPLY_GET_REGS, &payload);
    }

    fn reply_get_mem(&mut self, mem: &[u8]) {
        self.write_reply(DREPLY_GET_MEM, mem);
    }

    fn reply_get_offsets(&mut self) {
        self.write_reply(DREPLY_GET_OFFSETS, &[]);
    }

    fn reply_watchpoint_request(&mut self, code: i32) {
        self.write_reply(DREPLY_WATCHPOINT, &code.to_le_bytes());
    }

    fn reply_read_siginfo(&mut self, si_bytes: &[u8]) {
        self.write_reply(DREPLY_READ_SIGINFO, si_bytes);
    }

    fn reply_write_siginfo(&mut self) {
        self.write_reply(DREPLY_WRITE_SIGINFO, &[]);
    }
}

fn encode_reg(value: &DbgRegisterValue) -> [u8; 13] {
    let mut out = [0u8; 13];
    out[0..4].copy_from_slice(&value.regno.to_le_bytes());
    out[4..12].copy_from_slice(&value.value.to_le_bytes());
    out[12] = value.defined as u8;
    out
}

/// Bind 127.0.0.1:`port` and block until a debugger client connects.
pub fn await_client_connection(port: u16) -> FramedConnection<TcpStream> {
    let listener = match TcpListener::bind(("127.0.0.1", port)) {
        Ok(listener) => listener,
        Err(err) => {
            fatal!("Couldn't bind debugger port 127.0.0.1:{}: {}", port, err);
        }
    };
    log!(
        LogInfo,
        "Awaiting debugger connection on 127.0.0.1:{} ...",
        port
    );
    match listener.accept() {
        Ok((stream, peer)) => {
            log!(LogInfo, "Debugger connected from {}", peer);
            FramedConnection::new(stream)
        }
        Err(err) => {
            fatal!("accept() on debugger port {} failed: {}", port, err);
        }
    }
}

/// A connection whose requests are scripted up front and whose replies are
/// recorded as readable event strings.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Default)]
    pub(crate) struct ScriptedConnection {
        pub requests: VecDeque<DbgRequest>,
        pub events: Vec<String>,
    }

    impl ScriptedConnection {
        pub fn new(requests: Vec<DbgRequest>) -> ScriptedConnection {
            ScriptedConnection {
                requests: requests.into(),
                events: Vec::new(),
            }
        }
    }

    impl DbgConnection for ScriptedConnection {
        fn get_request(&mut self) -> DbgRequest {
            self.requests
                .pop_front()
                .expect("scripted connection ran out of requests")
        }

        fn notify_stop(&mut self, thread: pid_t, sig: i32, watch_addr: RemotePtr<u8>) {
            self.events
                .push(format!("notify_stop({}, {}, {})", thread, sig, watch_addr));
        }

        fn notify_exit_code(&mut self, code: i32) {
            self.events.push(format!("notify_exit_code({})", code));
        }

        fn reply_get_current_thread(&mut self, thread: pid_t) {
            self.events.push(format!("current_thread({})", thread));
        }

        fn reply_get_thread_list(&mut self, threads: &[pid_t]) {
            self.events.push(format!("thread_list({:?})", threads));
        }

        fn reply_get_is_thread_alive(&mut self, alive: bool) {
            self.events.push(format!("is_thread_alive({})", alive));
        }

        fn reply_get_stop_reason(&mut self, which: pid_t, sig: i32) {
            self.events.push(format!("stop_reason({}, {})", which, sig));
        }

        fn reply_get_reg(&mut self, value: DbgRegisterValue) {
            self.events.push(format!(
                "reg({}, {:#x}, {})",
                value.regno, value.value, value.defined
            ));
        }

        fn reply_get_regs(&mut self, file: &[DbgRegisterValue]) {
            self.events.push(format!("regs(len={})", file.len()));
        }

        fn reply_get_mem(&mut self, mem: &[u8]) {
            self.events.push(format!("mem(len={})", mem.len()));
        }

        fn reply_get_offsets(&mut self) {
            self.events.push("offsets()".to_string());
        }

        fn reply_watchpoint_request(&mut self, code: i32) {
            self.events.push(format!("watchpoint({})", code));
        }

        fn reply_read_siginfo(&mut self, si_bytes: &[u8]) {
            self.events.push(format!(
                "read_siginfo(len={}, zeroed={})",
                si_bytes.len(),
                si_bytes.iter().all(|b| *b == 0)
            ));
        }

        fn reply_write_siginfo(&mut self) {
            self.events.push("write_siginfo()".to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn request_frame(kind: u32, target: i32, addr: u64, len: u64, regno: u32) -> Vec<u8> {
        let mut frame = Vec::with_capacity(32);
        frame.extend_from_slice(&kind.to_le_bytes());
        frame.extend_from_slice(&target.to_le_bytes());
        frame.extend_from_slice(&addr.to_le_bytes());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&regno.to_le_bytes());
        frame.extend_from_slice(&0u32.to_le_bytes());
        frame
    }

    #[test]
    fn decodes_get_mem() {
        let frame = request_frame(DREQ_GET_MEM, 42, 0x7000, 16, 0);
        let mut conn = FramedConnection::new(Cursor::new(frame));
        let req = conn.get_request();
        assert_eq!(42, req.target);
        assert_eq!(
            DbgRequestKind::GetMem {
                addr: RemotePtr::from_val(0x7000),
                len: 16
            },
            req.kind
        );
        assert!(!req.is_resume());
    }

    #[test]
    fn decodes_set_mem_payload() {
        let mut frame = request_frame(DREQ_SET_MEM, 1, 0x5000, 3, 0);
        frame.extend_from_slice(&[0xaa, 0xbb, 0xcc]);
        let mut conn = FramedConnection::new(Cursor::new(frame));
        let req = conn.get_request();
        assert_eq!(
            DbgRequestKind::SetMem {
                addr: RemotePtr::from_val(0x5000),
                bytes: vec![0xaa, 0xbb, 0xcc]
            },
            req.kind
        );
    }

    #[test]
    fn resume_classification() {
        for (kind, resume) in [
            (DREQ_CONT, true),
            (DREQ_STEP, true),
            (DREQ_RESTART, false),
            (DREQ_INTERRUPT, false),
        ]
        .iter()
        {
            let frame = request_frame(*kind, -1, 0, 0, 0);
            let mut conn = FramedConnection::new(Cursor::new(frame));
            assert_eq!(*resume, conn.get_request().is_resume());
        }
    }

    #[test]
    fn step_targeting() {
        let frame = request_frame(DREQ_STEP, 7, 0, 0, 0);
        let mut conn = FramedConnection::new(Cursor::new(frame));
        let req = conn.get_request();
        assert!(req.is_step_of(7));
        assert!(!req.is_step_of(8));
    }

    #[test]
    fn break_and_watch_classification() {
        let frame = request_frame(DREQ_SET_RDWR_WATCH, 1, 0x100, 8, 0);
        let mut conn = FramedConnection::new(Cursor::new(frame));
        assert!(conn.get_request().is_break_or_watch());

        let frame = request_frame(DREQ_GET_REGS, 1, 0, 0, 0);
        let mut conn = FramedConnection::new(Cursor::new(frame));
        assert!(!conn.get_request().is_break_or_watch());
    }

    #[test]
    fn reply_framing() {
        let mut conn = FramedConnection::new(Cursor::new(Vec::new()));
        conn.reply_get_stop_reason(9, -1);
        let bytes = conn.into_inner().into_inner();
        assert_eq!(&DREPLY_GET_STOP_REASON.to_le_bytes(), &bytes[0..4]);
        assert_eq!(&8u32.to_le_bytes(), &bytes[4..8]);
        assert_eq!(&9i32.to_le_bytes(), &bytes[8..12]);
        assert_eq!(&(-1i32).to_le_bytes(), &bytes[12..16]);
    }

    #[test]
    fn notify_stop_framing() {
        let mut conn = FramedConnection::new(Cursor::new(Vec::new()));
        conn.notify_stop(3, 5, RemotePtr::null());
        let bytes = conn.into_inner().into_inner();
        assert_eq!(&DREPLY_NOTIFY_STOP.to_le_bytes(), &bytes[0..4]);
        assert_eq!(&16u32.to_le_bytes(), &bytes[4..8]);
        assert_eq!(&3i32.to_le_bytes(), &bytes[8..12]);
        assert_eq!(&5i32.to_le_bytes(), &bytes[12..16]);
    }
}
