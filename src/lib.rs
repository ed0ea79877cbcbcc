//! Deterministic replay engine for Linux/x86-64: re-executes a recorded
//! process trace event by event, using the PMU's retired-conditional-branch
//! counter ("ticks") to stop tracees at precise instruction counts, with a
//! remote debugger dispatch loop and discardable "diversion" sessions for
//! hypothetical execution.
//!
//! The trace format and the debugger wire protocol proper live outside this
//! crate: the replay consumes them through `trace::TraceInterpreter` and
//! `dbg_connection::DbgConnection`.

#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate static_assertions;

#[macro_use]
pub mod log;

pub mod breakpoints;
pub mod dbg_connection;
pub mod dbg_register;
pub mod diversion_session;
pub mod flags;
pub mod kernel_metadata;
pub mod perf_counters;
pub mod perf_event;
pub mod registers;
pub mod remote_ptr;
pub mod replay_session;
pub mod scoped_fd;
pub mod task;
pub mod ticks;
pub mod trace;
pub mod trace_frame;
pub mod util;
pub mod wait_status;
