use crate::kernel_metadata::errno_name;
use backtrace::Backtrace;
use nix::errno::errno;
use std::collections::HashMap;
use std::env;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Result, Write};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

#[derive(Copy, Clone, Eq, PartialEq, PartialOrd)]
pub enum LogLevel {
    LogFatal,
    LogError,
    LogWarn,
    LogInfo,
    LogDebug,
}

pub use LogLevel::*;

struct LogGlobals {
    level_map: HashMap<String, LogLevel>,
    default_level: LogLevel,
    /// Possibly buffered.
    log_file: Box<dyn Write + Send>,
}

lazy_static! {
    static ref LOG_GLOBALS: Mutex<LogGlobals> = {
        let mut f: Box<dyn Write + Send> = if let Ok(filename) = env::var("RETRACE_LOG_FILE") {
            Box::new(File::create(&filename).unwrap())
        } else if let Ok(filename) = env::var("RETRACE_APPEND_LOG_FILE") {
            Box::new(
                OpenOptions::new()
                    .append(true)
                    .create(true)
                    .open(&filename)
                    .unwrap(),
            )
        } else {
            Box::new(io::stderr())
        };

        if let Ok(buf_size) = env::var("RETRACE_LOG_BUFFER") {
            let log_buffer_size = buf_size.parse::<usize>().unwrap();
            f = Box::new(BufWriter::with_capacity(log_buffer_size, f));
        }

        Mutex::new(LogGlobals {
            level_map: HashMap::new(),
            default_level: LogInfo,
            log_file: f,
        })
    };
}

/// Raise or lower the level for one module (the file stem of the source
/// file doing the logging).
pub fn set_logging(module_name: &str, level: LogLevel) {
    let mut l = LOG_GLOBALS.lock().unwrap();
    l.level_map.insert(module_name.to_owned(), level);
}

pub fn set_all_logging(level: LogLevel) {
    let mut l = LOG_GLOBALS.lock().unwrap();
    l.default_level = level;
    l.level_map.clear();
}

fn get_log_level(module_name: &str, l: &MutexGuard<LogGlobals>) -> LogLevel {
    // Module names come from filenames and those are case sensitive on Linux.
    match l.level_map.get(module_name) {
        Some(level) => *level,
        None => l.default_level,
    }
}

fn filename_to_module_name(filename: &str) -> String {
    Path::new(filename)
        .file_stem()
        .unwrap()
        .to_string_lossy()
        .to_string()
}

fn log_name(level: LogLevel) -> &'static str {
    match level {
        LogFatal => "FATAL",
        LogError => "ERROR",
        LogWarn => "WARN",
        LogInfo => "INFO",
        LogDebug => "DEBUG",
    }
}

/// Buffers one log statement and writes it out newline-terminated when
/// dropped, so a statement built from multiple `write!`s can't interleave
/// with other output.
pub struct NewLineTerminatingOstream {
    enabled: bool,
    message: Vec<u8>,
    lock: MutexGuard<'static, LogGlobals>,
}

impl NewLineTerminatingOstream {
    fn new(
        level: LogLevel,
        filename: &str,
        line: u32,
        func_name: &str,
        always_enabled: bool,
    ) -> NewLineTerminatingOstream {
        let lock = LOG_GLOBALS.lock().unwrap();
        let module_name = filename_to_module_name(filename);
        let enabled = always_enabled || level <= get_log_level(&module_name, &lock);
        let mut this = NewLineTerminatingOstream {
            message: Vec::new(),
            enabled,
            lock,
        };
        if enabled {
            if level == LogDebug {
                write!(this, "[{}] ", module_name).unwrap();
            } else {
                write_prefix(&mut this, level, filename, line, func_name);
            }
        }

        this
    }
}

impl Drop for NewLineTerminatingOstream {
    fn drop(&mut self) {
        if self.enabled {
            self.write_all(b"\n").unwrap();
            self.flush().unwrap();
        }
    }
}

impl Write for NewLineTerminatingOstream {
    fn flush(&mut self) -> Result<()> {
        if !self.message.is_empty() && self.enabled {
            self.lock.log_file.write_all(&self.message)?;
            self.lock.log_file.flush()?;
        }
        self.message.clear();
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if self.enabled {
            self.message.extend_from_slice(buf);
        }

        // Pretend the bytes were written even when disabled, otherwise
        // write! reports WriteZero.
        Ok(buf.len())
    }
}

pub fn write_prefix(
    stream: &mut dyn Write,
    level: LogLevel,
    filename: &str,
    line: u32,
    func_name: &str,
) {
    write!(stream, "[{} ", log_name(level)).unwrap();
    if level <= LogError {
        write!(stream, "{}:{} ", filename, line).unwrap();
    }

    write!(stream, "{}()", func_name).unwrap();
    let err = errno();
    if level <= LogWarn && err != 0 {
        write!(stream, " errno: {}", errno_name(err)).unwrap();
    }
    write!(stream, "] ").unwrap();
}

pub fn log(
    log_level: LogLevel,
    filename: &str,
    line: u32,
    module_path: &str,
    always_enabled: bool,
) -> NewLineTerminatingOstream {
    NewLineTerminatingOstream::new(log_level, filename, line, module_path, always_enabled)
}

/// Write a leveled message to the log sink (stderr unless RETRACE_LOG_FILE
/// or RETRACE_APPEND_LOG_FILE redirects it). Execution continues normally.
macro_rules! log {
    ($log_level:expr, $($args:tt)+) => {
        {
            use std::io::Write;
            let mut stream = crate::log::log(
                $log_level,
                file!(),
                line!(),
                module_path!(),
                false
            );
            write!(stream, $($args)+).unwrap()
        }
    };
}

/// Log the message, dump a backtrace to stderr and abort the process.
macro_rules! fatal {
    ($($args:tt)+) => {
        {
            {
                use std::io::Write;
                use crate::log::LogFatal;
                let mut stream = crate::log::log(
                    LogFatal,
                    file!(),
                    line!(),
                    module_path!(),
                    true
                );
                write!(stream, $($args)+).unwrap();
            }
            crate::log::notifying_abort(backtrace::Backtrace::new())
        }
    };
}

/// Write to stderr and exit. No backtrace: this is for clean environment
/// errors (unsupported hardware and the like), not internal bugs.
macro_rules! clean_fatal {
    ($($args:tt)+) => {
        {
            use std::io::Write;
            use std::io::stderr;
            use crate::log::LogFatal;
            crate::log::write_prefix(&mut stderr(), LogFatal, file!(), line!(), module_path!());
            write!(stderr(), $($args)+).unwrap();
            write!(stderr(), "\n").unwrap();
            std::process::exit(1)
        }
    };
}

/// Assert a condition that, when violated, means the replay diverged or the
/// tracee is in a state we never recorded. Identifies the task, logs and
/// aborts.
macro_rules! ed_assert {
    ($task:expr, $cond:expr) => {
        ed_assert!($task, $cond, "")
    };
    ($task:expr, $cond:expr, $($args:tt)*) => {
        {
            let t: &crate::task::ReplayTask = $task;
            if !$cond {
                {
                    use std::io::Write;
                    use crate::log::LogFatal;
                    let mut stream = crate::log::log(
                        LogFatal,
                        file!(),
                        line!(),
                        module_path!(),
                        true
                    );
                    write!(
                        stream,
                        "(task {} (rec: {}) at time {}) Assertion `{}' failed to hold. ",
                        t.tid,
                        t.rec_tid,
                        t.trace_frame.global_time,
                        stringify!($cond)
                    )
                    .unwrap();
                    write!(stream, $($args)*).unwrap();
                }
                crate::log::notifying_abort(backtrace::Backtrace::new())
            }
        }
    };
}

/// Dump the stacktrace and abort.
pub fn notifying_abort(bt: Backtrace) -> ! {
    dump_retrace_stack(bt);
    std::process::abort();
}

fn dump_retrace_stack(bt: Backtrace) {
    write!(io::stderr(), "=== Start retrace backtrace:\n").unwrap();
    write!(io::stderr(), "{:?}", bt).unwrap();
    write!(io::stderr(), "=== End retrace backtrace\n").unwrap();
}
