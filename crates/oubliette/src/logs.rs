//! Logging: a `tracing` subscriber over a redirectable fd sink.
//!
//! The supervisor logs to stderr or to a logfile. A child serving a TCP
//! connection calls [`redirect_fd`] so everything it logs between fork and
//! exec travels over the connection socket instead of the listener's
//! stderr. The sink is a process-global fd of `sig_atomic` width, swapped
//! without locking - the supervisor is single-threaded.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::os::fd::{IntoRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicI32, Ordering};

use tracing_subscriber::EnvFilter;

use crate::error::Result;

static LOG_FD: AtomicI32 = AtomicI32::new(libc::STDERR_FILENO);

/// Operator-facing log levels. `Fatal` exists for config-file compatibility
/// and maps onto `error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Fatal,
}

impl LogLevel {
    /// The `EnvFilter` directive this level corresponds to.
    pub fn directive(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error | LogLevel::Fatal => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" | "d" => Ok(LogLevel::Debug),
            "info" | "i" => Ok(LogLevel::Info),
            "warning" | "warn" | "w" => Ok(LogLevel::Warning),
            "error" | "e" => Ok(LogLevel::Error),
            "fatal" | "f" => Ok(LogLevel::Fatal),
            other => Err(format!("unknown log level: {other}")),
        }
    }
}

/// Writer that targets whatever fd the process-global sink currently holds.
#[derive(Debug, Clone, Copy)]
pub struct FdWriter;

impl Write for FdWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let fd = LOG_FD.load(Ordering::Relaxed);
        loop {
            // SAFETY: buf is a live slice; fd validity is the sink's problem.
            let ret = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
            if ret >= 0 {
                return Ok(ret as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FdWriter {
    type Writer = FdWriter;

    fn make_writer(&'a self) -> Self::Writer {
        FdWriter
    }
}

/// Install the global subscriber. With a logfile, the sink is switched to it
/// before the first line is emitted; otherwise everything goes to stderr.
/// `RUST_LOG` overrides the configured level.
pub fn init(level: LogLevel, logfile: Option<&Path>) -> Result<()> {
    if let Some(path) = logfile {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .mode(0o640)
            .open(path)?;
        LOG_FD.store(file.into_raw_fd(), Ordering::Relaxed);
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.directive()));
    // try_init: tests install their own subscribers; losing that race is fine.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(FdWriter)
        .with_ansi(false)
        .try_init();
    Ok(())
}

/// Re-point the sink at a duplicate of `fd`. Used by children in listen mode
/// so their pre-exec diagnostics reach the peer, and by the daemonized
/// supervisor after stderr goes away.
pub fn redirect_fd(fd: RawFd) {
    // SAFETY: dup of a caller-provided fd; failure leaves the sink alone.
    let dup = unsafe { libc::dup(fd) };
    if dup >= 0 {
        let old = LOG_FD.swap(dup, Ordering::Relaxed);
        if old > libc::STDERR_FILENO {
            // SAFETY: old was produced by our own dup/open.
            unsafe { libc::close(old) };
        }
    }
}
