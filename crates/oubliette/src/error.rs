//! Error types for the sandbox engine.
//!
//! Config errors fail fast at startup. Syscall errors are fatal inside a
//! child (converted to `exit(1)` at the `child_run` boundary) and fatal for
//! the affected spawn in the parent, but never for the supervisor itself
//! except on the very first standalone spawn.

use std::io;

use rustix::io::Errno;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Invalid operator input, rejected before anything runs.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A raw syscall failed. `call` names the syscall and its key argument.
    #[error("{call}: {errno}")]
    Sys { call: &'static str, errno: Errno },

    /// The child read something other than the done byte from the sync pipe.
    #[error("bad handshake byte from parent")]
    Handshake,

    /// newuidmap/newgidmap (or the ip(8) helper) exited non-zero.
    #[error("{tool} failed with status {status}")]
    ExternalTool { tool: &'static str, status: i32 },

    /// Cgroup filesystem writes.
    #[error("cgroup: {0}")]
    Cgroup(String),

    #[error("I/O error")]
    Io(#[from] io::Error),

    #[error("system call error")]
    Nix(#[from] nix::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Capture errno for a failed raw libc call.
    pub(crate) fn sys(call: &'static str) -> Self {
        Error::Sys {
            call,
            errno: oubliette_sys::last_errno(),
        }
    }
}
