//! Installing the externally compiled seccomp policy.
//!
//! This is the last operation before exec: anything the child does after
//! the filter lands - another mount, a setuid - can trip a rule and die
//! with SIGSYS, so nothing is allowed to run between here and execve.

use tracing::debug;

use crate::config::Config;
use crate::error::{Error, Result};

/// Install the configured BPF program; no-op when the jail runs without a
/// syscall policy.
pub fn apply(cfg: &Config) -> Result<()> {
    let Some(prog) = &cfg.seccomp else {
        return Ok(());
    };
    debug!(instructions = prog.len(), "installing seccomp filter");
    // SAFETY: the program was validated structurally at load time; policy
    // correctness is the operator's contract.
    unsafe { oubliette_sys::seccomp::install(prog) }.map_err(|errno| Error::Sys {
        call: "seccomp(SECCOMP_SET_MODE_FILTER)",
        errno,
    })
}
