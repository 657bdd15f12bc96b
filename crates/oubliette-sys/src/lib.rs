//! Low-level Linux syscall wrappers for the oubliette process isolator.
//!
//! This crate provides thin wrappers around Linux-specific syscalls that are
//! not available (or not available in the exact shape the supervisor needs)
//! in rustix or libc. For standard syscalls, use rustix or nix.
//!
//! ## Modules
//!
//! - **clone** - Raw `clone(2)` with no child stack (in-place continuation)
//! - **caps** - `capset(2)`, secure-bits and the related prctls
//! - **seccomp** - Installing externally compiled seccomp-BPF programs

#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod caps;
pub mod clone;
pub mod seccomp;

#[inline]
pub fn last_errno() -> rustix::io::Errno {
    // SAFETY: __errno_location always returns a valid thread-local pointer.
    rustix::io::Errno::from_raw_os_error(unsafe { *libc::__errno_location() })
}
