//! Raw `clone(2)` with fork semantics.
//!
//! The supervisor creates children with a direct syscall and **no child
//! stack**: both the parent and the child return from the same call frame,
//! exactly like `fork(2)`, with the namespace flags applied to the child.
//! Library wrappers (glibc `clone()`, `nix::sched::clone`) insist on a
//! separate stack and a callback, which breaks the in-place continuation the
//! caller relies on.

use rustix::io::Errno;

use crate::last_errno;

/// Invoke `clone(2)` with `flags` and no new stack.
///
/// Returns the child's pid in the parent and `0` in the child, like `fork`.
/// `flags` is the OR of the `CLONE_NEW*` namespace bits and the termination
/// signal (`SIGCHLD`).
///
/// # Safety
///
/// Fork-safety rules apply: the child of a multi-threaded process may only
/// call async-signal-safe functions until it execs. The supervisor is
/// single-threaded, so the child may continue running normal code.
pub unsafe fn clone_in_place(flags: libc::c_ulong) -> Result<libc::pid_t, Errno> {
    // Argument order is arch-specific for the stack/tls pointers, but they
    // are all NULL here, which every arch accepts.
    let ret = unsafe { libc::syscall(libc::SYS_clone, flags, 0usize, 0usize, 0usize, 0usize) };
    if ret < 0 {
        Err(last_errno())
    } else {
        Ok(ret as libc::pid_t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_plain_fork() {
        // No namespace flags: behaves as fork. The child exits immediately.
        let pid = unsafe { clone_in_place(libc::SIGCHLD as libc::c_ulong) }.unwrap();
        if pid == 0 {
            unsafe { libc::_exit(7) };
        }
        let mut status = 0;
        let waited = unsafe { libc::waitpid(pid, &mut status, 0) };
        assert_eq!(waited, pid);
        assert!(libc::WIFEXITED(status));
        assert_eq!(libc::WEXITSTATUS(status), 7);
    }

    #[test]
    fn clone_rejects_bad_flags() {
        // CLONE_NEWUSER combined with CLONE_FS is invalid (EINVAL).
        let flags = (libc::CLONE_NEWUSER | libc::CLONE_FS) as libc::c_ulong;
        assert!(unsafe { clone_in_place(flags) }.is_err());
    }
}
