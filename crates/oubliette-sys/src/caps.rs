//! Capability sets, secure-bits and the related prctls.
//!
//! The child drops privileges in two steps: first the secure-bits are set so
//! capabilities survive the `setresuid` transition (they are still needed for
//! mounts and hostname changes), then - right before the target program is
//! prepared - all three capability vectors are cleared with a raw `capset(2)`
//! using header version 3 across both u32 words.

use rustix::io::Errno;

use crate::last_errno;

/// `_LINUX_CAPABILITY_VERSION_3` from `linux/capability.h`.
const LINUX_CAPABILITY_VERSION_3: u32 = 0x2008_0522;
/// Number of u32 words per capability vector for version 3.
const LINUX_CAPABILITY_U32S_3: usize = 2;

/// `SECBIT_NO_SETUID_FIXUP` from `linux/securebits.h`.
pub const SECBIT_NO_SETUID_FIXUP: libc::c_ulong = 1 << 2;
/// `SECBIT_KEEP_CAPS` from `linux/securebits.h`.
pub const SECBIT_KEEP_CAPS: libc::c_ulong = 1 << 4;

#[repr(C)]
struct CapUserHeader {
    version: u32,
    pid: libc::c_int,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct CapUserData {
    effective: u32,
    permitted: u32,
    inheritable: u32,
}

/// Set the process secure-bits.
pub fn set_securebits(bits: libc::c_ulong) -> Result<(), Errno> {
    // SAFETY: PR_SET_SECUREBITS takes a plain bitmask argument.
    if unsafe { libc::prctl(libc::PR_SET_SECUREBITS, bits, 0, 0, 0) } == -1 {
        Err(last_errno())
    } else {
        Ok(())
    }
}

/// Clear `PR_SET_KEEPCAPS` so the following `capset` empties the sets for good.
pub fn clear_keepcaps() -> Result<(), Errno> {
    // SAFETY: prctl with constant arguments.
    if unsafe { libc::prctl(libc::PR_SET_KEEPCAPS, 0, 0, 0, 0) } == -1 {
        Err(last_errno())
    } else {
        Ok(())
    }
}

/// `prctl(PR_SET_NO_NEW_PRIVS, 1)`. Fails on pre-3.5 kernels.
pub fn set_no_new_privs() -> Result<(), Errno> {
    // SAFETY: prctl with constant arguments.
    if unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) } == -1 {
        Err(last_errno())
    } else {
        Ok(())
    }
}

/// Zero the effective, permitted and inheritable capability sets of the
/// calling process with a raw `capset(2)`.
pub fn capset_clear() -> Result<(), Errno> {
    let hdr = CapUserHeader {
        version: LINUX_CAPABILITY_VERSION_3,
        pid: 0,
    };
    let data = [CapUserData::default(); LINUX_CAPABILITY_U32S_3];
    // SAFETY: hdr and data outlive the call and match the kernel ABI layout.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_capset,
            &hdr as *const CapUserHeader,
            data.as_ptr(),
        )
    };
    if ret == -1 {
        Err(last_errno())
    } else {
        Ok(())
    }
}
