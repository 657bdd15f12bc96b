//! Root mount tree construction inside the new mount namespace.
//!
//! Runs in the child after the handshake. The sequence is: make the mount
//! tree private so nothing propagates back to the host, mount a tmpfs
//! staging root (a configured chroot is recursively bound over it), apply
//! the plan's bind/tmpfs mounts under the staging root, pivot into it and
//! detach the old root, then mount a fresh /proc for the new pid
//! namespace. The pivot is unconditional: with an empty plan and no chroot
//! the child sees an empty root, never the live host tree.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::config::{Config, Mount};
use crate::error::{Error, Result};

/// Tmpfs size for the staging root; it only ever holds mountpoint
/// directories unless a chroot shadows it entirely.
const STAGING_TMPFS_SIZE: usize = 4 * 1024 * 1024;

/// Build the mount tree and enter it. No-op (except chdir) without a new
/// mount namespace, where touching the shared tree would leak to the host.
pub fn init_in_child(cfg: &Config) -> Result<()> {
    if cfg.namespaces.mount {
        make_rprivate()?;
        let root = stage_root(cfg)?;
        for m in &cfg.mounts {
            apply(&root, m)?;
        }
        pivot_into(&root)?;
        if cfg.mount_proc {
            mount_proc(&cfg.proc_path, cfg.proc_rw)?;
        }
    }

    std::env::set_current_dir(&cfg.cwd)?;
    Ok(())
}

/// Make all mounts private recursively.
fn make_rprivate() -> Result<()> {
    // SAFETY: mount with constant, valid arguments.
    let ret = unsafe {
        libc::mount(
            std::ptr::null(),
            c"/".as_ptr(),
            std::ptr::null(),
            libc::MS_REC | libc::MS_PRIVATE,
            std::ptr::null(),
        )
    };
    if ret == -1 {
        Err(Error::sys("mount(/, MS_REC|MS_PRIVATE)"))
    } else {
        Ok(())
    }
}

/// The fixed per-uid staging mountpoint. /tmp is writable for any mapped
/// user, and the tmpfs mounted over it stays private to this namespace.
fn staging_path() -> PathBuf {
    PathBuf::from(format!(
        "/tmp/oubliette.root.{}",
        nix::unistd::geteuid().as_raw()
    ))
}

/// Mount the tmpfs staging root the child later pivots into. A configured
/// chroot is recursively bound over it; otherwise the root starts empty
/// and only the plan mounts populate it.
fn stage_root(cfg: &Config) -> Result<PathBuf> {
    let staging = staging_path();
    std::fs::create_dir_all(&staging)?;
    let staging_c = path_cstring(&staging)?;

    let options = CString::new(format!("size={STAGING_TMPFS_SIZE}"))
        .map_err(|_| Error::Config("tmpfs options".into()))?;
    debug!(root = %staging.display(), "mounting staging root");
    // SAFETY: all pointers reference live CStrings.
    let ret = unsafe {
        libc::mount(
            c"none".as_ptr(),
            staging_c.as_ptr(),
            c"tmpfs".as_ptr(),
            libc::MS_NOSUID | libc::MS_NODEV,
            options.as_ptr().cast(),
        )
    };
    if ret == -1 {
        return Err(Error::sys("mount(tmpfs staging root)"));
    }

    if let Some(chroot) = &cfg.chroot {
        debug!(chroot = %chroot.display(), "binding chroot over staging root");
        let chroot_c = path_cstring(chroot)?;
        // SAFETY: as above.
        let ret = unsafe {
            libc::mount(
                chroot_c.as_ptr(),
                staging_c.as_ptr(),
                std::ptr::null(),
                libc::MS_BIND | libc::MS_REC,
                std::ptr::null(),
            )
        };
        if ret == -1 {
            return Err(Error::sys("mount(chroot, MS_BIND|MS_REC)"));
        }
    }
    Ok(staging)
}

/// Apply one plan entry under the staging root. Mandatory failures abort
/// the child; the rest are logged and skipped.
fn apply(root: &Path, m: &Mount) -> Result<()> {
    match apply_inner(root, m) {
        Ok(()) => Ok(()),
        Err(e) if m.mandatory => Err(e),
        Err(e) => {
            warn!(dst = %m.dst.display(), %e, "skipping optional mount");
            Ok(())
        }
    }
}

fn apply_inner(root: &Path, m: &Mount) -> Result<()> {
    let dst = jail_path(root, &m.dst);
    prepare_mountpoint(&dst, m.is_dir)?;

    let src_c = m.src.as_deref().map(path_cstring).transpose()?;
    let dst_c = path_cstring(&dst)?;
    let fstype_c = m
        .fstype
        .as_deref()
        .map(|s| CString::new(s).map_err(|_| Error::Config(format!("fstype: {s}"))))
        .transpose()?;
    let options_c = m
        .options
        .as_deref()
        .map(|s| CString::new(s).map_err(|_| Error::Config(format!("mount options: {s}"))))
        .transpose()?;

    debug!(src = ?m.src, dst = %dst.display(), flags = format_args!("{:#x}", m.flags), "mounting");

    // Read-only binds need two passes: the kernel ignores MS_RDONLY on the
    // initial bind, so remount afterwards.
    let first_flags = if m.is_bind() {
        m.flags & !(libc::MS_RDONLY as libc::c_ulong)
    } else {
        m.flags
    };

    // SAFETY: every pointer references a live CString or is null.
    let ret = unsafe {
        libc::mount(
            src_c.as_ref().map_or(std::ptr::null(), |s| s.as_ptr()),
            dst_c.as_ptr(),
            fstype_c.as_ref().map_or(std::ptr::null(), |s| s.as_ptr()),
            first_flags,
            options_c
                .as_ref()
                .map_or(std::ptr::null(), |s| s.as_ptr().cast()),
        )
    };
    if ret == -1 {
        return Err(Error::sys("mount"));
    }

    if m.is_bind() && m.is_ro() {
        // SAFETY: as above; remount of the bind we just created.
        let ret = unsafe {
            libc::mount(
                std::ptr::null(),
                dst_c.as_ptr(),
                std::ptr::null(),
                libc::MS_BIND | libc::MS_REMOUNT | libc::MS_RDONLY,
                std::ptr::null(),
            )
        };
        if ret == -1 {
            return Err(Error::sys("mount(MS_REMOUNT|MS_RDONLY)"));
        }
    }
    Ok(())
}

/// `pivot_root` into `new_root` and detach the old root.
fn pivot_into(new_root: &Path) -> Result<()> {
    let old = new_root.join(".old_root");
    std::fs::create_dir_all(&old)?;

    let new_c = path_cstring(new_root)?;
    let old_c = path_cstring(&old)?;
    // SAFETY: both paths are live CStrings.
    if unsafe { libc::syscall(libc::SYS_pivot_root, new_c.as_ptr(), old_c.as_ptr()) } == -1 {
        return Err(Error::sys("pivot_root"));
    }

    std::env::set_current_dir("/")?;
    // SAFETY: constant paths; the detach is allowed to fail lazily.
    unsafe {
        if libc::umount2(c"/.old_root".as_ptr(), libc::MNT_DETACH) == -1 {
            return Err(Error::sys("umount2(/.old_root)"));
        }
        libc::rmdir(c"/.old_root".as_ptr());
    }
    Ok(())
}

/// Mount a fresh procfs, read-only unless configured otherwise.
fn mount_proc(path: &Path, rw: bool) -> Result<()> {
    std::fs::create_dir_all(path)?;
    let path_c = path_cstring(path)?;
    let mut flags = (libc::MS_NOSUID | libc::MS_NODEV | libc::MS_NOEXEC) as libc::c_ulong;
    if !rw {
        flags |= libc::MS_RDONLY as libc::c_ulong;
    }
    // SAFETY: constant source/fstype, live dst CString.
    let ret = unsafe {
        libc::mount(
            c"proc".as_ptr(),
            path_c.as_ptr(),
            c"proc".as_ptr(),
            flags,
            std::ptr::null(),
        )
    };
    if ret == -1 {
        Err(Error::sys("mount(proc)"))
    } else {
        Ok(())
    }
}

/// Resolve a jail-relative destination under the staging root.
fn jail_path(root: &Path, dst: &Path) -> PathBuf {
    match dst.strip_prefix("/") {
        Ok(rel) => root.join(rel),
        Err(_) => root.join(dst),
    }
}

fn prepare_mountpoint(dst: &Path, is_dir: bool) -> Result<()> {
    if is_dir {
        std::fs::create_dir_all(dst)?;
    } else {
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if !dst.exists() {
            std::fs::File::create(dst)?;
        }
    }
    Ok(())
}

fn path_cstring(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::Config(format!("path contains NUL: {}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jail_path_strips_leading_slash() {
        assert_eq!(
            jail_path(Path::new("/jail"), Path::new("/usr/lib")),
            PathBuf::from("/jail/usr/lib")
        );
        assert_eq!(
            jail_path(Path::new("/jail"), Path::new("tmp")),
            PathBuf::from("/jail/tmp")
        );
    }

    #[test]
    fn staging_path_is_per_uid() {
        let path = staging_path();
        let expected = format!("/tmp/oubliette.root.{}", unsafe { libc::geteuid() });
        assert_eq!(path, PathBuf::from(expected));
    }

    #[test]
    fn mountpoint_file_creation() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("etc/hostname");
        prepare_mountpoint(&target, false).unwrap();
        assert!(target.is_file());

        let dirtarget = dir.path().join("sub/dir");
        prepare_mountpoint(&dirtarget, true).unwrap();
        assert!(dirtarget.is_dir());
    }

    #[test]
    fn path_cstring_rejects_nul() {
        use std::ffi::OsStr;
        let bad = Path::new(OsStr::from_bytes(b"/tmp/\0x"));
        assert!(path_cstring(bad).is_err());
    }
}
