//! Child creation: clone with the configured namespaces, the parent/child
//! handshake, and the child-side preparation up to execve.
//!
//! The ordering is the security contract. In the parent:
//! clone -> registry add -> net attach -> cgroup attach -> id maps ->
//! done byte. The child blocks on the sync pipe and may not run a single
//! instruction of untrusted setup until the byte arrives; that read is the
//! cross-process happens-before edge ordering privileged setup before the
//! seccomp filter.
//!
//! The clone is a raw syscall with no child stack - parent and child both
//! continue in this very frame with fork semantics (see `oubliette-sys`).

use std::convert::Infallible;
use std::ffi::CString;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::sched::{unshare, CloneFlags};
use tracing::{debug, error, info};

use oubliette_sys::clone::clone_in_place;

use crate::config::{Config, Mode};
use crate::error::{Error, Result};
use crate::registry::PidRegistry;
use crate::{caps, cgroup, contain, logs, mounts, net, sandbox, user};

/// The handshake byte: privileged setup done, proceed to exec.
const DONE_BYTE: u8 = b'D';
/// Sent instead when post-clone setup failed; the child exits rather than
/// blocking until the time limit collects it.
const ABORT_BYTE: u8 = b'A';

/// Spawn one jailed child with its stdio destined for the three fds.
///
/// In listen mode all three are the connection socket and admission control
/// runs first; a rejected connection is a silent success. On any parent-side
/// failure no child survives: either the clone never happened, or the abort
/// byte makes the blocked child exit. In `Execve` mode this call does not
/// return on success.
pub fn spawn(
    cfg: &Config,
    registry: &mut PidRegistry,
    fd_in: RawFd,
    fd_out: RawFd,
    fd_err: RawFd,
) -> Result<()> {
    if cfg.mode == Mode::ListenTcp && !net::limit_conns(cfg, registry, fd_in) {
        return Ok(());
    }

    let ns_flags = cfg.namespaces.clone_flags();

    if cfg.mode == Mode::Execve {
        debug!(flags = format_args!("{ns_flags:#x}"), "entering namespaces in-process");
        unshare(CloneFlags::from_bits_truncate(ns_flags as libc::c_int))?;
        child_run(cfg, fd_in, fd_out, fd_err, None);
    }

    let mut sv = [0 as RawFd; 2];
    // SAFETY: socketpair writes two fds into a valid array.
    if unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
            0,
            sv.as_mut_ptr(),
        )
    } == -1
    {
        return Err(Error::sys("socketpair"));
    }
    // SAFETY: both fds were just created by socketpair.
    let child_end = unsafe { OwnedFd::from_raw_fd(sv[0]) };
    let parent_end = unsafe { OwnedFd::from_raw_fd(sv[1]) };

    let flags = ns_flags | libc::SIGCHLD as libc::c_ulong;
    debug!(flags = format_args!("{flags:#x}"), "cloning child");
    // SAFETY: single-threaded supervisor; the child continues on this stack
    // with fork semantics and execs or exits.
    let pid = match unsafe { clone_in_place(flags) } {
        Ok(pid) => pid,
        Err(errno) => {
            error!(
                %errno,
                "clone failed; unprivileged user namespaces may be disabled \
                 (kernel.unprivileged_userns_clone) or root is required"
            );
            return Err(Error::Sys { call: "clone", errno });
        }
    };

    if pid == 0 {
        drop(parent_end);
        child_run(cfg, fd_in, fd_out, fd_err, Some(child_end));
    }
    drop(child_end);

    // Register before post-clone setup so a racing reap tick can find it.
    registry.add(pid, fd_in);

    if let Err(e) = init_parent(cfg, pid, &parent_end) {
        error!(pid, %e, "post-clone setup failed, aborting the child");
        let _ = write_byte(&parent_end, ABORT_BYTE);
        return Err(e);
    }

    let (peer, _) = net::peer_text(fd_in);
    info!(pid, target = %cfg.argv[0], peer = %peer, "child about to execute");
    Ok(())
}

/// Parent-side post-clone setup, finished off with the done byte.
fn init_parent(cfg: &Config, pid: libc::pid_t, parent_end: &OwnedFd) -> Result<()> {
    net::init_parent(cfg, pid)?;
    cgroup::init_parent(cfg, pid)?;
    user::map_parent(cfg, pid)?;
    write_byte(parent_end, DONE_BYTE)
}

fn write_byte(fd: &OwnedFd, byte: u8) -> Result<()> {
    loop {
        // SAFETY: writing one byte from a stack slot to an owned fd.
        let ret = unsafe { libc::write(fd.as_raw_fd(), (&byte as *const u8).cast(), 1) };
        if ret == 1 {
            return Ok(());
        }
        if ret == -1 && oubliette_sys::last_errno() == rustix::io::Errno::INTR {
            continue;
        }
        return Err(Error::sys("write(sync pipe)"));
    }
}

/// Block until the parent's verdict arrives. Anything but the done byte -
/// including EOF from a dead parent - is terminal.
fn wait_for_done(fd: &OwnedFd) -> Result<()> {
    let mut byte = 0u8;
    loop {
        // SAFETY: reading one byte into a stack slot from an owned fd.
        let ret = unsafe { libc::read(fd.as_raw_fd(), (&mut byte as *mut u8).cast(), 1) };
        if ret == 1 {
            break;
        }
        if ret == -1 && oubliette_sys::last_errno() == rustix::io::Errno::INTR {
            continue;
        }
        return Err(Error::Handshake);
    }
    if byte == DONE_BYTE {
        Ok(())
    } else {
        Err(Error::Handshake)
    }
}

/// Everything the child runs between clone and execve. Never returns; any
/// failure below exec turns into `exit(1)`.
fn child_run(
    cfg: &Config,
    fd_in: RawFd,
    fd_out: RawFd,
    fd_err: RawFd,
    sync: Option<OwnedFd>,
) -> ! {
    if let Err(e) = child_prep(cfg, fd_in, fd_out, fd_err, sync) {
        error!(%e, "child setup failed");
        // SAFETY: terminating the forked child without running atexit.
        unsafe { libc::_exit(1) };
    }
    unreachable!("child_prep only returns on error");
}

fn child_prep(
    cfg: &Config,
    fd_in: RawFd,
    fd_out: RawFd,
    fd_err: RawFd,
    sync: Option<OwnedFd>,
) -> Result<Infallible> {
    if cfg.mode == Mode::ListenTcp {
        // Diagnostics between here and exec travel over the connection.
        logs::redirect_fd(fd_err);
    }
    contain::setup_stdio(cfg, fd_in, fd_out, fd_err)?;

    match sync {
        // Direct-exec mode: no parent does the mapping for us.
        None => user::map_parent(cfg, nix::unistd::getpid().as_raw())?,
        Some(fd) => {
            wait_for_done(&fd)?;
            drop(fd);
        }
    }

    user::map_child(cfg)?;
    contain::prepare(cfg)?;
    net::init_child(cfg)?;
    mounts::init_in_child(cfg)?;
    caps::drop_privs(cfg)?;
    contain::apply_rlimits(cfg)?;
    contain::make_fds_cloexec(cfg)?;

    let exec = ExecImage::build(cfg)?;
    debug!(target = %cfg.argv[0], args = cfg.argv.len(), "about to execve");

    // Must be the last operation before exec: a filtered syscall from our
    // own setup would kill the child with SIGSYS.
    sandbox::apply(cfg)?;

    // SAFETY: all pointer arrays are NULL-terminated and alive.
    unsafe { libc::execve(exec.prog.as_ptr(), exec.argv_ptrs(), exec.envp_ptrs()) };
    Err(Error::sys("execve"))
}

/// The execve argument block, built before the seccomp filter lands so no
/// allocation happens after it.
struct ExecImage {
    prog: CString,
    argv: Vec<CString>,
    envp: Vec<CString>,
    argv_raw: Vec<*const libc::c_char>,
    envp_raw: Vec<*const libc::c_char>,
}

impl ExecImage {
    fn build(cfg: &Config) -> Result<Self> {
        let prog = CString::new(cfg.argv[0].as_str())
            .map_err(|_| Error::Config("NUL in target path".into()))?;
        let argv: Vec<CString> = cfg
            .argv
            .iter()
            .map(|a| CString::new(a.as_str()))
            .collect::<std::result::Result<_, _>>()
            .map_err(|_| Error::Config("NUL in argv".into()))?;

        let mut env: Vec<String> = if cfg.keep_env {
            std::env::vars().map(|(k, v)| format!("{k}={v}")).collect()
        } else {
            Vec::new()
        };
        env.extend(cfg.envs.iter().cloned());
        let envp: Vec<CString> = env
            .into_iter()
            .map(CString::new)
            .collect::<std::result::Result<_, _>>()
            .map_err(|_| Error::Config("NUL in environment entry".into()))?;

        let mut image = Self {
            prog,
            argv,
            envp,
            argv_raw: Vec::new(),
            envp_raw: Vec::new(),
        };
        image.argv_raw = image
            .argv
            .iter()
            .map(|s| s.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();
        image.envp_raw = image
            .envp
            .iter()
            .map(|s| s.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();
        Ok(image)
    }

    fn argv_ptrs(&self) -> *const *const libc::c_char {
        self.argv_raw.as_ptr()
    }

    fn envp_ptrs(&self) -> *const *const libc::c_char {
        self.envp_raw.as_ptr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_image_env_scrub() {
        // keep_env off: only the configured entries survive.
        let mut cfg = Config::new(["/bin/true"]);
        cfg.envs.push("A=1".into());
        cfg.envs.push("B=two".into());
        let image = ExecImage::build(&cfg).unwrap();
        assert_eq!(image.envp.len(), 2);
        assert_eq!(image.envp[0].to_str().unwrap(), "A=1");
        // NULL-terminated pointer arrays.
        assert_eq!(image.argv_raw.len(), 2);
        assert!(image.argv_raw.last().unwrap().is_null());
        assert_eq!(image.envp_raw.len(), 3);
        assert!(image.envp_raw.last().unwrap().is_null());
    }

    #[test]
    fn exec_image_keep_env_inherits() {
        std::env::set_var("OUBLIETTE_TEST_MARKER", "y");
        let mut cfg = Config::new(["/bin/true"]);
        cfg.keep_env = true;
        cfg.envs.push("EXTRA=1".into());
        let image = ExecImage::build(&cfg).unwrap();
        let entries: Vec<&str> = image.envp.iter().map(|e| e.to_str().unwrap()).collect();
        assert!(entries.contains(&"OUBLIETTE_TEST_MARKER=y"));
        // Configured entries come after the inherited block, in order.
        assert_eq!(*entries.last().unwrap(), "EXTRA=1");
    }

    #[test]
    fn handshake_accepts_done_rejects_rest() {
        let mut sv = [0 as RawFd; 2];
        // SAFETY: socketpair writes into a valid array.
        assert_eq!(
            unsafe {
                libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, sv.as_mut_ptr())
            },
            0
        );
        // SAFETY: fds were just created.
        let (a, b) = unsafe { (OwnedFd::from_raw_fd(sv[0]), OwnedFd::from_raw_fd(sv[1])) };

        write_byte(&a, DONE_BYTE).unwrap();
        wait_for_done(&b).unwrap();

        write_byte(&a, ABORT_BYTE).unwrap();
        assert!(matches!(wait_for_done(&b), Err(Error::Handshake)));

        // EOF from a vanished parent is terminal too.
        drop(a);
        assert!(matches!(wait_for_done(&b), Err(Error::Handshake)));
    }
}
