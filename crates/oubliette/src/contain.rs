//! Containment of the child process: hostname, personality, resource
//! limits, session handling, fd hygiene and stdio wiring.
//!
//! Everything here runs in the child, between the handshake and the
//! capability drop, while the process still holds its in-namespace
//! privileges.

use std::os::fd::RawFd;

use nix::unistd::{sethostname, setsid};
use tracing::{debug, warn};

use crate::config::{Config, Mode};
use crate::error::{Error, Result};

/// Hostname, parent-death signal, personality, niceness, session.
pub fn prepare(cfg: &Config) -> Result<()> {
    if cfg.namespaces.uts {
        debug!(hostname = %cfg.hostname, "setting hostname");
        sethostname(&cfg.hostname)?;
    }

    // Die with the supervisor: a reparented jail serves nobody.
    // SAFETY: prctl with constant arguments.
    if unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL, 0, 0, 0) } == -1 {
        return Err(Error::sys("prctl(PR_SET_PDEATHSIG)"));
    }

    if cfg.personality != 0 {
        // SAFETY: personality takes a plain bitmask and cannot corrupt state.
        if unsafe { libc::personality(cfg.personality) } == -1 {
            return Err(Error::sys("personality"));
        }
    }

    // SAFETY: setpriority on self.
    if unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, 19) } == -1 {
        warn!("setpriority(19) failed");
    }

    if !cfg.skip_setsid {
        if let Err(e) = setsid() {
            debug!(%e, "setsid failed");
        }
    }
    Ok(())
}

/// Apply the full rlimit vector with `prlimit64`; every failure is fatal.
pub fn apply_rlimits(cfg: &Config) -> Result<()> {
    let rl = &cfg.rlimits;
    set_limit(libc::RLIMIT_AS, rl.addr_space, "prlimit64(RLIMIT_AS)")?;
    set_limit(libc::RLIMIT_CORE, rl.core, "prlimit64(RLIMIT_CORE)")?;
    set_limit(libc::RLIMIT_CPU, rl.cpu, "prlimit64(RLIMIT_CPU)")?;
    set_limit(libc::RLIMIT_FSIZE, rl.fsize, "prlimit64(RLIMIT_FSIZE)")?;
    set_limit(libc::RLIMIT_NOFILE, rl.nofile, "prlimit64(RLIMIT_NOFILE)")?;
    set_limit(libc::RLIMIT_NPROC, rl.nproc, "prlimit64(RLIMIT_NPROC)")?;
    set_limit(libc::RLIMIT_STACK, rl.stack, "prlimit64(RLIMIT_STACK)")?;
    Ok(())
}

fn set_limit(resource: libc::__rlimit_resource_t, limit: u64, call: &'static str) -> Result<()> {
    let rlim = libc::rlimit64 {
        rlim_cur: limit,
        rlim_max: limit,
    };
    // SAFETY: rlim is valid, resource is a valid constant, pid 0 = self.
    if unsafe { libc::prlimit64(0, resource, &rlim, std::ptr::null_mut()) } == -1 {
        Err(Error::Sys {
            call,
            errno: oubliette_sys::last_errno(),
        })
    } else {
        Ok(())
    }
}

/// Mark every fd above stderr close-on-exec, except the operator's pass-fds.
///
/// Walks `/proc/self/fd`; if that is unavailable (proc not mounted yet in
/// this mount namespace), falls back to brute force over `3..1024`. The
/// fallback deliberately ignores `RLIMIT_NOFILE`: the limit can be lower
/// than the highest fd already open.
pub fn make_fds_cloexec(cfg: &Config) -> Result<()> {
    match std::fs::read_dir("/proc/self/fd") {
        Ok(entries) => {
            let fds: Vec<RawFd> = entries
                .flatten()
                .filter_map(|e| e.file_name().to_string_lossy().parse().ok())
                .collect();
            for fd in fds {
                set_cloexec(cfg, fd);
            }
        }
        Err(e) => {
            debug!(%e, "/proc/self/fd unavailable, sweeping 3..1024");
            for fd in 3..1024 {
                set_cloexec(cfg, fd);
            }
        }
    }
    Ok(())
}

fn set_cloexec(cfg: &Config, fd: RawFd) {
    if fd <= libc::STDERR_FILENO || cfg.pass_fds.contains(&fd) {
        return;
    }
    // SAFETY: fcntl on a candidate fd; failure means it is not open.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD, 0) };
    if flags == -1 {
        return;
    }
    // SAFETY: as above.
    unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) };
}

/// Wire the child's stdio. In listen mode the three fds are the connection
/// socket; in standalone modes the inherited stdio stays unless the jail is
/// silent, in which case all three become /dev/null.
pub fn setup_stdio(cfg: &Config, fd_in: RawFd, fd_out: RawFd, fd_err: RawFd) -> Result<()> {
    let (fd_in, fd_out, fd_err) = if cfg.mode != Mode::ListenTcp {
        if !cfg.is_silent {
            return Ok(());
        }
        // SAFETY: open of a constant path.
        let null = unsafe { libc::open(c"/dev/null".as_ptr(), libc::O_RDWR) };
        if null == -1 {
            return Err(Error::sys("open(/dev/null)"));
        }
        (null, null, null)
    } else {
        (fd_in, fd_out, fd_err)
    };

    for (fd, target, call) in [
        (fd_in, libc::STDIN_FILENO, "dup2(stdin)"),
        (fd_out, libc::STDOUT_FILENO, "dup2(stdout)"),
        (fd_err, libc::STDERR_FILENO, "dup2(stderr)"),
    ] {
        // SAFETY: dup2 onto the standard descriptors.
        if unsafe { libc::dup2(fd, target) } == -1 {
            return Err(Error::Sys {
                call,
                errno: oubliette_sys::last_errno(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    fn cloexec_set(fd: RawFd) -> bool {
        // SAFETY: query flags of an fd the test owns.
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD, 0) };
        flags != -1 && flags & libc::FD_CLOEXEC != 0
    }

    #[test]
    fn sweep_marks_open_fds() {
        let file = tempfile::tempfile().unwrap();
        let fd = file.as_raw_fd();
        // SAFETY: clearing FD_CLOEXEC on a test-owned fd.
        unsafe { libc::fcntl(fd, libc::F_SETFD, 0) };
        assert!(!cloexec_set(fd));

        let cfg = Config::new(["/bin/true"]);
        make_fds_cloexec(&cfg).unwrap();
        assert!(cloexec_set(fd));
    }

    #[test]
    fn sweep_exempts_pass_fds() {
        let file = tempfile::tempfile().unwrap();
        let fd = file.as_raw_fd();
        // SAFETY: clearing FD_CLOEXEC on a test-owned fd.
        unsafe { libc::fcntl(fd, libc::F_SETFD, 0) };

        let mut cfg = Config::new(["/bin/true"]);
        cfg.pass_fds.push(fd);
        make_fds_cloexec(&cfg).unwrap();
        assert!(!cloexec_set(fd));
    }

    #[test]
    fn standalone_non_silent_stdio_untouched() {
        let cfg = Config::new(["/bin/true"]);
        // Would dup2 garbage over our stdio if the mode check were wrong.
        setup_stdio(&cfg, -1, -1, -1).unwrap();
    }
}
