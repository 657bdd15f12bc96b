//! Bookkeeping for live jailed children.
//!
//! One [`ChildRecord`] per un-reaped child, owned exclusively by the
//! supervisor. Records are created right after a successful clone - before
//! any post-clone setup, so a racing reap tick can already find them - and
//! destroyed when the reap loop consumes the exit. The record owns an fd on
//! `/proc/<pid>/syscall`, opened early because after a SIGSYS death the
//! entry is only readable while the zombie is still unreaped.

use std::net::IpAddr;
use std::os::fd::RawFd;
use std::time::{SystemTime, UNIX_EPOCH};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::net;

/// Seconds since the epoch, the clock the time-limit sweep runs on.
pub(crate) fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[derive(Debug)]
pub struct ChildRecord {
    pub pid: libc::pid_t,
    /// Start timestamp, seconds since the epoch.
    pub start: i64,
    /// Peer identity, `[ip]:port` or `[STANDALONE]`.
    pub peer_text: String,
    pub peer_addr: Option<IpAddr>,
    /// Fd on /proc/<pid>/syscall, or -1 when the open failed.
    syscall_fd: RawFd,
}

impl ChildRecord {
    /// Read the pending-syscall line for the violation report. One shot: the
    /// fd sits at offset 0 until this is called.
    pub fn read_syscall_line(&self) -> Option<String> {
        if self.syscall_fd < 0 {
            return None;
        }
        let mut buf = [0u8; 4096];
        let n = loop {
            // SAFETY: reading into a valid local buffer from an owned fd.
            let ret = unsafe { libc::read(self.syscall_fd, buf.as_mut_ptr().cast(), buf.len()) };
            if ret >= 0 {
                break ret as usize;
            }
            if oubliette_sys::last_errno() != rustix::io::Errno::INTR {
                return None;
            }
        };
        if n == 0 {
            return None;
        }
        Some(String::from_utf8_lossy(&buf[..n]).trim_end().to_string())
    }
}

impl Drop for ChildRecord {
    fn drop(&mut self) {
        if self.syscall_fd >= 0 {
            // SAFETY: the record owns this fd.
            unsafe { libc::close(self.syscall_fd) };
        }
    }
}

/// The live-children table: keyed by pid, iterated in insertion order.
#[derive(Debug, Default)]
pub struct PidRegistry {
    children: Vec<ChildRecord>,
}

impl PidRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly cloned child. `sock` is the connection the child
    /// serves (any non-socket fd yields the standalone identity).
    pub fn add(&mut self, pid: libc::pid_t, sock: RawFd) {
        let (peer_text, peer_addr) = net::peer_text(sock);
        let syscall_fd = match std::ffi::CString::new(format!("/proc/{pid}/syscall")) {
            Ok(path) => loop {
                // SAFETY: open with a live CString; failure is tolerated as -1.
                let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) };
                if fd >= 0 || oubliette_sys::last_errno() != rustix::io::Errno::INTR {
                    break fd;
                }
            },
            Err(_) => -1,
        };
        let rec = ChildRecord {
            pid,
            start: now_epoch(),
            peer_text,
            peer_addr,
            syscall_fd,
        };
        debug!(pid, start = rec.start, peer = %rec.peer_text, "child registered");
        self.children.push(rec);
    }

    /// Drop the record for `pid`; closes its syscall fd.
    pub fn remove(&mut self, pid: libc::pid_t) {
        match self.children.iter().position(|r| r.pid == pid) {
            Some(idx) => {
                let rec = self.children.remove(idx);
                debug!(pid, peer = %rec.peer_text, start = rec.start, "child unregistered");
            }
            None => warn!(pid, "reaped a pid that was never registered"),
        }
    }

    pub fn count(&self) -> usize {
        self.children.len()
    }

    pub fn find(&self, pid: libc::pid_t) -> Option<&ChildRecord> {
        self.children.iter().find(|r| r.pid == pid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChildRecord> {
        self.children.iter()
    }

    /// SIGKILL every registered child. Used on fatal supervisor signals.
    pub fn kill_all(&self) {
        for rec in &self.children {
            let _ = kill(Pid::from_raw(rec.pid), Signal::SIGKILL);
        }
    }

    /// The SIGUSR1/SIGQUIT process listing.
    pub fn display(&self, cfg: &Config) {
        info!(total = self.count(), "spawned jails");
        let now = now_epoch();
        for rec in &self.children {
            let run_time = now - rec.start;
            let time_left = if cfg.tlimit > 0 {
                cfg.tlimit as i64 - run_time
            } else {
                0
            };
            info!(
                pid = rec.pid,
                peer = %rec.peer_text,
                run_time,
                time_left,
                "live child"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_find_remove() {
        let mut reg = PidRegistry::new();
        assert_eq!(reg.count(), 0);

        // A pid that certainly has no /proc entry: the open fails and the
        // record carries -1, which the registry must tolerate.
        reg.add(-1, -1);
        assert_eq!(reg.count(), 1);
        let rec = reg.find(-1).unwrap();
        assert_eq!(rec.peer_text, net::STANDALONE_PEER);
        assert!(rec.read_syscall_line().is_none());

        reg.remove(-1);
        assert_eq!(reg.count(), 0);
    }

    #[test]
    fn remove_unknown_pid_is_harmless() {
        let mut reg = PidRegistry::new();
        reg.remove(123456);
        assert_eq!(reg.count(), 0);
    }

    #[test]
    fn insertion_order_iteration() {
        let mut reg = PidRegistry::new();
        reg.add(-10, -1);
        reg.add(-20, -1);
        reg.add(-30, -1);
        let pids: Vec<_> = reg.iter().map(|r| r.pid).collect();
        assert_eq!(pids, vec![-10, -20, -30]);
    }

    #[test]
    fn syscall_fd_of_live_process() {
        let mut reg = PidRegistry::new();
        let self_pid = std::process::id() as libc::pid_t;
        reg.add(self_pid, -1);
        // Our own /proc entry is readable and parseable-looking.
        let line = reg.find(self_pid).unwrap().read_syscall_line().unwrap();
        assert!(!line.is_empty());
    }
}
