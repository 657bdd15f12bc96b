//! The reap loop: drain exited children, report seccomp violations,
//! enforce the wall-clock limit.
//!
//! The drain peeks with `waitid(WNOHANG|WNOWAIT)` first: a SIGSYS death
//! must be inspected through `/proc/<pid>/syscall` *before* the zombie is
//! consumed, or the entry is gone. Only then does `wait4` actually collect
//! the child and the status mapping runs.
//!
//! Status mapping (part of the observable contract): exit code `e` maps to
//! `e % 100`, bumped to 1 when a non-zero exit would fold to 0; a death by
//! signal `s` maps to `100 + s`.

use tracing::{error, info, warn};

use crate::cgroup;
use crate::config::Config;
use crate::registry::{now_epoch, PidRegistry};

/// A parsed `/proc/<pid>/syscall` line.
#[derive(Debug, PartialEq, Eq)]
struct SyscallState {
    nr: i64,
    args: [u64; 6],
    sp: u64,
    pc: u64,
}

/// Strict parse of the nine-field syscall line: decimal syscall number,
/// then eight hex fields (six arguments, stack pointer, program counter).
/// Blocked or running tasks produce shorter lines and yield `None`.
fn parse_syscall_line(line: &str) -> Option<SyscallState> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() != 9 {
        return None;
    }
    let nr = fields[0].parse::<i64>().ok()?;
    let mut hex = fields[1..].iter().map(|f| {
        u64::from_str_radix(f.strip_prefix("0x").unwrap_or(f), 16).ok()
    });
    let mut args = [0u64; 6];
    for slot in &mut args {
        *slot = hex.next()??;
    }
    let sp = hex.next()??;
    let pc = hex.next()??;
    Some(SyscallState { nr, args, sp, pc })
}

/// Map a raw `WIFEXITED` wait status to the supervisor's return value.
fn exited_code(status: libc::c_int) -> i32 {
    let e = libc::WEXITSTATUS(status);
    let r = e % 100;
    if r == 0 && e != 0 {
        1
    } else {
        r
    }
}

/// Map a raw `WIFSIGNALED` wait status to the supervisor's return value.
fn signaled_code(status: libc::c_int) -> i32 {
    100 + libc::WTERMSIG(status)
}

fn report_violation(registry: &PidRegistry, pid: libc::pid_t) {
    warn!(pid, "syscall violation, child killed by SIGSYS");
    let Some(rec) = registry.find(pid) else {
        error!(pid, "SIGSYS child missing from the registry");
        return;
    };
    let Some(line) = rec.read_syscall_line() else {
        return;
    };
    let Some(state) = parse_syscall_line(&line) else {
        return;
    };
    warn!(
        pid,
        syscall = state.nr,
        args = format_args!(
            "{:#x}, {:#x}, {:#x}, {:#x}, {:#x}, {:#x}",
            state.args[0], state.args[1], state.args[2],
            state.args[3], state.args[4], state.args[5],
        ),
        sp = format_args!("{:#x}", state.sp),
        pc = format_args!("{:#x}", state.pc),
        "violating syscall"
    );
}

/// Drain every ready child without blocking and sweep the time limit.
/// Returns the mapped status of the last child consumed, or 0 when none
/// was; standalone modes use this as the supervisor's exit code.
pub fn reap(cfg: &Config, registry: &mut PidRegistry) -> i32 {
    let mut rv = 0;

    loop {
        // SAFETY: si is a valid out-param; WNOWAIT leaves the child unreaped.
        let mut si: libc::siginfo_t = unsafe { std::mem::zeroed() };
        let ret = unsafe {
            libc::waitid(
                libc::P_ALL,
                0,
                &mut si,
                libc::WNOHANG | libc::WNOWAIT | libc::WEXITED,
            )
        };
        if ret == -1 {
            break;
        }
        // SAFETY: waitid succeeded, so the si_pid union arm is valid.
        let pid = unsafe { si.si_pid() };
        if pid == 0 {
            break;
        }
        // SAFETY: as above for si_status.
        if si.si_code == libc::CLD_KILLED && unsafe { si.si_status() } == libc::SIGSYS {
            report_violation(registry, pid);
        }

        let mut status: libc::c_int = 0;
        // SAFETY: status is a valid out-param; WNOHANG keeps this non-blocking.
        if unsafe { libc::wait4(pid, &mut status, libc::WNOHANG, std::ptr::null_mut()) } == pid {
            if libc::WIFEXITED(status) {
                registry.remove(pid);
                rv = exited_code(status);
                info!(
                    pid,
                    status = libc::WEXITSTATUS(status),
                    left = registry.count(),
                    "child exited"
                );
            }
            if libc::WIFSIGNALED(status) {
                registry.remove(pid);
                rv = signaled_code(status);
                info!(
                    pid,
                    signal = libc::WTERMSIG(status),
                    left = registry.count(),
                    "child terminated by signal"
                );
            }
            cgroup::finish_parent(cfg, pid);
        }
    }

    if cfg.tlimit > 0 {
        let now = now_epoch();
        for rec in registry.iter() {
            let run_time = now - rec.start;
            if run_time < cfg.tlimit as i64 {
                continue;
            }
            info!(
                pid = rec.pid,
                run_time,
                tlimit = cfg.tlimit,
                peer = %rec.peer_text,
                "over the time limit, killing"
            );
            // A stopped process inside a pid namespace can survive a bare
            // SIGKILL; wake it first.
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(rec.pid),
                nix::sys::signal::Signal::SIGCONT,
            );
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(rec.pid),
                nix::sys::signal::Signal::SIGKILL,
            );
        }
    }

    rv
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_exit(code: i32) -> libc::c_int {
        (code & 0xff) << 8
    }

    #[test]
    fn exit_mapping_folds_into_user_band() {
        assert_eq!(exited_code(raw_exit(0)), 0);
        assert_eq!(exited_code(raw_exit(1)), 1);
        assert_eq!(exited_code(raw_exit(37)), 37);
        assert_eq!(exited_code(raw_exit(137)), 37);
        // Non-zero exits that fold to 0 are bumped to 1.
        assert_eq!(exited_code(raw_exit(100)), 1);
        assert_eq!(exited_code(raw_exit(200)), 1);
        assert_eq!(exited_code(raw_exit(99)), 99);
    }

    #[test]
    fn signal_mapping() {
        assert_eq!(signaled_code(libc::SIGKILL), 109);
        assert_eq!(signaled_code(libc::SIGSEGV), 111);
        assert_eq!(signaled_code(libc::SIGSYS), 131);
    }

    #[test]
    fn syscall_line_parsing() {
        let line = "39 0x1 0x2 0x3 0x4 0x5 0x6 0x7ffca8a0 0x7f3b8c12";
        let state = parse_syscall_line(line).unwrap();
        assert_eq!(state.nr, 39);
        assert_eq!(state.args, [1, 2, 3, 4, 5, 6]);
        assert_eq!(state.sp, 0x7ffc_a8a0);
        assert_eq!(state.pc, 0x7f3b_8c12);
    }

    #[test]
    fn syscall_line_rejects_short_forms() {
        // Blocked / running tasks report fewer fields.
        assert!(parse_syscall_line("running").is_none());
        assert!(parse_syscall_line("-1 0x7ffc 0x7f3b").is_none());
        assert!(parse_syscall_line("").is_none());
        assert!(parse_syscall_line("x 0x1 0x2 0x3 0x4 0x5 0x6 0x7 0x8").is_none());
    }

    #[test]
    fn reap_consumes_forked_child() {
        let cfg = Config::new(["/bin/true"]);
        let mut registry = PidRegistry::new();

        // SAFETY: plain fork; the child exits immediately.
        let pid = unsafe { libc::fork() };
        assert!(pid >= 0);
        if pid == 0 {
            unsafe { libc::_exit(42) };
        }
        registry.add(pid, -1);

        // The child may not have exited yet; poll until the reap sees it.
        let mut rv = 0;
        for _ in 0..100 {
            rv = reap(&cfg, &mut registry);
            if registry.count() == 0 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(registry.count(), 0);
        assert_eq!(rv, 42);
    }
}
