//! Top-level mode drivers and supervisor signal handling.
//!
//! The supervisor is single-threaded and synchronous: all concurrency lives
//! in the jailed children. Signals only set flags of `sig_atomic` width; a
//! 1 Hz interval timer keeps interrupting the blocking syscalls (`accept`,
//! `pause`) so the loops get to poll those flags and the time limits.

use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use tracing::{error, info};

use crate::config::{Config, Mode};
use crate::error::Result;
use crate::registry::PidRegistry;
use crate::{net, reap, spawn};

/// Signals the supervisor fields through one handler.
pub const HANDLED_SIGNALS: [Signal; 6] = [
    Signal::SIGINT,
    Signal::SIGQUIT,
    Signal::SIGUSR1,
    Signal::SIGALRM,
    Signal::SIGCHLD,
    Signal::SIGTERM,
];

static FATAL_SIG: AtomicI32 = AtomicI32::new(0);
static SHOW_PROC: AtomicBool = AtomicBool::new(false);

extern "C" fn flag_signal(sig: libc::c_int) {
    match sig {
        // Timer ticks and child exits exist only to wake blocking syscalls.
        libc::SIGALRM | libc::SIGCHLD => {}
        libc::SIGUSR1 | libc::SIGQUIT => SHOW_PROC.store(true, Ordering::Relaxed),
        other => FATAL_SIG.store(other, Ordering::Relaxed),
    }
}

/// Install the shared flag-setting handler for every supervised signal.
/// Deliberately no `SA_RESTART`: the EINTRs are the wake-up mechanism.
pub fn install_signal_handlers() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(flag_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for sig in HANDLED_SIGNALS {
        // SAFETY: flag_signal only stores to atomics, which is signal-safe.
        unsafe { sigaction(sig, &action) }?;
    }
    Ok(())
}

/// Arm the 1 s interval timer. Skipped in direct-exec mode, where the
/// process image is about to be replaced anyway.
pub fn arm_timer(cfg: &Config) -> Result<()> {
    if cfg.mode == Mode::Execve {
        return Ok(());
    }
    let tick = libc::timeval {
        tv_sec: 1,
        tv_usec: 0,
    };
    let it = libc::itimerval {
        it_interval: tick,
        it_value: tick,
    };
    // SAFETY: it is a fully initialized itimerval.
    if unsafe { libc::setitimer(libc::ITIMER_REAL, &it, std::ptr::null_mut()) } == -1 {
        return Err(crate::error::Error::sys("setitimer(ITIMER_REAL)"));
    }
    Ok(())
}

/// Run the configured mode to completion. Returns the supervisor's exit
/// status: the last child's mapped status in standalone modes, 0 for a
/// cleanly shut-down listener, -1 when a fatal signal cut things short.
pub fn run(cfg: &Config) -> Result<i32> {
    install_signal_handlers()?;
    arm_timer(cfg)?;
    match cfg.mode {
        Mode::ListenTcp => listen(cfg),
        _ => standalone(cfg),
    }
}

fn standalone(cfg: &Config) -> Result<i32> {
    let mut registry = PidRegistry::new();
    // The first spawn failing means the jail cannot run at all.
    spawn::spawn(
        cfg,
        &mut registry,
        libc::STDIN_FILENO,
        libc::STDOUT_FILENO,
        libc::STDERR_FILENO,
    )?;

    loop {
        let status = reap::reap(cfg, &mut registry);

        if registry.count() == 0 {
            if cfg.mode != Mode::Rerun {
                return Ok(status);
            }
            if let Err(e) = spawn::spawn(
                cfg,
                &mut registry,
                libc::STDIN_FILENO,
                libc::STDOUT_FILENO,
                libc::STDERR_FILENO,
            ) {
                // Keep going: the next timer tick retries the respawn.
                error!(%e, "re-spawn failed");
            }
            continue;
        }
        if SHOW_PROC.swap(false, Ordering::Relaxed) {
            registry.display(cfg);
        }
        let sig = FATAL_SIG.load(Ordering::Relaxed);
        if sig > 0 {
            info!(signal = sig, "fatal signal, killing all children");
            registry.kill_all();
            return Ok(-1);
        }

        // SAFETY: pause until any handled signal (timer tick at the latest).
        unsafe { libc::pause() };
    }
}

fn listen(cfg: &Config) -> Result<i32> {
    let listener = net::bind_listen(&cfg.bindhost, cfg.port)?;
    info!(host = %cfg.bindhost, port = cfg.port, "listening for connections");
    let mut registry = PidRegistry::new();

    loop {
        let sig = FATAL_SIG.load(Ordering::Relaxed);
        if sig > 0 {
            info!(signal = sig, "fatal signal, killing all children");
            registry.kill_all();
            return Ok(0);
        }
        if SHOW_PROC.swap(false, Ordering::Relaxed) {
            registry.display(cfg);
        }
        if let Some(conn) = net::accept(&listener) {
            let fd = conn.as_raw_fd();
            if let Err(e) = spawn::spawn(cfg, &mut registry, fd, fd, fd) {
                error!(%e, "spawning jailed child failed");
            }
            // The child holds its own copies via dup2; ours closes here.
            drop(conn);
        }
        reap::reap(cfg, &mut registry);
    }
}
