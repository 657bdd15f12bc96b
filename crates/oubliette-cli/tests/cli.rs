//! End-to-end tests against the built binary.
//!
//! Namespace flags adapt to privileges: as root everything is disabled (no
//! namespaces needed to fork/exec), unprivileged runs keep a lone user
//! namespace so the id-map plumbing has something to chew on.

use std::process::Command;
use std::time::{Duration, Instant};

fn jail() -> Command {
    Command::new(env!("CARGO_BIN_EXE_oubliette"))
}

fn is_root() -> bool {
    // SAFETY: geteuid cannot fail.
    unsafe { libc::geteuid() == 0 }
}

/// User namespaces can be sysctl'd or seccomp'd off; probe with a real
/// unshare in a throwaway fork instead of trusting a sysctl.
fn userns_available() -> bool {
    // SAFETY: fork + unshare probe; the child exits immediately.
    unsafe {
        let pid = libc::fork();
        if pid == 0 {
            let ok = libc::unshare(libc::CLONE_NEWUSER) == 0;
            libc::_exit(if ok { 0 } else { 1 });
        }
        if pid < 0 {
            return false;
        }
        let mut status = 0;
        libc::waitpid(pid, &mut status, 0);
        libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0
    }
}

/// The adaptive flag sets need user namespaces only when unprivileged.
fn sandbox_ready() -> bool {
    is_root() || userns_available()
}

/// Namespace selection for the test environment.
fn ns_flags() -> Vec<&'static str> {
    let mut flags = vec![
        "--disable-clone-newnet",
        "--disable-clone-newns",
        "--disable-clone-newpid",
        "--disable-clone-newipc",
        "--disable-clone-newuts",
        "--disable-clone-newcgroup",
    ];
    if is_root() {
        flags.push("--disable-clone-newuser");
    }
    flags
}

#[test]
fn true_exits_zero() {
    if !sandbox_ready() {
        return;
    }
    let status = jail()
        .args(ns_flags())
        .args(["--", "/bin/true"])
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(0));
}

#[test]
fn exit_status_folded_into_user_band() {
    if !sandbox_ready() {
        return;
    }
    let status = jail()
        .args(ns_flags())
        .args(["--", "/bin/sh", "-c", "exit 137"])
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(37));
}

#[test]
fn signal_death_reported_as_100_plus() {
    if !sandbox_ready() {
        return;
    }
    let status = jail()
        .args(ns_flags())
        .args(["--", "/bin/sh", "-c", "kill -SEGV $$"])
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(111));
}

#[test]
fn time_limit_enforced() {
    if !sandbox_ready() {
        return;
    }
    let start = Instant::now();
    let status = jail()
        .args(ns_flags())
        .args(["--time-limit", "1", "--", "/bin/sleep", "10"])
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(109));
    assert!(
        start.elapsed() < Duration::from_secs(6),
        "took {:?}",
        start.elapsed()
    );
}

#[test]
fn userns_root_mapping() {
    // This one creates a user namespace even as root.
    if !userns_available() {
        return;
    }
    let uid = unsafe { libc::getuid() };
    let gid = unsafe { libc::getgid() };
    let output = jail()
        .args([
            "--disable-clone-newnet",
            "--disable-clone-newns",
            "--disable-clone-newpid",
            "--disable-clone-newipc",
            "--disable-clone-newuts",
            "--disable-clone-newcgroup",
        ])
        .args(["-U".to_string(), format!("0:{uid}:1")])
        .args(["-G".to_string(), format!("0:{gid}:1")])
        .args(["--env", "PATH=/usr/bin:/bin"])
        .args(["--", "/bin/sh", "-c", "id -u"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(0));
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "0");
}

#[test]
fn listen_mode_without_port_is_a_config_error() {
    let output = jail()
        .args(["--mode", "listen", "--", "/bin/true"])
        .output()
        .unwrap();
    assert_ne!(output.status.code(), Some(0));
    assert!(
        String::from_utf8_lossy(&output.stderr).contains("listen mode requires a port"),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

#[test]
fn missing_command_is_rejected() {
    let output = jail().output().unwrap();
    assert_ne!(output.status.code(), Some(0));
    assert!(String::from_utf8_lossy(&output.stderr).contains("no command"));
}

#[test]
fn config_file_drives_the_jail() {
    if !sandbox_ready() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("jail.toml");
    let ns = if is_root() {
        "[namespaces]\nnet = false\nuser = false\nmount = false\npid = false\nipc = false\nuts = false\ncgroup = false\n"
    } else {
        "[namespaces]\nnet = false\nmount = false\npid = false\nipc = false\nuts = false\ncgroup = false\n"
    };
    std::fs::write(
        &path,
        format!("cmd = [\"/bin/sh\", \"-c\", \"exit 3\"]\n{ns}"),
    )
    .unwrap();

    let status = jail()
        .args(["--config", path.to_str().unwrap()])
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(3));
}
