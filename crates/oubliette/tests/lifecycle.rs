//! Lifecycle tests: spawn real jailed children and drive the reap loop.
//!
//! The reap loop waits on any child of the process, so tests that fork are
//! serialized behind one lock - concurrent tests would steal each other's
//! exit statuses.
//!
//! Namespace selection adapts to privileges: as root the children run with
//! no new namespaces at all; unprivileged runs use a lone user namespace
//! with identity mappings (the setgroups deny write requires one).

use std::io::Read;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use oubliette::config::{Config, IdMap, Mode, Namespaces};
use oubliette::registry::PidRegistry;
use oubliette::{net, reap, spawn};

static REAP_LOCK: Mutex<()> = Mutex::new(());

fn is_root() -> bool {
    // SAFETY: geteuid cannot fail.
    unsafe { libc::geteuid() == 0 }
}

/// User namespaces can be sysctl'd or seccomp'd off; probe with a real
/// unshare in a throwaway fork and skip userns-dependent tests instead of
/// failing. Callers must hold `REAP_LOCK` (the probe forks).
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

/// The adaptive configs need user namespaces only when unprivileged.
fn sandbox_ready() -> bool {
    is_root() || userns_available()
}

fn base_config(argv: &[&str]) -> Config {
    let mut cfg = Config::new(argv.iter().copied());
    cfg.namespaces = Namespaces::none();
    if !is_root() {
        cfg.namespaces.user = true;
    }
    cfg
}

/// Drive the reap loop until the registry drains, returning the last mapped
/// status. Panics if the children take longer than the deadline.
fn run_to_completion(cfg: &Config, registry: &mut PidRegistry) -> i32 {
    let deadline = Instant::now() + Duration::from_secs(30);
    let mut status = 0;
    while registry.count() > 0 {
        assert!(Instant::now() < deadline, "children never drained");
        let rv = reap::reap(cfg, registry);
        if rv != 0 {
            status = rv;
        }
        if registry.count() > 0 {
            std::thread::sleep(Duration::from_millis(20));
        }
    }
    status
}

#[test]
fn true_exits_zero() {
    let _guard = REAP_LOCK.lock().unwrap();
    if !sandbox_ready() {
        return;
    }
    let cfg = base_config(&["/bin/true"]);
    let mut registry = PidRegistry::new();
    spawn::spawn(&cfg, &mut registry, 0, 1, 2).unwrap();
    assert_eq!(registry.count(), 1);
    assert_eq!(run_to_completion(&cfg, &mut registry), 0);
}

#[test]
fn exit_status_folds_into_user_band() {
    let _guard = REAP_LOCK.lock().unwrap();
    if !sandbox_ready() {
        return;
    }
    let cfg = base_config(&["/bin/sh", "-c", "exit 137"]);
    let mut registry = PidRegistry::new();
    spawn::spawn(&cfg, &mut registry, 0, 1, 2).unwrap();
    assert_eq!(run_to_completion(&cfg, &mut registry), 37);
}

#[test]
fn death_by_signal_maps_to_100_plus() {
    let _guard = REAP_LOCK.lock().unwrap();
    if !sandbox_ready() {
        return;
    }
    let cfg = base_config(&["/bin/sh", "-c", "kill -SEGV $$"]);
    let mut registry = PidRegistry::new();
    spawn::spawn(&cfg, &mut registry, 0, 1, 2).unwrap();
    assert_eq!(run_to_completion(&cfg, &mut registry), 100 + libc::SIGSEGV);
}

#[test]
fn exec_failure_exits_one() {
    let _guard = REAP_LOCK.lock().unwrap();
    if !sandbox_ready() {
        return;
    }
    let cfg = base_config(&["/nonexistent/of/course"]);
    let mut registry = PidRegistry::new();
    spawn::spawn(&cfg, &mut registry, 0, 1, 2).unwrap();
    assert_eq!(run_to_completion(&cfg, &mut registry), 1);
}

#[test]
fn time_limit_kills_overdue_child() {
    let _guard = REAP_LOCK.lock().unwrap();
    if !sandbox_ready() {
        return;
    }
    let mut cfg = base_config(&["/bin/sleep", "10"]);
    cfg.tlimit = 1;
    let mut registry = PidRegistry::new();

    let start = Instant::now();
    spawn::spawn(&cfg, &mut registry, 0, 1, 2).unwrap();
    let status = run_to_completion(&cfg, &mut registry);

    assert_eq!(status, 100 + libc::SIGKILL);
    assert!(
        start.elapsed() < Duration::from_secs(5),
        "kill took {:?}",
        start.elapsed()
    );
}

#[test]
fn userns_maps_child_to_root() {
    let _guard = REAP_LOCK.lock().unwrap();
    // This one creates a user namespace even as root.
    if !userns_available() {
        return;
    }
    // Map uid/gid 0 inside onto the current ids outside; `id -u` inside the
    // jail must print 0.
    let uid = unsafe { libc::getuid() };
    let gid = unsafe { libc::getgid() };
    let mut cfg = Config::new(["/bin/sh", "-c", "id -u"]);
    cfg.namespaces = Namespaces::none();
    cfg.namespaces.user = true;
    cfg.uids = vec![IdMap::new(0, uid, 1)];
    cfg.gids = vec![IdMap::new(0, gid, 1)];
    cfg.envs.push("PATH=/usr/bin:/bin".into());
    // Listen-mode stdio wiring dups the supplied fds over the child's
    // stdio, which is what lets the test capture the output.
    cfg.mode = Mode::ListenTcp;

    let mut pipe = [0i32; 2];
    // SAFETY: pipe2 writes into a valid array.
    assert_eq!(unsafe { libc::pipe2(pipe.as_mut_ptr(), libc::O_CLOEXEC) }, 0);
    // SAFETY: fds were just created.
    let (read_end, write_end) =
        unsafe { (OwnedFd::from_raw_fd(pipe[0]), OwnedFd::from_raw_fd(pipe[1])) };
    // SAFETY: opening /dev/null for the child's stdin.
    let devnull = unsafe {
        OwnedFd::from_raw_fd(libc::open(c"/dev/null".as_ptr(), libc::O_RDWR))
    };

    let mut registry = PidRegistry::new();
    spawn::spawn(
        &cfg,
        &mut registry,
        devnull.as_raw_fd(),
        write_end.as_raw_fd(),
        write_end.as_raw_fd(),
    )
    .unwrap();
    drop(write_end);

    let mut output = String::new();
    let mut file = std::fs::File::from(read_end);
    file.read_to_string(&mut output).unwrap();
    assert_eq!(output.trim(), "0");

    assert_eq!(run_to_completion(&cfg, &mut registry), 0);
    drop(devnull);
}

#[test]
fn admission_control_caps_per_ip_connections() {
    // Pure bookkeeping, no children involved: records with a live peer
    // block further connections from the same address.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let first = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
    let (first_srv, _) = listener.accept().unwrap();
    let second = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
    let (second_srv, _) = listener.accept().unwrap();

    let mut cfg = Config::new(["/bin/true"]);
    cfg.mode = Mode::ListenTcp;
    cfg.port = port;
    cfg.max_conns_per_ip = 1;

    let mut registry = PidRegistry::new();
    assert!(net::limit_conns(&cfg, &registry, first_srv.as_raw_fd()));
    registry.add(-1, first_srv.as_raw_fd());

    // Same IP, cap of one: rejected while the first child lives.
    assert!(!net::limit_conns(&cfg, &registry, second_srv.as_raw_fd()));

    // Cap of zero means unlimited.
    cfg.max_conns_per_ip = 0;
    assert!(net::limit_conns(&cfg, &registry, second_srv.as_raw_fd()));

    // First child gone: admitted again.
    cfg.max_conns_per_ip = 1;
    registry.remove(-1);
    assert!(net::limit_conns(&cfg, &registry, second_srv.as_raw_fd()));

    drop((first, second));
}

#[test]
fn registry_ignores_foreign_ips_in_admission() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let client = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
    let (srv, _) = listener.accept().unwrap();

    let mut cfg = Config::new(["/bin/true"]);
    cfg.mode = Mode::ListenTcp;
    cfg.max_conns_per_ip = 1;

    // A standalone record has no peer address and must not count against
    // any IP.
    let mut registry = PidRegistry::new();
    registry.add(-1, -1);
    assert!(net::limit_conns(&cfg, &registry, srv.as_raw_fd()));
    drop(client);
}
