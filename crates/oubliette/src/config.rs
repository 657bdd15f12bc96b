//! The sandbox configuration record.
//!
//! A single `Config` aggregates every operator-supplied knob the engine
//! consumes. It is assembled once at startup (by the CLI from flags or a
//! config file), checked by [`Config::validate`], and treated as frozen from
//! then on: every component takes `&Config` and nothing mutates it after
//! validation.
//!
//! Byte-valued rlimit fields arrive pre-scaled from megabytes; the scaling
//! is the config front-end's job, not the engine's.

use std::net::Ipv4Addr;
use std::os::fd::RawFd;
use std::path::PathBuf;

use oubliette_sys::seccomp::SockFilter;

use crate::error::{Error, Result};
use crate::logs::LogLevel;

/// Execution mode of the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Fork a sandboxed child per inbound TCP connection.
    ListenTcp,
    /// Run the target once and exit with its mapped status.
    #[default]
    Once,
    /// Re-spawn the target whenever the previous instance exits.
    Rerun,
    /// Unshare namespaces in-process and exec the target directly.
    Execve,
}

/// One uid or gid mapping entry: `inside outside count`, installed either by
/// writing the map file directly or by invoking the setuid newuidmap /
/// newgidmap helpers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdMap {
    pub inside_id: u32,
    pub outside_id: u32,
    pub count: u32,
    /// Install via /usr/bin/newuidmap (or newgidmap) instead of a direct
    /// /proc write. Needed for multi-range maps without CAP_SETUID.
    pub use_newidmap: bool,
}

impl IdMap {
    pub fn new(inside_id: u32, outside_id: u32, count: u32) -> Self {
        Self {
            inside_id,
            outside_id,
            count,
            use_newidmap: false,
        }
    }
}

/// Which new namespaces the child is created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Namespaces {
    pub net: bool,
    pub user: bool,
    pub mount: bool,
    pub pid: bool,
    pub ipc: bool,
    pub uts: bool,
    pub cgroup: bool,
}

impl Default for Namespaces {
    /// Everything on, like the jail is meant to be run.
    fn default() -> Self {
        Self {
            net: true,
            user: true,
            mount: true,
            pid: true,
            ipc: true,
            uts: true,
            cgroup: true,
        }
    }
}

impl Namespaces {
    /// No new namespaces at all.
    pub fn none() -> Self {
        Self {
            net: false,
            user: false,
            mount: false,
            pid: false,
            ipc: false,
            uts: false,
            cgroup: false,
        }
    }

    /// Fold the booleans into a `CLONE_NEW*` bitmask for clone/unshare.
    pub fn clone_flags(&self) -> libc::c_ulong {
        let mut flags: libc::c_ulong = 0;
        if self.net {
            flags |= libc::CLONE_NEWNET as libc::c_ulong;
        }
        if self.user {
            flags |= libc::CLONE_NEWUSER as libc::c_ulong;
        }
        if self.mount {
            flags |= libc::CLONE_NEWNS as libc::c_ulong;
        }
        if self.pid {
            flags |= libc::CLONE_NEWPID as libc::c_ulong;
        }
        if self.ipc {
            flags |= libc::CLONE_NEWIPC as libc::c_ulong;
        }
        if self.uts {
            flags |= libc::CLONE_NEWUTS as libc::c_ulong;
        }
        if self.cgroup {
            flags |= libc::CLONE_NEWCGROUP as libc::c_ulong;
        }
        flags
    }
}

/// Per-child resource limits, applied with `prlimit64` in the child. All
/// byte-valued fields are bytes (pre-scaled from MiB by the front-end).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rlimits {
    pub addr_space: u64,
    pub core: u64,
    pub cpu: u64,
    pub fsize: u64,
    pub nofile: u64,
    pub nproc: u64,
    pub stack: u64,
}

impl Default for Rlimits {
    fn default() -> Self {
        Self {
            addr_space: 512 * 1024 * 1024,
            core: 0,
            cpu: 600,
            fsize: 1024 * 1024,
            nofile: 32,
            nproc: 1024,
            stack: 8 * 1024 * 1024,
        }
    }
}

/// One entry of the mount plan applied inside the new mount namespace.
#[derive(Debug, Clone)]
pub struct Mount {
    /// Host path for bind mounts; None for synthetic filesystems.
    pub src: Option<PathBuf>,
    /// Path inside the jail (relative to the new root).
    pub dst: PathBuf,
    /// Filesystem type for non-bind mounts (`tmpfs`, ...).
    pub fstype: Option<String>,
    /// Mount data string (`size=4194304`, ...).
    pub options: Option<String>,
    /// `MS_*` flags.
    pub flags: libc::c_ulong,
    /// Whether dst is a directory (a regular file is created otherwise).
    pub is_dir: bool,
    /// Mandatory mounts abort the child on failure; others are logged.
    pub mandatory: bool,
}

impl Mount {
    /// Read-only recursive bind mount of a host path at the same location.
    pub fn bind_ro(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            src: Some(path.clone()),
            dst: path,
            fstype: None,
            options: None,
            flags: (libc::MS_BIND | libc::MS_REC | libc::MS_RDONLY) as libc::c_ulong,
            is_dir: true,
            mandatory: true,
        }
    }

    /// Writable recursive bind mount.
    pub fn bind_rw(src: impl Into<PathBuf>, dst: impl Into<PathBuf>) -> Self {
        Self {
            src: Some(src.into()),
            dst: dst.into(),
            fstype: None,
            options: None,
            flags: (libc::MS_BIND | libc::MS_REC) as libc::c_ulong,
            is_dir: true,
            mandatory: true,
        }
    }

    /// Fresh tmpfs of `size` bytes at dst.
    pub fn tmpfs(dst: impl Into<PathBuf>, size: usize) -> Self {
        Self {
            src: None,
            dst: dst.into(),
            fstype: Some("tmpfs".into()),
            options: Some(format!("size={size}")),
            flags: (libc::MS_NOSUID | libc::MS_NODEV) as libc::c_ulong,
            is_dir: true,
            mandatory: true,
        }
    }

    /// Relocate the mount to a different path inside the jail.
    pub fn at(mut self, dst: impl Into<PathBuf>) -> Self {
        self.dst = dst.into();
        self
    }

    pub fn optional(mut self) -> Self {
        self.mandatory = false;
        self
    }

    pub fn is_bind(&self) -> bool {
        self.flags & libc::MS_BIND as libc::c_ulong != 0
    }

    pub fn is_ro(&self) -> bool {
        self.flags & libc::MS_RDONLY as libc::c_ulong != 0
    }
}

/// Cgroup-v1 attachment plan. A controller is active when its `mount` is
/// non-empty and its limit value is non-zero.
#[derive(Debug, Clone, Default)]
pub struct CgroupPlan {
    pub mem_mount: PathBuf,
    pub mem_parent: String,
    pub mem_max: u64,
    pub pids_mount: PathBuf,
    pub pids_parent: String,
    pub pids_max: u64,
    pub net_cls_mount: PathBuf,
    pub net_cls_parent: String,
    pub net_cls_classid: u32,
    pub cpu_mount: PathBuf,
    pub cpu_parent: String,
    pub cpu_ms_per_sec: u32,
}

/// Network interface plan: a single MACVLAN peer moved into the child's
/// netns, plus loopback bring-up.
#[derive(Debug, Clone)]
pub struct IfacePlan {
    /// Host interface the MACVLAN peer hangs off. None disables the whole
    /// mechanism.
    pub macvlan_master: Option<String>,
    /// Name of the peer inside the jail.
    pub vs_name: String,
    pub vs_ip: Option<Ipv4Addr>,
    pub vs_netmask: Option<Ipv4Addr>,
    pub vs_gateway: Option<Ipv4Addr>,
    /// Leave `lo` down inside the new netns.
    pub no_lo: bool,
}

impl Default for IfacePlan {
    fn default() -> Self {
        Self {
            macvlan_master: None,
            vs_name: "vs".into(),
            vs_ip: None,
            vs_netmask: None,
            vs_gateway: None,
            no_lo: false,
        }
    }
}

/// The complete, immutable-after-startup sandbox configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Target program and arguments; `argv[0]` is the path that gets execed.
    pub argv: Vec<String>,
    pub hostname: String,
    pub cwd: PathBuf,
    pub chroot: Option<PathBuf>,
    pub mode: Mode,
    pub bindhost: String,
    pub port: u16,
    /// Wall-clock limit per child in seconds; 0 = unlimited.
    pub tlimit: u64,
    /// Per-peer-IP concurrent connection cap in listen mode; 0 = unlimited.
    pub max_conns_per_ip: u32,
    pub namespaces: Namespaces,
    pub rlimits: Rlimits,
    /// Linux personality bitmask; 0 leaves the personality alone.
    pub personality: libc::c_ulong,
    /// Ordered uid map entries; the first is the id the child runs as.
    pub uids: Vec<IdMap>,
    /// Ordered gid map entries; the first is the id the child runs as.
    pub gids: Vec<IdMap>,
    pub keep_env: bool,
    pub keep_caps: bool,
    pub is_silent: bool,
    pub skip_setsid: bool,
    pub disable_no_new_privs: bool,
    pub daemonize: bool,
    /// `KEY=VALUE` entries applied to the child environment, in order.
    pub envs: Vec<String>,
    /// Fds the child keeps open across exec (exempt from the cloexec sweep).
    pub pass_fds: Vec<RawFd>,
    pub mounts: Vec<Mount>,
    pub mount_proc: bool,
    pub proc_path: PathBuf,
    pub proc_rw: bool,
    pub cgroup: CgroupPlan,
    pub iface: IfacePlan,
    /// Externally compiled seccomp-BPF program; None installs no filter.
    pub seccomp: Option<Vec<SockFilter>>,
    pub logfile: Option<PathBuf>,
    pub log_level: LogLevel,
}

impl Config {
    /// A configuration with the given argv and defaults for everything else:
    /// all namespaces on, identity id maps for the current user, no mounts,
    /// no cgroups, no seccomp.
    pub fn new(argv: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let uid = nix::unistd::getuid().as_raw();
        let gid = nix::unistd::getgid().as_raw();
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            hostname: "OUBLIETTE".into(),
            cwd: "/".into(),
            chroot: None,
            mode: Mode::Once,
            bindhost: "::".into(),
            port: 0,
            tlimit: 0,
            max_conns_per_ip: 0,
            namespaces: Namespaces::default(),
            rlimits: Rlimits::default(),
            personality: 0,
            uids: vec![IdMap::new(uid, uid, 1)],
            gids: vec![IdMap::new(gid, gid, 1)],
            keep_env: false,
            keep_caps: false,
            is_silent: false,
            skip_setsid: false,
            disable_no_new_privs: false,
            daemonize: false,
            envs: Vec::new(),
            pass_fds: Vec::new(),
            mounts: Vec::new(),
            mount_proc: false,
            proc_path: "/proc".into(),
            proc_rw: false,
            cgroup: CgroupPlan::default(),
            iface: IfacePlan::default(),
            seccomp: None,
            logfile: None,
            log_level: LogLevel::Info,
        }
    }

    /// The uid the child ends up running as.
    pub fn inside_uid(&self) -> u32 {
        self.uids.first().map_or(0, |m| m.inside_id)
    }

    /// The gid the child ends up running as.
    pub fn inside_gid(&self) -> u32 {
        self.gids.first().map_or(0, |m| m.inside_id)
    }

    /// Fail-fast validation of the record invariants. Call once at startup,
    /// before the first spawn.
    pub fn validate(&self) -> Result<()> {
        if self.argv.is_empty() || self.argv[0].is_empty() {
            return Err(Error::Config("no command to execute".into()));
        }
        if self.namespaces.user && (self.uids.is_empty() || self.gids.is_empty()) {
            return Err(Error::Config(
                "user namespace requested but uid/gid mappings are empty".into(),
            ));
        }
        if self.uids.iter().chain(self.gids.iter()).any(|m| m.count == 0) {
            return Err(Error::Config("id mapping with count 0".into()));
        }
        if self.mode == Mode::ListenTcp && self.port == 0 {
            return Err(Error::Config("listen mode requires a port".into()));
        }
        if self.hostname.is_empty() && self.namespaces.uts {
            return Err(Error::Config("empty hostname with a new uts namespace".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::new(["/bin/true"]);
        cfg.validate().unwrap();
        assert_eq!(cfg.mode, Mode::Once);
        assert!(!cfg.uids.is_empty());
        assert_eq!(cfg.inside_uid(), nix::unistd::getuid().as_raw());
    }

    #[test]
    fn empty_argv_rejected() {
        let cfg = Config::new(Vec::<String>::new());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn userns_without_maps_rejected() {
        let mut cfg = Config::new(["/bin/true"]);
        cfg.uids.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn listen_mode_needs_port() {
        let mut cfg = Config::new(["/bin/true"]);
        cfg.mode = Mode::ListenTcp;
        assert!(cfg.validate().is_err());
        cfg.port = 4444;
        cfg.validate().unwrap();
    }

    #[test]
    fn clone_flags_fold() {
        assert_eq!(Namespaces::none().clone_flags(), 0);

        let mut ns = Namespaces::none();
        ns.pid = true;
        ns.uts = true;
        assert_eq!(
            ns.clone_flags(),
            (libc::CLONE_NEWPID | libc::CLONE_NEWUTS) as libc::c_ulong
        );

        let all = Namespaces::default().clone_flags();
        for flag in [
            libc::CLONE_NEWNET,
            libc::CLONE_NEWUSER,
            libc::CLONE_NEWNS,
            libc::CLONE_NEWPID,
            libc::CLONE_NEWIPC,
            libc::CLONE_NEWUTS,
            libc::CLONE_NEWCGROUP,
        ] {
            assert_ne!(all & flag as libc::c_ulong, 0);
        }
    }

    #[test]
    fn mount_helpers() {
        let m = Mount::bind_ro("/usr");
        assert!(m.is_bind());
        assert!(m.is_ro());
        assert!(m.mandatory);

        let t = Mount::tmpfs("/tmp", 4 << 20).optional();
        assert!(!t.is_bind());
        assert!(!t.mandatory);
        assert_eq!(t.options.as_deref(), Some("size=4194304"));
    }
}
