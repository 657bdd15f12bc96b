//! oubliette CLI - build a jail configuration from flags or a TOML file and
//! run the selected mode.
//!
//! Flags mirror the config-file schema; a `--config` file is loaded first
//! and individual flags override it. Downstream, the engine cannot tell the
//! two apart.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use tracing::warn;

use oubliette::{driver, logs, Config, IdMap, LogLevel, Mode, Mount};

mod file;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    /// Run the command once and exit with its status.
    #[value(alias = "o")]
    Once,
    /// Re-run the command whenever it exits.
    #[value(alias = "r")]
    Rerun,
    /// Unshare namespaces and exec the command in-place.
    #[value(alias = "e")]
    Execve,
    /// Fork a jailed child per inbound TCP connection.
    #[value(alias = "l")]
    Listen,
}

impl From<ModeArg> for Mode {
    fn from(m: ModeArg) -> Mode {
        match m {
            ModeArg::Once => Mode::Once,
            ModeArg::Rerun => Mode::Rerun,
            ModeArg::Execve => Mode::Execve,
            ModeArg::Listen => Mode::ListenTcp,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LevelArg {
    Debug,
    Info,
    Warning,
    Error,
    Fatal,
}

impl From<LevelArg> for LogLevel {
    fn from(l: LevelArg) -> LogLevel {
        match l {
            LevelArg::Debug => LogLevel::Debug,
            LevelArg::Info => LogLevel::Info,
            LevelArg::Warning => LogLevel::Warning,
            LevelArg::Error => LogLevel::Error,
            LevelArg::Fatal => LogLevel::Fatal,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "oubliette", version, about = "A namespace jail for Linux")]
struct Cli {
    /// TOML configuration file; flags override its values.
    #[arg(short = 'C', long)]
    config: Option<PathBuf>,

    #[arg(short = 'M', long, value_enum)]
    mode: Option<ModeArg>,

    /// Hostname inside the UTS namespace.
    #[arg(short = 'H', long)]
    hostname: Option<String>,

    /// Working directory inside the jail.
    #[arg(short = 'D', long)]
    cwd: Option<PathBuf>,

    /// Directory pivoted to as the jail's root.
    #[arg(short = 'c', long)]
    chroot: Option<PathBuf>,

    /// Address to bind the listener to.
    #[arg(long)]
    bindhost: Option<String>,

    /// TCP port for listen mode.
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// Wall-clock limit per child in seconds (0 = unlimited).
    #[arg(short = 't', long)]
    time_limit: Option<u64>,

    /// Concurrent connections allowed per peer IP (0 = unlimited).
    #[arg(long)]
    max_conns_per_ip: Option<u32>,

    /// Fork into the background before the first spawn.
    #[arg(short = 'd', long)]
    daemon: bool,

    /// Log file (default: stderr).
    #[arg(short = 'l', long)]
    log: Option<PathBuf>,

    #[arg(long, value_enum)]
    log_level: Option<LevelArg>,

    /// Keep the inherited environment instead of scrubbing it.
    #[arg(short = 'e', long)]
    keep_env: bool,

    /// Additional KEY=VALUE environment entries for the jailed process.
    #[arg(short = 'E', long = "env")]
    envs: Vec<String>,

    /// Keep capabilities in the jailed process.
    #[arg(long)]
    keep_caps: bool,

    /// Redirect standalone stdio to /dev/null.
    #[arg(long)]
    silent: bool,

    #[arg(long)]
    skip_setsid: bool,

    #[arg(long)]
    disable_no_new_privs: bool,

    /// RLIMIT_AS in MiB.
    #[arg(long)]
    rlimit_as: Option<u64>,
    /// RLIMIT_CORE in MiB.
    #[arg(long)]
    rlimit_core: Option<u64>,
    /// RLIMIT_CPU in seconds.
    #[arg(long)]
    rlimit_cpu: Option<u64>,
    /// RLIMIT_FSIZE in MiB.
    #[arg(long)]
    rlimit_fsize: Option<u64>,
    #[arg(long)]
    rlimit_nofile: Option<u64>,
    #[arg(long)]
    rlimit_nproc: Option<u64>,
    /// RLIMIT_STACK in MiB.
    #[arg(long)]
    rlimit_stack: Option<u64>,

    #[arg(long)]
    persona_addr_compat_layout: bool,
    #[arg(long)]
    persona_mmap_page_zero: bool,
    #[arg(long)]
    persona_read_implies_exec: bool,
    #[arg(long)]
    persona_addr_limit_3gb: bool,
    #[arg(long)]
    persona_addr_no_randomize: bool,

    #[arg(long)]
    disable_clone_newnet: bool,
    #[arg(long)]
    disable_clone_newuser: bool,
    #[arg(long)]
    disable_clone_newns: bool,
    #[arg(long)]
    disable_clone_newpid: bool,
    #[arg(long)]
    disable_clone_newipc: bool,
    #[arg(long)]
    disable_clone_newuts: bool,
    #[arg(long)]
    disable_clone_newcgroup: bool,

    /// Uid mapping `inside:outside:count[:newidmap]`; repeatable, replaces
    /// the default identity mapping.
    #[arg(short = 'U', long = "uid-mapping", value_parser = parse_idmap)]
    uid_mappings: Vec<IdMap>,

    /// Gid mapping, same syntax as --uid-mapping.
    #[arg(short = 'G', long = "gid-mapping", value_parser = parse_idmap)]
    gid_mappings: Vec<IdMap>,

    /// Read-only bind mount `src[:dst]`; repeatable.
    #[arg(short = 'R', long = "bindmount-ro", value_parser = parse_bind)]
    bindmounts_ro: Vec<(PathBuf, PathBuf)>,

    /// Writable bind mount `src[:dst]`; repeatable.
    #[arg(short = 'B', long = "bindmount", value_parser = parse_bind)]
    bindmounts: Vec<(PathBuf, PathBuf)>,

    /// Tmpfs mount at dst; repeatable.
    #[arg(short = 'T', long = "tmpfsmount")]
    tmpfsmounts: Vec<PathBuf>,

    /// Size of tmpfs mounts in bytes.
    #[arg(long, default_value_t = 4 * 1024 * 1024)]
    tmpfs_size: usize,

    /// Mount a fresh procfs inside the jail.
    #[arg(long)]
    mount_proc: bool,

    #[arg(long)]
    proc_path: Option<PathBuf>,

    #[arg(long)]
    proc_rw: bool,

    /// File with a compiled seccomp-BPF program (raw sock_filter records).
    #[arg(long)]
    seccomp_bpf: Option<PathBuf>,

    /// Host interface to hang the jail's MACVLAN peer off.
    #[arg(short = 'I', long)]
    macvlan_iface: Option<String>,
    #[arg(long)]
    macvlan_vs_ip: Option<Ipv4Addr>,
    #[arg(long)]
    macvlan_vs_nm: Option<Ipv4Addr>,
    #[arg(long)]
    macvlan_vs_gw: Option<Ipv4Addr>,
    /// Leave `lo` down inside the new network namespace.
    #[arg(long)]
    iface_no_lo: bool,

    #[arg(long)]
    cgroup_mem_mount: Option<PathBuf>,
    #[arg(long)]
    cgroup_mem_parent: Option<String>,
    /// Memory limit in bytes (0 = controller unused).
    #[arg(long)]
    cgroup_mem_max: Option<u64>,
    #[arg(long)]
    cgroup_pids_mount: Option<PathBuf>,
    #[arg(long)]
    cgroup_pids_parent: Option<String>,
    #[arg(long)]
    cgroup_pids_max: Option<u64>,
    #[arg(long)]
    cgroup_net_cls_mount: Option<PathBuf>,
    #[arg(long)]
    cgroup_net_cls_parent: Option<String>,
    #[arg(long)]
    cgroup_net_cls_classid: Option<u32>,
    #[arg(long)]
    cgroup_cpu_mount: Option<PathBuf>,
    #[arg(long)]
    cgroup_cpu_parent: Option<String>,
    /// CPU milliseconds per second of wall time (0 = controller unused).
    #[arg(long)]
    cgroup_cpu_ms_per_sec: Option<u32>,

    /// Fd numbers the jailed process keeps open across exec; repeatable.
    #[arg(long = "pass-fd")]
    pass_fds: Vec<i32>,

    /// Command and arguments to jail.
    #[arg(last = true)]
    cmd: Vec<String>,
}

fn parse_idmap(s: &str) -> Result<IdMap, String> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() < 3 || parts.len() > 4 {
        return Err(format!("expected inside:outside:count[:newidmap], got {s}"));
    }
    let num = |p: &str, what: &str| -> Result<u32, String> {
        p.parse().map_err(|_| format!("bad {what}: {p}"))
    };
    let mut map = IdMap::new(
        num(parts[0], "inside id")?,
        num(parts[1], "outside id")?,
        num(parts[2], "count")?,
    );
    if parts.len() == 4 {
        if parts[3] != "newidmap" {
            return Err(format!("unknown mapping option: {}", parts[3]));
        }
        map.use_newidmap = true;
    }
    Ok(map)
}

fn parse_bind(s: &str) -> Result<(PathBuf, PathBuf), String> {
    match s.split_once(':') {
        Some((src, dst)) if !src.is_empty() && !dst.is_empty() => {
            Ok((PathBuf::from(src), PathBuf::from(dst)))
        }
        Some(_) => Err(format!("expected src[:dst], got {s}")),
        None if !s.is_empty() => Ok((PathBuf::from(s), PathBuf::from(s))),
        None => Err("empty mount spec".into()),
    }
}

/// Assemble the final configuration: file first, flags on top.
fn build_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut cfg = match &cli.config {
        Some(path) => file::load(path)
            .with_context(|| format!("loading config file {}", path.display()))?,
        None => Config::new(Vec::<String>::new()),
    };

    if !cli.cmd.is_empty() {
        cfg.argv = cli.cmd.clone();
    }
    if let Some(mode) = cli.mode {
        cfg.mode = mode.into();
    }
    if let Some(v) = &cli.hostname {
        cfg.hostname = v.clone();
    }
    if let Some(v) = &cli.cwd {
        cfg.cwd = v.clone();
    }
    if let Some(v) = &cli.chroot {
        cfg.chroot = Some(v.clone());
    }
    if let Some(v) = &cli.bindhost {
        cfg.bindhost = v.clone();
    }
    if let Some(v) = cli.port {
        cfg.port = v;
    }
    if let Some(v) = cli.time_limit {
        cfg.tlimit = v;
    }
    if let Some(v) = cli.max_conns_per_ip {
        cfg.max_conns_per_ip = v;
    }
    cfg.daemonize |= cli.daemon;
    if let Some(v) = &cli.log {
        cfg.logfile = Some(v.clone());
    }
    if let Some(v) = cli.log_level {
        cfg.log_level = v.into();
    }
    cfg.keep_env |= cli.keep_env;
    cfg.envs.extend(cli.envs.iter().cloned());
    cfg.keep_caps |= cli.keep_caps;
    cfg.is_silent |= cli.silent;
    cfg.skip_setsid |= cli.skip_setsid;
    cfg.disable_no_new_privs |= cli.disable_no_new_privs;

    const MB: u64 = 1024 * 1024;
    if let Some(v) = cli.rlimit_as {
        cfg.rlimits.addr_space = v * MB;
    }
    if let Some(v) = cli.rlimit_core {
        cfg.rlimits.core = v * MB;
    }
    if let Some(v) = cli.rlimit_cpu {
        cfg.rlimits.cpu = v;
    }
    if let Some(v) = cli.rlimit_fsize {
        cfg.rlimits.fsize = v * MB;
    }
    if let Some(v) = cli.rlimit_nofile {
        cfg.rlimits.nofile = v;
    }
    if let Some(v) = cli.rlimit_nproc {
        cfg.rlimits.nproc = v;
    }
    if let Some(v) = cli.rlimit_stack {
        cfg.rlimits.stack = v * MB;
    }

    if cli.persona_addr_compat_layout {
        cfg.personality |= libc::ADDR_COMPAT_LAYOUT as libc::c_ulong;
    }
    if cli.persona_mmap_page_zero {
        cfg.personality |= libc::MMAP_PAGE_ZERO as libc::c_ulong;
    }
    if cli.persona_read_implies_exec {
        cfg.personality |= libc::READ_IMPLIES_EXEC as libc::c_ulong;
    }
    if cli.persona_addr_limit_3gb {
        cfg.personality |= libc::ADDR_LIMIT_3GB as libc::c_ulong;
    }
    if cli.persona_addr_no_randomize {
        cfg.personality |= libc::ADDR_NO_RANDOMIZE as libc::c_ulong;
    }

    cfg.namespaces.net &= !cli.disable_clone_newnet;
    cfg.namespaces.user &= !cli.disable_clone_newuser;
    cfg.namespaces.mount &= !cli.disable_clone_newns;
    cfg.namespaces.pid &= !cli.disable_clone_newpid;
    cfg.namespaces.ipc &= !cli.disable_clone_newipc;
    cfg.namespaces.uts &= !cli.disable_clone_newuts;
    cfg.namespaces.cgroup &= !cli.disable_clone_newcgroup;

    if !cli.uid_mappings.is_empty() {
        cfg.uids = cli.uid_mappings.clone();
    }
    if !cli.gid_mappings.is_empty() {
        cfg.gids = cli.gid_mappings.clone();
    }

    for (src, dst) in &cli.bindmounts_ro {
        cfg.mounts.push(Mount::bind_ro(src.clone()).at(dst.clone()));
    }
    for (src, dst) in &cli.bindmounts {
        cfg.mounts.push(Mount::bind_rw(src.clone(), dst.clone()));
    }
    for dst in &cli.tmpfsmounts {
        cfg.mounts.push(Mount::tmpfs(dst.clone(), cli.tmpfs_size));
    }
    cfg.mount_proc |= cli.mount_proc;
    if let Some(v) = &cli.proc_path {
        cfg.proc_path = v.clone();
    }
    cfg.proc_rw |= cli.proc_rw;

    if let Some(path) = &cli.seccomp_bpf {
        let bytes = std::fs::read(path)
            .with_context(|| format!("reading seccomp program {}", path.display()))?;
        let prog = oubliette_sys::seccomp::program_from_bytes(&bytes)
            .map_err(|e| anyhow::anyhow!("malformed seccomp program: {e}"))?;
        cfg.seccomp = Some(prog);
    }

    if let Some(v) = &cli.macvlan_iface {
        cfg.iface.macvlan_master = Some(v.clone());
    }
    if let Some(v) = cli.macvlan_vs_ip {
        cfg.iface.vs_ip = Some(v);
    }
    if let Some(v) = cli.macvlan_vs_nm {
        cfg.iface.vs_netmask = Some(v);
    }
    if let Some(v) = cli.macvlan_vs_gw {
        cfg.iface.vs_gateway = Some(v);
    }
    cfg.iface.no_lo |= cli.iface_no_lo;

    if let Some(v) = &cli.cgroup_mem_mount {
        cfg.cgroup.mem_mount = v.clone();
    }
    if let Some(v) = &cli.cgroup_mem_parent {
        cfg.cgroup.mem_parent = v.clone();
    }
    if let Some(v) = cli.cgroup_mem_max {
        cfg.cgroup.mem_max = v;
    }
    if let Some(v) = &cli.cgroup_pids_mount {
        cfg.cgroup.pids_mount = v.clone();
    }
    if let Some(v) = &cli.cgroup_pids_parent {
        cfg.cgroup.pids_parent = v.clone();
    }
    if let Some(v) = cli.cgroup_pids_max {
        cfg.cgroup.pids_max = v;
    }
    if let Some(v) = &cli.cgroup_net_cls_mount {
        cfg.cgroup.net_cls_mount = v.clone();
    }
    if let Some(v) = &cli.cgroup_net_cls_parent {
        cfg.cgroup.net_cls_parent = v.clone();
    }
    if let Some(v) = cli.cgroup_net_cls_classid {
        cfg.cgroup.net_cls_classid = v;
    }
    if let Some(v) = &cli.cgroup_cpu_mount {
        cfg.cgroup.cpu_mount = v.clone();
    }
    if let Some(v) = &cli.cgroup_cpu_parent {
        cfg.cgroup.cpu_parent = v.clone();
    }
    if let Some(v) = cli.cgroup_cpu_ms_per_sec {
        cfg.cgroup.cpu_ms_per_sec = v;
    }

    cfg.pass_fds.extend(cli.pass_fds.iter().copied());

    if cfg.argv.is_empty() {
        bail!("no command given (pass it after `--` or via the config file)");
    }
    Ok(cfg)
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = build_config(&cli)?;
    cfg.validate()?;
    logs::init(cfg.log_level, cfg.logfile.as_deref())?;

    if !cfg.namespaces.user && !is_root() {
        warn!("running without a user namespace usually requires root");
    }

    if cfg.daemonize {
        if cfg.logfile.is_none() {
            warn!("daemonizing without a log file discards further output");
        }
        // SAFETY: daemon() forks and detaches; we are pre-spawn and
        // single-threaded.
        if unsafe { libc::daemon(0, 0) } == -1 {
            bail!("daemon() failed: {}", std::io::Error::last_os_error());
        }
    }

    let status = driver::run(&cfg)?;
    std::process::exit(status);
}

fn is_root() -> bool {
    // SAFETY: geteuid cannot fail.
    unsafe { libc::geteuid() == 0 }
}
