//! TOML config-file loading.
//!
//! The file schema mirrors the flag set; everything is optional and falls
//! back to the engine defaults. The result is an ordinary `Config`, so the
//! engine cannot tell a file-built jail from a flag-built one.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use serde::Deserialize;

use oubliette::{Config, IdMap, LogLevel, Mode, Mount};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    cmd: Option<Vec<String>>,
    mode: Option<String>,
    hostname: Option<String>,
    cwd: Option<PathBuf>,
    chroot: Option<PathBuf>,
    bindhost: Option<String>,
    port: Option<u16>,
    time_limit: Option<u64>,
    max_conns_per_ip: Option<u32>,
    daemon: Option<bool>,
    log_file: Option<PathBuf>,
    log_level: Option<String>,
    keep_env: Option<bool>,
    envs: Option<Vec<String>>,
    keep_caps: Option<bool>,
    silent: Option<bool>,
    skip_setsid: Option<bool>,
    disable_no_new_privs: Option<bool>,
    mount_proc: Option<bool>,
    proc_path: Option<PathBuf>,
    proc_rw: Option<bool>,
    seccomp_bpf: Option<PathBuf>,
    pass_fds: Option<Vec<i32>>,
    #[serde(default)]
    rlimits: FileRlimits,
    #[serde(default)]
    namespaces: FileNamespaces,
    #[serde(default)]
    uid_maps: Vec<FileIdMap>,
    #[serde(default)]
    gid_maps: Vec<FileIdMap>,
    #[serde(default)]
    mounts: Vec<FileMount>,
    #[serde(default)]
    iface: FileIface,
    #[serde(default)]
    cgroup: FileCgroup,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileRlimits {
    /// MiB
    r#as: Option<u64>,
    /// MiB
    core: Option<u64>,
    /// seconds
    cpu: Option<u64>,
    /// MiB
    fsize: Option<u64>,
    nofile: Option<u64>,
    nproc: Option<u64>,
    /// MiB
    stack: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileNamespaces {
    net: Option<bool>,
    user: Option<bool>,
    mount: Option<bool>,
    pid: Option<bool>,
    ipc: Option<bool>,
    uts: Option<bool>,
    cgroup: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileIdMap {
    inside_id: u32,
    outside_id: u32,
    #[serde(default = "one")]
    count: u32,
    #[serde(default)]
    use_newidmap: bool,
}

fn one() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileMount {
    src: Option<PathBuf>,
    dst: PathBuf,
    #[serde(default)]
    rw: bool,
    /// `tmpfs` for a fresh tmpfs; absent means bind.
    fstype: Option<String>,
    /// tmpfs size in bytes.
    tmpfs_size: Option<usize>,
    #[serde(default)]
    optional: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileIface {
    macvlan_master: Option<String>,
    vs_name: Option<String>,
    vs_ip: Option<Ipv4Addr>,
    vs_netmask: Option<Ipv4Addr>,
    vs_gateway: Option<Ipv4Addr>,
    #[serde(default)]
    no_lo: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileCgroup {
    mem_mount: Option<PathBuf>,
    mem_parent: Option<String>,
    mem_max: Option<u64>,
    pids_mount: Option<PathBuf>,
    pids_parent: Option<String>,
    pids_max: Option<u64>,
    net_cls_mount: Option<PathBuf>,
    net_cls_parent: Option<String>,
    net_cls_classid: Option<u32>,
    cpu_mount: Option<PathBuf>,
    cpu_parent: Option<String>,
    cpu_ms_per_sec: Option<u32>,
}

/// Parse `path` into a full engine configuration.
pub fn load(path: &Path) -> anyhow::Result<Config> {
    let text = std::fs::read_to_string(path)?;
    parse(&text, path.parent().unwrap_or(Path::new(".")))
}

fn parse(text: &str, base: &Path) -> anyhow::Result<Config> {
    let fc: FileConfig = toml::from_str(text).context("parsing TOML")?;

    let mut cfg = Config::new(fc.cmd.unwrap_or_default());

    if let Some(mode) = &fc.mode {
        cfg.mode = match mode.as_str() {
            "once" | "o" => Mode::Once,
            "rerun" | "r" => Mode::Rerun,
            "execve" | "e" => Mode::Execve,
            "listen" | "l" => Mode::ListenTcp,
            other => bail!("unknown mode: {other}"),
        };
    }
    if let Some(v) = fc.hostname {
        cfg.hostname = v;
    }
    if let Some(v) = fc.cwd {
        cfg.cwd = v;
    }
    cfg.chroot = fc.chroot.or(cfg.chroot);
    if let Some(v) = fc.bindhost {
        cfg.bindhost = v;
    }
    if let Some(v) = fc.port {
        cfg.port = v;
    }
    if let Some(v) = fc.time_limit {
        cfg.tlimit = v;
    }
    if let Some(v) = fc.max_conns_per_ip {
        cfg.max_conns_per_ip = v;
    }
    if let Some(v) = fc.daemon {
        cfg.daemonize = v;
    }
    cfg.logfile = fc.log_file.or(cfg.logfile);
    if let Some(v) = &fc.log_level {
        cfg.log_level = v
            .parse::<LogLevel>()
            .map_err(|e| anyhow::anyhow!("{e}"))?;
    }
    if let Some(v) = fc.keep_env {
        cfg.keep_env = v;
    }
    if let Some(v) = fc.envs {
        cfg.envs = v;
    }
    if let Some(v) = fc.keep_caps {
        cfg.keep_caps = v;
    }
    if let Some(v) = fc.silent {
        cfg.is_silent = v;
    }
    if let Some(v) = fc.skip_setsid {
        cfg.skip_setsid = v;
    }
    if let Some(v) = fc.disable_no_new_privs {
        cfg.disable_no_new_privs = v;
    }
    if let Some(v) = fc.mount_proc {
        cfg.mount_proc = v;
    }
    if let Some(v) = fc.proc_path {
        cfg.proc_path = v;
    }
    if let Some(v) = fc.proc_rw {
        cfg.proc_rw = v;
    }
    if let Some(v) = fc.pass_fds {
        cfg.pass_fds = v;
    }

    const MB: u64 = 1024 * 1024;
    if let Some(v) = fc.rlimits.r#as {
        cfg.rlimits.addr_space = v * MB;
    }
    if let Some(v) = fc.rlimits.core {
        cfg.rlimits.core = v * MB;
    }
    if let Some(v) = fc.rlimits.cpu {
        cfg.rlimits.cpu = v;
    }
    if let Some(v) = fc.rlimits.fsize {
        cfg.rlimits.fsize = v * MB;
    }
    if let Some(v) = fc.rlimits.nofile {
        cfg.rlimits.nofile = v;
    }
    if let Some(v) = fc.rlimits.nproc {
        cfg.rlimits.nproc = v;
    }
    if let Some(v) = fc.rlimits.stack {
        cfg.rlimits.stack = v * MB;
    }

    if let Some(v) = fc.namespaces.net {
        cfg.namespaces.net = v;
    }
    if let Some(v) = fc.namespaces.user {
        cfg.namespaces.user = v;
    }
    if let Some(v) = fc.namespaces.mount {
        cfg.namespaces.mount = v;
    }
    if let Some(v) = fc.namespaces.pid {
        cfg.namespaces.pid = v;
    }
    if let Some(v) = fc.namespaces.ipc {
        cfg.namespaces.ipc = v;
    }
    if let Some(v) = fc.namespaces.uts {
        cfg.namespaces.uts = v;
    }
    if let Some(v) = fc.namespaces.cgroup {
        cfg.namespaces.cgroup = v;
    }

    if !fc.uid_maps.is_empty() {
        cfg.uids = fc.uid_maps.iter().map(to_idmap).collect();
    }
    if !fc.gid_maps.is_empty() {
        cfg.gids = fc.gid_maps.iter().map(to_idmap).collect();
    }

    for m in &fc.mounts {
        cfg.mounts.push(to_mount(m)?);
    }

    if fc.iface.macvlan_master.is_some() {
        cfg.iface.macvlan_master = fc.iface.macvlan_master.clone();
    }
    if let Some(v) = fc.iface.vs_name {
        cfg.iface.vs_name = v;
    }
    cfg.iface.vs_ip = fc.iface.vs_ip.or(cfg.iface.vs_ip);
    cfg.iface.vs_netmask = fc.iface.vs_netmask.or(cfg.iface.vs_netmask);
    cfg.iface.vs_gateway = fc.iface.vs_gateway.or(cfg.iface.vs_gateway);
    cfg.iface.no_lo |= fc.iface.no_lo;

    let cg = &fc.cgroup;
    if let Some(v) = &cg.mem_mount {
        cfg.cgroup.mem_mount = v.clone();
    }
    if let Some(v) = &cg.mem_parent {
        cfg.cgroup.mem_parent = v.clone();
    }
    if let Some(v) = cg.mem_max {
        cfg.cgroup.mem_max = v;
    }
    if let Some(v) = &cg.pids_mount {
        cfg.cgroup.pids_mount = v.clone();
    }
    if let Some(v) = &cg.pids_parent {
        cfg.cgroup.pids_parent = v.clone();
    }
    if let Some(v) = cg.pids_max {
        cfg.cgroup.pids_max = v;
    }
    if let Some(v) = &cg.net_cls_mount {
        cfg.cgroup.net_cls_mount = v.clone();
    }
    if let Some(v) = &cg.net_cls_parent {
        cfg.cgroup.net_cls_parent = v.clone();
    }
    if let Some(v) = cg.net_cls_classid {
        cfg.cgroup.net_cls_classid = v;
    }
    if let Some(v) = &cg.cpu_mount {
        cfg.cgroup.cpu_mount = v.clone();
    }
    if let Some(v) = &cg.cpu_parent {
        cfg.cgroup.cpu_parent = v.clone();
    }
    if let Some(v) = cg.cpu_ms_per_sec {
        cfg.cgroup.cpu_ms_per_sec = v;
    }

    if let Some(bpf) = &fc.seccomp_bpf {
        // Relative program paths resolve against the config file.
        let full = if bpf.is_absolute() {
            bpf.clone()
        } else {
            base.join(bpf)
        };
        let bytes = std::fs::read(&full)
            .with_context(|| format!("reading seccomp program {}", full.display()))?;
        let prog = oubliette_sys::seccomp::program_from_bytes(&bytes)
            .map_err(|e| anyhow::anyhow!("malformed seccomp program: {e}"))?;
        cfg.seccomp = Some(prog);
    }

    Ok(cfg)
}

fn to_idmap(m: &FileIdMap) -> IdMap {
    let mut map = IdMap::new(m.inside_id, m.outside_id, m.count);
    map.use_newidmap = m.use_newidmap;
    map
}

fn to_mount(m: &FileMount) -> anyhow::Result<Mount> {
    let mount = match m.fstype.as_deref() {
        Some("tmpfs") => Mount::tmpfs(&m.dst, m.tmpfs_size.unwrap_or(4 * 1024 * 1024)),
        Some(other) => bail!("unsupported fstype: {other}"),
        None => {
            let src = m
                .src
                .as_ref()
                .with_context(|| format!("bind mount {} needs src", m.dst.display()))?;
            if m.rw {
                Mount::bind_rw(src, &m.dst)
            } else {
                Mount::bind_ro(src.clone()).at(&m.dst)
            }
        }
    };
    Ok(if m.optional { mount.optional() } else { mount })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_file() {
        let cfg = parse(r#"cmd = ["/bin/true"]"#, Path::new(".")).unwrap();
        assert_eq!(cfg.argv, vec!["/bin/true"]);
        assert_eq!(cfg.mode, Mode::Once);
        cfg.validate().unwrap();
    }

    #[test]
    fn full_file() {
        let text = r#"
cmd = ["/bin/sh", "-c", "id"]
mode = "listen"
hostname = "jail"
port = 9000
time_limit = 20
max_conns_per_ip = 2
log_level = "debug"

[rlimits]
as = 256
cpu = 30

[namespaces]
net = false

[[uid_maps]]
inside_id = 0
outside_id = 1000

[[gid_maps]]
inside_id = 0
outside_id = 1000
count = 1
use_newidmap = true

[[mounts]]
src = "/usr"
dst = "/usr"

[[mounts]]
dst = "/tmp"
fstype = "tmpfs"
tmpfs_size = 1048576

[iface]
no_lo = true

[cgroup]
pids_mount = "/sys/fs/cgroup/pids"
pids_parent = "OUBLIETTE"
pids_max = 16
"#;
        let cfg = parse(text, Path::new(".")).unwrap();
        assert_eq!(cfg.mode, Mode::ListenTcp);
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.tlimit, 20);
        assert!(!cfg.namespaces.net);
        assert!(cfg.namespaces.pid);
        assert_eq!(cfg.rlimits.addr_space, 256 * 1024 * 1024);
        assert_eq!(cfg.uids.len(), 1);
        assert_eq!(cfg.uids[0].outside_id, 1000);
        assert!(cfg.gids[0].use_newidmap);
        assert_eq!(cfg.mounts.len(), 2);
        assert!(cfg.iface.no_lo);
        assert_eq!(cfg.cgroup.pids_max, 16);
        cfg.validate().unwrap();
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(parse("nonsense = 1", Path::new(".")).is_err());
    }

    #[test]
    fn bad_mode_rejected() {
        assert!(parse(r#"cmd=["/bin/true"]
mode="turbo""#, Path::new(".")).is_err());
    }
}
