//! Cgroup-v1 attachment for jailed children.
//!
//! The parent creates a per-pid group under each configured controller
//! between clone and the handshake, writes the limit keys, then adds the
//! child to `tasks`. On reap the per-pid group is removed again. A
//! controller is active when its mount path is set and its limit is
//! non-zero; everything else is skipped.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{Error, Result};

fn pid_dir(mount: &Path, parent: &str, pid: libc::pid_t) -> PathBuf {
    mount.join(parent).join(format!("OUBLIETTE.{pid}"))
}

fn write_key(dir: &Path, key: &str, value: &str) -> Result<()> {
    let path = dir.join(key);
    debug!(path = %path.display(), value, "cgroup write");
    fs::write(&path, value)
        .map_err(|e| Error::Cgroup(format!("writing {} failed: {e}", path.display())))
}

fn attach(
    mount: &Path,
    parent: &str,
    pid: libc::pid_t,
    keys: &[(&str, String)],
) -> Result<()> {
    let dir = pid_dir(mount, parent, pid);
    fs::create_dir_all(&dir)
        .map_err(|e| Error::Cgroup(format!("creating {} failed: {e}", dir.display())))?;
    for (key, value) in keys {
        write_key(&dir, key, value)?;
    }
    write_key(&dir, "tasks", &pid.to_string())
}

/// Put `pid` into every active controller's per-pid group.
pub fn init_parent(cfg: &Config, pid: libc::pid_t) -> Result<()> {
    let cg = &cfg.cgroup;

    if !cg.mem_mount.as_os_str().is_empty() && cg.mem_max > 0 {
        attach(
            &cg.mem_mount,
            &cg.mem_parent,
            pid,
            &[("memory.limit_in_bytes", cg.mem_max.to_string())],
        )?;
    }
    if !cg.pids_mount.as_os_str().is_empty() && cg.pids_max > 0 {
        attach(
            &cg.pids_mount,
            &cg.pids_parent,
            pid,
            &[("pids.max", cg.pids_max.to_string())],
        )?;
    }
    if !cg.net_cls_mount.as_os_str().is_empty() && cg.net_cls_classid != 0 {
        attach(
            &cg.net_cls_mount,
            &cg.net_cls_parent,
            pid,
            &[("net_cls.classid", format!("{:#x}", cg.net_cls_classid))],
        )?;
    }
    if !cg.cpu_mount.as_os_str().is_empty() && cg.cpu_ms_per_sec != 0 {
        // ms-per-second maps onto a quota over a one second period.
        let quota_us = u64::from(cg.cpu_ms_per_sec) * 1000;
        attach(
            &cg.cpu_mount,
            &cg.cpu_parent,
            pid,
            &[
                ("cpu.cfs_period_us", 1_000_000u32.to_string()),
                ("cpu.cfs_quota_us", quota_us.to_string()),
            ],
        )?;
    }
    Ok(())
}

/// Remove the per-pid groups after the child was reaped. Best effort: the
/// kernel refuses while an unreaped task lingers, which resolves itself.
pub fn finish_parent(cfg: &Config, pid: libc::pid_t) {
    let cg = &cfg.cgroup;
    let dirs = [
        (&cg.mem_mount, &cg.mem_parent, cg.mem_max > 0),
        (&cg.pids_mount, &cg.pids_parent, cg.pids_max > 0),
        (&cg.net_cls_mount, &cg.net_cls_parent, cg.net_cls_classid != 0),
        (&cg.cpu_mount, &cg.cpu_parent, cg.cpu_ms_per_sec != 0),
    ];
    for (mount, parent, active) in dirs {
        if mount.as_os_str().is_empty() || !active {
            continue;
        }
        let dir = pid_dir(mount, parent, pid);
        if let Err(e) = fs::remove_dir(&dir) {
            warn!(dir = %dir.display(), %e, "removing cgroup failed");
        }
    }
}
