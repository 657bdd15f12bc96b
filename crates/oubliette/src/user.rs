//! User namespace id mapping.
//!
//! The parent installs the child's uid/gid maps between clone and the
//! handshake byte, so by the time the child runs a single instruction of
//! setup the maps are final. Entries are installed in a fixed order:
//! self-written gid map, external gid map, self-written uid map, external
//! uid map - the gid helpers must run while the helper still sees the
//! caller as root-capable in the new namespace.
//!
//! The child side runs after the handshake: it pins secure-bits so the
//! upcoming setresuid does not shed the capabilities still needed for
//! mounts, then switches to the first mapping entry of each table.

use std::fs::OpenOptions;
use std::io::Write;
use std::process::Command;

use nix::unistd::{setgroups, setresgid, setresuid, Gid, Uid};
use oubliette_sys::caps::{set_securebits, SECBIT_KEEP_CAPS, SECBIT_NO_SETUID_FIXUP};
use tracing::{debug, error};

use crate::config::{Config, IdMap};
use crate::error::{Error, Result};

const NEWUIDMAP: &str = "/usr/bin/newuidmap";
const NEWGIDMAP: &str = "/usr/bin/newgidmap";

/// Concatenate the self-written entries into the buffer written to
/// `/proc/<pid>/uid_map` / `gid_map`: one `inside outside count` line per
/// entry, in input order. Empty when every entry goes via the helpers.
fn self_map_buffer(maps: &[IdMap]) -> String {
    let mut buf = String::new();
    for m in maps.iter().filter(|m| !m.use_newidmap) {
        buf.push_str(&format!("{} {} {}\n", m.inside_id, m.outside_id, m.count));
    }
    buf
}

/// Argv tail for newuidmap/newgidmap: `<pid> [inside outside count]...`.
/// None when no entry is marked for the helper.
fn helper_args(pid: libc::pid_t, maps: &[IdMap]) -> Option<Vec<String>> {
    let mut args = vec![pid.to_string()];
    let mut used = false;
    for m in maps.iter().filter(|m| m.use_newidmap) {
        used = true;
        args.push(m.inside_id.to_string());
        args.push(m.outside_id.to_string());
        args.push(m.count.to_string());
    }
    used.then_some(args)
}

fn write_map_file(path: &str, buf: &str) -> Result<()> {
    debug!(path, map = buf.trim_end(), "writing id map");
    let mut file = OpenOptions::new().write(true).open(path)?;
    file.write_all(buf.as_bytes())?;
    Ok(())
}

fn map_self(pid: libc::pid_t, maps: &[IdMap], which: &str) -> Result<()> {
    let buf = self_map_buffer(maps);
    if buf.is_empty() {
        return Ok(());
    }
    write_map_file(&format!("/proc/{pid}/{which}"), &buf)
}

fn map_external(pid: libc::pid_t, maps: &[IdMap], tool: &'static str) -> Result<()> {
    let Some(args) = helper_args(pid, maps) else {
        return Ok(());
    };
    debug!(tool, ?args, "invoking id map helper");
    let status = Command::new(tool).args(&args).status()?;
    if !status.success() {
        return Err(Error::ExternalTool {
            tool,
            status: status.code().unwrap_or(-1),
        });
    }
    Ok(())
}

/// Parent-side mapping for a freshly cloned `pid`. Also used by the
/// direct-exec mode on the process itself after `unshare`.
pub fn map_parent(cfg: &Config, pid: libc::pid_t) -> Result<()> {
    // Writing the maps as root does not require the deny step.
    if !nix::unistd::geteuid().is_root() {
        let path = format!("/proc/{pid}/setgroups");
        if let Err(e) = write_map_file(&path, "deny") {
            error!(path = %path, %e, "denying setgroups failed");
            return Err(e);
        }
    }
    if !cfg.namespaces.user {
        return Ok(());
    }
    map_self(pid, &cfg.gids, "gid_map")?;
    map_external(pid, &cfg.gids, NEWGIDMAP)?;
    map_self(pid, &cfg.uids, "uid_map")?;
    map_external(pid, &cfg.uids, NEWUIDMAP)?;
    Ok(())
}

/// Child-side identity switch, run right after the handshake byte arrives.
pub fn map_child(cfg: &Config) -> Result<()> {
    if !cfg.namespaces.user {
        return Ok(());
    }

    // Best effort: /proc/self/setgroups may already say deny.
    if let Err(e) = setgroups(&[]) {
        debug!(%e, "setgroups(0, NULL) failed");
    }

    // Keep capabilities across the id switch; they are still needed for
    // mounts, hostname and the rest of the privileged child setup.
    set_securebits(SECBIT_KEEP_CAPS | SECBIT_NO_SETUID_FIXUP)
        .map_err(|errno| Error::Sys {
            call: "prctl(PR_SET_SECUREBITS)",
            errno,
        })?;

    let gid = Gid::from_raw(cfg.inside_gid());
    setresgid(gid, gid, gid)?;
    let uid = Uid::from_raw(cfg.inside_uid());
    setresuid(uid, uid, uid)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(inside: u32, outside: u32, count: u32, external: bool) -> IdMap {
        IdMap {
            inside_id: inside,
            outside_id: outside,
            count,
            use_newidmap: external,
        }
    }

    #[test]
    fn buffer_keeps_input_order_and_skips_external() {
        let maps = [
            map(0, 1000, 1, false),
            map(1, 100000, 65536, true),
            map(65537, 70000, 10, false),
        ];
        assert_eq!(self_map_buffer(&maps), "0 1000 1\n65537 70000 10\n");
    }

    #[test]
    fn buffer_empty_when_all_external() {
        let maps = [map(0, 1000, 1, true)];
        assert!(self_map_buffer(&maps).is_empty());
    }

    #[test]
    fn helper_args_shape() {
        let maps = [map(0, 1000, 1, false), map(1, 100000, 65536, true)];
        let args = helper_args(4242, &maps).unwrap();
        assert_eq!(args, ["4242", "1", "100000", "65536"]);
    }

    #[test]
    fn helper_skipped_without_external_entries() {
        let maps = [map(0, 1000, 1, false)];
        assert!(helper_args(1, &maps).is_none());
    }

    #[test]
    fn map_parent_no_userns_is_noop_for_root() {
        // With user namespaces off there is nothing to write; as non-root
        // the deny step still runs against a real pid, so only exercise the
        // short-circuit when we are root.
        if !nix::unistd::geteuid().is_root() {
            return;
        }
        let mut cfg = Config::new(["/bin/true"]);
        cfg.namespaces.user = false;
        map_parent(&cfg, std::process::id() as libc::pid_t).unwrap();
    }
}
