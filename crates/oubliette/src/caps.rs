//! Dropping privileges in the child.
//!
//! Runs after the privileged setup (mounts, hostname) is done. The order
//! matters: groups and ids first, then no-new-privs, then the capability
//! sets - clearing the sets earlier would make the preceding setresuid fail
//! in the non-userns case.

use nix::unistd::{setgroups, setresgid, setresuid, Gid, Uid};
use oubliette_sys::caps::{capset_clear, clear_keepcaps, set_no_new_privs};
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{Error, Result};

/// Drop groups, switch ids, forbid privilege gain, clear capability sets.
pub fn drop_privs(cfg: &Config) -> Result<()> {
    // Best effort: fails when /proc/self/setgroups says deny.
    if let Err(e) = setgroups(&[]) {
        debug!(%e, "setgroups(0, NULL) failed");
    }

    let gid = Gid::from_raw(cfg.inside_gid());
    setresgid(gid, gid, gid)?;
    let uid = Uid::from_raw(cfg.inside_uid());
    setresuid(uid, uid, uid)?;

    if !cfg.disable_no_new_privs {
        // Only kernels >= 3.5 support it.
        if let Err(errno) = set_no_new_privs() {
            warn!(%errno, "prctl(PR_SET_NO_NEW_PRIVS, 1) failed");
        }
    }

    if !cfg.keep_caps {
        clear_keepcaps().map_err(|errno| Error::Sys {
            call: "prctl(PR_SET_KEEPCAPS, 0)",
            errno,
        })?;
        capset_clear().map_err(|errno| Error::Sys {
            call: "capset",
            errno,
        })?;
    }
    Ok(())
}
