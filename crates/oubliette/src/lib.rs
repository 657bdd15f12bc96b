//! oubliette: a namespace jail for Linux.
//!
//! A launcher that runs a target program inside a tightly constrained
//! sandbox built from Linux namespaces, capability drops, resource limits,
//! uid/gid mappings, a private mount tree and externally compiled seccomp
//! filters. Four modes of operation:
//!
//! - **Once** - run the target a single time, exit with its mapped status
//! - **Rerun** - re-spawn the target whenever it exits
//! - **Execve** - unshare namespaces and replace the supervisor in place
//! - **ListenTcp** - fork one jailed child per inbound TCP connection
//!
//! ## Quick Start
//!
//! ```ignore
//! use oubliette::{driver, logs, Config, Mount};
//!
//! let mut cfg = Config::new(["/bin/sh", "-i"]);
//! // The jail pivots into an empty root; the plan decides what is visible.
//! cfg.mounts.push(Mount::bind_ro("/bin"));
//! cfg.mounts.push(Mount::bind_ro("/lib"));
//! cfg.mounts.push(Mount::bind_ro("/lib64").optional());
//! cfg.mounts.push(Mount::tmpfs("/tmp", 4 << 20));
//! cfg.validate()?;
//! logs::init(cfg.log_level, cfg.logfile.as_deref())?;
//! let status = driver::run(&cfg)?;
//! std::process::exit(status);
//! ```
//!
//! ## Security model
//!
//! The parent installs uid/gid maps, cgroup membership and the network
//! interface *before* releasing the child through a one-byte handshake, so
//! no untrusted code observes a half-built jail. Inside the child the
//! seccomp filter is installed last, directly before execve. See the
//! `spawn` module for the exact ordering.

#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod caps;
pub mod cgroup;
pub mod config;
pub mod contain;
pub mod driver;
pub mod error;
pub mod logs;
pub mod mounts;
pub mod net;
pub mod reap;
pub mod registry;
pub mod sandbox;
pub mod spawn;
pub mod user;

pub use config::{CgroupPlan, Config, IdMap, IfacePlan, Mode, Mount, Namespaces, Rlimits};
pub use error::{Error, Result};
pub use logs::LogLevel;
pub use registry::{ChildRecord, PidRegistry};
