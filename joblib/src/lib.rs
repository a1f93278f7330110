//! Core engine of the jobworker supervisor: cgroup-confined job execution
//! with live output fan-out.
//!
//! The pieces, bottom up: [`device`] enumerates physical disks for io.max,
//! [`cgroup`] manages the cgroup2 hierarchy, [`output`] owns the per-job log
//! files, [`watch`] turns kernel file-modification events into follower
//! wake-ups, [`reexec`] is the child side of the launch protocol, and
//! [`JobService`] ties jobs, cgroups, and output together.

pub mod cgroup;
pub mod config;
pub mod device;
pub mod error;
mod job;
pub mod output;
pub mod reexec;
mod service;
pub mod watch;

pub use cgroup::{Cgroup, CgroupService, Limits};
pub use config::Config;
pub use error::{Error, Result};
pub use job::{Job, JobId, Status, NO_EXIT};
pub use reexec::Command;
pub use service::JobService;
