//! Linux cgroup v2 management: mount, per-job cgroup creation, process
//! placement, draining, removal.
//!
//! The service owns `<mount_root>/<base>`. Each job gets one cgroup directory
//! named by a fresh UUID, and because v2 forbids processes in inner nodes,
//! the job's process is written into a further randomly-named leaf below it.

mod controller;

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use nix::mount::{mount, umount, MsFlags};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Error, Result};

const CGROUP_PROCS: &str = "cgroup.procs";
const SUBTREE_CONTROL: &str = "cgroup.subtree_control";

/// Resource limits applied to one job's cgroup. `None` means the control is
/// not applied at all, never "limit of zero".
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Limits {
    /// memory.high ceiling in bytes.
    pub memory_bytes: Option<u64>,
    /// cpu.max share in cores, e.g. 1.5.
    pub cpus: Option<f32>,
    /// io.max read bandwidth in bytes per second, per physical disk.
    pub disk_read_bps: Option<u64>,
    /// io.max write bandwidth in bytes per second, per physical disk.
    pub disk_write_bps: Option<u64>,
}

/// One job's cgroup: its identity, directory, and the limits written into it.
#[derive(Debug, Clone)]
pub struct Cgroup {
    pub id: Uuid,
    pub limits: Limits,
    path: PathBuf,
}

impl Cgroup {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Manages the cgroup2 hierarchy for job cgroups.
#[derive(Debug, Clone)]
pub struct CgroupService {
    mount_root: PathBuf,
    base: PathBuf,
    disk_major: u32,
    disk_minor_stride: u32,
}

impl CgroupService {
    /// Construction only; no filesystem access until [`CgroupService::setup`].
    pub fn new(config: &Config) -> Self {
        Self {
            mount_root: config.cgroup_mount_root.clone(),
            base: config.cgroup_base_path(),
            disk_major: config.disk_major,
            disk_minor_stride: config.disk_minor_stride,
        }
    }

    /// Mounts a cgroup2 filesystem on the mount root if nothing is there yet,
    /// creates the base directory for job cgroups, and enables the cpu,
    /// memory, and io controllers for both the root and the base.
    pub fn setup(&self) -> Result<()> {
        fs::create_dir_all(&self.mount_root).map_err(|err| {
            Error::io(format!("create mount root {}", self.mount_root.display()), err)
        })?;

        let empty = match fs::read_dir(&self.mount_root) {
            Ok(mut entries) => entries.next().is_none(),
            Err(_) => true,
        };
        if empty {
            mount(
                Some("none"),
                &self.mount_root,
                Some("cgroup2"),
                MsFlags::empty(),
                None::<&str>,
            )
            .map_err(|source| Error::Mount {
                path: self.mount_root.clone(),
                source,
            })?;
        }

        fs::create_dir_all(&self.base)
            .map_err(|err| Error::io(format!("create cgroup base {}", self.base.display()), err))?;

        for dir in [&self.mount_root, &self.base] {
            for name in controller::CONTROLLERS {
                controller::enable(dir, name)?;
            }
        }

        Ok(())
    }

    /// Creates a fresh job cgroup and writes every control the limits select.
    pub fn create_cgroup(&self, limits: Limits) -> Result<Cgroup> {
        let id = Uuid::new_v4();
        let cgroup = Cgroup {
            id,
            limits,
            path: self.base.join(id.to_string()),
        };

        fs::create_dir(&cgroup.path).map_err(|err| {
            Error::io(format!("create cgroup {}", cgroup.path.display()), err)
        })?;

        for ctl in controller::for_limits(&limits, self.disk_major, self.disk_minor_stride) {
            ctl.enable(&cgroup.path)?;
            ctl.apply(&cgroup.path)?;
        }

        debug!(cgroup = %id, "created cgroup");
        Ok(cgroup)
    }

    /// Places `pid` into the cgroup. The pid is written into a randomly named
    /// leaf directory: v2's no-internal-processes rule means the job cgroup
    /// itself must stay process-free once it has children.
    pub fn place(&self, cgroup: &Cgroup, pid: u32) -> Result<()> {
        let leaf = cgroup.path.join(Uuid::new_v4().to_string());
        fs::create_dir(&leaf)
            .map_err(|err| Error::io(format!("create cgroup leaf {}", leaf.display()), err))?;

        let procs = leaf.join(CGROUP_PROCS);
        write_file(&procs, &pid.to_string())
            .map_err(|err| Error::io(format!("write pid into {}", procs.display()), err))?;

        debug!(cgroup = %cgroup.id, pid, "placed process in cgroup");
        Ok(())
    }

    /// Removes the job cgroup with the given id: every pid found below it is
    /// moved to the root cgroup, then the leaves and the directory itself are
    /// removed. A cgroup that no longer exists is not an error.
    pub fn remove_cgroup(&self, id: Uuid) -> Result<()> {
        let path = self.base.join(id.to_string());
        if !path.exists() {
            debug!(cgroup = %id, "cgroup already removed");
            return Ok(());
        }

        let pids = read_procs_below(&path);
        self.place_in_root_cgroup(&pids);

        remove_leaves(&path)?;
        fs::remove_dir(&path)
            .map_err(|err| Error::io(format!("remove cgroup {}", path.display()), err))?;

        debug!(cgroup = %id, "removed cgroup");
        Ok(())
    }

    /// Tears down everything this service owns: drains and removes every
    /// residual job cgroup, removes the base directory, unmounts. Runs at
    /// shutdown; failures are logged, never propagated.
    pub fn cleanup(&self) {
        match fs::read_dir(&self.base) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    let name = entry.file_name();
                    // Only directories this service created are drained.
                    let Some(id) = name.to_str().and_then(|n| Uuid::parse_str(n).ok()) else {
                        continue;
                    };
                    if let Err(err) = self.remove_cgroup(id) {
                        error!(cgroup = %id, error = %err, "cleanup: removing cgroup");
                    }
                }
            }
            Err(err) => error!(base = %self.base.display(), error = %err, "cleanup: reading base"),
        }

        if let Err(err) = fs::remove_dir(&self.base) {
            error!(base = %self.base.display(), error = %err, "cleanup: removing base");
        }
        if let Err(err) = umount(&self.mount_root) {
            error!(root = %self.mount_root.display(), error = %err, "cleanup: unmounting cgroup2");
        }
    }

    /// Moves pids back to the root cgroup so their old cgroup can be removed.
    /// A pid that exited in the meantime is logged and skipped.
    fn place_in_root_cgroup(&self, pids: &[u32]) {
        let procs = self.mount_root.join(CGROUP_PROCS);
        for pid in pids {
            if let Err(err) = write_file(&procs, &pid.to_string()) {
                warn!(pid, error = %err, "moving pid to root cgroup");
            }
        }
    }
}

/// Collects every pid recorded in `cgroup.procs` files below `path`.
/// Unreadable entries are logged and skipped so draining makes as much
/// progress as possible.
fn read_procs_below(path: &Path) -> Vec<u32> {
    let mut pids = Vec::new();
    let mut stack = vec![path.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let procs = dir.join(CGROUP_PROCS);
        match fs::read_to_string(&procs) {
            Ok(contents) => {
                for line in contents.lines() {
                    match line.trim().parse::<u32>() {
                        Ok(pid) => pids.push(pid),
                        Err(_) if line.trim().is_empty() => {}
                        Err(err) => warn!(file = %procs.display(), line, error = %err, "parsing cgroup.procs"),
                    }
                }
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(file = %procs.display(), error = %err, "reading cgroup.procs"),
        }

        let Ok(entries) = fs::read_dir(&dir) else { continue };
        for entry in entries.flatten() {
            if entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false) {
                stack.push(entry.path());
            }
        }
    }

    pids
}

/// Removes the leaf directories directly below the job cgroup.
fn remove_leaves(path: &Path) -> Result<()> {
    let entries = fs::read_dir(path)
        .map_err(|err| Error::io(format!("read cgroup {}", path.display()), err))?;
    for entry in entries.flatten() {
        if !entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false) {
            continue;
        }
        let leaf = entry.path();
        fs::remove_dir(&leaf)
            .map_err(|err| Error::io(format!("remove cgroup leaf {}", leaf.display()), err))?;
    }
    Ok(())
}

/// Interface files reject O_CREAT and partial writes mean partial limits, so
/// open for plain writing and push the whole value at once.
fn write_file(path: &Path, value: &str) -> io::Result<()> {
    let mut fd = OpenOptions::new().write(true).open(path)?;
    fd.write_all(value.as_bytes())
}
