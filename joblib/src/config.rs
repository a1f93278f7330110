use std::path::{Path, PathBuf};

/// Process-wide configuration, threaded through constructors so tests can
/// override every path.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding one `<job_id>.log` file per job.
    pub output_root: PathBuf,
    /// Mount point of the cgroup2 filesystem managed by the supervisor.
    pub cgroup_mount_root: PathBuf,
    /// Name of the directory under the mount root that holds job cgroups.
    pub cgroup_base: String,
    /// Subcommand the supervisor binary is re-invoked with to stage a job.
    pub reexec_subcommand: String,
    /// Major number of the physical disk devices governed by io.max.
    pub disk_major: u32,
    /// Minor-number stride between physical disks (partitions sit in between).
    pub disk_minor_stride: u32,
    /// Read size used when streaming job output to a follower.
    pub stream_chunk_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output_root: PathBuf::from("/var/log/jobworker"),
            cgroup_mount_root: PathBuf::from("/cgroup2"),
            cgroup_base: "jobworker".to_string(),
            reexec_subcommand: "reexec".to_string(),
            disk_major: 8,
            disk_minor_stride: 16,
            stream_chunk_size: 8192,
        }
    }
}

impl Config {
    /// Directory the job cgroups live in.
    pub fn cgroup_base_path(&self) -> PathBuf {
        self.cgroup_mount_root.join(&self.cgroup_base)
    }

    /// Rooted variant of the default config, for tests that must not touch
    /// the real /var/log or /cgroup2.
    pub fn under(root: &Path) -> Self {
        Self {
            output_root: root.join("output"),
            cgroup_mount_root: root.join("cgroup2"),
            ..Self::default()
        }
    }
}
