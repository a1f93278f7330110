//! Per-job output log files: path resolution and directory lifecycle.
//!
//! Every job appends its combined stdout/stderr to exactly one file under the
//! output root. The file is created by the supervisor before the target may
//! produce output and is never truncated while the job exists.

use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;

use tracing::warn;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Error, Result};

/// Permissions of the output root and every log file within it.
pub const FILE_MODE: u32 = 0o644;

/// Location of the log file for the given job.
pub fn file_path(config: &Config, id: Uuid) -> PathBuf {
    config.output_root.join(format!("{id}.log"))
}

/// Ensures the output root directory exists.
pub fn create_root(config: &Config) -> Result<()> {
    fs::create_dir_all(&config.output_root).map_err(|err| {
        Error::io(
            format!("create output root {}", config.output_root.display()),
            err,
        )
    })
}

/// Creates the job's log file, mode 0644, in append mode. Opening an existing
/// file is fine; the log is append-only by contract.
pub fn create_file(config: &Config, id: Uuid) -> Result<File> {
    let path = file_path(config, id);
    OpenOptions::new()
        .create(true)
        .append(true)
        .mode(FILE_MODE)
        .open(&path)
        .map_err(|err| Error::io(format!("create output log {}", path.display()), err))
}

/// Removes the output root and everything in it. Called on service close;
/// failures are logged, never propagated.
pub fn remove_root(config: &Config) {
    if let Err(err) = fs::remove_dir_all(&config.output_root) {
        warn!(
            root = %config.output_root.display(),
            error = %err,
            "removing output root"
        );
    }
}
