//! Enumeration of physical disk devices under /dev, used to address io.max
//! lines at every disk of a given major.

use std::fs;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

const DEV: &str = "/dev";

/// Reads the minor numbers of the physical disks with the given major.
///
/// Partitions are filtered out by keeping only minors that are a multiple of
/// `stride` (16 for the sd driver). Entries that cannot be inspected are
/// skipped; the walk itself failing is an error.
pub fn disk_minors(major: u32, stride: u32) -> Result<Vec<u32>> {
    disk_minors_in(Path::new(DEV), major, stride)
}

fn disk_minors_in(dev: &Path, major: u32, stride: u32) -> Result<Vec<u32>> {
    let mut minors = Vec::new();
    let mut stack: Vec<PathBuf> = vec![dev.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let entries = fs::read_dir(&dir)
            .map_err(|err| Error::io(format!("read dir {}", dir.display()), err))?;
        for entry in entries {
            let Ok(entry) = entry else { continue };
            let Ok(meta) = entry.metadata() else { continue };

            let file_type = meta.file_type();
            if file_type.is_dir() {
                stack.push(entry.path());
                continue;
            }
            if !file_type.is_block_device() {
                continue;
            }

            let rdev = meta.rdev();
            if libc::major(rdev) != major {
                continue;
            }
            let minor = libc::minor(rdev);
            if !is_physical_minor(minor, stride) {
                continue;
            }
            minors.push(minor);
        }
    }

    minors.sort_unstable();
    minors.dedup();
    Ok(minors)
}

/// A whole-disk node sits at a stride boundary; everything in between is a
/// partition.
fn is_physical_minor(minor: u32, stride: u32) -> bool {
    stride != 0 && minor % stride == 0
}
