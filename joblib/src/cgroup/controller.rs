//! Per-resource cgroup controllers: which interface file to write and the
//! exact value format for each supported limit.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use super::{Limits, SUBTREE_CONTROL};
use crate::device;
use crate::error::{Error, Result};

pub(super) const CPU: &str = "cpu";
pub(super) const MEMORY: &str = "memory";
pub(super) const IO: &str = "io";

/// Controllers the service enables on the root and base cgroups at setup.
pub(super) const CONTROLLERS: [&str; 3] = [CPU, MEMORY, IO];

/// cpu.max quota is expressed against this period, in microseconds.
const CPU_PERIOD: u64 = 100_000;

/// A controller knows how to enable itself on a cgroup and how to write its
/// control value.
pub(super) trait Controller {
    fn name(&self) -> &'static str;

    fn enable(&self, cgroup: &Path) -> Result<()> {
        enable(cgroup, self.name())
    }

    fn apply(&self, cgroup: &Path) -> Result<()>;
}

/// Selects the controllers for the non-empty limit fields.
pub(super) fn for_limits(
    limits: &Limits,
    disk_major: u32,
    disk_minor_stride: u32,
) -> Vec<Box<dyn Controller>> {
    let mut set: Vec<Box<dyn Controller>> = Vec::new();
    if let Some(bytes) = limits.memory_bytes {
        set.push(Box::new(MemoryController { bytes }));
    }
    if let Some(cpus) = limits.cpus {
        set.push(Box::new(CpuController { cpus }));
    }
    if let Some(bps) = limits.disk_read_bps {
        set.push(Box::new(DiskBpsController {
            key: "rbps",
            bps,
            disk_major,
            disk_minor_stride,
        }));
    }
    if let Some(bps) = limits.disk_write_bps {
        set.push(Box::new(DiskBpsController {
            key: "wbps",
            bps,
            disk_major,
            disk_minor_stride,
        }));
    }
    set
}

/// Appends `+<name>\n` to the cgroup's subtree control file.
pub(super) fn enable(cgroup: &Path, controller: &'static str) -> Result<()> {
    let path = cgroup.join(SUBTREE_CONTROL);
    let result = OpenOptions::new()
        .write(true)
        .open(&path)
        .and_then(|mut fd| fd.write_all(format!("+{controller}\n").as_bytes()));
    result.map_err(|source| Error::ControllerEnable {
        controller,
        path: cgroup.to_path_buf(),
        source,
    })
}

/// Writes a single control value, surfacing failures as the limit rejection
/// that aborts a job start.
fn write_limit(cgroup: &Path, control: &'static str, value: String) -> Result<()> {
    let path = cgroup.join(control);
    let result = OpenOptions::new()
        .write(true)
        .open(&path)
        .and_then(|mut fd| fd.write_all(value.as_bytes()));
    result.map_err(|source| Error::ResourceLimit {
        control,
        value,
        source,
    })
}

/// memory.high, decimal bytes.
struct MemoryController {
    bytes: u64,
}

impl Controller for MemoryController {
    fn name(&self) -> &'static str {
        MEMORY
    }

    fn apply(&self, cgroup: &Path) -> Result<()> {
        write_limit(cgroup, "memory.high", memory_high_value(self.bytes))
    }
}

/// cpu.max, `<quota> <period>` with the quota rounded to whole microseconds.
struct CpuController {
    cpus: f32,
}

impl Controller for CpuController {
    fn name(&self) -> &'static str {
        CPU
    }

    fn apply(&self, cgroup: &Path) -> Result<()> {
        write_limit(cgroup, "cpu.max", cpu_max_value(self.cpus))
    }
}

/// io.max bandwidth, one `<major>:<minor> <key>=<bps>` line per physical
/// disk.
struct DiskBpsController {
    key: &'static str,
    bps: u64,
    disk_major: u32,
    disk_minor_stride: u32,
}

impl Controller for DiskBpsController {
    fn name(&self) -> &'static str {
        IO
    }

    fn apply(&self, cgroup: &Path) -> Result<()> {
        let minors = device::disk_minors(self.disk_major, self.disk_minor_stride)?;
        for minor in minors {
            write_limit(
                cgroup,
                "io.max",
                io_max_value(self.disk_major, minor, self.key, self.bps),
            )?;
        }
        Ok(())
    }
}

fn memory_high_value(bytes: u64) -> String {
    bytes.to_string()
}

fn cpu_max_value(cpus: f32) -> String {
    let quota = (f64::from(cpus) * CPU_PERIOD as f64).round() as u64;
    format!("{quota} {CPU_PERIOD}")
}

fn io_max_value(major: u32, minor: u32, key: &str, bps: u64) -> String {
    format!("{major}:{minor} {key}={bps}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_max_rounds_the_quota() {
        assert_eq!(cpu_max_value(1.5), "150000 100000");
        assert_eq!(cpu_max_value(0.5), "50000 100000");
        assert_eq!(cpu_max_value(1.0), "100000 100000");
        // 0.333 * 100000 = 33300.000... but float representation wobbles;
        // rounding keeps the written value whole.
        assert_eq!(cpu_max_value(0.333), "33300 100000");
    }

    #[test]
    fn memory_high_is_decimal_bytes() {
        assert_eq!(memory_high_value(100_000), "100000");
    }

    #[test]
    fn io_max_line_shape() {
        assert_eq!(io_max_value(8, 0, "rbps", 10_000), "8:0 rbps=10000");
        assert_eq!(io_max_value(8, 16, "wbps", 10_000), "8:16 wbps=10000");
    }

    #[test]
    fn controllers_follow_the_set_limits() {
        let none = for_limits(&Limits::default(), 8, 16);
        assert!(none.is_empty());

        let all = for_limits(
            &Limits {
                memory_bytes: Some(1),
                cpus: Some(1.0),
                disk_read_bps: Some(1),
                disk_write_bps: Some(1),
            },
            8,
            16,
        );
        let names: Vec<&str> = all.iter().map(|c| c.name()).collect();
        assert_eq!(names, vec![MEMORY, CPU, IO, IO]);
    }
}
