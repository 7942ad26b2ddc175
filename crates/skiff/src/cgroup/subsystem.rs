//! Cgroup v1 subsystems.

use std::fs;
use std::io;
use std::path::Path;

use skiff_common::{SkiffError, SkiffResult};

use super::ResourceConfig;

/// One cgroup v1 controller.
///
/// Every method receives the container's directory inside the controller's
/// hierarchy.
pub trait Subsystem: Send + Sync {
    /// Controller name as it appears in the mount options.
    fn name(&self) -> &'static str;

    /// Create `dir` and write the limits this controller owns.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or a limit file cannot be written.
    fn set(&self, dir: &Path, resources: &ResourceConfig) -> SkiffResult<()>;

    /// Move `pid` into the cgroup.
    ///
    /// # Errors
    ///
    /// Returns an error if `tasks` cannot be written.
    fn apply(&self, dir: &Path, pid: u32) -> SkiffResult<()> {
        write_file(dir, "tasks", &pid.to_string())
    }

    /// Delete the cgroup directory; a missing directory is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory exists but cannot be removed.
    fn remove(&self, dir: &Path) -> SkiffResult<()> {
        match fs::remove_dir(dir) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => {
                Err(SkiffError::from_io(e, format!("remove cgroup {}", dir.display())))
            }
            _ => Ok(()),
        }
    }
}

/// `cpu` controller: relative CPU weight.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpuSubsystem;

impl Subsystem for CpuSubsystem {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn set(&self, dir: &Path, resources: &ResourceConfig) -> SkiffResult<()> {
        create_dir(dir)?;
        if let Some(shares) = requested(resources.cpu_share.as_deref()) {
            write_file(dir, "cpu.shares", shares)?;
        }
        Ok(())
    }
}

/// `cpuset` controller: CPUs the container may run on.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpusetSubsystem;

impl Subsystem for CpusetSubsystem {
    fn name(&self) -> &'static str {
        "cpuset"
    }

    fn set(&self, dir: &Path, resources: &ResourceConfig) -> SkiffResult<()> {
        create_dir(dir)?;
        // A cpuset with empty cpus or mems rejects every task.
        inherit(dir, "cpuset.cpus")?;
        inherit(dir, "cpuset.mems")?;
        if let Some(cpus) = requested(resources.cpuset.as_deref()) {
            write_file(dir, "cpuset.cpus", cpus)?;
        }
        Ok(())
    }
}

/// `memory` controller: hard memory limit.
#[derive(Debug, Default, Clone, Copy)]
pub struct MemorySubsystem;

impl Subsystem for MemorySubsystem {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn set(&self, dir: &Path, resources: &ResourceConfig) -> SkiffResult<()> {
        create_dir(dir)?;
        if let Some(limit) = requested(resources.memory_limit.as_deref()) {
            write_file(dir, "memory.limit_in_bytes", limit)?;
        }
        Ok(())
    }

    fn remove(&self, dir: &Path) -> SkiffResult<()> {
        if !dir.exists() {
            return Ok(());
        }
        fs::remove_dir(dir)
            .map_err(|e| SkiffError::from_io(e, format!("remove cgroup {}", dir.display())))
    }
}

/// The controllers skiff manages, in fan-out order.
#[must_use]
pub fn default_subsystems() -> Vec<Box<dyn Subsystem>> {
    vec![
        Box::new(CpuSubsystem),
        Box::new(CpusetSubsystem),
        Box::new(MemorySubsystem),
    ]
}

fn requested(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn create_dir(dir: &Path) -> SkiffResult<()> {
    fs::create_dir_all(dir)
        .map_err(|e| SkiffError::from_io(e, format!("create cgroup {}", dir.display())))
}

fn write_file(dir: &Path, file: &str, value: &str) -> SkiffResult<()> {
    let path = dir.join(file);
    tracing::debug!(path = %path.display(), value, "Writing cgroup file");
    fs::write(&path, value)
        .map_err(|e| SkiffError::from_io(e, format!("write {}", path.display())))
}

/// Copy `file` from the nearest ancestor that has a value when it is empty
/// here, filling every directory in between on the way down.
fn inherit(dir: &Path, file: &str) -> SkiffResult<()> {
    if !read_value(dir, file).is_empty() {
        return Ok(());
    }
    let Some(parent) = dir.parent() else {
        return Ok(());
    };
    inherit(parent, file)?;

    let value = read_value(parent, file);
    if !value.is_empty() {
        write_file(dir, file, &value)?;
    }
    Ok(())
}

fn read_value(dir: &Path, file: &str) -> String {
    fs::read_to_string(dir.join(file))
        .map(|v| v.trim().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_fields_write_nothing() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("skiff/abc");
        let resources = ResourceConfig {
            memory_limit: Some(String::new()),
            ..ResourceConfig::default()
        };

        MemorySubsystem.set(&dir, &resources).unwrap();
        CpuSubsystem.set(&dir, &resources).unwrap();

        assert!(dir.is_dir());
        assert!(!dir.join("memory.limit_in_bytes").exists());
        assert!(!dir.join("cpu.shares").exists());
    }

    #[test]
    fn cpuset_seeds_from_ancestors() {
        let root = tempfile::tempdir().unwrap();
        fs::write(root.path().join("cpuset.cpus"), "0-3\n").unwrap();
        fs::write(root.path().join("cpuset.mems"), "0\n").unwrap();
        let dir = root.path().join("skiff/abc");

        CpusetSubsystem
            .set(&dir, &ResourceConfig::default())
            .unwrap();

        assert_eq!(read_value(&root.path().join("skiff"), "cpuset.cpus"), "0-3");
        assert_eq!(read_value(&dir, "cpuset.cpus"), "0-3");
        assert_eq!(read_value(&dir, "cpuset.mems"), "0");
    }

    #[test]
    fn cpuset_request_overrides_inherited() {
        let root = tempfile::tempdir().unwrap();
        fs::write(root.path().join("cpuset.cpus"), "0-3").unwrap();
        fs::write(root.path().join("cpuset.mems"), "0").unwrap();
        let dir = root.path().join("skiff/abc");
        let resources = ResourceConfig {
            cpuset: Some("1".into()),
            ..ResourceConfig::default()
        };

        CpusetSubsystem.set(&dir, &resources).unwrap();
        assert_eq!(read_value(&dir, "cpuset.cpus"), "1");
    }

    #[test]
    fn remove_tolerates_missing_dirs() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("gone");
        for subsystem in default_subsystems() {
            subsystem.remove(&dir).unwrap();
        }
    }
}
