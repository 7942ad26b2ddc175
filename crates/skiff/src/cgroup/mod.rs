//! Cgroup v1 resource enforcement.
//!
//! A [`CgroupManager`] owns one relative cgroup path (`skiff/<id>`) and fans
//! every operation out to its subsystems. Each subsystem resolves its own
//! hierarchy from the mount table, so a host missing one controller still
//! gets the others. Results are collected per subsystem in a
//! [`CgroupOutcome`] instead of stopping at the first failure.

mod mountinfo;
mod subsystem;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use skiff_common::{SkiffError, SkiffResult};

pub use mountinfo::find_mount_point;
pub use subsystem::{
    CpuSubsystem, CpusetSubsystem, MemorySubsystem, Subsystem, default_subsystems,
};

use crate::runtime::config::DEFAULT_MOUNTINFO;

/// Requested limits. `None` or an empty string means no limit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceConfig {
    /// `memory.limit_in_bytes`, e.g. `100m` or `104857600`.
    pub memory_limit: Option<String>,
    /// `cpu.shares`.
    pub cpu_share: Option<String>,
    /// `cpuset.cpus`, e.g. `0-1`.
    pub cpuset: Option<String>,
}

impl ResourceConfig {
    /// Whether any limit was requested.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        [&self.memory_limit, &self.cpu_share, &self.cpuset]
            .into_iter()
            .all(|v| v.as_deref().is_none_or(|v| v.trim().is_empty()))
    }
}

/// Per-subsystem results of one fan-out.
#[derive(Debug, Default)]
pub struct CgroupOutcome {
    results: Vec<(&'static str, Option<SkiffError>)>,
}

impl CgroupOutcome {
    fn record(&mut self, subsystem: &'static str, result: SkiffResult<()>) {
        if let Err(e) = &result {
            tracing::warn!(subsystem, error = %e, "Cgroup operation failed");
        }
        self.results.push((subsystem, result.err()));
    }

    /// Whether every subsystem succeeded.
    #[must_use]
    pub fn is_fully_applied(&self) -> bool {
        self.results.iter().all(|(_, err)| err.is_none())
    }

    /// Subsystems that succeeded.
    pub fn applied(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.results
            .iter()
            .filter(|(_, err)| err.is_none())
            .map(|(name, _)| *name)
    }

    /// Subsystems that failed, with their errors.
    pub fn failures(&self) -> impl Iterator<Item = (&'static str, &SkiffError)> {
        self.results
            .iter()
            .filter_map(|(name, err)| err.as_ref().map(|e| (*name, e)))
    }

    /// `Ok` when fully applied, otherwise one error naming every failure.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Setup`] listing the failed subsystems.
    pub fn into_result(self) -> SkiffResult<()> {
        if self.is_fully_applied() {
            return Ok(());
        }
        let message = self
            .failures()
            .map(|(name, e)| format!("{name}: {e}"))
            .collect::<Vec<_>>()
            .join("; ");
        Err(SkiffError::setup("cgroup", message))
    }
}

/// Cgroup of one container across all managed subsystems.
pub struct CgroupManager {
    path: PathBuf,
    mountinfo: PathBuf,
    subsystems: Vec<Box<dyn Subsystem>>,
}

impl std::fmt::Debug for CgroupManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CgroupManager")
            .field("path", &self.path)
            .field("mountinfo", &self.mountinfo)
            .field(
                "subsystems",
                &self.subsystems.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl CgroupManager {
    /// Manager for `path` (relative to each hierarchy root) over the cpu,
    /// cpuset and memory controllers.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            mountinfo: PathBuf::from(DEFAULT_MOUNTINFO),
            subsystems: default_subsystems(),
        }
    }

    /// Discover hierarchies from `mountinfo` instead of the live table.
    #[must_use]
    pub fn with_mountinfo(mut self, mountinfo: impl Into<PathBuf>) -> Self {
        self.mountinfo = mountinfo.into();
        self
    }

    /// Relative cgroup path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the cgroup in every hierarchy and write the requested limits.
    pub fn set(&self, resources: &ResourceConfig) -> CgroupOutcome {
        tracing::debug!(path = %self.path.display(), ?resources, "Setting cgroup limits");
        self.fan_out(|subsystem, dir| subsystem.set(dir, resources))
    }

    /// Add `pid` to the cgroup in every hierarchy.
    pub fn apply(&self, pid: u32) -> CgroupOutcome {
        tracing::debug!(path = %self.path.display(), pid, "Adding process to cgroup");
        self.fan_out(|subsystem, dir| subsystem.apply(dir, pid))
    }

    /// Delete the cgroup from every hierarchy.
    pub fn remove(&self) -> CgroupOutcome {
        tracing::debug!(path = %self.path.display(), "Removing cgroup");
        self.fan_out(|subsystem, dir| subsystem.remove(dir))
    }

    /// Directory of the cgroup inside `subsystem`'s hierarchy.
    ///
    /// # Errors
    ///
    /// Returns an error if the hierarchy is not mounted.
    pub fn subsystem_dir(&self, subsystem: &str) -> SkiffResult<PathBuf> {
        let mount = find_mount_point(&self.mountinfo, subsystem)?;
        Ok(mount.join(&self.path))
    }

    fn fan_out<F>(&self, op: F) -> CgroupOutcome
    where
        F: Fn(&dyn Subsystem, &Path) -> SkiffResult<()>,
    {
        let mut outcome = CgroupOutcome::default();
        for subsystem in &self.subsystems {
            let result = self
                .subsystem_dir(subsystem.name())
                .and_then(|dir| op(subsystem.as_ref(), &dir));
            outcome.record(subsystem.name(), result);
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    /// A fake mount table pointing every controller into `root`.
    fn fake_hierarchies(root: &Path, subsystems: &[&str]) -> PathBuf {
        let mut table = String::new();
        for (i, name) in subsystems.iter().enumerate() {
            let mount = root.join(name);
            fs::create_dir_all(&mount).unwrap();
            table.push_str(&format!(
                "{} 30 0:{} / {} rw,nosuid shared:{} - cgroup cgroup rw,{}\n",
                40 + i,
                60 + i,
                mount.display(),
                i,
                name
            ));
        }
        if subsystems.contains(&"cpuset") {
            fs::write(root.join("cpuset/cpuset.cpus"), "0").unwrap();
            fs::write(root.join("cpuset/cpuset.mems"), "0").unwrap();
        }
        let path = root.join("mountinfo");
        fs::write(&path, table).unwrap();
        path
    }

    #[test]
    fn memory_limit_and_tasks() {
        let root = tempfile::tempdir().unwrap();
        let mountinfo = fake_hierarchies(root.path(), &["cpu", "cpuset", "memory"]);
        let manager = CgroupManager::new("skiff/abc").with_mountinfo(&mountinfo);

        let resources = ResourceConfig {
            memory_limit: Some("104857600".into()),
            ..ResourceConfig::default()
        };
        assert!(manager.set(&resources).is_fully_applied());
        assert!(manager.apply(4242).is_fully_applied());

        let memory = root.path().join("memory/skiff/abc");
        assert_eq!(
            fs::read_to_string(memory.join("memory.limit_in_bytes")).unwrap(),
            "104857600"
        );
        assert_eq!(fs::read_to_string(memory.join("tasks")).unwrap(), "4242");
        assert_eq!(
            fs::read_to_string(root.path().join("cpu/skiff/abc/tasks")).unwrap(),
            "4242"
        );
    }

    #[test]
    fn missing_hierarchy_is_partial() {
        let root = tempfile::tempdir().unwrap();
        let mountinfo = fake_hierarchies(root.path(), &["memory"]);
        let manager = CgroupManager::new("skiff/abc").with_mountinfo(&mountinfo);

        let outcome = manager.set(&ResourceConfig {
            memory_limit: Some("1m".into()),
            ..ResourceConfig::default()
        });
        assert!(!outcome.is_fully_applied());
        assert_eq!(outcome.applied().collect::<Vec<_>>(), vec!["memory"]);
        let failed: Vec<_> = outcome.failures().map(|(name, _)| name).collect();
        assert_eq!(failed, vec!["cpu", "cpuset"]);
        assert!(root.path().join("memory/skiff/abc/memory.limit_in_bytes").exists());

        let err = outcome.into_result().unwrap_err();
        assert!(err.to_string().contains("cpu:"));
    }

    #[test]
    fn resource_config_emptiness() {
        assert!(ResourceConfig::default().is_empty());
        assert!(
            ResourceConfig {
                cpu_share: Some("  ".into()),
                ..ResourceConfig::default()
            }
            .is_empty()
        );
        assert!(
            !ResourceConfig {
                cpuset: Some("0".into()),
                ..ResourceConfig::default()
            }
            .is_empty()
        );
    }
}
