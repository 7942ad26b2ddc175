//! Container record persistence.

use std::fs;
use std::path::PathBuf;

use skiff_common::{SkiffError, SkiffPaths, SkiffResult};

use super::container::ContainerInfo;

/// Reads and writes `containers/<id>/config.json`.
#[derive(Debug, Clone)]
pub struct ContainerStore {
    paths: SkiffPaths,
}

impl ContainerStore {
    /// Create a store rooted at `paths`.
    #[must_use]
    pub fn new(paths: SkiffPaths) -> Self {
        Self { paths }
    }

    /// Path of a container's record.
    #[must_use]
    pub fn config_path(&self, id: &str) -> PathBuf {
        self.paths.container_config(id)
    }

    /// Save a container record.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be written.
    pub fn save(&self, info: &ContainerInfo) -> SkiffResult<()> {
        let path = self.config_path(info.id.as_str());
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(info)?;
        fs::write(&path, json)?;

        tracing::debug!(
            container_id = %info.id,
            status = %info.status,
            path = %path.display(),
            "Saved container record"
        );
        Ok(())
    }

    /// Load a container record by exact id.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::ContainerNotFound`] if there is no record.
    pub fn load(&self, id: &str) -> SkiffResult<ContainerInfo> {
        let path = self.config_path(id);
        if !path.exists() {
            return Err(SkiffError::ContainerNotFound {
                reference: id.to_string(),
            });
        }

        let json = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Delete a container's directory and everything in it.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory exists but cannot be removed.
    pub fn delete(&self, id: &str) -> SkiffResult<()> {
        let dir = self.paths.container(id);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
            tracing::debug!(container_id = %id, path = %dir.display(), "Deleted container directory");
        }
        Ok(())
    }

    /// Every readable record, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the containers directory cannot be read.
    pub fn list(&self) -> SkiffResult<Vec<ContainerInfo>> {
        let dir = self.paths.containers();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut containers = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().into_owned();
            if !self.config_path(&id).exists() {
                continue;
            }
            match self.load(&id) {
                Ok(info) => containers.push(info),
                Err(e) => tracing::warn!(container_id = %id, error = %e, "Skipping unreadable record"),
            }
        }

        containers.sort_by(|a, b| {
            a.create_time
                .cmp(&b.create_time)
                .then_with(|| a.id.as_str().cmp(b.id.as_str()))
        });
        Ok(containers)
    }

    /// Whether some container already uses `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the records cannot be listed.
    pub fn name_in_use(&self, name: &str) -> SkiffResult<bool> {
        Ok(self.list()?.iter().any(|info| info.name == name))
    }

    /// Find a container by exact name, then (unless `just_name`) by id
    /// prefix.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::ContainerNotFound`] when nothing matches and
    /// [`SkiffError::AmbiguousReference`] when several containers do.
    pub fn resolve(&self, reference: &str, just_name: bool) -> SkiffResult<ContainerInfo> {
        let containers = self.list()?;

        let by_name: Vec<_> = containers.iter().filter(|c| c.name == reference).collect();
        let matched = if !by_name.is_empty() || just_name {
            by_name
        } else {
            containers
                .iter()
                .filter(|c| !reference.is_empty() && c.id.as_str().starts_with(reference))
                .collect()
        };

        match matched.as_slice() {
            [info] => Ok((*info).clone()),
            [] => Err(SkiffError::ContainerNotFound {
                reference: reference.to_string(),
            }),
            many => Err(SkiffError::AmbiguousReference {
                kind: "container",
                reference: reference.to_string(),
                count: many.len(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use skiff_common::ContainerId;
    use tempfile::tempdir;

    use super::*;
    use crate::runtime::container::ContainerStatus;

    fn info(paths: &SkiffPaths, id: &str, name: Option<&str>) -> ContainerInfo {
        ContainerInfo::new(
            ContainerId::new(id).unwrap(),
            name.map(String::from),
            "base",
            paths,
        )
    }

    #[test]
    fn save_and_load() {
        let temp = tempdir().unwrap();
        let paths = SkiffPaths::with_root(temp.path());
        let store = ContainerStore::new(paths.clone());

        let mut record = info(&paths, "abc123", Some("web"));
        record.pid = Some(42);
        store.save(&record).unwrap();

        let loaded = store.load("abc123").unwrap();
        assert_eq!(loaded, record);
        assert!(matches!(
            store.load("nope"),
            Err(SkiffError::ContainerNotFound { .. })
        ));
    }

    #[test]
    fn resolve_name_before_prefix() {
        let temp = tempdir().unwrap();
        let paths = SkiffPaths::with_root(temp.path());
        let store = ContainerStore::new(paths.clone());

        store.save(&info(&paths, "aaa111", Some("web"))).unwrap();
        store.save(&info(&paths, "aaa222", Some("db"))).unwrap();
        store.save(&info(&paths, "bbb333", Some("aaa"))).unwrap();

        assert_eq!(store.resolve("web", false).unwrap().id.as_str(), "aaa111");
        // "aaa" is a name before it is a prefix.
        assert_eq!(store.resolve("aaa", false).unwrap().id.as_str(), "bbb333");
        assert_eq!(store.resolve("aaa2", false).unwrap().id.as_str(), "aaa222");
        assert!(matches!(
            store.resolve("aaa2", true),
            Err(SkiffError::ContainerNotFound { .. })
        ));
        assert!(matches!(
            store.resolve("b", false),
            Ok(ref c) if c.id.as_str() == "bbb333"
        ));
    }

    #[test]
    fn duplicate_names_are_ambiguous() {
        let temp = tempdir().unwrap();
        let paths = SkiffPaths::with_root(temp.path());
        let store = ContainerStore::new(paths.clone());

        store.save(&info(&paths, "aaa111", Some("twin"))).unwrap();
        store.save(&info(&paths, "aaa222", Some("twin"))).unwrap();

        assert!(matches!(
            store.resolve("twin", true),
            Err(SkiffError::AmbiguousReference { count: 2, .. })
        ));
        assert!(matches!(
            store.resolve("aaa", false),
            Err(SkiffError::AmbiguousReference { .. })
        ));
        assert!(store.name_in_use("twin").unwrap());
        assert!(!store.name_in_use("solo").unwrap());
    }

    #[test]
    fn list_and_delete() {
        let temp = tempdir().unwrap();
        let paths = SkiffPaths::with_root(temp.path());
        let store = ContainerStore::new(paths.clone());

        let mut stopped = info(&paths, "c1", None);
        stopped.status = ContainerStatus::Stopped;
        store.save(&stopped).unwrap();
        store.save(&info(&paths, "c2", None)).unwrap();
        std::fs::create_dir_all(paths.container("no-record")).unwrap();

        assert_eq!(store.list().unwrap().len(), 2);
        store.delete("c1").unwrap();
        assert!(!paths.container("c1").exists());
        assert_eq!(store.list().unwrap().len(), 1);
        store.delete("c1").unwrap();
    }
}
