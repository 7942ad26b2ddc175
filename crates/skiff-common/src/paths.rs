//! Standard filesystem paths for skiff.

use std::path::PathBuf;

use once_cell::sync::Lazy;

/// Default runtime root directory.
pub static SKIFF_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("SKIFF_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/run/skiff"))
});

/// Name of a container's metadata file.
pub const CONTAINER_CONFIG: &str = "config.json";

/// Name of a detached container's log file.
pub const CONTAINER_LOG: &str = "container.log";

/// Paths used by the skiff runtime, all derived from one root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkiffPaths {
    /// Root directory (default: /var/run/skiff).
    pub root: PathBuf,
}

impl SkiffPaths {
    /// Create paths with the default root.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths with a custom root directory.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory for container data.
    #[must_use]
    pub fn containers(&self) -> PathBuf {
        self.root.join("containers")
    }

    /// Private directory of one container (its base URL).
    #[must_use]
    pub fn container(&self, id: &str) -> PathBuf {
        self.containers().join(id)
    }

    /// Container metadata file.
    #[must_use]
    pub fn container_config(&self, id: &str) -> PathBuf {
        self.container(id).join(CONTAINER_CONFIG)
    }

    /// Container log file.
    #[must_use]
    pub fn container_log(&self, id: &str) -> PathBuf {
        self.container(id).join(CONTAINER_LOG)
    }

    /// Directory for images.
    #[must_use]
    pub fn images(&self) -> PathBuf {
        self.root.join("images")
    }

    /// Directory of one image.
    #[must_use]
    pub fn image(&self, id: &str) -> PathBuf {
        self.images().join(id)
    }

    /// Image manifest file.
    #[must_use]
    pub fn image_config(&self, id: &str) -> PathBuf {
        self.image(id).join("config.json")
    }

    /// Read-only layer contents of an image.
    #[must_use]
    pub fn image_layer(&self, id: &str) -> PathBuf {
        self.image(id).join("layer")
    }

    /// Volumes directory.
    #[must_use]
    pub fn volumes(&self) -> PathBuf {
        self.root.join("volumes")
    }

    /// Host-side storage of one anonymous volume.
    #[must_use]
    pub fn volume(&self, id: &str) -> PathBuf {
        self.volumes().join(id)
    }

    /// Directory of persisted network records.
    #[must_use]
    pub fn networks(&self) -> PathBuf {
        self.root.join("network").join("network")
    }

    /// Persisted record of one network.
    #[must_use]
    pub fn network(&self, name: &str) -> PathBuf {
        self.networks().join(name)
    }

    /// IPAM state directory.
    #[must_use]
    pub fn ipam(&self) -> PathBuf {
        self.root.join("network").join("ipam")
    }

    /// Subnet allocation table.
    #[must_use]
    pub fn ipam_table(&self) -> PathBuf {
        self.ipam().join("subnet.json")
    }

    /// Create all necessary directories.
    ///
    /// # Errors
    ///
    /// Returns an error if directory creation fails.
    pub fn create_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.containers())?;
        std::fs::create_dir_all(self.images())?;
        std::fs::create_dir_all(self.volumes())?;
        std::fs::create_dir_all(self.networks())?;
        std::fs::create_dir_all(self.ipam())?;
        Ok(())
    }
}

impl Default for SkiffPaths {
    fn default() -> Self {
        Self {
            root: SKIFF_ROOT.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_root() {
        let paths = SkiffPaths::with_root("/tmp/skiff-test");
        assert_eq!(
            paths.containers(),
            PathBuf::from("/tmp/skiff-test/containers")
        );
        assert_eq!(
            paths.container_log("abc"),
            PathBuf::from("/tmp/skiff-test/containers/abc/container.log")
        );
    }

    #[test]
    fn image_paths() {
        let paths = SkiffPaths::with_root("/r");
        assert_eq!(paths.image_config("base"), PathBuf::from("/r/images/base/config.json"));
        assert_eq!(paths.image_layer("base"), PathBuf::from("/r/images/base/layer"));
    }

    #[test]
    fn network_paths() {
        let paths = SkiffPaths::with_root("/r");
        assert_eq!(paths.network("br0"), PathBuf::from("/r/network/network/br0"));
        assert_eq!(paths.ipam_table(), PathBuf::from("/r/network/ipam/subnet.json"));
    }

    #[test]
    fn create_dirs_builds_layout() {
        let temp = tempfile::tempdir().unwrap();
        let paths = SkiffPaths::with_root(temp.path());
        paths.create_dirs().unwrap();
        assert!(paths.containers().is_dir());
        assert!(paths.volumes().is_dir());
        assert!(paths.ipam().is_dir());
    }
}
