//! Runtime configuration.

use std::path::PathBuf;

use skiff_common::SkiffPaths;
use skiff_network::portmap::DEFAULT_BIND_HOST;

/// Parent of every container cgroup inside each hierarchy.
pub const DEFAULT_CGROUP_PARENT: &str = "skiff";

/// Where cgroup mount points are discovered.
pub const DEFAULT_MOUNTINFO: &str = "/proc/self/mountinfo";

/// Runtime configuration options.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Paths for runtime data.
    pub paths: SkiffPaths,
    /// Cgroup directory containers are placed under, relative to each
    /// hierarchy's mount point.
    pub cgroup_parent: String,
    /// Mount table scanned for cgroup hierarchies.
    pub mountinfo: PathBuf,
    /// Address the port proxy listens on.
    pub proxy_bind_host: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            paths: SkiffPaths::new(),
            cgroup_parent: DEFAULT_CGROUP_PARENT.to_string(),
            mountinfo: PathBuf::from(DEFAULT_MOUNTINFO),
            proxy_bind_host: DEFAULT_BIND_HOST.to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Set the root directory.
    #[must_use]
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.paths = SkiffPaths::with_root(root);
        self
    }

    /// Set the cgroup parent directory.
    #[must_use]
    pub fn with_cgroup_parent(mut self, parent: impl Into<String>) -> Self {
        self.cgroup_parent = parent.into();
        self
    }

    /// Read cgroup mount points from `path` instead of the live mount table.
    #[must_use]
    pub fn with_mountinfo(mut self, path: impl Into<PathBuf>) -> Self {
        self.mountinfo = path.into();
        self
    }

    /// Set the proxy listen address.
    #[must_use]
    pub fn with_proxy_bind_host(mut self, host: impl Into<String>) -> Self {
        self.proxy_bind_host = host.into();
        self
    }

    /// Cgroup path of a container, relative to a hierarchy root.
    #[must_use]
    pub fn cgroup_path(&self, container_id: &str) -> String {
        format!("{}/{container_id}", self.cgroup_parent)
    }
}
