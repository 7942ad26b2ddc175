//! Container metadata.

use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use skiff_common::{ContainerId, SkiffPaths};

use crate::filesystem::VolumeInfo;
use crate::image::TIME_FORMAT;

/// Lifecycle status of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Init is (believed to be) alive.
    Running,
    /// Stopped through `skiff stop`.
    Stopped,
    /// Init exited on its own.
    Exited,
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Exited => "exited",
        })
    }
}

/// Where a container is attached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkAttachment {
    /// Network name.
    pub network: String,
    /// Address assigned to the container.
    pub ip: Ipv4Addr,
    /// Published mappings, `hostPort:ip:containerPort`.
    pub port_mappings: Vec<String>,
}

/// Persisted record of one container (`containers/<id>/config.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerInfo {
    /// Container id.
    pub id: ContainerId,
    /// Unique name; the id when none was given.
    pub name: String,
    /// Host pid of init while running.
    pub pid: Option<u32>,
    /// Current status.
    pub status: ContainerStatus,
    /// Resolved command line.
    pub command: String,
    /// Creation time.
    #[serde(rename = "create_time")]
    pub create_time: String,
    /// Private directory holding `upper/`, `work/` and `merged/`.
    pub base_url: PathBuf,
    /// Mounted volumes, in mount order.
    #[serde(rename = "volume", default)]
    pub volumes: Vec<VolumeInfo>,
    /// Requested `hostPort:containerPort` mappings.
    #[serde(default)]
    pub port_mapping: Vec<String>,
    /// Image id.
    pub image: String,
    /// Whether a cgroup was created.
    #[serde(default)]
    pub set_cgroup: bool,
    /// Network attachment, when connected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkAttachment>,
}

impl ContainerInfo {
    /// Fresh record for a container about to start.
    #[must_use]
    pub fn new(id: ContainerId, name: Option<String>, image: &str, paths: &SkiffPaths) -> Self {
        let base_url = paths.container(id.as_str());
        Self {
            name: name.unwrap_or_else(|| id.to_string()),
            id,
            pid: None,
            status: ContainerStatus::Running,
            command: String::new(),
            create_time: chrono::Local::now().format(TIME_FORMAT).to_string(),
            base_url,
            volumes: Vec::new(),
            port_mapping: Vec::new(),
            image: image.to_string(),
            set_cgroup: false,
            network: None,
        }
    }

    /// `merged/` under the base directory.
    #[must_use]
    pub fn merged_dir(&self) -> PathBuf {
        self.base_url.join("merged")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&ContainerStatus::Stopped).unwrap(),
            "\"stopped\""
        );
        assert_eq!(ContainerStatus::Exited.to_string(), "exited");
    }

    #[test]
    fn new_defaults_name_to_id() {
        let paths = SkiffPaths::with_root("/r");
        let id = ContainerId::new("abc123").unwrap();
        let info = ContainerInfo::new(id, None, "base", &paths);
        assert_eq!(info.name, "abc123");
        assert_eq!(info.base_url, PathBuf::from("/r/containers/abc123"));
        assert_eq!(info.merged_dir(), PathBuf::from("/r/containers/abc123/merged"));
        assert_eq!(info.status, ContainerStatus::Running);
    }

    #[test]
    fn record_keys() {
        let paths = SkiffPaths::with_root("/r");
        let id = ContainerId::new("abc123").unwrap();
        let json = serde_json::to_value(ContainerInfo::new(id, Some("web".into()), "base", &paths))
            .unwrap();
        for key in ["id", "name", "pid", "status", "create_time", "baseUrl", "volume", "setCgroup"] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
        assert!(json.get("network").is_none());
    }
}
