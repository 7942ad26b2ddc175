//! Bind-mounted container volumes.

use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use skiff_common::{SkiffError, SkiffResult};

use super::mounts::Mounter;

/// One mounted volume, as recorded in the container record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeInfo {
    /// Directory on the host.
    pub host_volume_path: PathBuf,
    /// Path inside the container.
    pub container_path: PathBuf,
    /// The container path as seen from the host, under `merged/`.
    pub container_path_in_host: PathBuf,
    /// Whether the volume was created for an image-declared path.
    pub anonymous: bool,
}

/// A parsed `host:container` spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeSpec {
    /// Host directory.
    pub host: PathBuf,
    /// Container directory.
    pub container: PathBuf,
}

impl VolumeSpec {
    /// Parse `host:container`.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::InvalidVolume`] unless the spec has exactly two
    /// non-empty parts, neither containing `..`.
    pub fn parse(spec: &str) -> SkiffResult<Self> {
        let invalid = || SkiffError::InvalidVolume {
            spec: spec.to_string(),
        };

        let parts: Vec<&str> = spec.split(':').collect();
        let [host, container] = parts.as_slice() else {
            return Err(invalid());
        };
        if host.is_empty() || container.is_empty() {
            return Err(invalid());
        }

        let (host, container) = (PathBuf::from(host), PathBuf::from(container));
        if escapes(&host) || escapes(&container) {
            return Err(invalid());
        }
        Ok(Self { host, container })
    }
}

fn escapes(path: &Path) -> bool {
    path.components().any(|c| c == Component::ParentDir)
}

/// `container` resolved under `merged`.
#[must_use]
pub fn path_in_merged(merged: &Path, container: &Path) -> PathBuf {
    merged.join(container.strip_prefix("/").unwrap_or(container))
}

/// Bind `host` onto `container` inside `merged`, creating both ends.
///
/// # Errors
///
/// Returns an error if a directory cannot be created or the mount fails.
pub fn mount_volume(
    mounter: &dyn Mounter,
    host: &Path,
    container: &Path,
    merged: &Path,
    anonymous: bool,
) -> SkiffResult<VolumeInfo> {
    let target = path_in_merged(merged, container);

    fs::create_dir_all(host)
        .map_err(|e| SkiffError::from_io(e, format!("create {}", host.display())))?;
    fs::create_dir_all(&target)
        .map_err(|e| SkiffError::from_io(e, format!("create {}", target.display())))?;

    mounter.bind(host, &target)?;

    tracing::debug!(
        host = %host.display(),
        target = %target.display(),
        anonymous,
        "Volume mounted"
    );

    Ok(VolumeInfo {
        host_volume_path: host.to_path_buf(),
        container_path: container.to_path_buf(),
        container_path_in_host: target,
        anonymous,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesystem::mounts::testing::RecordingMounter;
    use proptest::prelude::*;

    #[test]
    fn parse_specs() {
        let spec = VolumeSpec::parse("/data:/var/lib/data").unwrap();
        assert_eq!(spec.host, PathBuf::from("/data"));
        assert_eq!(spec.container, PathBuf::from("/var/lib/data"));

        for bad in ["/data", "/a:/b:/c", ":/b", "/a:", "/a/../etc:/b", "/a:/b/.."] {
            assert!(
                matches!(VolumeSpec::parse(bad), Err(SkiffError::InvalidVolume { .. })),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn container_paths_stay_under_merged() {
        assert_eq!(
            path_in_merged(Path::new("/m"), Path::new("/etc/app")),
            PathBuf::from("/m/etc/app")
        );
        assert_eq!(
            path_in_merged(Path::new("/m"), Path::new("data")),
            PathBuf::from("/m/data")
        );
    }

    #[test]
    fn mount_creates_both_ends() {
        let dir = tempfile::tempdir().unwrap();
        let host = dir.path().join("host");
        let merged = dir.path().join("merged");
        let mounter = RecordingMounter::default();

        let info = mount_volume(&mounter, &host, Path::new("/data"), &merged, false).unwrap();

        assert!(host.is_dir());
        assert!(merged.join("data").is_dir());
        assert_eq!(info.container_path_in_host, merged.join("data"));
        assert_eq!(*mounter.mounted.borrow(), vec![merged.join("data")]);
    }

    #[test]
    fn record_keys() {
        let info = VolumeInfo {
            host_volume_path: "/h".into(),
            container_path: "/c".into(),
            container_path_in_host: "/m/c".into(),
            anonymous: true,
        };
        let json = serde_json::to_value(info).unwrap();
        assert_eq!(json["hostVolumePath"], "/h");
        assert_eq!(json["containerPathInHost"], "/m/c");
        assert_eq!(json["anonymous"], true);
    }

    proptest! {
        #[test]
        fn parsed_volumes_stay_under_merged(
            host in "(/[a-z0-9_]{1,8}){1,4}",
            container in "(/[a-z0-9_]{1,8}){1,4}",
        ) {
            let spec = VolumeSpec::parse(&format!("{host}:{container}")).unwrap();
            let merged = Path::new("/m/merged");
            let resolved = path_in_merged(merged, &spec.container);
            prop_assert!(resolved.starts_with(merged));
            prop_assert!(resolved.ends_with(container.trim_start_matches('/')));
        }
    }
}
