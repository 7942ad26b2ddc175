//! Container root filesystem assembly.

use std::path::PathBuf;

use skiff_common::{SkiffPaths, SkiffResult, volume_id};

use super::mounts::{HostMounter, Mounter};
use super::overlay::OverlayFs;
use super::volume::{VolumeSpec, mount_volume};
use crate::image::{ImageInfo, ImageStore};
use crate::runtime::container::ContainerInfo;

/// Builds and tears down the merged root of a container.
#[derive(Debug)]
pub struct Workspace<M: Mounter = HostMounter> {
    paths: SkiffPaths,
    mounter: M,
}

impl Workspace {
    /// Workspace performing real mounts.
    #[must_use]
    pub fn new(paths: SkiffPaths) -> Self {
        Self::with_mounter(paths, HostMounter)
    }
}

impl<M: Mounter> Workspace<M> {
    /// Workspace using `mounter` for every mount.
    #[must_use]
    pub fn with_mounter(paths: SkiffPaths, mounter: M) -> Self {
        Self { paths, mounter }
    }

    /// The mounter in use.
    #[must_use]
    pub fn mounter(&self) -> &M {
        &self.mounter
    }

    /// Mount the overlay for `image` under `info.base_url`, then the user
    /// volumes and the image's anonymous volumes. Every mount is recorded
    /// in `info.volumes`. On failure everything mounted so far is undone.
    ///
    /// # Errors
    ///
    /// Returns an error if a spec is malformed, the layer chain cannot be
    /// resolved, or a mount fails.
    pub fn create(
        &self,
        info: &mut ContainerInfo,
        volume_specs: &[String],
        images: &ImageStore,
        image: &ImageInfo,
    ) -> SkiffResult<PathBuf> {
        let specs = volume_specs
            .iter()
            .map(|spec| VolumeSpec::parse(spec))
            .collect::<SkiffResult<Vec<_>>>()?;

        let overlay = OverlayFs::for_container(&info.base_url, images.layer_chain(image)?);
        overlay.mount(&self.mounter)?;
        let merged = overlay.merged_dir.clone();

        if let Err(e) = self.mount_volumes(info, &specs, image, &merged) {
            tracing::warn!(container_id = %info.id, error = %e, "Volume setup failed, rolling back");
            if let Err(cleanup) = self.delete(info) {
                tracing::warn!(container_id = %info.id, error = %cleanup, "Rollback incomplete");
            }
            return Err(e);
        }

        tracing::info!(
            container_id = %info.id,
            merged = %merged.display(),
            volumes = info.volumes.len(),
            "Workspace ready"
        );
        Ok(merged)
    }

    fn mount_volumes(
        &self,
        info: &mut ContainerInfo,
        specs: &[VolumeSpec],
        image: &ImageInfo,
        merged: &std::path::Path,
    ) -> SkiffResult<()> {
        for spec in specs {
            let volume = mount_volume(&self.mounter, &spec.host, &spec.container, merged, false)?;
            info.volumes.push(volume);
        }

        for container_path in &image.volume {
            let host = self.paths.volume(&volume_id());
            let volume = mount_volume(
                &self.mounter,
                &host,
                std::path::Path::new(container_path),
                merged,
                true,
            )?;
            info.volumes.push(volume);
        }
        Ok(())
    }

    /// Unmount every recorded volume (last first), then the merged root.
    /// Failures are logged and the rest still run; the first one is
    /// returned.
    ///
    /// # Errors
    ///
    /// Returns the first unmount failure.
    pub fn delete(&self, info: &ContainerInfo) -> SkiffResult<()> {
        let mut first_error = None;

        for volume in info.volumes.iter().rev() {
            if let Err(e) = self.mounter.unmount(&volume.container_path_in_host) {
                tracing::warn!(
                    container_id = %info.id,
                    target = %volume.container_path_in_host.display(),
                    error = %e,
                    "Failed to unmount volume"
                );
                first_error.get_or_insert(e);
            }
        }

        let merged = info.merged_dir();
        if merged.exists() {
            if let Err(e) = self.mounter.unmount(&merged) {
                tracing::warn!(container_id = %info.id, error = %e, "Failed to unmount merged root");
                first_error.get_or_insert(e);
            }
        }

        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use skiff_common::{ContainerId, SkiffError};
    use tempfile::TempDir;

    use super::*;
    use crate::filesystem::mounts::testing::RecordingMounter;

    fn setup() -> (TempDir, SkiffPaths, ImageStore, ImageInfo, ContainerInfo) {
        let dir = TempDir::new().unwrap();
        let paths = SkiffPaths::with_root(dir.path());
        let images = ImageStore::new(paths.clone());
        let image = ImageInfo {
            id: "img".into(),
            name: "img".into(),
            volume: vec!["/cache".into()],
            ..ImageInfo::default()
        };
        images.save(&image).unwrap();
        let info = ContainerInfo::new(ContainerId::new("c1").unwrap(), None, "img", &paths);
        (dir, paths, images, image, info)
    }

    #[test]
    fn create_then_delete_unmounts_everything() {
        let (dir, paths, images, image, mut info) = setup();
        let workspace = Workspace::with_mounter(paths.clone(), RecordingMounter::default());
        let host = dir.path().join("host-data");
        let spec = format!("{}:/data", host.display());

        let merged = workspace.create(&mut info, &[spec], &images, &image).unwrap();

        assert_eq!(merged, info.merged_dir());
        assert_eq!(info.volumes.len(), 2);
        assert!(!info.volumes[0].anonymous);
        assert!(info.volumes[1].anonymous);
        assert!(info.volumes[1].host_volume_path.starts_with(paths.volumes()));
        let anonymous = info.volumes[1].host_volume_path.file_name().unwrap();
        assert_eq!(anonymous.len(), 10);
        assert!(info.volumes[1].host_volume_path.is_dir());
        assert_eq!(workspace.mounter().mounted.borrow().len(), 3);
        assert!(
            workspace.mounter().calls.borrow()[0]
                .starts_with(&format!("overlay lowerdir={}", images.layer_dir("img").display()))
        );

        workspace.delete(&info).unwrap();
        assert!(workspace.mounter().mounted.borrow().is_empty());
        assert_eq!(
            workspace.mounter().calls.borrow().last().unwrap(),
            &format!("unmount {}", merged.display())
        );
    }

    #[test]
    fn malformed_spec_mounts_nothing() {
        let (_dir, paths, images, image, mut info) = setup();
        let workspace = Workspace::with_mounter(paths, RecordingMounter::default());

        let err = workspace
            .create(&mut info, &["nocolon".to_string()], &images, &image)
            .unwrap_err();

        assert!(matches!(err, SkiffError::InvalidVolume { .. }));
        assert!(workspace.mounter().calls.borrow().is_empty());
        assert!(info.volumes.is_empty());
    }

    #[test]
    fn volume_failure_rolls_back() {
        let (dir, paths, images, image, mut info) = setup();
        let workspace = Workspace::with_mounter(paths, RecordingMounter::default());
        // A regular file where the host directory should go.
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "").unwrap();
        let spec = format!("{}:/data", blocker.join("sub").display());

        assert!(workspace.create(&mut info, &[spec], &images, &image).is_err());
        assert!(workspace.mounter().mounted.borrow().is_empty());
    }

    #[test]
    #[ignore = "requires root"]
    fn overlay_and_volumes_on_host() {
        let (dir, paths, images, image, mut info) = setup();
        std::fs::create_dir_all(images.layer_dir("img")).unwrap();
        std::fs::write(images.layer_dir("img").join("hello"), "hi").unwrap();
        let host = dir.path().join("host-data");
        std::fs::create_dir_all(&host).unwrap();
        std::fs::write(host.join("shared"), "data").unwrap();

        let workspace = Workspace::new(paths);
        let merged = workspace
            .create(&mut info, &[format!("{}:/data", host.display())], &images, &image)
            .unwrap();
        assert_eq!(std::fs::read_to_string(merged.join("hello")).unwrap(), "hi");
        assert_eq!(std::fs::read_to_string(merged.join("data/shared")).unwrap(), "data");

        workspace.delete(&info).unwrap();
        assert!(!merged.join("hello").exists());
        assert!(host.join("shared").exists());
    }
}
