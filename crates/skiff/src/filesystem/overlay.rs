//! OverlayFS setup for container rootfs.

use std::path::{Path, PathBuf};

use skiff_common::SkiffResult;

use super::mounts::Mounter;

/// OverlayFS configuration.
#[derive(Debug, Clone)]
pub struct OverlayFs {
    /// Lower directories (read-only layers), most-derived first.
    pub lower_dirs: Vec<PathBuf>,
    /// Upper directory (writable layer).
    pub upper_dir: PathBuf,
    /// Work directory (required by overlayfs).
    pub work_dir: PathBuf,
    /// Merged mount point.
    pub merged_dir: PathBuf,
}

impl OverlayFs {
    /// Create a new OverlayFS configuration.
    #[must_use]
    pub fn new(
        lower_dirs: Vec<PathBuf>,
        upper_dir: PathBuf,
        work_dir: PathBuf,
        merged_dir: PathBuf,
    ) -> Self {
        Self {
            lower_dirs,
            upper_dir,
            work_dir,
            merged_dir,
        }
    }

    /// Layout under a container's base directory.
    #[must_use]
    pub fn for_container(base_url: &Path, layer_dirs: Vec<PathBuf>) -> Self {
        Self::new(
            layer_dirs,
            base_url.join("upper"),
            base_url.join("work"),
            base_url.join("merged"),
        )
    }

    /// Create necessary directories.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be created.
    pub fn create_dirs(&self) -> SkiffResult<()> {
        std::fs::create_dir_all(&self.upper_dir)?;
        std::fs::create_dir_all(&self.work_dir)?;
        std::fs::create_dir_all(&self.merged_dir)?;
        Ok(())
    }

    /// `lowerdir=…,upperdir=…,workdir=…`.
    #[must_use]
    pub fn mount_options(&self) -> String {
        let lower = self
            .lower_dirs
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(":");

        format!(
            "lowerdir={},upperdir={},workdir={}",
            lower,
            self.upper_dir.display(),
            self.work_dir.display()
        )
    }

    /// Create the directories and mount the overlay on `merged_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directories cannot be created or the mount
    /// fails.
    pub fn mount(&self, mounter: &dyn Mounter) -> SkiffResult<()> {
        self.create_dirs()?;
        mounter.overlay(&self.mount_options(), &self.merged_dir)?;
        tracing::info!(merged = %self.merged_dir.display(), "OverlayFS mounted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesystem::mounts::testing::RecordingMounter;

    #[test]
    fn overlay_mount_options() {
        let overlay = OverlayFs::new(
            vec![PathBuf::from("/layer1"), PathBuf::from("/layer2")],
            PathBuf::from("/upper"),
            PathBuf::from("/work"),
            PathBuf::from("/merged"),
        );

        assert_eq!(
            overlay.mount_options(),
            "lowerdir=/layer1:/layer2,upperdir=/upper,workdir=/work"
        );
    }

    #[test]
    fn mount_creates_layout() {
        let dir = tempfile::tempdir().unwrap();
        let overlay = OverlayFs::for_container(dir.path(), vec![PathBuf::from("/l")]);
        let mounter = RecordingMounter::default();

        overlay.mount(&mounter).unwrap();
        for sub in ["upper", "work", "merged"] {
            assert!(dir.path().join(sub).is_dir());
        }
        assert_eq!(*mounter.mounted.borrow(), vec![dir.path().join("merged")]);
    }
}
