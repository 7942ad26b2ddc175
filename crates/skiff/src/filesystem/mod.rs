//! Filesystem operations for containers.
//!
//! This module handles:
//! - OverlayFS assembly of image layers
//! - Volume bind mounts
//! - Mount operations
//! - pivot_root

mod mounts;
mod overlay;
mod pivot;
mod volume;
mod workspace;

pub use mounts::{
    HostMounter, Mounter, bind_onto_itself, detach, make_root_private, mount_dev, mount_proc,
};
pub use overlay::OverlayFs;
pub use pivot::pivot_into;
pub use volume::{VolumeInfo, VolumeSpec, mount_volume, path_in_merged};
pub use workspace::Workspace;
