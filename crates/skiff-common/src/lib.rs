//! # skiff-common
//!
//! Shared types for the skiff container runtime:
//! - Container and volume ID generation
//! - The on-disk runtime layout
//! - The common error type

#![warn(missing_docs)]

pub mod error;
pub mod id;
pub mod paths;

pub use error::{SkiffError, SkiffResult};
pub use id::{ContainerId, volume_id};
pub use paths::SkiffPaths;
