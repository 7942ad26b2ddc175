//! Container runtime core.
//!
//! This module provides the container record, its store and the lifecycle
//! operations built on them.

pub mod config;
pub mod container;
mod lifecycle;
pub mod state;

pub use config::RuntimeConfig;
pub use container::{ContainerInfo, ContainerStatus, NetworkAttachment};
pub use lifecycle::{NetworkMode, RunOptions, RunOutcome, Runtime};
pub use state::ContainerStore;
