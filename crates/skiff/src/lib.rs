//! # Skiff Container Runtime
//!
//! Skiff runs processes in fresh UTS, IPC, PID, mount and network
//! namespaces on an overlay of image layers, with cgroup v1 limits and
//! optional bridge networking.
//!
//! ## Usage
//!
//! ```no_run
//! use skiff::runtime::{RunOptions, Runtime, RuntimeConfig};
//!
//! # fn example() -> skiff_common::SkiffResult<()> {
//! let runtime = Runtime::new(RuntimeConfig::default());
//!
//! // Start a detached container from the base image
//! let outcome = runtime.run(RunOptions {
//!     image: "base".into(),
//!     command: vec!["top".into(), "-b".into()],
//!     ..RunOptions::default()
//! })?;
//!
//! // Stop and remove it
//! runtime.stop(outcome.id.as_str())?;
//! runtime.remove(outcome.id.as_str())?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod cgroup;
pub mod cli;
pub mod exec;
pub mod filesystem;
pub mod image;
pub mod namespace;
pub mod runtime;

pub use runtime::Runtime;
