//! Process execution.

pub mod descriptor;
pub mod enter;
pub mod init;
pub mod process;

pub use descriptor::StartupDescriptor;
pub use enter::exec_in_container;
pub use init::run_init;
pub use process::{InitOptions, InitProcess, is_alive, spawn_init, terminate};
