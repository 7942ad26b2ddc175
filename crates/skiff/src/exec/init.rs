#![allow(unsafe_code)]
//! Container init.
//!
//! `skiff init` runs as PID 1 of a fresh container and walks these states:
//! 1. wait for the startup descriptor on fd 3
//! 2. join a shared network namespace, if asked to
//! 3. pivot into the merged root (the current directory)
//! 4. mount `/proc` and `/dev`
//! 5. enter the working directory
//! 6. exec the user command
//!
//! Any failure before exec is fatal; nothing is rolled back.

use std::convert::Infallible;
use std::fs::File;
use std::os::fd::FromRawFd;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use skiff_common::{SkiffError, SkiffPaths, SkiffResult};
use skiff_network::netns::{join_netns, netns_path};

use super::descriptor::StartupDescriptor;
use super::process::INIT_PIPE_FD;
use crate::filesystem::{make_root_private, mount_dev, mount_proc, pivot_into};
use crate::runtime::state::ContainerStore;

/// Network namespace of the host, as seen before `/proc` is remounted.
const HOST_NETNS: &str = "/proc/1/ns/net";

/// Run the init state machine. Only returns on failure.
///
/// # Errors
///
/// Returns the error of the first step that failed.
pub fn run_init(paths: &SkiffPaths) -> SkiffResult<Infallible> {
    // Safety: fd 3 is the pipe handed over by the launcher and nothing else
    // in this process owns it.
    let pipe = unsafe { File::from_raw_fd(INIT_PIPE_FD) };
    let descriptor = StartupDescriptor::receive(pipe)?;
    tracing::debug!(cmds = ?descriptor.cmds, "Received startup descriptor");

    let Some((program, args)) = descriptor.cmds.split_first() else {
        return Err(SkiffError::setup("init", "no command to run"));
    };

    if let Some(netns) = shared_netns(paths, &descriptor)? {
        join_netns(&netns).map_err(|e| SkiffError::setup("network namespace", e))?;
        tracing::debug!(netns = %netns.display(), "Joined network namespace");
    }

    let new_root = std::env::current_dir().map_err(|e| SkiffError::setup("rootfs", e))?;
    setup_mounts(&new_root)?;

    let work_dir = descriptor.work_dir();
    std::env::set_current_dir(work_dir)
        .map_err(|e| SkiffError::setup("workdir", format!("{work_dir}: {e}")))?;

    tracing::debug!(program = %program, "Executing user command");
    let err = Command::new(program).args(args).exec();
    Err(SkiffError::Command {
        command: descriptor.cmds.join(" "),
        message: err.to_string(),
    })
}

/// Namespace file init should join, if any.
fn shared_netns(
    paths: &SkiffPaths,
    descriptor: &StartupDescriptor,
) -> SkiffResult<Option<PathBuf>> {
    if descriptor.host {
        return Ok(Some(PathBuf::from(HOST_NETNS)));
    }
    if descriptor.shared_ns_container.is_empty() {
        return Ok(None);
    }

    let target =
        ContainerStore::new(paths.clone()).resolve(&descriptor.shared_ns_container, false)?;
    let pid = target.pid.ok_or_else(|| SkiffError::InvalidState {
        id: target.id.to_string(),
        status: target.status.to_string(),
        operation: "share its network namespace",
        required: "running",
    })?;
    Ok(Some(netns_path(pid)))
}

fn setup_mounts(new_root: &Path) -> SkiffResult<()> {
    make_root_private().map_err(|e| SkiffError::setup("mount propagation", e))?;
    pivot_into(new_root).map_err(|e| SkiffError::setup("pivot_root", e))?;

    for dir in ["/proc", "/dev"] {
        std::fs::create_dir_all(dir).map_err(|e| SkiffError::setup("rootfs", e))?;
    }
    mount_proc().map_err(|e| SkiffError::setup("mount /proc", e))?;
    mount_dev().map_err(|e| SkiffError::setup("mount /dev", e))?;
    Ok(())
}
