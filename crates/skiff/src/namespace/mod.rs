#![allow(unsafe_code)]
//! Linux namespace management.
//!
//! Containers get fresh namespaces of these kinds:
//! - UTS namespace (CLONE_NEWUTS)
//! - IPC namespace (CLONE_NEWIPC)
//! - PID namespace (CLONE_NEWPID)
//! - Mount namespace (CLONE_NEWNS)
//! - Network namespace (CLONE_NEWNET)

use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::PathBuf;

use skiff_common::{SkiffError, SkiffResult};

/// A namespace kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamespaceKind {
    /// Mount namespace.
    Mount,
    /// UTS namespace.
    Uts,
    /// IPC namespace.
    Ipc,
    /// Network namespace.
    Net,
    /// PID namespace.
    Pid,
}

impl NamespaceKind {
    /// Name under `/proc/<pid>/ns/`.
    #[must_use]
    pub const fn proc_name(self) -> &'static str {
        match self {
            Self::Mount => "mnt",
            Self::Uts => "uts",
            Self::Ipc => "ipc",
            Self::Net => "net",
            Self::Pid => "pid",
        }
    }

    /// `CLONE_NEW*` flag.
    #[must_use]
    pub const fn clone_flag(self) -> libc::c_int {
        match self {
            Self::Mount => libc::CLONE_NEWNS,
            Self::Uts => libc::CLONE_NEWUTS,
            Self::Ipc => libc::CLONE_NEWIPC,
            Self::Net => libc::CLONE_NEWNET,
            Self::Pid => libc::CLONE_NEWPID,
        }
    }

    /// `/proc/<pid>/ns/<name>`.
    #[must_use]
    pub fn path(self, pid: u32) -> PathBuf {
        PathBuf::from(format!("/proc/{pid}/ns/{}", self.proc_name()))
    }
}

/// Namespaces every container runs in, in the order `exec` joins them.
pub const CONTAINER_NAMESPACES: [NamespaceKind; 5] = [
    NamespaceKind::Mount,
    NamespaceKind::Uts,
    NamespaceKind::Ipc,
    NamespaceKind::Net,
    NamespaceKind::Pid,
];

/// Clone flags for a container's init.
#[must_use]
pub fn clone_flags() -> libc::c_int {
    CONTAINER_NAMESPACES
        .iter()
        .fold(0, |flags, kind| flags | kind.clone_flag())
}

/// Open handles on another process's namespaces.
#[derive(Debug)]
pub struct NamespaceFiles {
    files: Vec<(NamespaceKind, File)>,
}

impl NamespaceFiles {
    /// Open the container namespaces of `pid`.
    ///
    /// All handles are opened up front, since joining the mount namespace
    /// changes what `/proc` resolves to.
    ///
    /// # Errors
    ///
    /// Returns an error if any namespace file cannot be opened.
    pub fn open(pid: u32) -> SkiffResult<Self> {
        let files = CONTAINER_NAMESPACES
            .iter()
            .map(|&kind| {
                let path = kind.path(pid);
                File::open(&path)
                    .map(|file| (kind, file))
                    .map_err(|e| SkiffError::from_io(e, format!("open {}", path.display())))
            })
            .collect::<SkiffResult<Vec<_>>>()?;
        Ok(Self { files })
    }

    /// Join every opened namespace on the calling thread.
    ///
    /// Joining a PID namespace only affects children forked afterwards.
    ///
    /// # Errors
    ///
    /// Returns the first failing `setns`.
    pub fn join(&self) -> SkiffResult<()> {
        for (kind, file) in &self.files {
            // Safety: the fd is owned by `file` and open for the whole call.
            let ret = unsafe { libc::setns(file.as_raw_fd(), kind.clone_flag()) };
            if ret != 0 {
                return Err(SkiffError::from_io(
                    std::io::Error::last_os_error(),
                    format!("setns({})", kind.proc_name()),
                ));
            }
        }
        Ok(())
    }
}
