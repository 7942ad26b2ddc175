#![allow(unsafe_code)]
//! Mount operations.

use std::ffi::{CString, OsStr};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use rustix::mount::{UnmountFlags, mount_bind, unmount};
use skiff_common::{SkiffError, SkiffResult};

/// The mount syscalls a workspace needs, behind a seam so workspace assembly
/// can run without privileges in tests.
pub trait Mounter {
    /// Mount overlayfs on `target` with the given option string.
    ///
    /// # Errors
    ///
    /// Returns an error if the mount fails.
    fn overlay(&self, options: &str, target: &Path) -> SkiffResult<()>;

    /// Bind-mount `source` onto `target`.
    ///
    /// # Errors
    ///
    /// Returns an error if the mount fails.
    fn bind(&self, source: &Path, target: &Path) -> SkiffResult<()>;

    /// Unmount `target`.
    ///
    /// # Errors
    ///
    /// Returns an error if the unmount fails.
    fn unmount(&self, target: &Path) -> SkiffResult<()>;
}

/// Performs real mounts on the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostMounter;

impl Mounter for HostMounter {
    fn overlay(&self, options: &str, target: &Path) -> SkiffResult<()> {
        tracing::debug!(target = %target.display(), options, "Mounting overlayfs");
        mount("overlay", target, "overlay", 0, Some(options))
    }

    fn bind(&self, source: &Path, target: &Path) -> SkiffResult<()> {
        tracing::debug!(
            source = %source.display(),
            target = %target.display(),
            "Creating bind mount"
        );
        mount_bind(source, target).map_err(|e| io_error(e, "bind mount", target))
    }

    fn unmount(&self, target: &Path) -> SkiffResult<()> {
        tracing::debug!(target = %target.display(), "Unmounting");
        match unmount(target, UnmountFlags::empty()) {
            // Not a mount point: nothing left to undo.
            Err(rustix::io::Errno::INVAL | rustix::io::Errno::NOENT) => {
                tracing::debug!(target = %target.display(), "Not mounted");
                Ok(())
            }
            result => result.map_err(|e| io_error(e, "unmount", target)),
        }
    }
}

/// Make every mount under `/` private so nothing propagates back to the host.
///
/// # Errors
///
/// Returns an error if the remount fails.
pub fn make_root_private() -> SkiffResult<()> {
    tracing::debug!("Making / private recursively");
    mount("", Path::new("/"), "", libc::MS_PRIVATE | libc::MS_REC, None)
}

/// Recursively bind-mount `path` onto itself so it becomes a mount point.
///
/// # Errors
///
/// Returns an error if the mount fails.
pub fn bind_onto_itself(path: &Path) -> SkiffResult<()> {
    tracing::debug!(path = %path.display(), "Bind-mounting onto itself");
    mount(path, path, "bind", libc::MS_BIND | libc::MS_REC, None)
}

/// Mount a fresh procfs on `/proc`.
///
/// # Errors
///
/// Returns an error if the mount fails.
pub fn mount_proc() -> SkiffResult<()> {
    tracing::debug!("Mounting /proc");
    mount(
        "proc",
        Path::new("/proc"),
        "proc",
        libc::MS_NOEXEC | libc::MS_NOSUID | libc::MS_NODEV,
        None,
    )
}

/// Mount a tmpfs on `/dev`.
///
/// # Errors
///
/// Returns an error if the mount fails.
pub fn mount_dev() -> SkiffResult<()> {
    tracing::debug!("Mounting /dev");
    mount(
        "tmpfs",
        Path::new("/dev"),
        "tmpfs",
        libc::MS_NOSUID | libc::MS_STRICTATIME,
        Some("mode=755"),
    )
}

/// Lazily detach the mount at `target`.
///
/// # Errors
///
/// Returns an error if the unmount fails.
pub fn detach(target: &Path) -> SkiffResult<()> {
    unmount(target, UnmountFlags::DETACH).map_err(|e| io_error(e, "detach", target))
}

fn mount<S: AsRef<OsStr>>(
    source: S,
    target: &Path,
    fstype: &str,
    flags: libc::c_ulong,
    data: Option<&str>,
) -> SkiffResult<()> {
    let source_c = cstring(source.as_ref().as_bytes(), target)?;
    let target_c = cstring(target.as_os_str().as_bytes(), target)?;
    let fstype_c = cstring(fstype.as_bytes(), target)?;
    let data_c = data.map(|d| cstring(d.as_bytes(), target)).transpose()?;

    // Safety: every pointer comes from a CString that outlives the call;
    // a null data pointer is allowed.
    let ret = unsafe {
        libc::mount(
            source_c.as_ptr(),
            target_c.as_ptr(),
            fstype_c.as_ptr(),
            flags,
            data_c
                .as_ref()
                .map_or(std::ptr::null(), |d| d.as_ptr().cast()),
        )
    };
    if ret != 0 {
        return Err(SkiffError::from_io(
            std::io::Error::last_os_error(),
            format!("mount {fstype} on {}", target.display()),
        ));
    }
    Ok(())
}

fn cstring(bytes: &[u8], context: &Path) -> SkiffResult<CString> {
    CString::new(bytes).map_err(|_| SkiffError::Config {
        message: format!("mount argument for {} contains a NUL byte", context.display()),
    })
}

fn io_error(err: rustix::io::Errno, op: &str, target: &Path) -> SkiffError {
    SkiffError::from_io(err.into(), format!("{op} {}", target.display()))
}

#[cfg(test)]
pub(crate) mod testing {
    use std::cell::RefCell;
    use std::path::PathBuf;

    use super::*;

    /// Records mount calls instead of performing them.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingMounter {
        pub(crate) calls: RefCell<Vec<String>>,
        pub(crate) mounted: RefCell<Vec<PathBuf>>,
    }

    impl Mounter for RecordingMounter {
        fn overlay(&self, options: &str, target: &Path) -> SkiffResult<()> {
            self.calls
                .borrow_mut()
                .push(format!("overlay {options} {}", target.display()));
            self.mounted.borrow_mut().push(target.to_path_buf());
            Ok(())
        }

        fn bind(&self, source: &Path, target: &Path) -> SkiffResult<()> {
            self.calls
                .borrow_mut()
                .push(format!("bind {} {}", source.display(), target.display()));
            self.mounted.borrow_mut().push(target.to_path_buf());
            Ok(())
        }

        fn unmount(&self, target: &Path) -> SkiffResult<()> {
            self.calls
                .borrow_mut()
                .push(format!("unmount {}", target.display()));
            self.mounted.borrow_mut().retain(|m| m != target);
            Ok(())
        }
    }
}
