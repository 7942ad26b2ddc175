#![allow(unsafe_code)]
//! Network namespace entry.
//!
//! Namespace membership is a per-thread property, so entering another
//! network namespace is only sound on a thread that stays put for the whole
//! operation and switches back afterwards. [`NetnsGuard`] does the switch and
//! restores the original namespace on drop; [`with_netns`] runs a closure on a
//! dedicated scoped OS thread holding such a guard, so the caller's own thread
//! never changes namespace.

use std::fs::File;
use std::marker::PhantomData;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use skiff_common::{SkiffError, SkiffResult};

/// Network namespace file of a process.
#[must_use]
pub fn netns_path(pid: u32) -> PathBuf {
    PathBuf::from(format!("/proc/{pid}/ns/net"))
}

/// Join the network namespace at `path` on the current thread.
///
/// # Errors
///
/// Returns an error if the namespace file cannot be opened or `setns` fails.
pub fn join_netns(path: &Path) -> SkiffResult<()> {
    let target = File::open(path).map_err(|e| SkiffError::from_io(e, "open network namespace"))?;
    setns_net(&target)
}

/// A thread switched into another network namespace.
///
/// Not `Send`: the guard must be dropped on the thread that created it.
#[derive(Debug)]
pub struct NetnsGuard {
    original: File,
    _not_send: PhantomData<*const ()>,
}

impl NetnsGuard {
    /// Switch the current thread into the namespace at `target`.
    ///
    /// # Errors
    ///
    /// Returns an error if either namespace file cannot be opened or the
    /// switch fails; the thread is left in its original namespace.
    pub fn enter(target: &Path) -> SkiffResult<Self> {
        let original = File::open("/proc/thread-self/ns/net")
            .map_err(|e| SkiffError::from_io(e, "open current network namespace"))?;
        join_netns(target)?;

        tracing::debug!(target = %target.display(), "Entered network namespace");
        Ok(Self {
            original,
            _not_send: PhantomData,
        })
    }
}

impl Drop for NetnsGuard {
    fn drop(&mut self) {
        match setns_net(&self.original) {
            Ok(()) => tracing::debug!("Restored original network namespace"),
            Err(e) => tracing::error!(error = %e, "Failed to restore network namespace"),
        }
    }
}

/// Run `f` inside the network namespace of `pid`.
///
/// The closure runs on a fresh OS thread that enters the namespace, runs `f`
/// and restores the namespace before it exits, whatever `f` returns.
///
/// # Errors
///
/// Returns the error of entering the namespace or of `f` itself.
pub fn with_netns<T, F>(pid: u32, f: F) -> SkiffResult<T>
where
    T: Send,
    F: FnOnce() -> SkiffResult<T> + Send,
{
    let target = netns_path(pid);
    std::thread::scope(|scope| {
        scope
            .spawn(|| {
                let _guard = NetnsGuard::enter(&target)?;
                f()
            })
            .join()
            .map_err(|_| SkiffError::Internal {
                message: format!("network namespace worker for pid {pid} panicked"),
            })?
    })
}

fn setns_net(file: &File) -> SkiffResult<()> {
    // Safety: the fd is owned by `file` and valid for the duration of the call.
    let ret = unsafe { libc::setns(file.as_raw_fd(), libc::CLONE_NEWNET) };
    if ret != 0 {
        return Err(SkiffError::from_io(
            std::io::Error::last_os_error(),
            "setns(CLONE_NEWNET)",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn netns_path_format() {
        assert_eq!(netns_path(42), PathBuf::from("/proc/42/ns/net"));
    }

    #[test]
    fn missing_namespace_fails_without_switching() {
        let err = with_netns(u32::MAX, || Ok(())).unwrap_err();
        assert!(matches!(
            err,
            SkiffError::Io(_) | SkiffError::PermissionDenied { .. }
        ));
    }

    #[test]
    #[ignore = "requires root"]
    fn own_namespace_roundtrip() {
        let pid = std::process::id();
        let value = with_netns(pid, || Ok(7)).unwrap();
        assert_eq!(value, 7);
    }
}
