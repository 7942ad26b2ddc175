#![allow(unsafe_code)]
//! Launching a container's init process.
//!
//! Init is cloned straight into fresh namespaces and re-executes this binary
//! as `skiff init`. Everything the child touches between clone and exec is
//! prepared beforehand, so the child only makes raw syscalls.

use std::ffi::{CString, OsStr, OsString};
use std::fs::{File, OpenOptions};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use rustix::pipe::{PipeFlags, pipe_with};
use skiff_common::{SkiffError, SkiffResult};

use crate::namespace;

/// Descriptor number init reads its startup message from.
pub const INIT_PIPE_FD: RawFd = 3;

/// How init should be launched.
#[derive(Debug, Clone)]
pub struct InitOptions<'a> {
    /// Runtime root forwarded to `skiff init`.
    pub root: &'a Path,
    /// Merged rootfs; init starts with it as its working directory.
    pub merged: &'a Path,
    /// Inherit the caller's stdio instead of logging to `log_file`.
    pub interactive: bool,
    /// Where stdout and stderr go when detached.
    pub log_file: &'a Path,
    /// Extra `KEY=VALUE` environment entries.
    pub env: &'a [String],
}

/// A running init process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitProcess {
    pid: u32,
}

impl InitProcess {
    /// Host pid.
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// Block until init exits and return its exit code (128 + signal when
    /// killed).
    ///
    /// # Errors
    ///
    /// Returns an error if `waitpid` fails.
    pub fn wait(&self) -> SkiffResult<i32> {
        wait_for(raw_pid(self.pid)?)
    }
}

/// Clone init into new namespaces. Returns the process and the write end
/// of the startup pipe.
///
/// # Errors
///
/// Returns an error if the pipe, the log file or the clone cannot be
/// created; nothing is started in that case.
pub fn spawn_init(options: &InitOptions<'_>) -> SkiffResult<(InitProcess, File)> {
    let exe = cstring(OsStr::new("/proc/self/exe"))?;
    let argv = [
        exe.clone(),
        cstring(OsStr::new("--root"))?,
        cstring(options.root.as_os_str())?,
        cstring(OsStr::new("init"))?,
    ];
    let envp = environment(options.env)?
        .iter()
        .map(|entry| cstring(entry.as_os_str()))
        .collect::<SkiffResult<Vec<_>>>()?;
    let merged = cstring(options.merged.as_os_str())?;

    let argv_ptrs = null_terminated(&argv);
    let envp_ptrs = null_terminated(&envp);

    let stdio = if options.interactive {
        None
    } else {
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(options.log_file)
            .map_err(|e| SkiffError::from_io(e, format!("open {}", options.log_file.display())))?;
        let null = File::open("/dev/null").map_err(|e| SkiffError::from_io(e, "open /dev/null"))?;
        Some((log, null))
    };
    let stdio_fds = stdio
        .as_ref()
        .map(|(log, null)| (log.as_raw_fd(), null.as_raw_fd()));

    let (read, write) = pipe_with(PipeFlags::CLOEXEC).map_err(|e| SkiffError::setup("pipe", e))?;
    let read_fd = read.as_raw_fd();

    let flags = libc::c_ulong::try_from(namespace::clone_flags() | libc::SIGCHLD)
        .map_err(|e| SkiffError::setup("clone", e))?;

    // Safety: a null stack gives fork semantics; the child below only makes
    // async-signal-safe calls on memory prepared before the clone.
    let pid = unsafe { libc::syscall(libc::SYS_clone, flags, 0usize, 0usize, 0usize, 0usize) };

    if pid == 0 {
        // Safety: raw syscalls on descriptors and C strings owned above.
        unsafe {
            if let Some((log_fd, null_fd)) = stdio_fds {
                if libc::dup2(null_fd, 0) < 0
                    || libc::dup2(log_fd, 1) < 0
                    || libc::dup2(log_fd, 2) < 0
                {
                    libc::_exit(126);
                }
            }
            let pipe_ok = if read_fd == INIT_PIPE_FD {
                libc::fcntl(INIT_PIPE_FD, libc::F_SETFD, 0) == 0
            } else {
                libc::dup2(read_fd, INIT_PIPE_FD) >= 0
            };
            if !pipe_ok || libc::chdir(merged.as_ptr()) != 0 {
                libc::_exit(126);
            }
            libc::execve(exe.as_ptr(), argv_ptrs.as_ptr(), envp_ptrs.as_ptr());
            libc::_exit(127);
        }
    }

    if pid < 0 {
        return Err(SkiffError::setup("clone", std::io::Error::last_os_error()));
    }
    drop(read);

    let pid = u32::try_from(pid).map_err(|e| SkiffError::setup("clone", e))?;
    tracing::info!(pid, interactive = options.interactive, "Init process cloned");
    Ok((InitProcess { pid }, File::from(write)))
}

/// Send SIGTERM to `pid`.
///
/// # Errors
///
/// Returns an error if the signal cannot be delivered.
pub fn terminate(pid: u32) -> SkiffResult<()> {
    let raw = raw_pid(pid)?;
    // Safety: kill has no memory-safety preconditions.
    let ret = unsafe { libc::kill(raw, libc::SIGTERM) };
    if ret != 0 {
        return Err(SkiffError::from_io(
            std::io::Error::last_os_error(),
            format!("kill -TERM {pid}"),
        ));
    }
    Ok(())
}

/// Whether a process with this pid exists.
#[must_use]
pub fn is_alive(pid: u32) -> bool {
    let Ok(raw) = raw_pid(pid) else {
        return false;
    };
    // Safety: signal 0 only checks for existence.
    let ret = unsafe { libc::kill(raw, 0) };
    ret == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

fn raw_pid(pid: u32) -> SkiffResult<libc::pid_t> {
    libc::pid_t::try_from(pid).map_err(|_| SkiffError::Internal {
        message: format!("pid {pid} out of range"),
    })
}

/// `waitpid` until `pid` exits; retries on EINTR.
pub(crate) fn wait_for(pid: libc::pid_t) -> SkiffResult<i32> {
    let mut status: libc::c_int = 0;
    loop {
        // Safety: status points to a live local.
        let result = unsafe { libc::waitpid(pid, &raw mut status, 0) };
        if result == -1 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(SkiffError::from_io(err, format!("waitpid {pid}")));
        }
        break;
    }

    if libc::WIFEXITED(status) {
        Ok(libc::WEXITSTATUS(status))
    } else if libc::WIFSIGNALED(status) {
        Ok(128 + libc::WTERMSIG(status))
    } else {
        Ok(1)
    }
}

/// The caller's environment with `extra` entries added, later keys winning.
fn environment(extra: &[String]) -> SkiffResult<Vec<OsString>> {
    let mut vars: Vec<(OsString, OsString)> = std::env::vars_os().collect();
    for entry in extra {
        let (key, value) = entry.split_once('=').ok_or_else(|| SkiffError::Config {
            message: format!("environment entry '{entry}' is not KEY=VALUE"),
        })?;
        vars.retain(|(existing, _)| existing.as_os_str() != OsStr::new(key));
        vars.push((key.into(), value.into()));
    }

    Ok(vars
        .into_iter()
        .map(|(key, value)| {
            let mut entry = key;
            entry.push("=");
            entry.push(value);
            entry
        })
        .collect())
}

pub(crate) fn cstring(value: &OsStr) -> SkiffResult<CString> {
    CString::new(value.as_bytes()).map_err(|_| SkiffError::Config {
        message: format!("argument contains a NUL byte: {}", value.to_string_lossy()),
    })
}

pub(crate) fn null_terminated(values: &[CString]) -> Vec<*const libc::c_char> {
    values
        .iter()
        .map(|value| value.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}
