#![allow(unsafe_code)]
//! Running a command inside an existing container.

use std::ffi::{CString, OsStr};
use std::os::unix::ffi::OsStrExt;

use skiff_common::{SkiffError, SkiffResult};

use super::process::{cstring, null_terminated, wait_for};
use crate::namespace::NamespaceFiles;

/// Environment of `pid`, read from `/proc/<pid>/environ`.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub fn read_environ(pid: u32) -> SkiffResult<Vec<CString>> {
    let path = format!("/proc/{pid}/environ");
    let raw = std::fs::read(&path).map_err(|e| SkiffError::from_io(e, format!("read {path}")))?;
    Ok(parse_environ(&raw))
}

fn parse_environ(raw: &[u8]) -> Vec<CString> {
    raw.split(|&b| b == 0)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| CString::new(entry).ok())
        .collect()
}

/// Run `args` in the namespaces of container init `pid`, with the
/// container's environment, and wait for it.
///
/// A forked child joins the namespaces; since a PID namespace only applies
/// to processes created after the join, it forks once more and the
/// grandchild execs. Returns the command's exit code.
///
/// # Errors
///
/// Returns an error if the namespaces or environment cannot be read, the
/// fork fails, or waiting fails.
pub fn exec_in_container(pid: u32, args: &[String]) -> SkiffResult<i32> {
    if args.is_empty() {
        return Err(SkiffError::Config {
            message: "exec needs a command".to_string(),
        });
    }

    let namespaces = NamespaceFiles::open(pid)?;
    let env = read_environ(pid)?;
    let argv = args
        .iter()
        .map(|arg| cstring(OsStr::new(arg)))
        .collect::<SkiffResult<Vec<_>>>()?;
    let root = cstring(OsStr::from_bytes(b"/"))?;

    let argv_ptrs = null_terminated(&argv);
    let env_ptrs = null_terminated(&env);

    tracing::debug!(pid, command = ?args, "Entering container");

    // Safety: the CLI is single-threaded here, so the child may allocate.
    let child = unsafe { libc::fork() };
    if child < 0 {
        return Err(SkiffError::from_io(std::io::Error::last_os_error(), "fork"));
    }

    if child == 0 {
        if let Err(e) = namespaces.join() {
            eprintln!("skiff exec: {e}");
            // Safety: terminating the forked child without unwinding.
            unsafe { libc::_exit(1) };
        }

        // Safety: raw process calls on pointers prepared before the fork.
        unsafe {
            let grandchild = libc::fork();
            if grandchild < 0 {
                libc::_exit(1);
            }
            if grandchild == 0 {
                if libc::chdir(root.as_ptr()) != 0 {
                    libc::_exit(126);
                }
                libc::execvpe(argv_ptrs[0], argv_ptrs.as_ptr(), env_ptrs.as_ptr());
                libc::_exit(127);
            }
            let code = wait_for(grandchild).unwrap_or(1);
            libc::_exit(code);
        }
    }

    let code = wait_for(child)?;
    tracing::debug!(pid, exit_code = code, "Exec finished");
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environ_entries() {
        let env = parse_environ(b"PATH=/bin\0HOME=/root\0\0");
        assert_eq!(
            env,
            vec![
                CString::new("PATH=/bin").unwrap(),
                CString::new("HOME=/root").unwrap()
            ]
        );
    }

    #[test]
    fn own_environment_is_readable() {
        assert!(!read_environ(std::process::id()).unwrap().is_empty());
    }

    #[test]
    fn empty_command_is_rejected() {
        assert!(matches!(
            exec_in_container(std::process::id(), &[]),
            Err(SkiffError::Config { .. })
        ));
    }
}
