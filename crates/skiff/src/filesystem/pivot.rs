#![allow(unsafe_code)]
//! pivot_root implementation.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use skiff_common::{SkiffError, SkiffResult};

use super::mounts::{bind_onto_itself, detach};

/// Directory under the new root that briefly holds the old one.
const PUT_OLD: &str = ".pivot_root";

/// Raw pivot_root(2).
fn pivot_root(new_root: &Path, put_old: &Path) -> SkiffResult<()> {
    tracing::debug!(
        new_root = %new_root.display(),
        put_old = %put_old.display(),
        "Executing pivot_root"
    );

    let invalid = |_| SkiffError::Internal {
        message: format!("path contains a NUL byte: {}", new_root.display()),
    };
    let new_root_c = CString::new(new_root.as_os_str().as_bytes()).map_err(invalid)?;
    let put_old_c = CString::new(put_old.as_os_str().as_bytes()).map_err(invalid)?;

    // Safety: both pointers are NUL-terminated and live across the call.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_pivot_root,
            new_root_c.as_ptr(),
            put_old_c.as_ptr(),
        )
    };
    if ret != 0 {
        return Err(SkiffError::from_io(
            std::io::Error::last_os_error(),
            format!("pivot_root into {}", new_root.display()),
        ));
    }
    Ok(())
}

/// Make `new_root` the process root and drop the old root.
///
/// `new_root` is bind-mounted onto itself first, since pivot_root needs a
/// mount point. The old root is parked under `.pivot_root`, then detached
/// and removed.
///
/// # Errors
///
/// Returns an error if any mount, the pivot, or the cleanup fails.
pub fn pivot_into(new_root: &Path) -> SkiffResult<()> {
    bind_onto_itself(new_root)?;

    let put_old = new_root.join(PUT_OLD);
    std::fs::create_dir_all(&put_old)
        .map_err(|e| SkiffError::from_io(e, format!("create {}", put_old.display())))?;

    pivot_root(new_root, &put_old)?;
    std::env::set_current_dir("/").map_err(|e| SkiffError::from_io(e, "chdir /"))?;

    let old_root = Path::new("/").join(PUT_OLD);
    detach(&old_root)?;
    std::fs::remove_dir(&old_root)
        .map_err(|e| SkiffError::from_io(e, format!("remove {}", old_root.display())))?;

    tracing::debug!(new_root = %new_root.display(), "pivot_root complete");
    Ok(())
}
