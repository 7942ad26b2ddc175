//! Cgroup v1 hierarchy discovery.

use std::fs;
use std::path::{Path, PathBuf};

use skiff_common::{SkiffError, SkiffResult};

/// Mount point of the hierarchy carrying `subsystem`, read from `mountinfo`.
///
/// The table is read on every call.
///
/// # Errors
///
/// Returns an error if the table cannot be read or no line mounts the
/// subsystem.
pub fn find_mount_point(mountinfo: &Path, subsystem: &str) -> SkiffResult<PathBuf> {
    let table = fs::read_to_string(mountinfo)
        .map_err(|e| SkiffError::from_io(e, format!("read {}", mountinfo.display())))?;

    table
        .lines()
        .find_map(|line| parse_line(line, subsystem))
        .ok_or_else(|| SkiffError::Config {
            message: format!("cgroup subsystem '{subsystem}' is not mounted"),
        })
}

/// Mount point of `line` if its super options name `subsystem`.
///
/// ```text
/// 34 25 0:30 / /sys/fs/cgroup/memory rw,nosuid shared:16 - cgroup cgroup rw,memory
/// ```
fn parse_line(line: &str, subsystem: &str) -> Option<PathBuf> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    let options = fields.last()?;
    if fields.len() < 5 || !options.split(',').any(|opt| opt == subsystem) {
        return None;
    }
    Some(PathBuf::from(fields[4]))
}
