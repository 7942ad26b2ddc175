//! Helpers for shelling out to `ip` and `iptables`.

use std::process::Command;

use skiff_common::{SkiffError, SkiffResult};

/// Run `ip` with the given arguments.
pub(crate) fn run_ip<S: AsRef<str>>(args: &[S]) -> SkiffResult<()> {
    run("ip", args)
}

/// Run `iptables` with the given arguments.
pub(crate) fn run_iptables<S: AsRef<str>>(args: &[S]) -> SkiffResult<()> {
    run("iptables", args)
}

/// Whether `ip link show <name>` finds the interface.
pub(crate) fn link_exists(name: &str) -> bool {
    Command::new("ip")
        .args(["link", "show", name])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn run<S: AsRef<str>>(program: &str, args: &[S]) -> SkiffResult<()> {
    let args: Vec<&str> = args.iter().map(AsRef::as_ref).collect();
    let command = format!("{program} {}", args.join(" "));
    tracing::debug!(%command, "Running network command");

    let output = Command::new(program)
        .args(&args)
        .output()
        .map_err(|e| SkiffError::Command {
            command: command.clone(),
            message: e.to_string(),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(SkiffError::Command {
            command,
            message: format!("{} ({})", stderr.trim(), output.status),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_program_is_a_command_error() {
        let err = run("skiff-definitely-missing-binary", &["x"]).unwrap_err();
        assert!(matches!(err, SkiffError::Command { .. }));
        assert!(err.to_string().contains("skiff-definitely-missing-binary x"));
    }

    #[test]
    fn nonexistent_link() {
        assert!(!link_exists("nonexistent_bridge_12345"));
    }
}
