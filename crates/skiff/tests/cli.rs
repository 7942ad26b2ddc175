//! Command-line behaviour that needs no privileges.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::tempdir;

fn skiff(root: &std::path::Path) -> Command {
    let mut cmd = Command::cargo_bin("skiff").unwrap();
    cmd.env("SKIFF_ROOT", root).env_remove("RUST_LOG");
    cmd
}

#[test]
fn help_lists_commands() {
    let temp = tempdir().unwrap();
    skiff(temp.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("network"))
        .stdout(predicate::str::contains("proxy"));
}

#[test]
fn ps_on_empty_root_prints_header() {
    let temp = tempdir().unwrap();
    skiff(temp.path())
        .arg("ps")
        .assert()
        .success()
        .stdout("ID\tNAME\tPID\tSTATUS\tCOMMAND\tCREATED\n");
}

#[test]
fn images_on_empty_root_prints_header() {
    let temp = tempdir().unwrap();
    skiff(temp.path())
        .arg("images")
        .assert()
        .success()
        .stdout("ID\tNAME\tVERSION\tCREATED\n");
}

#[test]
fn removing_unknown_container_fails() {
    let temp = tempdir().unwrap();
    skiff(temp.path())
        .args(["rm", "nothing"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("nothing"));
}

#[test]
fn tty_conflicts_with_detach() {
    let temp = tempdir().unwrap();
    skiff(temp.path())
        .args(["run", "-t", "-d", "--image", "base", "sh"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot be used with"));
}

#[test]
fn run_requires_image() {
    let temp = tempdir().unwrap();
    skiff(temp.path())
        .args(["run", "-d", "sh"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--image"));
}
