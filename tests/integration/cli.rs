use std::fs;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::tempdir;

fn depstart() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("depstart"))
}

#[test]
fn help_lists_flags() {
    depstart()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--error-action"))
        .stdout(predicate::str::contains("--log-level"))
        .stdout(predicate::str::contains("--log-file"));
}

#[test]
fn missing_config_path_exits_2() {
    depstart()
        .arg("--config")
        .arg("/nonexistent/depstart.yaml")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("does not exist"));
}

#[test]
fn no_default_config_found_exits_4() {
    let dir = tempdir().expect("failed to create tempdir");

    depstart()
        .current_dir(dir.path())
        .assert()
        .code(4)
        .stderr(predicate::str::contains("No config file found"));
}

#[test]
fn unparseable_config_exits_3() {
    let dir = tempdir().expect("failed to create tempdir");
    let path = dir.path().join("depstart.yaml");
    fs::write(&path, "services: [unterminated").expect("failed to write config");

    depstart()
        .arg("--config")
        .arg(path.to_str().unwrap())
        .assert()
        .code(3);
}

#[test]
fn circular_dependencies_exit_3() {
    let dir = tempdir().expect("failed to create tempdir");
    let path = dir.path().join("depstart.yaml");
    fs::write(
        &path,
        r#"
services:
  a:
    autostart: false
    dependent_startup: true
    dependent_startup_wait_for: "b"
  b:
    autostart: false
    dependent_startup: true
    dependent_startup_wait_for: "a"
"#,
    )
    .expect("failed to write config");

    depstart()
        .arg("--config")
        .arg(path.to_str().unwrap())
        .assert()
        .code(3)
        .stderr(predicate::str::contains("Circular dependencies detected"));
}

#[test]
fn config_conflict_fatal_under_exit_policy() {
    let dir = tempdir().expect("failed to create tempdir");
    let path = dir.path().join("depstart.yaml");
    fs::write(
        &path,
        r#"
services:
  a:
    dependent_startup: true
"#,
    )
    .expect("failed to write config");

    depstart()
        .arg("--config")
        .arg(path.to_str().unwrap())
        .arg("--error-action")
        .arg("exit")
        .assert()
        .code(3)
        .stderr(predicate::str::contains("dependent_startup"));
}

#[test]
fn invalid_error_action_is_usage_error() {
    depstart()
        .arg("--error-action")
        .arg("panic")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--error-action"));
}
