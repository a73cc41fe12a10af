// ABOUTME: CLI smoke tests: config init, discovery, and the status command.

use assert_cmd::Command;
use predicates::prelude::*;

fn cutover() -> Command {
    Command::cargo_bin("cutover").unwrap()
}

#[test]
fn init_writes_config_and_refuses_overwrite() {
    let dir = tempfile::tempdir().unwrap();

    cutover()
        .current_dir(dir.path())
        .args(["init", "--service", "demo"])
        .assert()
        .success()
        .stdout(predicate::str::contains("cutover.yml"));
    let written = std::fs::read_to_string(dir.path().join("cutover.yml")).unwrap();
    assert!(written.contains("service: demo"));

    cutover()
        .current_dir(dir.path())
        .arg("init")
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));

    cutover()
        .current_dir(dir.path())
        .args(["init", "--force"])
        .assert()
        .success();
}

#[test]
fn status_reports_the_discovered_service() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("cutover.yml"),
        "service: api\ncommand: ./api --port $CUTOVER_PORT\ninstances: [8081, 8082]\n",
    )
    .unwrap();

    cutover()
        .current_dir(dir.path())
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("Service: api"))
        .stdout(predicate::str::contains("Strategy: rolling_update"))
        .stdout(predicate::str::contains("Current version: none"));
}

#[test]
fn status_without_config_fails() {
    let dir = tempfile::tempdir().unwrap();
    cutover()
        .current_dir(dir.path())
        .arg("status")
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn failed_deploy_is_visible_to_status() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("cutover.yml"),
        "service: api\ncommand: ./api --port $CUTOVER_PORT\ninstances: [8081]\n",
    )
    .unwrap();

    // The artifact does not exist, so the deployment fails validation.
    cutover()
        .current_dir(dir.path())
        .args(["deploy", "1.0.0", "--artifact", "missing.tar.gz"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("artifact not found"));

    // A later invocation reads the persisted record of the failure.
    cutover()
        .current_dir(dir.path())
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("Last deployment:"))
        .stdout(predicate::str::contains("Failed"));
}

#[test]
fn deploy_rejects_empty_version() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("cutover.yml"),
        "service: api\ncommand: ./api\ninstances: [8081]\n",
    )
    .unwrap();

    cutover()
        .current_dir(dir.path())
        .args(["deploy", " ", "--artifact", "app.tar.gz"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("version"));
}
