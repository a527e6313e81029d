//! Binary-level tests for huddle-sync.

use assert_cmd::Command;
use predicates::prelude::*;

fn huddle_sync() -> Command {
    Command::cargo_bin("huddle-sync").unwrap()
}

#[test]
fn classify_plain_text() {
    huddle_sync()
        .args(["classify", "hello there"])
        .assert()
        .success()
        .stdout(predicate::str::contains("plain message"));
}

#[test]
fn classify_team_leave() {
    huddle_sync()
        .args(["classify", "🚪 Bob has left the team."])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"type\": \"team_leave\""))
        .stdout(predicate::str::contains("\"userName\": \"Bob\""));
}

#[test]
fn missing_config_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("absent.toml");

    huddle_sync()
        .arg("--config")
        .arg(&missing)
        .arg("conversations")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read config file"));
}

#[test]
fn config_without_token_fails() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "user_id = \"u1\"\n").unwrap();

    huddle_sync()
        .env_remove("HUDDLE_TOKEN")
        .arg("--config")
        .arg(&path)
        .arg("conversations")
        .assert()
        .failure()
        .stderr(predicate::str::contains("No token configured"));
}
