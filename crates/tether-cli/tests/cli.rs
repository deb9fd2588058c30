//! Integration tests for the tether CLI.

use assert_cmd::Command;
use predicates::prelude::*;

fn tether() -> Command {
    let mut cmd = Command::cargo_bin("tether").unwrap();
    // Keep discovery away from any worker on the machine.
    cmd.env("TETHER_WORKER_PATH", "/nonexistent/tether-worker");
    cmd
}

#[test]
fn test_help_lists_commands() {
    tether()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("call"))
        .stdout(predicate::str::contains("generate"))
        .stdout(predicate::str::contains("download"))
        .stdout(predicate::str::contains("status"));
}

#[test]
fn test_unknown_call_type_fails_before_spawning() {
    tether()
        .args(["call", "getWeather", "--worker", "/nonexistent/tether-worker"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown operation: getWeather"));
}

#[test]
fn test_invalid_payload_is_rejected() {
    tether()
        .args(["call", "loadModel", "--data", "{modelId"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--data is not valid JSON"));
}

#[test]
fn test_streaming_call_is_redirected() {
    tether()
        .args(["call", "generateStreamResponse"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("tether generate"));
}

#[test]
fn test_missing_worker_shows_hint() {
    tether()
        .args(["status", "--worker", "/nonexistent/tether-worker"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("worker binary not found"))
        .stderr(predicate::str::contains("hint:"));
}

#[test]
#[ignore = "Requires tether-worker binary"]
fn test_call_against_echo_worker() {
    let mut cmd = Command::cargo_bin("tether").unwrap();
    cmd.env_remove("TETHER_WORKER_PATH")
        .args(["call", "getLocalModels"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"echo\""));
}
