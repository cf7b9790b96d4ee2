//! Argument handling of the built `vmux` binary

use assert_cmd::Command;
use predicates::prelude::*;

fn vmux() -> Command {
    let mut cmd = Command::cargo_bin("vmux").expect("vmux binary not built");
    // Keep a developer's RUST_LOG from adding noise to stderr assertions
    cmd.env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_help_lists_subcommands() {
    vmux()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "Virtual connections multiplexed over one TCP stream",
        ))
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("send"))
        .stdout(predicate::str::contains("--log-level"));
}

#[test]
fn test_serve_help_describes_echo_server() {
    vmux()
        .args(["serve", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("echo server"))
        .stdout(predicate::str::contains("--bind"));
}

#[test]
fn test_send_help_lists_stream_count() {
    vmux()
        .args(["send", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--streams"))
        .stdout(predicate::str::contains("--connect"))
        .stdout(predicate::str::contains("<MESSAGE>"));
}

#[test]
fn test_send_rejects_non_numeric_stream_count() {
    vmux()
        .args(["send", "--streams", "many", "hello"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid value"));
}

#[test]
fn test_send_requires_message() {
    vmux().arg("send").assert().failure();
}

#[test]
fn test_missing_config_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    vmux()
        .args(["--config"])
        .arg(dir.path().join("absent.toml"))
        .args(["send", "hello"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load config"));
}

#[test]
fn test_send_reports_unreachable_server() {
    // Bind then drop so the port is very likely closed
    let addr = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap();

    vmux()
        .args(["send", "--connect", &addr.to_string(), "hello"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to connect"));
}
