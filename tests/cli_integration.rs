//! Integration tests for the valueloop CLI

use assert_cmd::cargo;
use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// Get a Command for the valueloop binary
fn valueloop() -> Command {
    Command::new(cargo::cargo_bin!("valueloop"))
}

/// Command already pointed at `dir`.
fn in_project(dir: &TempDir) -> Command {
    let mut cmd = valueloop();
    cmd.arg("--project").arg(dir.path());
    cmd
}

fn initialized() -> TempDir {
    let temp = TempDir::new().unwrap();
    in_project(&temp)
        .args(["init", "--unit", "checkout"])
        .assert()
        .success();
    temp
}

#[test]
fn test_help() {
    valueloop()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("delivered and verified"));
}

#[test]
fn test_version() {
    valueloop()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("0.1.0"));
}

#[test]
fn test_init_creates_structure() {
    let temp = TempDir::new().unwrap();

    in_project(&temp)
        .args(["init", "--unit", "checkout"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Initialized state for unit 'checkout'"));

    let config = std::fs::read_to_string(temp.path().join(".valueloop/config.toml")).unwrap();
    assert!(config.contains("unit = \"checkout\""));
    assert!(temp.path().join(".valueloop/state.json").exists());
    let gitignore = std::fs::read_to_string(temp.path().join(".gitignore")).unwrap();
    assert!(gitignore.contains(".valueloop/"));
}

#[test]
fn test_init_keeps_existing_config() {
    let temp = initialized();

    in_project(&temp)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("already exists"))
        .stdout(predicate::str::contains("State already present"));
}

#[test]
fn test_status_before_init() {
    let temp = TempDir::new().unwrap();

    in_project(&temp)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("No state yet"));
}

#[test]
fn test_status_json_dashboard() {
    let temp = initialized();

    let output = in_project(&temp)
        .args(["status", "--json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let dashboard: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(dashboard["iteration"], 0);
    assert_eq!(dashboard["tier"], "GREEN");
}

#[test]
fn test_human_dispatch_adds_item() {
    let temp = initialized();

    in_project(&temp)
        .args([
            "dispatch",
            "add_work_item",
            r#"{"id":"A","description":"Accept card payments","value":"revenue","acceptance":"a test charge succeeds"}"#,
            "--human",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"ok\": true"));

    in_project(&temp)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("Work items (1)"))
        .stdout(predicate::str::contains("pending: 1"));
}

#[test]
fn test_role_dispatch_outside_role_is_refused() {
    let temp = initialized();

    in_project(&temp)
        .args([
            "dispatch",
            "add_work_item",
            r#"{"description":"x","value":"y","acceptance":"z"}"#,
            "--role",
            "strategist",
        ])
        .assert()
        .code(2)
        .stdout(predicate::str::contains("may not call"));
}

#[test]
fn test_dispatch_requires_caller() {
    let temp = initialized();

    in_project(&temp)
        .args(["dispatch", "flag_coherence", r#"{"reason":"drift"}"#])
        .assert()
        .failure();
}

#[test]
fn test_dispatch_rejects_bad_json() {
    let temp = initialized();

    in_project(&temp)
        .args(["dispatch", "flag_coherence", "{not json", "--human"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("not valid JSON"));
}

#[test]
fn test_resume_when_not_paused() {
    let temp = initialized();

    in_project(&temp)
        .arg("resume")
        .assert()
        .success()
        .stdout(predicate::str::contains("not paused"));
}

#[test]
fn test_resume_runs_verification() {
    let temp = initialized();

    in_project(&temp)
        .args([
            "dispatch",
            "escalate",
            r#"{"reason":"needs api key","instructions":"create the key file","verify_command":"test -f key"}"#,
            "--human",
        ])
        .assert()
        .success();

    in_project(&temp)
        .arg("resume")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Verification failed"));

    std::fs::write(temp.path().join("key"), "secret").unwrap();
    in_project(&temp)
        .arg("resume")
        .assert()
        .success()
        .stdout(predicate::str::contains("Pause cleared"));

    in_project(&temp)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("Paused:").not());
}

#[test]
fn test_rollback_unknown_label() {
    let temp = initialized();

    in_project(&temp)
        .args(["rollback", "nope", "--reason", "testing"])
        .assert()
        .code(5)
        .stderr(predicate::str::contains("nope"));
}

#[test]
fn test_invalid_config_is_reported() {
    let temp = initialized();
    std::fs::write(
        temp.path().join(".valueloop/config.toml"),
        "[monitor]\nalpha = 3.0\n",
    )
    .unwrap();

    in_project(&temp)
        .args(["dispatch", "flag_coherence", r#"{"reason":"drift"}"#, "--human"])
        .assert()
        .code(7)
        .stderr(predicate::str::contains("monitor.alpha"));
}

#[test]
fn test_log_json_emits_structured_lines() {
    let temp = initialized();

    in_project(&temp)
        .env_remove("RUST_LOG")
        .args([
            "--log-json",
            "dispatch",
            "flag_coherence",
            r#"{"reason":"pricing drifted from the plan"}"#,
            "--human",
        ])
        .assert()
        .success()
        .stderr(predicate::str::contains(r#""level":"INFO""#))
        .stderr(predicate::str::contains("flag_coherence"));
}
