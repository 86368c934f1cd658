//! End-to-end CLI tests against a temporary database.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn ensemble(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("ensemble").unwrap();
    cmd.current_dir(dir.path());
    cmd.arg("--db").arg(dir.path().join("state.db"));
    cmd
}

fn create_team(dir: &TempDir) -> String {
    let output = ensemble(dir)
        .args(["team", "create", "--name", "checkout", "--project-type", "web_service"])
        .output()
        .unwrap();
    assert!(output.status.success());
    String::from_utf8(output.stdout).unwrap().trim().to_string()
}

#[test]
fn team_create_prints_team_id() {
    let dir = TempDir::new().unwrap();
    ensemble(&dir)
        .args(["team", "create", "--name", "checkout", "--project-type", "web_service"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("team_"));
}

#[test]
fn role_unassign_works_on_seeded_roles() {
    let dir = TempDir::new().unwrap();
    let team_id = create_team(&dir);
    ensemble(&dir)
        .args(["role", "unassign", "--team", &team_id, "--role", "QA Lead"])
        .assert()
        .success()
        .stdout(predicate::str::contains("QA Lead"));
}

#[test]
fn role_assign_rejects_unknown_agent() {
    let dir = TempDir::new().unwrap();
    let team_id = create_team(&dir);
    ensemble(&dir)
        .args([
            "role", "assign", "--team", &team_id, "--role", "QA Lead", "--agent", "ghost",
        ])
        .assert()
        .failure();
}

#[test]
fn workflow_run_completes_and_streams_events() {
    let dir = TempDir::new().unwrap();
    let team_id = create_team(&dir);
    let spec = dir.path().join("delivery.yaml");
    std::fs::write(
        &spec,
        r#"
name: mini_delivery
nodes:
  - id: design
    kind: phase
    phase: design
  - id: implement
    kind: action
    depends_on: [design]
"#,
    )
    .unwrap();

    ensemble(&dir)
        .args(["workflow", "run", "--team", &team_id])
        .arg("--spec")
        .arg(&spec)
        .assert()
        .success()
        .stdout(predicate::str::contains("node.completed").or(predicate::str::contains("completed")))
        .stdout(predicate::str::contains("\"status\":\"completed\""));
}

#[test]
fn failed_gap_detection_exits_with_validation_code() {
    let dir = TempDir::new().unwrap();
    let team_id = create_team(&dir);
    let spec = dir.path().join("gapped.yaml");
    std::fs::write(
        &spec,
        r#"
name: gapped_delivery
nodes:
  - id: backend
    kind: action
  - id: detect_gaps
    kind: validator
    name: gap_detector
    depends_on: [backend]
    inputs:
      expected_components: [models, routes]
"#,
    )
    .unwrap();

    ensemble(&dir)
        .args(["workflow", "run", "--team", &team_id])
        .arg("--spec")
        .arg(&spec)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("recovery context"));
}

#[test]
fn workflow_run_requires_spec_or_resume() {
    let dir = TempDir::new().unwrap();
    let team_id = create_team(&dir);
    ensemble(&dir)
        .args(["workflow", "run", "--team", &team_id])
        .assert()
        .code(2);
}

#[test]
fn history_metrics_prints_json() {
    let dir = TempDir::new().unwrap();
    let team_id = create_team(&dir);
    let spec = dir.path().join("delivery.yaml");
    std::fs::write(
        &spec,
        r#"
name: metrics_run
nodes:
  - id: only
    kind: action
"#,
    )
    .unwrap();
    ensemble(&dir)
        .args(["workflow", "run", "--team", &team_id])
        .arg("--spec")
        .arg(&spec)
        .assert()
        .success();

    ensemble(&dir)
        .args(["history", "metrics", "--days", "7"])
        .assert()
        .success()
        .stdout(predicate::str::contains("total_executions"))
        .stdout(predicate::str::contains("success_rate"));
}
