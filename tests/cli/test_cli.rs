use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

const DEMO: &str = r#"
version: v1
name: demo
inventory:
  hosts:
    local: {}
steps:
  - name: hello
    action: cmd.run
    args: { cmd: echo hello }
  - name: bye
    action: cmd.run
    args: { cmd: echo bye }
"#;

const BROKEN: &str = r#"
version: v1
name: broken
inventory:
  hosts:
    local: {}
steps:
  - name: explode
    action: cmd.run
    args: { cmd: exit 2 }
"#;

const INVALID: &str = r#"
name: invalid
steps:
  - name: nothing
"#;

fn fleetflow(workspace: &Path) -> Command {
    let mut cmd = Command::cargo_bin("fleetflow").unwrap();
    cmd.current_dir(workspace)
        .env("FLEETFLOW_LOG_FILE", "false")
        .env("FLEETFLOW_LOG_CONSOLE", "none")
        .env_remove("FLEETFLOW_STATE_FILE")
        .env_remove("FLEETFLOW_AGENT_BASE_URL")
        .env_remove("FLEETFLOW_NOTIFY_URL")
        .env_remove("RUST_LOG");
    cmd
}

fn workspace_with(files: &[(&str, &str)]) -> TempDir {
    let dir = TempDir::new().unwrap();
    for (name, content) in files {
        fs::write(dir.path().join(name), content).unwrap();
    }
    dir
}

#[test]
fn test_help_lists_commands() {
    let dir = TempDir::new().unwrap();
    fleetflow(dir.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("COMMANDS:"))
        .stdout(predicate::str::contains("Show what a workflow would change"))
        .stdout(predicate::str::contains("Serve the remote agent HTTP API"));
}

#[test]
fn test_version_command() {
    let dir = TempDir::new().unwrap();
    fleetflow(dir.path())
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(format!(
            "fleetflow {}",
            env!("CARGO_PKG_VERSION")
        )));
}

#[test]
fn test_apply_command_help() {
    let dir = TempDir::new().unwrap();
    fleetflow(dir.path())
        .args(["apply", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--state-file"))
        .stdout(predicate::str::contains("--agent"));
}

#[test]
fn test_validate_reports_step_count_or_issues() {
    let dir = workspace_with(&[("demo.yaml", DEMO), ("invalid.yaml", INVALID)]);
    fleetflow(dir.path())
        .args(["validate", "demo.yaml"])
        .assert()
        .success()
        .stdout(predicate::str::contains("workflow demo is valid (2 step(s))"));

    fleetflow(dir.path())
        .args(["validate", "invalid.yaml"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("- "))
        .stderr(predicate::str::contains("validation issue(s)"));

    fleetflow(dir.path())
        .args(["validate", "missing.yaml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("FF-WORKFLOW-001"));
}

#[test]
fn test_plan_text_and_json() {
    let dir = workspace_with(&[("demo.yaml", DEMO)]);
    fleetflow(dir.path())
        .args(["plan", "demo.yaml"])
        .assert()
        .success()
        .stdout(predicate::str::contains("hello (cmd.run) on [local]"))
        .stdout(predicate::str::contains("~ hello:local"))
        .stdout(predicate::str::contains("Plan: 2 change(s)."));

    let output = fleetflow(dir.path())
        .args(["plan", "demo.yaml", "--format", "json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let plan: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(plan["workflow_name"], "demo");
    assert_eq!(plan["steps"][1]["changes"][0]["diff"]["cmd"]["desired"], "echo bye");
}

#[test]
fn test_apply_records_runs_that_can_be_listed() {
    let dir = workspace_with(&[("demo.yaml", DEMO), ("broken.yaml", BROKEN)]);

    fleetflow(dir.path())
        .args(["apply", "demo.yaml", "--run-id", "run-cli-0001", "-v"])
        .assert()
        .success()
        .stdout(predicate::str::contains("==> hello (cmd.run) on [local]"))
        .stdout(predicate::str::contains("    hello"))
        .stdout(predicate::str::contains("run run-cli-0001 success"));
    assert!(dir.path().join(".fleetflow/state/runs.json").exists());

    fleetflow(dir.path())
        .args(["apply", "broken.yaml", "--run-id", "run-cli-0002"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("run run-cli-0002 failed"))
        .stderr(predicate::str::contains("FF-CMD-001"));

    fleetflow(dir.path())
        .arg("runs")
        .assert()
        .success()
        .stdout(predicate::str::contains("RUN ID"))
        .stdout(predicate::str::contains("run-cli-0001"))
        .stdout(predicate::str::contains("run-cli-0002"));

    fleetflow(dir.path())
        .args(["runs", "--status", "failed"])
        .assert()
        .success()
        .stdout(predicate::str::contains("run-cli-0002"))
        .stdout(predicate::str::contains("run-cli-0001").not());

    fleetflow(dir.path())
        .args(["runs", "--run-id", "run-cli-0001"])
        .assert()
        .success()
        .stdout(predicate::str::contains("run run-cli-0001 (demo) success"))
        .stdout(predicate::str::contains("step bye success"));

    fleetflow(dir.path())
        .args(["runs", "--status", "paused"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid run status"));
}

#[test]
fn test_apply_json_with_explicit_state_file() {
    let dir = workspace_with(&[("demo.yaml", DEMO)]);
    let state = dir.path().join("custom/runs.json");

    let output = fleetflow(dir.path())
        .args(["apply", "demo.yaml", "--json", "--state-file"])
        .arg(&state)
        .output()
        .unwrap();
    assert!(output.status.success());
    let run: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(run["status"], "success");
    assert_eq!(run["workflow_name"], "demo");
    assert!(state.exists());

    fleetflow(dir.path())
        .args(["runs", "--format", "json", "--state-file"])
        .arg(&state)
        .assert()
        .success()
        .stdout(predicate::str::contains(run["run_id"].as_str().unwrap()));

    let empty = dir.path().join("empty.json");
    fleetflow(dir.path())
        .args(["runs", "--state-file"])
        .arg(&empty)
        .assert()
        .success()
        .stdout(predicate::str::contains("no runs"));
}

#[test]
fn test_reconcile_marks_running_runs_interrupted() {
    let dir = TempDir::new().unwrap();
    let state = dir.path().join("runs.json");
    fs::write(
        &state,
        r#"{"runs":[
            {"run_id":"run-cli-stale-1","workflow_name":"demo","status":"running","version":1},
            {"run_id":"run-cli-done-1","workflow_name":"demo","status":"success","version":2}
        ]}"#,
    )
    .unwrap();

    fleetflow(dir.path())
        .args(["reconcile", "--reason", "host rebooted", "--state-file"])
        .arg(&state)
        .assert()
        .success()
        .stdout(predicate::str::contains("1 run(s) marked interrupted"));

    fleetflow(dir.path())
        .args(["runs", "--run-id", "run-cli-stale-1", "--state-file"])
        .arg(&state)
        .assert()
        .success()
        .stdout(predicate::str::contains("interrupted: host rebooted"));
}

#[test]
fn test_config_file_errors_are_reported() {
    let dir = workspace_with(&[("fleetflow.toml", "[server]\nbind = \"nowhere\"\n")]);
    fleetflow(dir.path())
        .arg("runs")
        .assert()
        .failure()
        .stderr(predicate::str::contains("server.bind"));

    fleetflow(dir.path())
        .args(["--config", "absent.toml", "runs"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn test_agent_rejects_bad_bind_without_touching_run_state() {
    let dir = TempDir::new().unwrap();
    fleetflow(dir.path())
        .args(["agent", "--bind", "nowhere"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("FF-SERVER-001"));
    assert!(!dir.path().join(".fleetflow/state/runs.json").exists());
}
