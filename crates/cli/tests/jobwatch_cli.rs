//! End-to-end tests driving the `jobwatch` binary.
#![cfg(unix)]

use jobwatch_core::launcher::SupervisorCommand;
use jobwatch_core::{
    JobError, JobState, JobStore, JobwatchConfig, LaunchOutcome, LaunchRequest, Launcher,
    Snapshot, StatusReader,
};
use std::path::Path;
use std::process::{Command, Output};
use std::time::Duration;

fn jobwatch(workspace: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_jobwatch"))
        .args(args)
        .arg("--workspace")
        .arg(workspace)
        .output()
        .expect("run jobwatch")
}

fn launch(workspace: &Path, label: &str, then: &[&str], detach: bool, command: &str) -> Output {
    let mut args = vec!["launch", label];
    for follow_up in then {
        args.push("--then");
        args.push(follow_up);
    }
    if detach {
        args.push("--detach");
    }
    args.push("--workspace");
    let workspace = workspace.to_str().unwrap();
    args.push(workspace);
    args.push("--");
    args.push(command);
    Command::new(env!("CARGO_BIN_EXE_jobwatch"))
        .args(&args)
        .output()
        .expect("run jobwatch launch")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

async fn wait_terminal(workspace: &Path, job_id: &str) -> Snapshot {
    StatusReader::new(JobStore::new(workspace))
        .with_tail_lines(100)
        .wait(job_id, Duration::from_millis(50), Some(Duration::from_secs(20)))
        .await
        .expect("status readable")
        .expect("job finished in time")
}

fn output_lines(snapshot: &Snapshot) -> Vec<&str> {
    snapshot
        .log_tail
        .iter()
        .map(String::as_str)
        .filter(|line| !line.starts_with("==> [jobwatch]"))
        .collect()
}

#[test]
fn foreground_launch_streams_output_and_records_success() {
    let dir = tempfile::tempdir().unwrap();

    let output = launch(dir.path(), "build", &[], false, "echo hi");
    assert!(output.status.success());
    assert_eq!(stdout(&output), "hi\n");

    let status = jobwatch(dir.path(), &["status", "latest", "--json"]);
    assert!(status.status.success());
    let json: serde_json::Value = serde_json::from_slice(&status.stdout).unwrap();
    assert!(json["job_id"].as_str().unwrap().starts_with("build_"));
    assert_eq!(json["state"], "succeeded");
    assert_eq!(json["exit_code"], 0);
}

#[test]
fn foreground_failure_becomes_exit_code() {
    let dir = tempfile::tempdir().unwrap();

    let output = launch(dir.path(), "build", &["echo should-not-run"], false, "exit 3");
    assert_eq!(output.status.code(), Some(3));
    assert!(!stdout(&output).contains("should-not-run"));
}

#[tokio::test]
async fn detached_failure_skips_follow_ups() {
    let dir = tempfile::tempdir().unwrap();

    let output = launch(dir.path(), "build", &["echo should-not-run"], true, "exit 3");
    assert!(output.status.success());
    let job_id = stdout(&output).trim().to_string();
    assert!(job_id.starts_with("build_"));

    let snapshot = wait_terminal(dir.path(), &job_id).await;
    assert_eq!(snapshot.state, JobState::Failed);
    assert_eq!(snapshot.exit_code, Some(3));
    let log = std::fs::read_to_string(&snapshot.log_path).unwrap();
    assert!(!log.contains("should-not-run"));
}

#[tokio::test]
async fn detached_follow_ups_run_in_order() {
    let dir = tempfile::tempdir().unwrap();

    let output = launch(dir.path(), "chain", &["echo a", "echo b"], true, "true");
    assert!(output.status.success());
    let job_id = stdout(&output).trim().to_string();

    let snapshot = wait_terminal(dir.path(), &job_id).await;
    assert_eq!(snapshot.state, JobState::Succeeded);
    assert_eq!(output_lines(&snapshot), vec!["a", "b"]);
}

#[tokio::test]
async fn detached_job_outlives_launcher() {
    let dir = tempfile::tempdir().unwrap();

    let output = launch(dir.path(), "slow", &["echo done"], true, "sleep 1");
    assert!(output.status.success());
    let job_id = stdout(&output).trim().to_string();

    // The launcher has exited; the job is still going
    let snapshot = StatusReader::new(JobStore::new(dir.path()))
        .status(&job_id)
        .unwrap();
    assert_eq!(snapshot.state, JobState::Running);
    assert!(snapshot.pid.is_some());

    let snapshot = wait_terminal(dir.path(), &job_id).await;
    assert_eq!(snapshot.state, JobState::Succeeded);
    assert_eq!(output_lines(&snapshot), vec!["done"]);
}

#[tokio::test]
async fn killed_job_is_recorded_as_failed() {
    let dir = tempfile::tempdir().unwrap();

    let output = launch(dir.path(), "victim", &["echo never"], true, "sleep 30");
    let job_id = stdout(&output).trim().to_string();
    let snapshot = StatusReader::new(JobStore::new(dir.path()))
        .status(&job_id)
        .unwrap();
    let pid = snapshot.pid.expect("running job has a pid");

    let killed = Command::new("kill")
        .args(["-TERM", &pid.to_string()])
        .status()
        .unwrap();
    assert!(killed.success());

    let snapshot = wait_terminal(dir.path(), &job_id).await;
    assert_eq!(snapshot.state, JobState::Failed);
    assert_eq!(snapshot.exit_code, Some(-15));
    assert!(snapshot.pid.is_none());
}

#[test]
fn status_of_empty_workspace_is_not_found() {
    let dir = tempfile::tempdir().unwrap();

    let output = jobwatch(dir.path(), &["status", "latest"]);
    assert_eq!(output.status.code(), Some(3));
}

#[test]
fn status_of_corrupt_record_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let store = JobStore::new(dir.path());
    let record = store.create_job("broken", "true", vec![]).unwrap();
    std::fs::write(store.record_path(&record.id), "{").unwrap();

    let output = jobwatch(dir.path(), &["status", &record.id]);
    assert_eq!(output.status.code(), Some(4));
}

#[test]
fn launch_into_missing_workspace_is_setup_error() {
    let dir = tempfile::tempdir().unwrap();

    let output = launch(&dir.path().join("absent"), "build", &[], true, "true");
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn list_shows_jobs_newest_first() {
    let dir = tempfile::tempdir().unwrap();
    launch(dir.path(), "first", &[], false, "true");
    launch(dir.path(), "second", &[], false, "false");

    let output = jobwatch(dir.path(), &["list", "--json"]);
    assert!(output.status.success());
    let rows: Vec<serde_json::Value> = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows[0]["job_id"].as_str().unwrap().starts_with("second_"));
    assert_eq!(rows[0]["state"], "failed");
    assert_eq!(rows[1]["state"], "succeeded");
}

#[test]
fn wait_mirrors_job_exit_code() {
    let dir = tempfile::tempdir().unwrap();
    let output = launch(dir.path(), "late", &[], true, "sleep 0.2; exit 5");
    let job_id = stdout(&output).trim().to_string();

    let waited = jobwatch(dir.path(), &["wait", &job_id, "--poll-ms", "20"]);
    assert_eq!(waited.status.code(), Some(5));
}

#[test]
fn command_words_reach_the_shell_intact() {
    let dir = tempfile::tempdir().unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_jobwatch"))
        .args(["launch", "quote", "--workspace"])
        .arg(dir.path())
        .args(["--", "printf", "%s\\n", "a b"])
        .output()
        .unwrap();
    assert!(output.status.success());
    assert_eq!(stdout(&output), "a b\n");
}

#[test]
fn status_finds_workspace_from_subdirectory() {
    let dir = tempfile::tempdir().unwrap();
    let nested = dir.path().join("src");
    std::fs::create_dir(&nested).unwrap();

    let launched = Command::new(env!("CARGO_BIN_EXE_jobwatch"))
        .args(["launch", "rooted", "--", "true"])
        .current_dir(dir.path())
        .output()
        .unwrap();
    assert!(launched.status.success());

    let status = Command::new(env!("CARGO_BIN_EXE_jobwatch"))
        .args(["status", "latest", "--json"])
        .current_dir(&nested)
        .output()
        .unwrap();
    assert!(status.status.success());
    let json: serde_json::Value = serde_json::from_slice(&status.stdout).unwrap();
    assert!(json["job_id"].as_str().unwrap().starts_with("rooted_"));
}

fn supervisor() -> SupervisorCommand {
    SupervisorCommand::new(env!("CARGO_BIN_EXE_jobwatch")).arg("supervise")
}

#[tokio::test]
async fn detached_job_uses_launcher_config() {
    let dir = tempfile::tempdir().unwrap();
    let config = JobwatchConfig {
        shell: "/definitely/not/a/shell".to_string(),
        ..JobwatchConfig::default()
    };
    let launcher = Launcher::new(dir.path())
        .unwrap()
        .with_config(config)
        .with_supervisor(supervisor());

    let err = launcher
        .launch(LaunchRequest::new("cfg", "echo hi").detached(true))
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::SpawnPrimary { .. }));

    let id = launcher.store().latest_id().unwrap().unwrap();
    let record = launcher.store().read_record(&id).unwrap();
    assert_eq!(record.state, JobState::Failed);
}

#[tokio::test]
async fn dashed_label_can_be_detached() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = Launcher::new(dir.path())
        .unwrap()
        .with_supervisor(supervisor());

    let outcome = launcher
        .launch(LaunchRequest::new("-x", "echo dashed").detached(true))
        .await
        .unwrap();
    let LaunchOutcome::Detached { job_id, .. } = outcome else {
        panic!("expected a detached job");
    };
    assert!(job_id.starts_with("-x_"));

    let snapshot = wait_terminal(dir.path(), &job_id).await;
    assert_eq!(snapshot.state, JobState::Succeeded);
    assert_eq!(output_lines(&snapshot), vec!["dashed"]);
}
