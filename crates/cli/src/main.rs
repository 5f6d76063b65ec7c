//! Jobwatch CLI
//!
//! Launch shell commands as jobs that outlive the terminal that started them,
//! then check on them later from anywhere in the workspace.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jobwatch_core::launcher::{self, LaunchOutcome, LaunchRequest, Launcher};
use jobwatch_core::status::{format_elapsed, StatusReader};
use jobwatch_core::{JobError, JobState, JobStore, JobwatchConfig, StatusError, LATEST};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

/// Setup failures: bad workspace, unwritable store, job never started
const EXIT_SETUP: u8 = 2;
const EXIT_NOT_FOUND: u8 = 3;
const EXIT_CORRUPT: u8 = 4;
/// `wait` gave up before the job finished
const EXIT_TIMEOUT: u8 = 124;

#[derive(Parser, Clone)]
#[command(author, version, about = "Jobwatch - detached jobs with resumable status")]
struct Args {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand, Clone)]
enum CliCommand {
    /// Start a job, in the foreground or detached from this terminal
    Launch {
        /// Short token used as the job id prefix
        label: String,
        /// Command to run after the previous one succeeds (repeatable)
        #[arg(long = "then", value_name = "COMMAND")]
        then: Vec<String>,
        /// Workspace root the job runs in and is recorded under
        /// [default: nearest job store, else git work tree, else current dir]
        #[arg(short, long)]
        workspace: Option<PathBuf>,
        /// Return as soon as the job has started
        #[arg(short, long)]
        detach: bool,
        /// Primary command; several words are shell-quoted and joined
        #[arg(last = true, required = true, value_name = "COMMAND")]
        command: Vec<String>,
    },
    /// Show the state of a job
    Status {
        /// Job id, or `latest` for the most recently created job
        #[arg(default_value = LATEST)]
        job: String,
        /// Workspace root holding the job store
        #[arg(short, long)]
        workspace: Option<PathBuf>,
        /// Print the snapshot as JSON
        #[arg(long)]
        json: bool,
        /// Number of log lines to include
        #[arg(short, long)]
        tail: Option<usize>,
    },
    /// List all jobs, newest first
    List {
        #[arg(short, long)]
        workspace: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Block until a job finishes; the exit code mirrors the job's
    Wait {
        #[arg(default_value = LATEST)]
        job: String,
        #[arg(short, long)]
        workspace: Option<PathBuf>,
        /// Give up after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
        /// Polling interval in milliseconds
        #[arg(long, default_value = "500")]
        poll_ms: u64,
        #[arg(long)]
        json: bool,
    },
    /// Run a pending job to completion (used by detached launches)
    #[command(hide = true)]
    Supervise {
        #[arg(long)]
        workspace: PathBuf,
        job: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(matches!(args.command, CliCommand::Supervise { .. }));

    match run(args.command).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::from(exit_code_for(&e))
        }
    }
}

/// Diagnostics go to stderr; for a supervisor that is its `supervisor.log`
fn init_tracing(supervisor: bool) {
    let default = if supervisor { "info" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(!supervisor)
        .init();
}

async fn run(command: CliCommand) -> Result<u8> {
    match command {
        CliCommand::Launch {
            label,
            then,
            workspace,
            detach,
            command,
        } => {
            let workspace = workspace_root(workspace)?;
            launch(label, command_line(command)?, then, &workspace, detach).await
        }
        CliCommand::Status {
            job,
            workspace,
            json,
            tail,
        } => status(&job, &workspace_root(workspace)?, json, tail),
        CliCommand::List { workspace, json } => list(&workspace_root(workspace)?, json),
        CliCommand::Wait {
            job,
            workspace,
            timeout,
            poll_ms,
            json,
        } => wait(&job, &workspace_root(workspace)?, timeout, poll_ms, json).await,
        CliCommand::Supervise { workspace, job } => {
            let record = launcher::supervise(&workspace, &job)
                .await
                .with_context(|| format!("Supervisor for job {} failed", job))?;
            tracing::info!(job_id = %record.id, state = %record.state, "Supervisor exiting");
            Ok(0)
        }
    }
}

/// Explicit workspace, or the one enclosing the current directory
fn workspace_root(explicit: Option<PathBuf>) -> Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path),
        None => {
            let cwd = std::env::current_dir().context("Cannot read current directory")?;
            Ok(launcher::discover_workspace(&cwd))
        }
    }
}

/// A single argument is already a shell command; several are quoted as words
fn command_line(words: Vec<String>) -> Result<String> {
    if let [command] = words.as_slice() {
        return Ok(command.clone());
    }
    shlex::try_join(words.iter().map(String::as_str))
        .context("Command cannot be quoted for the shell")
}

async fn launch(
    label: String,
    command: String,
    then: Vec<String>,
    workspace: &Path,
    detach: bool,
) -> Result<u8> {
    let launcher = Launcher::new(workspace)
        .with_context(|| format!("Cannot use workspace {}", workspace.display()))?;
    let mut request = LaunchRequest::new(label, command).detached(detach);
    request.follow_up_commands = then;

    match launcher.launch(request).await.context("Failed to launch job")? {
        LaunchOutcome::Detached { job_id, pid } => {
            println!("{}", job_id);
            eprintln!(
                "Started job {} (pid {}). Check on it with: jobwatch status {}",
                job_id, pid, job_id
            );
            Ok(0)
        }
        LaunchOutcome::Finished(record) => {
            eprintln!("Job {} {}", record.id, record.state);
            Ok(job_exit_code(record.state, record.exit_code))
        }
    }
}

fn status(job: &str, workspace: &Path, json: bool, tail: Option<usize>) -> Result<u8> {
    let store = JobStore::new(workspace);
    let tail = match tail {
        Some(tail) => tail,
        None => JobwatchConfig::load(&store.root())?.tail_lines,
    };
    let snapshot = StatusReader::new(store).with_tail_lines(tail).status(job)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        print!("{}", snapshot.render());
    }
    Ok(0)
}

fn list(workspace: &Path, json: bool) -> Result<u8> {
    let summaries = StatusReader::new(JobStore::new(workspace)).list()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
        return Ok(0);
    }
    if summaries.is_empty() {
        println!("No jobs recorded under {}", workspace.display());
        return Ok(0);
    }

    println!(
        "{:<40} {:<10} {:>5} {:>8}  COMMAND",
        "JOB", "STATE", "EXIT", "ELAPSED"
    );
    for summary in summaries {
        let state = match (summary.state, &summary.problem) {
            (Some(state), _) => state.to_string(),
            (None, Some(problem)) if problem.starts_with("record not written") => {
                "creating".to_string()
            }
            (None, _) => "corrupt".to_string(),
        };
        let exit = summary
            .exit_code
            .map(|code| code.to_string())
            .unwrap_or_else(|| "-".to_string());
        let elapsed = summary
            .elapsed_ms
            .map(|ms| format_elapsed(Duration::from_millis(ms)))
            .unwrap_or_else(|| "-".to_string());
        let detail = summary.command.or(summary.problem).unwrap_or_default();
        println!(
            "{:<40} {:<10} {:>5} {:>8}  {}",
            summary.job_id, state, exit, elapsed, detail
        );
    }
    Ok(0)
}

async fn wait(
    job: &str,
    workspace: &Path,
    timeout: Option<u64>,
    poll_ms: u64,
    json: bool,
) -> Result<u8> {
    let reader = StatusReader::new(JobStore::new(workspace));
    let poll = Duration::from_millis(poll_ms.max(10));
    let snapshot = reader
        .wait(job, poll, timeout.map(Duration::from_secs))
        .await?;

    let Some(snapshot) = snapshot else {
        eprintln!("Timed out waiting for job {}", job);
        return Ok(EXIT_TIMEOUT);
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        print!("{}", snapshot.render());
    }
    Ok(job_exit_code(snapshot.state, snapshot.exit_code))
}

/// Mirror a job's outcome as a process exit code
fn job_exit_code(state: JobState, exit_code: Option<i32>) -> u8 {
    match (state, exit_code) {
        (JobState::Succeeded, _) => 0,
        (_, Some(code)) if code < 0 => 128u8.saturating_add((-code).min(127) as u8),
        (_, Some(code)) if code > 0 => code.min(255) as u8,
        _ => 1,
    }
}

fn exit_code_for(err: &anyhow::Error) -> u8 {
    if let Some(status) = err.downcast_ref::<StatusError>() {
        return match status {
            StatusError::NotFound { .. } => EXIT_NOT_FOUND,
            StatusError::CorruptRecord { .. } => EXIT_CORRUPT,
            StatusError::Io(_) => EXIT_SETUP,
        };
    }
    if let Some(JobError::LoadRecord(status)) = err.downcast_ref::<JobError>() {
        if matches!(status, StatusError::CorruptRecord { .. }) {
            return EXIT_CORRUPT;
        }
    }
    EXIT_SETUP
}
