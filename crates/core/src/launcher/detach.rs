//! # Detached Supervision
//!
//! A detached job is driven by a separate supervisor process: the launcher
//! re-executes a binary (normally itself) in a new OS session, the supervisor
//! starts the primary command and reports back over a one-line handshake on
//! its stdout, and from then on owns the job record until the job ends. The
//! launching session can exit or lose its terminal without affecting the job.

use super::runner::{JobRunner, RunMode, RunningJob};
use crate::config::JobwatchConfig;
use crate::error::{JobError, JobResult};
use crate::state::{JobRecord, JobState, JobStore};
use chrono::Utc;
use std::ffi::OsString;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

/// How long the launcher waits for the supervisor to report a start
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// The one line a supervisor writes to its stdout
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handshake {
    /// Primary command is running with this pid
    Started(u32),
    /// Primary command could not be started
    Failed(String),
}

impl Handshake {
    pub fn to_line(&self) -> String {
        match self {
            Self::Started(pid) => format!("started {}\n", pid),
            // Keep the message on one line
            Self::Failed(message) => format!("error {}\n", message.replace('\n', " ")),
        }
    }

    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        if let Some(pid) = line.strip_prefix("started ") {
            return pid.trim().parse().ok().map(Self::Started);
        }
        line.strip_prefix("error ")
            .map(|message| Self::Failed(message.to_string()))
    }
}

/// How to invoke the supervisor: a program and the arguments preceding
/// `--workspace <root> -- <job_id>`
#[derive(Debug, Clone)]
pub struct SupervisorCommand {
    program: PathBuf,
    args: Vec<OsString>,
    handshake_timeout: Duration,
}

impl SupervisorCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            handshake_timeout: HANDSHAKE_TIMEOUT,
        }
    }

    /// The running executable, invoked with the `supervise` subcommand
    pub fn current_exe() -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?).arg("supervise"))
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

/// Start the supervisor for a pending job and wait for its handshake
///
/// The launcher's effective config is saved next to the record so the
/// supervisor runs the job with the same settings. Returns the pid of the
/// primary command.
pub(crate) async fn spawn_supervisor(
    supervisor: &SupervisorCommand,
    store: &JobStore,
    record: &JobRecord,
    config: &JobwatchConfig,
) -> JobResult<u32> {
    let id = record.id.clone();
    if let Err(e) = config.save(&store.job_config_path(&id)) {
        abandon_pending(store, &id, format!("cannot save job config: {}", e));
        return Err(e);
    }
    let diagnostics = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(store.supervisor_log_path(&id))?;

    let mut cmd = Command::new(&supervisor.program);
    cmd.args(&supervisor.args)
        .arg("--workspace")
        .arg(store.workspace_root())
        .arg("--")
        .arg(&id)
        .current_dir(store.workspace_root())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::from(diagnostics));
    detach_from_session(&mut cmd);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(source) => {
            abandon_pending(store, &id, format!("supervisor failed to start: {}", source));
            return Err(JobError::SpawnSupervisor { id, source });
        }
    };
    tracing::debug!(job_id = %id, supervisor_pid = ?child.id(), "Supervisor spawned");

    let stdout = child.stdout.take().ok_or_else(|| JobError::SupervisorHandshake {
        id: id.clone(),
        message: "supervisor stdout unavailable".to_string(),
    })?;
    let mut line = String::new();
    let read = tokio::time::timeout(
        supervisor.handshake_timeout,
        BufReader::new(stdout).read_line(&mut line),
    )
    .await;

    // The supervisor outlives us; dropping the handle does not kill it
    drop(child);

    match read {
        // The supervisor is still alive and may yet start the job
        Err(_) => Err(JobError::SupervisorHandshake {
            message: format!(
                "no response within {}ms; the job may still start, check `jobwatch status {}`",
                supervisor.handshake_timeout.as_millis(),
                id
            ),
            id,
        }),
        Ok(Err(e)) => Err(JobError::SupervisorHandshake {
            id,
            message: e.to_string(),
        }),
        Ok(Ok(_)) => match Handshake::parse(&line) {
            Some(Handshake::Started(pid)) => Ok(pid),
            Some(Handshake::Failed(message)) => {
                abandon_pending(store, &id, message.clone());
                Err(JobError::SpawnPrimary { id, message })
            }
            None => {
                let message = if line.is_empty() {
                    "supervisor exited before starting the job".to_string()
                } else {
                    format!("unexpected handshake '{}'", line.trim())
                };
                abandon_pending(store, &id, message.clone());
                Err(JobError::SupervisorHandshake { id, message })
            }
        },
    }
}

/// Put the supervisor in its own session so hangups and terminal signals
/// aimed at the launcher do not reach it
#[cfg(unix)]
fn detach_from_session(cmd: &mut Command) {
    // SAFETY: setsid is async-signal-safe and touches no parent state
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(windows)]
fn detach_from_session(cmd: &mut Command) {
    const DETACHED_PROCESS: u32 = 0x0000_0008;
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
    cmd.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
}

/// Mark a job failed if nobody ever picked it up
fn abandon_pending(store: &JobStore, id: &str, message: String) {
    match store.read_record(id) {
        Ok(mut record) if record.state == JobState::Pending => {
            record.mark_errored(message, Utc::now());
            if let Err(e) = store.write_record(&record) {
                tracing::warn!(job_id = %id, "Failed to record abandoned job: {}", e);
            }
        }
        Ok(_) => {}
        Err(e) => tracing::warn!(job_id = %id, "Failed to read abandoned job: {}", e),
    }
}

/// Supervisor entry point: run a pending job to completion
///
/// Writes the handshake line to stdout as soon as the primary command has
/// started (or failed to start), then keeps running until the last step ends.
pub async fn supervise(workspace_root: &Path, job_id: &str) -> JobResult<JobRecord> {
    let started: JobResult<RunningJob> = async {
        let store = JobStore::new(workspace_root);
        let job_config = store.job_config_path(job_id);
        let config = if job_config.exists() {
            JobwatchConfig::load_file(&job_config)?
        } else {
            JobwatchConfig::load(&store.root())?
        };
        let record = store.read_record(job_id)?;
        JobRunner::new(store, config, RunMode::Detached)
            .start(record)
            .await
    }
    .await;

    match started {
        Ok(running) => {
            report(&Handshake::Started(running.pid()));
            running.finish().await
        }
        Err(e) => {
            report(&Handshake::Failed(e.to_string()));
            Err(e)
        }
    }
}

fn report(handshake: &Handshake) {
    let mut stdout = std::io::stdout().lock();
    // The launcher may already have given up on us
    let _ = stdout
        .write_all(handshake.to_line().as_bytes())
        .and_then(|_| stdout.flush());
}
