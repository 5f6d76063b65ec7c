//! # Job Runner
//!
//! Executes a job's steps in order and keeps its record current. The runner
//! is the single writer of a job record once the job leaves `pending`; it runs
//! either inside the launching process (foreground) or inside the detached
//! supervisor.

use super::output::{self, Echo, LogSink, SharedLog};
use crate::config::JobwatchConfig;
use crate::error::{JobError, JobResult};
use crate::state::{JobRecord, JobState, JobStore};
use chrono::Utc;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

/// How long output pumps may keep draining after a step exits
///
/// Background grandchildren can hold the pipe open indefinitely.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Where step output goes besides the job log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Log only; stdin closed
    Detached,
    /// Log plus live echo to the caller's terminal; stdin inherited
    Foreground,
}

/// Executes jobs from a store
#[derive(Debug, Clone)]
pub struct JobRunner {
    store: JobStore,
    config: JobwatchConfig,
    mode: RunMode,
}

/// A job whose current step has been spawned
pub struct RunningJob {
    runner: JobRunner,
    record: JobRecord,
    log: SharedLog,
    step: RunningStep,
}

struct RunningStep {
    child: Child,
    pumps: Vec<JoinHandle<()>>,
}

impl JobRunner {
    pub fn new(store: JobStore, config: JobwatchConfig, mode: RunMode) -> Self {
        Self {
            store,
            config,
            mode,
        }
    }

    /// Start the primary command of a pending job
    ///
    /// On success the record is `running` with the primary's pid. If the
    /// primary cannot be started the record is marked failed and the error is
    /// returned to the caller.
    pub async fn start(&self, mut record: JobRecord) -> JobResult<RunningJob> {
        if record.state != JobState::Pending {
            return Err(JobError::NotPending {
                id: record.id.clone(),
                state: record.state.to_string(),
            });
        }

        let sink = match LogSink::open(&record.log_path, self.config.max_log_bytes) {
            Ok(sink) => sink,
            Err(e) => {
                let message = format!("cannot open log {}: {}", record.log_path.display(), e);
                return Err(self.fail_pending(record, message));
            }
        };
        let log = output::shared(sink);
        write_marker(&log, &format!("step 0: {}", record.command));

        let step = match self.spawn_step(&record.command, &record.working_directory, &log) {
            Ok(step) => step,
            Err(e) => {
                write_marker(&log, &format!("step 0 failed to start: {}", e));
                return Err(self.fail_pending(record, e.to_string()));
            }
        };

        // `id()` is only None after the child has been reaped
        let pid = step.child.id().unwrap_or_default();
        record.mark_running(0, pid, Utc::now());
        if let Err(e) = self.store.write_record(&record) {
            step.abandon().await;
            write_marker(&log, &format!("step 0 killed: {}", e));
            record.mark_errored(format!("cannot record start: {}", e), Utc::now());
            if let Err(retry) = self.store.write_record(&record) {
                tracing::warn!(job_id = %record.id, "Failed to record start failure: {}", retry);
            }
            return Err(e);
        }
        tracing::info!(job_id = %record.id, pid, "Job started");

        Ok(RunningJob {
            runner: self.clone(),
            record,
            log,
            step,
        })
    }

    fn fail_pending(&self, mut record: JobRecord, message: String) -> JobError {
        record.mark_errored(message.clone(), Utc::now());
        if let Err(e) = self.store.write_record(&record) {
            tracing::warn!(job_id = %record.id, "Failed to record start failure: {}", e);
        }
        JobError::SpawnPrimary {
            id: record.id,
            message,
        }
    }

    fn spawn_step(
        &self,
        command: &str,
        working_directory: &Path,
        log: &SharedLog,
    ) -> std::io::Result<RunningStep> {
        let mut cmd = Command::new(&self.config.shell);
        cmd.arg(&self.config.shell_flag)
            .arg(command)
            .current_dir(working_directory)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        match self.mode {
            RunMode::Detached => cmd.stdin(Stdio::null()),
            RunMode::Foreground => cmd.stdin(Stdio::inherit()),
        };

        let mut child = cmd.spawn()?;
        let (out_echo, err_echo) = match self.mode {
            RunMode::Detached => (Echo::None, Echo::None),
            RunMode::Foreground => (Echo::Stdout, Echo::Stderr),
        };

        let mut pumps = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            pumps.push(tokio::spawn(output::pump(stdout, log.clone(), out_echo)));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(tokio::spawn(output::pump(stderr, log.clone(), err_echo)));
        }
        Ok(RunningStep { child, pumps })
    }
}

impl RunningJob {
    pub fn id(&self) -> &str {
        &self.record.id
    }

    /// Pid of the step currently running
    pub fn pid(&self) -> u32 {
        self.record.pid.unwrap_or_default()
    }

    /// Run the job to completion and write its terminal record
    ///
    /// Follow-ups only run after a zero exit and stop at the first failure.
    pub async fn finish(self) -> JobResult<JobRecord> {
        let RunningJob {
            runner,
            mut record,
            log,
            mut step,
        } = self;
        let total = record.steps_total();
        let mut index = 0;

        loop {
            let status = step.wait().await;
            record.steps_completed += 1;

            let code = match status {
                Ok(status) => exit_code(status),
                Err(e) => {
                    let message = format!("lost track of step {}: {}", index, e);
                    write_marker(&log, &message);
                    record.mark_errored(message, Utc::now());
                    break;
                }
            };
            write_marker(&log, &format!("step {} exited with {}", index, code));
            tracing::info!(job_id = %record.id, step = index, exit_code = code, "Step finished");

            if code != 0 || index + 1 == total {
                record.mark_finished(Some(code), Utc::now());
                break;
            }

            index += 1;
            let command = match record.step_command(index) {
                Some(command) => command.to_string(),
                None => {
                    record.mark_finished(Some(code), Utc::now());
                    break;
                }
            };
            write_marker(&log, &format!("step {}: {}", index, command));
            match runner.spawn_step(&command, &record.working_directory, &log) {
                Ok(next) => {
                    step = next;
                    let pid = step.child.id().unwrap_or_default();
                    record.mark_running(index, pid, Utc::now());
                    if let Err(e) = runner.store.write_record(&record) {
                        tracing::warn!(job_id = %record.id, "Failed to record step start: {}", e);
                    }
                }
                Err(e) => {
                    let message = format!("step {} failed to start: {}", index, e);
                    write_marker(&log, &message);
                    record.mark_errored(message, Utc::now());
                    break;
                }
            }
        }

        runner.store.write_record(&record)?;
        tracing::info!(
            job_id = %record.id,
            state = %record.state,
            exit_code = ?record.exit_code,
            "Job finished"
        );
        Ok(record)
    }
}

impl RunningStep {
    async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        let status = self.child.wait().await;
        for pump in self.pumps.drain(..) {
            let abort = pump.abort_handle();
            if tokio::time::timeout(DRAIN_GRACE, pump).await.is_err() {
                abort.abort();
            }
        }
        status
    }

    /// Kill the step and reap it
    async fn abandon(mut self) {
        if let Err(e) = self.child.kill().await {
            tracing::warn!("Failed to kill step: {}", e);
        }
        for pump in self.pumps {
            pump.abort();
        }
    }
}

fn write_marker(log: &SharedLog, message: &str) {
    if let Err(e) = output::lock(log).marker(message) {
        tracing::warn!("Failed to write job log marker: {}", e);
    }
}

/// Exit code of a finished step; a signal death maps to the negative signal
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    -1
}
