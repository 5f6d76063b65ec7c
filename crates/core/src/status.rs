//! # Status Reader
//!
//! Point-in-time views of jobs, built only from the persisted record and log.
//! Nothing here writes to the store or looks at the OS process table; a pid
//! in a record may already belong to an unrelated process.

use crate::config::DEFAULT_TAIL_LINES;
use crate::error::StatusError;
use crate::state::io::tail_log;
use crate::state::{JobRecord, JobState, JobStore};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::time::Duration;

/// Snapshot of one job
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Snapshot {
    pub job_id: String,
    pub label: String,
    pub state: JobState,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub pid: Option<u32>,
    pub current_step: Option<usize>,
    pub steps_completed: usize,
    pub steps_total: usize,
    pub command: String,
    pub follow_up_commands: Vec<String>,
    pub working_directory: PathBuf,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub elapsed_ms: u64,
    pub log_path: PathBuf,
    pub log_tail: Vec<String>,
}

impl Snapshot {
    fn from_record(record: JobRecord, log_tail: Vec<String>, now: DateTime<Utc>) -> Self {
        let elapsed_ms = elapsed(&record, now).as_millis() as u64;
        Self {
            steps_total: record.steps_total(),
            job_id: record.id,
            label: record.label,
            state: record.state,
            exit_code: record.exit_code,
            error: record.error,
            pid: record.pid,
            current_step: record.current_step,
            steps_completed: record.steps_completed,
            command: record.command,
            follow_up_commands: record.follow_up_commands,
            working_directory: record.working_directory,
            created_at: record.created_at,
            started_at: record.started_at,
            ended_at: record.ended_at,
            elapsed_ms,
            log_path: record.log_path,
            log_tail,
        }
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms)
    }

    /// Human-readable summary
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Job:      {}", self.job_id);
        let _ = writeln!(out, "State:    {}", describe_state(self));
        let _ = writeln!(out, "Command:  {}", self.command);
        for (i, command) in self.follow_up_commands.iter().enumerate() {
            let _ = writeln!(out, "Then {}:   {}", i + 1, command);
        }
        if self.state == JobState::Running {
            if let Some(step) = self.current_step {
                let _ = writeln!(out, "Step:     {} of {}", step + 1, self.steps_total);
            }
        }
        if let Some(error) = &self.error {
            let _ = writeln!(out, "Error:    {}", error);
        }
        if let Some(started) = self.started_at {
            let _ = writeln!(out, "Started:  {}", started.format("%Y-%m-%d %H:%M:%S UTC"));
        }
        if let Some(ended) = self.ended_at {
            let _ = writeln!(out, "Ended:    {}", ended.format("%Y-%m-%d %H:%M:%S UTC"));
        }
        let _ = writeln!(out, "Elapsed:  {}", format_elapsed(self.elapsed()));
        let _ = writeln!(out, "Log:      {}", self.log_path.display());
        if !self.log_tail.is_empty() {
            let _ = writeln!(out, "--- last {} log lines ---", self.log_tail.len());
            for line in &self.log_tail {
                let _ = writeln!(out, "{}", line);
            }
        }
        out
    }
}

fn describe_state(snapshot: &Snapshot) -> String {
    match (snapshot.state, snapshot.exit_code) {
        (JobState::Running, _) => match snapshot.pid {
            Some(pid) => format!("running (pid {})", pid),
            None => "running".to_string(),
        },
        (state, Some(code)) if code < 0 => format!("{} (killed by signal {})", state, -code),
        (state, Some(code)) => format!("{} (exit {})", state, code),
        (state, None) => state.to_string(),
    }
}

/// One row of a job listing
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct JobSummary {
    pub job_id: String,
    /// None when the record is missing or corrupt
    pub state: Option<JobState>,
    pub exit_code: Option<i32>,
    pub elapsed_ms: Option<u64>,
    pub command: Option<String>,
    /// Why the record could not be read
    pub problem: Option<String>,
}

/// Reads job state from a store
#[derive(Debug, Clone)]
pub struct StatusReader {
    store: JobStore,
    tail_lines: usize,
}

impl StatusReader {
    pub fn new(store: JobStore) -> Self {
        Self {
            store,
            tail_lines: DEFAULT_TAIL_LINES,
        }
    }

    pub fn with_tail_lines(mut self, tail_lines: usize) -> Self {
        self.tail_lines = tail_lines;
        self
    }

    /// Snapshot of a job id or `latest`
    pub fn status(&self, selector: &str) -> Result<Snapshot, StatusError> {
        self.status_at(selector, Utc::now())
    }

    /// Snapshot with an explicit notion of "now"
    pub fn status_at(&self, selector: &str, now: DateTime<Utc>) -> Result<Snapshot, StatusError> {
        let id = self.store.resolve(selector)?;
        let record = self.store.read_record(&id)?;
        let log_tail = tail_log(&record.log_path, self.tail_lines)?;
        Ok(Snapshot::from_record(record, log_tail, now))
    }

    /// Every job in the store, newest first
    ///
    /// Unreadable records are listed with a `problem` instead of failing the
    /// whole listing.
    pub fn list(&self) -> Result<Vec<JobSummary>, StatusError> {
        let now = Utc::now();
        let mut summaries = Vec::new();
        for id in self.store.list_ids()? {
            let summary = match self.store.read_record(&id) {
                Ok(record) => JobSummary {
                    elapsed_ms: Some(elapsed(&record, now).as_millis() as u64),
                    state: Some(record.state),
                    exit_code: record.exit_code,
                    command: Some(record.command),
                    job_id: record.id,
                    problem: None,
                },
                Err(e) => JobSummary {
                    job_id: id,
                    state: None,
                    exit_code: None,
                    elapsed_ms: None,
                    command: None,
                    problem: Some(match e {
                        StatusError::NotFound { .. } => "record not written yet".to_string(),
                        other => other.to_string(),
                    }),
                },
            };
            summaries.push(summary);
        }
        Ok(summaries)
    }

    /// Poll until the job reaches a terminal state
    ///
    /// Returns `Ok(None)` if `timeout` passes first. A job whose directory
    /// exists but whose record is not written yet is waited on; an unknown
    /// job is `NotFound` immediately.
    pub async fn wait(
        &self,
        selector: &str,
        poll: Duration,
        timeout: Option<Duration>,
    ) -> Result<Option<Snapshot>, StatusError> {
        let id = self.store.resolve(selector)?;
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            match self.status(&id) {
                Ok(snapshot) if snapshot.state.is_terminal() => return Ok(Some(snapshot)),
                Ok(_) => {}
                Err(StatusError::NotFound { .. }) if self.store.job_dir(&id).is_dir() => {}
                Err(e) => return Err(e),
            }
            if let Some(deadline) = deadline {
                if tokio::time::Instant::now() >= deadline {
                    return Ok(None);
                }
            }
            tokio::time::sleep(poll).await;
        }
    }
}

/// Status of a single job with an explicit tail size
pub fn status(store: &JobStore, selector: &str, tail_lines: usize) -> Result<Snapshot, StatusError> {
    StatusReader::new(store.clone())
        .with_tail_lines(tail_lines)
        .status(selector)
}

fn elapsed(record: &JobRecord, now: DateTime<Utc>) -> Duration {
    let Some(started) = record.started_at else {
        return Duration::ZERO;
    };
    let end = if record.state == JobState::Running {
        now
    } else {
        record.ended_at.unwrap_or(now)
    };
    (end - started).to_std().unwrap_or_default()
}

/// `850ms`, `12.3s`, `4m05s`, `2h03m`
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    if secs == 0 {
        format!("{}ms", elapsed.as_millis())
    } else if secs < 60 {
        format!("{:.1}s", elapsed.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60)
    }
}
