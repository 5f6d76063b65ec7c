//! # Job Record
//!
//! The persisted description of one job. The record is the only channel
//! between the process that runs a job and any process that asks about it,
//! so it carries everything a reader needs and validates its own invariants.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Current on-disk schema version
pub const RECORD_SCHEMA_VERSION: u32 = 1;

/// Timestamp suffix appended to the label to form a job id
const ID_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Length of `YYYYMMDD_HHMMSS_mmm`
const ID_TIMESTAMP_LEN: usize = 19;

/// Lifecycle state of a job
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Record written, primary command not started yet
    #[default]
    Pending,
    /// A step is executing
    Running,
    /// Primary and every follow-up exited 0
    Succeeded,
    /// Some step exited non-zero, was killed, or never started
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A job as persisted in `job.json`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRecord {
    pub schema_version: u32,
    /// `{label}_{YYYYMMDD_HHMMSS_mmm}`, assigned once
    pub id: String,
    pub label: String,
    /// Primary shell command
    pub command: String,
    /// Commands run in order after the primary command succeeds
    #[serde(default)]
    pub follow_up_commands: Vec<String>,
    pub working_directory: PathBuf,
    pub state: JobState,
    /// OS pid of the step currently executing; only set while running
    #[serde(default)]
    pub pid: Option<u32>,
    /// 0 for the primary command, n for the n-th follow-up
    #[serde(default)]
    pub current_step: Option<usize>,
    /// Number of steps that have exited so far
    #[serde(default)]
    pub steps_completed: usize,
    /// Exit code of the terminating step; negative signal number if killed
    #[serde(default)]
    pub exit_code: Option<i32>,
    /// Why a step could not be started or waited on
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    pub log_path: PathBuf,
}

impl JobRecord {
    /// Create a pending record
    pub fn new(
        id: String,
        label: &str,
        command: &str,
        follow_up_commands: Vec<String>,
        working_directory: PathBuf,
        created_at: DateTime<Utc>,
        log_path: PathBuf,
    ) -> Self {
        Self {
            schema_version: RECORD_SCHEMA_VERSION,
            id,
            label: label.to_string(),
            command: command.to_string(),
            follow_up_commands,
            working_directory,
            state: JobState::Pending,
            pid: None,
            current_step: None,
            steps_completed: 0,
            exit_code: None,
            error: None,
            created_at,
            started_at: None,
            ended_at: None,
            log_path,
        }
    }

    /// Primary command plus follow-ups
    pub fn steps_total(&self) -> usize {
        1 + self.follow_up_commands.len()
    }

    /// Command for a step index (0 = primary)
    pub fn step_command(&self, step: usize) -> Option<&str> {
        if step == 0 {
            Some(self.command.as_str())
        } else {
            self.follow_up_commands.get(step - 1).map(String::as_str)
        }
    }

    /// Move into `running` for the given step
    pub fn mark_running(&mut self, step: usize, pid: u32, now: DateTime<Utc>) {
        self.state = JobState::Running;
        self.pid = Some(pid);
        self.current_step = Some(step);
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
    }

    /// Apply the terminal update: state, exit code, end time and cleared pid
    pub fn mark_finished(&mut self, exit_code: Option<i32>, now: DateTime<Utc>) {
        self.state = if exit_code == Some(0) && self.steps_completed == self.steps_total() {
            JobState::Succeeded
        } else {
            JobState::Failed
        };
        self.exit_code = exit_code;
        self.ended_at = Some(now);
        self.pid = None;
        self.current_step = None;
    }

    /// Terminal failure without an exit code: a step never started or was lost
    pub fn mark_errored(&mut self, message: String, now: DateTime<Utc>) {
        self.error = Some(message);
        self.state = JobState::Failed;
        self.exit_code = None;
        self.ended_at = Some(now);
        self.pid = None;
        self.current_step = None;
    }

    /// Check the cross-field invariants of the record
    pub fn validate(&self) -> Result<(), String> {
        if self.schema_version != RECORD_SCHEMA_VERSION {
            return Err(format!(
                "unsupported schema version {} (expected {})",
                self.schema_version, RECORD_SCHEMA_VERSION
            ));
        }
        if self.command.trim().is_empty() {
            return Err("empty command".to_string());
        }
        match self.state {
            JobState::Pending => {
                if self.pid.is_some() || self.started_at.is_some() || self.ended_at.is_some() {
                    return Err("pending job has runtime fields set".to_string());
                }
            }
            JobState::Running => {
                if self.pid.is_none() {
                    return Err("running job has no pid".to_string());
                }
                if self.started_at.is_none() {
                    return Err("running job has no start time".to_string());
                }
                if self.ended_at.is_some() {
                    return Err("running job has an end time".to_string());
                }
            }
            JobState::Succeeded | JobState::Failed => {
                if self.ended_at.is_none() {
                    return Err(format!("{} job has no end time", self.state));
                }
                if self.pid.is_some() {
                    return Err(format!("{} job still has a pid", self.state));
                }
            }
        }
        if self.state == JobState::Succeeded && self.exit_code != Some(0) {
            return Err("succeeded job has a non-zero exit code".to_string());
        }
        Ok(())
    }
}

/// Build a job id from a label and creation time
pub fn make_job_id(label: &str, created_at: DateTime<Utc>) -> String {
    format!(
        "{}_{}_{:03}",
        label,
        created_at.format(ID_TIMESTAMP_FORMAT),
        created_at.timestamp_subsec_millis().min(999)
    )
}

/// Recover the creation timestamp encoded in a job id
pub fn parse_job_timestamp(id: &str) -> Option<DateTime<Utc>> {
    if id.len() <= ID_TIMESTAMP_LEN + 1 || !id.is_char_boundary(id.len() - ID_TIMESTAMP_LEN) {
        return None;
    }
    let (head, suffix) = id.split_at(id.len() - ID_TIMESTAMP_LEN);
    if !head.ends_with('_') || !suffix.is_ascii() {
        return None;
    }
    let (seconds, millis) = suffix.split_at(15);
    let millis = millis.strip_prefix('_')?;
    if millis.len() != 3 {
        return None;
    }
    let millis: i64 = millis.parse().ok()?;
    let naive = NaiveDateTime::parse_from_str(seconds, ID_TIMESTAMP_FORMAT).ok()?;
    Some(Utc.from_utc_datetime(&naive) + chrono::Duration::milliseconds(millis))
}

/// Labels become directory names, so keep them to a portable character set
pub fn is_valid_label(label: &str) -> bool {
    !label.is_empty()
        && label.len() <= 64
        && !label.starts_with('.')
        && label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample(state: JobState) -> JobRecord {
        let created = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let mut record = JobRecord::new(
            make_job_id("build", created),
            "build",
            "echo hi",
            vec!["echo a".to_string()],
            PathBuf::from("/tmp/ws"),
            created,
            PathBuf::from("/tmp/ws/.jobwatch/jobs/x/output.log"),
        );
        record.state = state;
        record
    }

    #[test]
    fn test_job_state_serialization() {
        let json = serde_json::to_string(&JobState::Succeeded).unwrap();
        assert_eq!(json, "\"succeeded\"");
        assert!(JobState::Failed.is_terminal());
        assert!(!JobState::Running.is_terminal());
    }

    #[test]
    fn test_job_id_round_trips_timestamp() {
        let created = Utc.with_ymd_and_hms(2026, 10, 18, 9, 5, 7).unwrap()
            + chrono::Duration::milliseconds(42);
        let id = make_job_id("nightly_build", created);
        assert_eq!(id, "nightly_build_20261018_090507_042");
        assert_eq!(parse_job_timestamp(&id), Some(created));
    }

    #[test]
    fn test_parse_job_timestamp_rejects_garbage() {
        assert_eq!(parse_job_timestamp("build"), None);
        assert_eq!(parse_job_timestamp("build_2026xx18_090507_042"), None);
        assert_eq!(parse_job_timestamp("_20261018_090507_042"), None);
    }

    #[test]
    fn test_label_validation() {
        assert!(is_valid_label("build"));
        assert!(is_valid_label("train-v2.1_gpu"));
        assert!(!is_valid_label(""));
        assert!(!is_valid_label(".hidden"));
        assert!(!is_valid_label("a/b"));
        assert!(!is_valid_label("with space"));
    }

    #[test]
    fn test_running_requires_pid() {
        let mut record = sample(JobState::Running);
        record.started_at = Some(record.created_at);
        assert!(record.validate().is_err());
        record.pid = Some(42);
        assert!(record.validate().is_ok());
    }

    #[test]
    fn test_terminal_requires_end_and_no_pid() {
        let mut record = sample(JobState::Running);
        record.mark_running(0, 7, record.created_at);
        record.steps_completed = 2;
        record.mark_finished(Some(0), record.created_at);
        assert_eq!(record.state, JobState::Succeeded);
        assert_eq!(record.pid, None);
        assert!(record.validate().is_ok());

        record.ended_at = None;
        assert!(record.validate().is_err());
    }

    #[test]
    fn test_finish_before_all_steps_is_failure() {
        let mut record = sample(JobState::Pending);
        record.mark_running(0, 7, record.created_at);
        record.steps_completed = 1;
        record.mark_finished(Some(0), record.created_at);
        assert_eq!(record.state, JobState::Failed);
    }

    #[test]
    fn test_step_command_indexing() {
        let record = sample(JobState::Pending);
        assert_eq!(record.step_command(0), Some("echo hi"));
        assert_eq!(record.step_command(1), Some("echo a"));
        assert_eq!(record.step_command(2), None);
        assert_eq!(record.steps_total(), 2);
    }
}
