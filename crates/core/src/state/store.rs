//! # Job Store
//!
//! Directory layout and record persistence for one workspace:
//!
//! ```text
//! <workspace>/.jobwatch/
//!   config.json
//!   jobs/<job_id>/job.json
//!   jobs/<job_id>/config.json
//!   jobs/<job_id>/output.log
//!   jobs/<job_id>/supervisor.log
//! ```
//!
//! Each job owns its directory. Record writes go through [`write_atomic`],
//! so readers never need a lock.

use super::io::write_atomic;
use super::record::{is_valid_label, make_job_id, parse_job_timestamp, JobRecord};
use crate::error::{JobError, JobResult, StatusError};
use chrono::{DateTime, Utc};
use std::io;
use std::path::{Path, PathBuf};

/// Store directory name inside the workspace root
pub const STORE_DIR: &str = ".jobwatch";
/// Selector resolving to the most recently created job
pub const LATEST: &str = "latest";

const JOBS_DIR: &str = "jobs";
const RECORD_FILE: &str = "job.json";
const LOG_FILE: &str = "output.log";
const SUPERVISOR_LOG_FILE: &str = "supervisor.log";
const JOB_CONFIG_FILE: &str = "config.json";

/// Upper bound on id collisions tolerated before giving up
const MAX_ID_ATTEMPTS: u32 = 1000;

/// Handle on the job store of a single workspace
#[derive(Debug, Clone)]
pub struct JobStore {
    workspace_root: PathBuf,
}

impl JobStore {
    /// Create a store handle; nothing is touched on disk
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
        }
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    /// `<workspace>/.jobwatch`
    pub fn root(&self) -> PathBuf {
        self.workspace_root.join(STORE_DIR)
    }

    pub fn jobs_dir(&self) -> PathBuf {
        self.root().join(JOBS_DIR)
    }

    pub fn job_dir(&self, id: &str) -> PathBuf {
        self.jobs_dir().join(id)
    }

    pub fn record_path(&self, id: &str) -> PathBuf {
        self.job_dir(id).join(RECORD_FILE)
    }

    pub fn log_path(&self, id: &str) -> PathBuf {
        self.job_dir(id).join(LOG_FILE)
    }

    pub fn supervisor_log_path(&self, id: &str) -> PathBuf {
        self.job_dir(id).join(SUPERVISOR_LOG_FILE)
    }

    /// Config a detached job's supervisor runs with
    pub fn job_config_path(&self, id: &str) -> PathBuf {
        self.job_dir(id).join(JOB_CONFIG_FILE)
    }

    /// Claim a fresh job id and persist its pending record
    ///
    /// The id is claimed by creating its directory, which fails if another
    /// job already holds it; on collision the next millisecond is tried.
    pub fn create_job(
        &self,
        label: &str,
        command: &str,
        follow_up_commands: Vec<String>,
    ) -> JobResult<JobRecord> {
        if !is_valid_label(label) {
            return Err(JobError::InvalidLabel {
                label: label.to_string(),
            });
        }
        let jobs_dir = self.jobs_dir();
        std::fs::create_dir_all(&jobs_dir).map_err(|source| JobError::CreateJobDir {
            path: jobs_dir.clone(),
            source,
        })?;

        let (id, created_at) = self.claim_job_dir(label)?;
        let record = JobRecord::new(
            id.clone(),
            label,
            command,
            follow_up_commands,
            self.workspace_root.clone(),
            created_at,
            self.log_path(&id),
        );
        self.write_record(&record)?;
        tracing::info!(job_id = %id, "Job record created");
        Ok(record)
    }

    fn claim_job_dir(&self, label: &str) -> JobResult<(String, DateTime<Utc>)> {
        let mut last_id = String::new();
        for _ in 0..MAX_ID_ATTEMPTS {
            let created_at = Utc::now();
            let id = make_job_id(label, created_at);
            if id == last_id {
                std::thread::sleep(std::time::Duration::from_millis(1));
                continue;
            }
            let dir = self.job_dir(&id);
            match std::fs::create_dir(&dir) {
                Ok(()) => return Ok((id, created_at)),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    tracing::debug!(job_id = %id, "Job id taken, retrying");
                    last_id = id;
                }
                Err(source) => return Err(JobError::CreateJobDir { path: dir, source }),
            }
        }
        Err(JobError::CreateJobDir {
            path: self.job_dir(&last_id),
            source: io::Error::new(io::ErrorKind::AlreadyExists, "no free job id"),
        })
    }

    /// Persist a record with an atomic replace
    pub fn write_record(&self, record: &JobRecord) -> JobResult<()> {
        record.validate().map_err(|reason| JobError::InvalidRecord {
            id: record.id.clone(),
            reason,
        })?;
        let path = self.record_path(&record.id);
        let mut payload = serde_json::to_vec_pretty(record)
            .map_err(|e| JobError::WriteRecord {
                path: path.clone(),
                source: io::Error::new(io::ErrorKind::InvalidData, e),
            })?;
        payload.push(b'\n');
        write_atomic(&path, &payload).map_err(|source| JobError::WriteRecord { path, source })
    }

    /// Load and validate a record
    pub fn read_record(&self, id: &str) -> Result<JobRecord, StatusError> {
        if !is_safe_id(id) {
            return Err(StatusError::not_found(id));
        }
        let path = self.record_path(id);
        let raw = match std::fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StatusError::not_found(id))
            }
            Err(e) => return Err(StatusError::Io(e)),
        };
        let record: JobRecord = serde_json::from_slice(&raw)
            .map_err(|e| StatusError::corrupt(id, format!("unparseable record: {}", e)))?;
        if record.id != id {
            return Err(StatusError::corrupt(
                id,
                format!("record belongs to job {}", record.id),
            ));
        }
        record
            .validate()
            .map_err(|reason| StatusError::corrupt(id, reason))?;
        Ok(record)
    }

    /// All job ids in the store, newest first
    pub fn list_ids(&self) -> io::Result<Vec<String>> {
        let dir = self.jobs_dir();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Ok(name) = entry.file_name().into_string() {
                if is_safe_id(&name) {
                    ids.push(name);
                }
            }
        }

        ids.sort_by(|a, b| {
            let key_a = (parse_job_timestamp(a), a.as_str());
            let key_b = (parse_job_timestamp(b), b.as_str());
            key_b.cmp(&key_a)
        });
        Ok(ids)
    }

    /// Most recently created job id, if any
    pub fn latest_id(&self) -> io::Result<Option<String>> {
        Ok(self.list_ids()?.into_iter().next())
    }

    /// Turn a job id or `latest` into a concrete id
    pub fn resolve(&self, selector: &str) -> Result<String, StatusError> {
        if selector == LATEST {
            self.latest_id()?
                .ok_or_else(|| StatusError::not_found(LATEST))
        } else {
            Ok(selector.to_string())
        }
    }
}

/// Ids come from user input on the read side; keep them inside the store
fn is_safe_id(id: &str) -> bool {
    !id.is_empty() && !id.starts_with('.') && !id.contains(['/', '\\'])
}
