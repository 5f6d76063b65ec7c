//! # Errors
//!
//! `JobError` covers everything that can go wrong before a job's primary
//! command is running. Failures after that point are recorded in the job
//! record, not returned. `StatusError` covers the read side.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for launcher operations
pub type JobResult<T> = Result<T, JobError>;

/// Setup failures surfaced synchronously by `launch`
#[derive(Debug, Error)]
pub enum JobError {
    /// Label is empty or contains characters unsafe for a directory name
    #[error("Invalid job label '{label}': use letters, digits, '.', '_' or '-' (not starting with '.')")]
    InvalidLabel { label: String },

    /// Primary command is empty or whitespace
    #[error("Job command must not be empty")]
    EmptyCommand,

    /// Workspace root does not exist
    #[error("Workspace root not found: {path}")]
    WorkspaceNotFound { path: PathBuf },

    /// Workspace root exists but is not a directory
    #[error("Workspace root is not a directory: {path}")]
    WorkspaceNotDirectory { path: PathBuf },

    /// The job directory could not be created
    #[error("Failed to create job directory {path}: {source}")]
    CreateJobDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The job record could not be written
    #[error("Failed to write job record {path}: {source}")]
    WriteRecord {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The job record could not be read back by the supervisor
    #[error("Failed to load job record: {0}")]
    LoadRecord(#[from] StatusError),

    /// A record was about to be persisted in an inconsistent state
    #[error("Refusing to write inconsistent job record {id}: {reason}")]
    InvalidRecord { id: String, reason: String },

    /// The job is not in the state required for the requested transition
    #[error("Job {id} is {state}, expected pending")]
    NotPending { id: String, state: String },

    /// The primary command could not be started
    #[error("Failed to start primary command for job {id}: {message}")]
    SpawnPrimary { id: String, message: String },

    /// The detached supervisor process could not be started
    #[error("Failed to start supervisor for job {id}: {source}")]
    SpawnSupervisor {
        id: String,
        #[source]
        source: std::io::Error,
    },

    /// The supervisor did not confirm that the primary command started
    #[error("Supervisor for job {id} did not report a start: {message}")]
    SupervisorHandshake { id: String, message: String },

    /// Configuration file is present but unusable
    #[error("Invalid configuration at {path}: {message}")]
    Config { path: PathBuf, message: String },

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors reported by the status reader
#[derive(Debug, Error)]
pub enum StatusError {
    /// No job matches the selector, or its record has not been written yet
    #[error("Job not found: {selector}")]
    NotFound { selector: String },

    /// The persisted record exists but cannot be trusted
    #[error("Corrupt job record for {id}: {reason}")]
    CorruptRecord { id: String, reason: String },

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StatusError {
    pub(crate) fn not_found(selector: impl Into<String>) -> Self {
        Self::NotFound {
            selector: selector.into(),
        }
    }

    pub(crate) fn corrupt(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CorruptRecord {
            id: id.into(),
            reason: reason.into(),
        }
    }
}
