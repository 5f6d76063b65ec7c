//! # Jobwatch Core
//!
//! Detached job supervision with resumable, file-backed state: start a
//! command, let it outlive the session that started it, and ask about it
//! later from any process.
//!
//! ## Architecture
//!
//! - `state/` - Job records, the per-workspace job store, atomic file IO
//! - `launcher/` - Job creation, detached supervision, step execution
//! - `status` - Read-only snapshots and listings
//! - `config` - Optional per-workspace settings
//!
//! ## Usage
//!
//! ```rust,ignore
//! use jobwatch_core::launcher::{LaunchRequest, Launcher};
//! use jobwatch_core::status::StatusReader;
//!
//! let launcher = Launcher::new(Path::new("."))?;
//! let outcome = launcher
//!     .launch(LaunchRequest::new("build", "cargo build").then("cargo test").detached(true))
//!     .await?;
//!
//! let snapshot = StatusReader::new(launcher.store().clone()).status(outcome.job_id())?;
//! println!("{}", snapshot.render());
//! ```

pub mod config;
pub mod error;
pub mod launcher;
pub mod state;
pub mod status;

pub use config::JobwatchConfig;
pub use error::{JobError, JobResult, StatusError};
pub use launcher::{LaunchOutcome, LaunchRequest, Launcher};
pub use state::{JobRecord, JobState, JobStore, LATEST};
pub use status::{JobSummary, Snapshot, StatusReader};
