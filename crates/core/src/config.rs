//! # Configuration
//!
//! Optional per-workspace settings read from `.jobwatch/config.json`.
//! Every field has a default, so the file only needs the overrides.

use crate::error::{JobError, JobResult};
use crate::state::io::write_atomic;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// File name of the workspace config inside the store root
pub const CONFIG_FILE: &str = "config.json";

/// Default number of log lines shown by `status`
pub const DEFAULT_TAIL_LINES: usize = 20;

/// Default log rotation threshold (64 MiB)
pub const DEFAULT_MAX_LOG_BYTES: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct JobwatchConfig {
    /// Log lines included in a status snapshot
    pub tail_lines: usize,
    /// Size at which `output.log` is rotated to `output.log.1`
    pub max_log_bytes: u64,
    /// Shell used to interpret job commands
    pub shell: String,
    /// Flag passing the command string to the shell
    pub shell_flag: String,
}

impl Default for JobwatchConfig {
    fn default() -> Self {
        let (shell, shell_flag) = if cfg!(windows) {
            ("cmd", "/C")
        } else {
            ("sh", "-c")
        };
        Self {
            tail_lines: DEFAULT_TAIL_LINES,
            max_log_bytes: DEFAULT_MAX_LOG_BYTES,
            shell: shell.to_string(),
            shell_flag: shell_flag.to_string(),
        }
    }
}

impl JobwatchConfig {
    /// Load the config from a store root, falling back to defaults when absent
    ///
    /// A file that exists but does not parse is an error.
    pub fn load(store_root: &Path) -> JobResult<Self> {
        Self::load_file(&store_root.join(CONFIG_FILE))
    }

    /// Load a config file, falling back to defaults when absent
    pub fn load_file(path: &Path) -> JobResult<Self> {
        let path = path.to_path_buf();
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(JobError::Io(e)),
        };
        let config: Self = serde_json::from_str(&content).map_err(|e| JobError::Config {
            path: path.clone(),
            message: e.to_string(),
        })?;
        if config.shell.trim().is_empty() {
            return Err(JobError::Config {
                path,
                message: "shell must not be empty".to_string(),
            });
        }
        Ok(config)
    }

    /// Write the config as JSON with an atomic replace
    pub fn save(&self, path: &Path) -> JobResult<()> {
        let payload = serde_json::to_vec_pretty(self).map_err(|e| JobError::Config {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        write_atomic(path, &payload).map_err(|e| JobError::Config {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }
}
