//! # Launcher
//!
//! Creates a job record and starts the job, either detached (handed to a
//! supervisor process, returns immediately) or in the foreground (runs in
//! this process, streams output, returns the finished record).
//!
//! ## Modules
//!
//! - `runner` - Step execution and record updates
//! - `detach` - Supervisor spawn, session detachment and handshake
//! - `output` - Job log capture and rotation

pub mod detach;
pub mod output;
pub mod runner;

pub use detach::{supervise, Handshake, SupervisorCommand};
pub use runner::{JobRunner, RunMode, RunningJob};

use crate::config::JobwatchConfig;
use crate::error::{JobError, JobResult};
use crate::state::store::STORE_DIR;
use crate::state::{JobRecord, JobStore};
use std::path::{Path, PathBuf};

/// What to run
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    /// Short token used as the job id prefix
    pub label: String,
    /// Primary shell command
    pub command: String,
    /// Run in order after the primary command succeeds
    pub follow_up_commands: Vec<String>,
    /// Return right after hand-off instead of waiting for completion
    pub detach: bool,
}

impl LaunchRequest {
    pub fn new(label: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            command: command.into(),
            follow_up_commands: Vec::new(),
            detach: false,
        }
    }

    pub fn then(mut self, command: impl Into<String>) -> Self {
        self.follow_up_commands.push(command.into());
        self
    }

    pub fn detached(mut self, detach: bool) -> Self {
        self.detach = detach;
        self
    }
}

/// Result of a successful launch
#[derive(Debug, Clone)]
pub enum LaunchOutcome {
    /// Handed off to a supervisor; the primary command is running
    Detached { job_id: String, pid: u32 },
    /// Ran in the foreground to a terminal state
    Finished(JobRecord),
}

impl LaunchOutcome {
    pub fn job_id(&self) -> &str {
        match self {
            Self::Detached { job_id, .. } => job_id,
            Self::Finished(record) => &record.id,
        }
    }
}

/// Launches jobs into one workspace
#[derive(Debug, Clone)]
pub struct Launcher {
    store: JobStore,
    config: JobwatchConfig,
    supervisor: Option<SupervisorCommand>,
}

impl Launcher {
    /// Open a launcher for a workspace root, loading its config
    ///
    /// The root must be an existing directory; it is canonicalized so job
    /// records carry an absolute working directory.
    pub fn new(workspace_root: &Path) -> JobResult<Self> {
        let root = resolve_workspace(workspace_root)?;
        let store = JobStore::new(root);
        let config = JobwatchConfig::load(&store.root())?;
        Ok(Self {
            store,
            config,
            supervisor: None,
        })
    }

    /// Replace the loaded config
    pub fn with_config(mut self, config: JobwatchConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a specific supervisor instead of re-executing the current binary
    pub fn with_supervisor(mut self, supervisor: SupervisorCommand) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Create the job and start it
    pub async fn launch(&self, request: LaunchRequest) -> JobResult<LaunchOutcome> {
        validate_commands(&request)?;
        let record = self.store.create_job(
            &request.label,
            &request.command,
            request.follow_up_commands.clone(),
        )?;

        if request.detach {
            let supervisor = match &self.supervisor {
                Some(supervisor) => supervisor.clone(),
                None => SupervisorCommand::current_exe()?,
            };
            let pid =
                detach::spawn_supervisor(&supervisor, &self.store, &record, &self.config).await?;
            tracing::info!(job_id = %record.id, pid, "Job detached");
            return Ok(LaunchOutcome::Detached {
                job_id: record.id,
                pid,
            });
        }

        let runner = JobRunner::new(self.store.clone(), self.config.clone(), RunMode::Foreground);
        let running = runner.start(record).await?;
        let interrupts = tokio::spawn(outlive_interrupts(running.id().to_string()));
        let finished = running.finish().await;
        interrupts.abort();
        Ok(LaunchOutcome::Finished(finished?))
    }
}

/// Check that the workspace root exists and is a directory
pub fn resolve_workspace(path: &Path) -> JobResult<PathBuf> {
    let metadata = match std::fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(JobError::WorkspaceNotFound {
                path: path.to_path_buf(),
            })
        }
        Err(e) => return Err(JobError::Io(e)),
    };
    if !metadata.is_dir() {
        return Err(JobError::WorkspaceNotDirectory {
            path: path.to_path_buf(),
        });
    }
    Ok(path.canonicalize()?)
}

/// Find the workspace root for a directory inside it
///
/// The nearest ancestor holding a job store wins, then the top of the
/// enclosing git work tree, then `start` itself.
pub fn discover_workspace(start: &Path) -> PathBuf {
    if let Some(found) = start.ancestors().find(|dir| dir.join(STORE_DIR).is_dir()) {
        return found.to_path_buf();
    }
    match git2::Repository::discover(start) {
        Ok(repo) => {
            if let Some(workdir) = repo.workdir() {
                return workdir.to_path_buf();
            }
        }
        Err(e) => tracing::debug!(start = %start.display(), "No git work tree: {}", e.message()),
    }
    start.to_path_buf()
}

fn validate_commands(request: &LaunchRequest) -> JobResult<()> {
    if request.command.trim().is_empty()
        || request
            .follow_up_commands
            .iter()
            .any(|command| command.trim().is_empty())
    {
        return Err(JobError::EmptyCommand);
    }
    Ok(())
}

/// Keep the foreground launcher alive through Ctrl-C
///
/// The interrupt also reaches the child through the shared process group;
/// staying alive lets the runner record the resulting failure.
async fn outlive_interrupts(job_id: String) {
    while tokio::signal::ctrl_c().await.is_ok() {
        tracing::warn!(job_id = %job_id, "Interrupt received, waiting for the job to exit");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::JobState;

    #[test]
    fn test_missing_workspace_is_setup_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Launcher::new(&dir.path().join("absent")).unwrap_err();
        assert!(matches!(err, JobError::WorkspaceNotFound { .. }));

        let file = dir.path().join("file.txt");
        std::fs::write(&file, "x").unwrap();
        let err = Launcher::new(&file).unwrap_err();
        assert!(matches!(err, JobError::WorkspaceNotDirectory { .. }));
    }

    #[test]
    fn test_discover_prefers_existing_store() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(STORE_DIR)).unwrap();
        let nested = dir.path().join("src").join("deep");
        std::fs::create_dir_all(&nested).unwrap();

        assert_eq!(discover_workspace(&nested), dir.path());
    }

    #[test]
    fn test_discover_falls_back_to_git_work_tree() {
        let dir = tempfile::tempdir().unwrap();
        git2::Repository::init(dir.path()).unwrap();
        let nested = dir.path().join("src");
        std::fs::create_dir_all(&nested).unwrap();

        let found = discover_workspace(&nested);
        assert_eq!(
            found.canonicalize().unwrap(),
            dir.path().canonicalize().unwrap()
        );
    }

    #[test]
    fn test_discover_without_store_or_repo_is_start() {
        let dir = tempfile::tempdir().unwrap();
        if git2::Repository::discover(dir.path()).is_ok() {
            return;
        }
        assert_eq!(discover_workspace(dir.path()), dir.path());
    }

    #[tokio::test]
    async fn test_empty_command_creates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Launcher::new(dir.path()).unwrap();

        let err = launcher
            .launch(LaunchRequest::new("build", "   "))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::EmptyCommand));

        let err = launcher
            .launch(LaunchRequest::new("build", "true").then(""))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::EmptyCommand));
        assert!(launcher.store().list_ids().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_detached_launch_without_supervisor_fails_synchronously() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Launcher::new(dir.path())
            .unwrap()
            .with_supervisor(SupervisorCommand::new("/definitely/not/jobwatch"));

        let err = launcher
            .launch(LaunchRequest::new("build", "true").detached(true))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::SpawnSupervisor { .. }));

        let id = launcher.store().latest_id().unwrap().unwrap();
        let record = launcher.store().read_record(&id).unwrap();
        assert_eq!(record.state, JobState::Failed);
        assert!(record.error.is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_detached_launch_hands_config_to_supervisor() {
        let dir = tempfile::tempdir().unwrap();
        let config = JobwatchConfig {
            max_log_bytes: 4096,
            shell: "/definitely/not/a/shell".to_string(),
            ..JobwatchConfig::default()
        };
        let launcher = Launcher::new(dir.path())
            .unwrap()
            .with_config(config.clone())
            .with_supervisor(SupervisorCommand::new("true"));

        launcher
            .launch(LaunchRequest::new("build", "echo hi").detached(true))
            .await
            .unwrap_err();

        let id = launcher.store().latest_id().unwrap().unwrap();
        let saved = JobwatchConfig::load_file(&launcher.store().job_config_path(&id)).unwrap();
        assert_eq!(saved, config);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_foreground_launch_runs_to_completion() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Launcher::new(dir.path()).unwrap();

        let outcome = launcher
            .launch(LaunchRequest::new("build", "echo hi"))
            .await
            .unwrap();

        let LaunchOutcome::Finished(record) = outcome else {
            panic!("foreground launch should finish");
        };
        assert!(record.id.starts_with("build_"));
        assert_eq!(record.state, JobState::Succeeded);
        assert_eq!(record.exit_code, Some(0));
        assert_eq!(
            record.working_directory,
            dir.path().canonicalize().unwrap()
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_foreground_failure_is_recorded_not_raised() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Launcher::new(dir.path()).unwrap();

        let outcome = launcher
            .launch(LaunchRequest::new("build", "exit 3").then("echo should-not-run"))
            .await
            .unwrap();

        let LaunchOutcome::Finished(record) = outcome else {
            panic!("foreground launch should finish");
        };
        assert_eq!(record.state, JobState::Failed);
        assert_eq!(record.exit_code, Some(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_small_log_cap_rotates_output() {
        let dir = tempfile::tempdir().unwrap();
        let config = JobwatchConfig {
            max_log_bytes: 64,
            ..JobwatchConfig::default()
        };
        let launcher = Launcher::new(dir.path()).unwrap().with_config(config);

        let outcome = launcher
            .launch(LaunchRequest::new("chatty", "echo first").then("echo second"))
            .await
            .unwrap();

        let LaunchOutcome::Finished(record) = outcome else {
            panic!("foreground launch should finish");
        };
        assert_eq!(record.state, JobState::Succeeded);
        let rotated = crate::state::io::rotated_log_path(&record.log_path);
        assert!(rotated.exists());
        assert!(std::fs::metadata(&record.log_path).unwrap().len() <= 64);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_jobs_run_in_workspace_root() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Launcher::new(dir.path()).unwrap();

        launcher
            .launch(LaunchRequest::new("touch", "touch marker.txt"))
            .await
            .unwrap();
        assert!(dir.path().join("marker.txt").exists());
    }
}
