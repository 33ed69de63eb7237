//! Stale-job recovery
//!
//! Jobs left `running` by a supervisor that went away are closed out as
//! `incomplete` at startup. Each close-out runs in isolation so that one
//! broken job cannot stop the scan.

use anyhow::{Context, Result};
use async_trait::async_trait;
use cadence_core::{JobId, JobState};
use cadence_store::JobService;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, error, info};

/// Runs the close-out of one stale job
#[async_trait]
pub trait RecoveryInvoker: Send + Sync {
    /// Closes out the job as `incomplete`
    async fn mark_incomplete(&self, id: JobId) -> Result<()>;
}

/// Runs the close-out on its own tokio task
///
/// A panic inside the close-out surfaces as an error instead of taking the
/// supervisor down.
#[derive(Clone)]
pub struct TaskRecoveryInvoker {
    service: JobService,
}

impl TaskRecoveryInvoker {
    pub fn new(service: JobService) -> Self {
        Self { service }
    }
}

#[async_trait]
impl RecoveryInvoker for TaskRecoveryInvoker {
    async fn mark_incomplete(&self, id: JobId) -> Result<()> {
        let service = self.service.clone();
        let report = tokio::spawn(async move { service.mark_incomplete(id).await })
            .await
            .with_context(|| format!("Recovery task for job {} panicked", id))?
            .with_context(|| format!("Failed to mark job {} as incomplete", id))?;

        debug!(job_id = %id, visited = report.visited.len(), "Recovered job");
        Ok(())
    }
}

/// Re-executes a binary as `<program> mark-incomplete <id>`
///
/// The child gets its own process, runtime and store connection.
#[derive(Debug, Clone)]
pub struct ProcessRecoveryInvoker {
    program: PathBuf,
    envs: Vec<(String, String)>,
}

impl ProcessRecoveryInvoker {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            envs: Vec::new(),
        }
    }

    /// Invoker re-running the current executable
    pub fn current_exe() -> Result<Self> {
        let program = std::env::current_exe().context("Failed to locate current executable")?;
        Ok(Self::new(program))
    }

    /// Sets an environment variable for the child
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

#[async_trait]
impl RecoveryInvoker for ProcessRecoveryInvoker {
    async fn mark_incomplete(&self, id: JobId) -> Result<()> {
        let output = Command::new(&self.program)
            .arg("mark-incomplete")
            .arg(id.to_string())
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .output()
            .await
            .with_context(|| format!("Failed to run {}", self.program.display()))?;

        if !output.status.success() {
            anyhow::bail!(
                "mark-incomplete for job {} exited with {}: {}",
                id,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(())
    }
}

/// Closes out every job that is still `running` in the store
///
/// Originals that already have retry attempts are left alone; their chain
/// is resolved through the retries. Returns the number of recovered jobs.
pub async fn clean_up_stale_jobs(service: &JobService, invoker: &dyn RecoveryInvoker) -> Result<usize> {
    let stale = service
        .store()
        .find_by_state(JobState::Running)
        .await
        .context("Failed to load running jobs")?;

    let mut recovered = 0;
    for job in stale {
        let Some(id) = job.id else { continue };

        if !job.is_retry_job() && !job.retry_jobs.is_empty() {
            debug!(job_id = %id, "Skipping original with retry attempts");
            continue;
        }

        match invoker.mark_incomplete(id).await {
            Ok(()) => {
                info!(job_id = %id, "Marked stale job as incomplete");
                recovered += 1;
            }
            Err(e) => error!(job_id = %id, "Failed to recover stale job: {:#}", e),
        }
    }

    Ok(recovered)
}
