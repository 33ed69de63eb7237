//! Job supervisor
//!
//! Polls the store for startable jobs, runs them as subprocesses and closes
//! them out once they exit or run over their time limit.

use anyhow::{Context, Result};
use cadence_core::hooks::{NoopHook, OutputHook, OutputStream};
use cadence_core::{Job, JobId, JobState};
use cadence_store::{JobService, StoreError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::config::SupervisorConfig;
use crate::process::{ChildProcess, CommandLauncher, ProcessLauncher};
use crate::recovery::{self, RecoveryInvoker, TaskRecoveryInvoker};

/// A job whose subprocess is being watched
struct RunningJob {
    job: Job,
    process: Box<dyn ChildProcess>,
    started: Instant,
    /// Exit status and output not yet written to `job`
    exited: Option<Exited>,
    /// Final state to apply once a failed close-out is retried
    closing: Option<JobState>,
}

struct Exited {
    code: i32,
    output: String,
    error_output: String,
}

/// Outcome of a single supervisor run
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub started: usize,
    pub closed: usize,
    pub recovered: usize,
}

/// Runs jobs from the store until its time budget is used up
pub struct Supervisor {
    config: SupervisorConfig,
    service: JobService,
    launcher: Arc<dyn ProcessLauncher>,
    output_hook: Arc<dyn OutputHook>,
    recovery: Arc<dyn RecoveryInvoker>,
    running: Vec<RunningJob>,
    summary: RunSummary,
}

impl Supervisor {
    /// Creates a supervisor with local subprocesses and in-process recovery
    pub fn new(config: SupervisorConfig, service: JobService) -> Self {
        let recovery = Arc::new(TaskRecoveryInvoker::new(service.clone()));
        Self {
            config,
            service,
            launcher: Arc::new(CommandLauncher::new()),
            output_hook: Arc::new(NoopHook),
            recovery,
            running: Vec::new(),
            summary: RunSummary::default(),
        }
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn ProcessLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn with_output_hook(mut self, hook: Arc<dyn OutputHook>) -> Self {
        self.output_hook = hook;
        self
    }

    pub fn with_recovery_invoker(mut self, invoker: Arc<dyn RecoveryInvoker>) -> Self {
        self.recovery = invoker;
        self
    }

    /// IDs of the jobs currently tracked
    pub fn running_job_ids(&self) -> Vec<JobId> {
        self.running.iter().filter_map(|r| r.job.id).collect()
    }

    /// Starts jobs until the budget is spent, then waits for the running ones
    pub async fn run(&mut self) -> Result<RunSummary> {
        self.config.validate()?;

        info!(
            supervisor_id = %self.config.supervisor_id,
            max_runtime = ?self.config.max_runtime,
            max_concurrent_jobs = self.config.max_concurrent_jobs,
            "Starting supervisor"
        );

        if self.config.recovery_enabled {
            self.summary.recovered =
                recovery::clean_up_stale_jobs(&self.service, self.recovery.as_ref())
                    .await
                    .context("Failed to clean up stale jobs")?;
        }

        let started = Instant::now();
        while started.elapsed() < self.config.max_runtime {
            if let Err(e) = self.run_iteration().await {
                error!("Supervisor iteration failed: {:#}", e);
                time::sleep(self.config.idle_time).await;
            }
        }

        info!(
            running = self.running.len(),
            "Run budget used up, waiting for running jobs"
        );
        self.drain().await;

        info!(
            started = self.summary.started,
            closed = self.summary.closed,
            "Supervisor finished"
        );
        Ok(self.summary.clone())
    }

    /// One pass: poll the running jobs, then fill free slots
    async fn run_iteration(&mut self) -> Result<()> {
        self.check_running_jobs().await;

        let mut excluded: Vec<JobId> = Vec::new();
        while self.running.len() < self.config.max_concurrent_jobs {
            let Some(job) = self.service.find_startable_job(&mut excluded).await? else {
                debug!("No startable job, idling");
                time::sleep(self.config.idle_time).await;
                return Ok(());
            };

            if let Some(id) = job.id {
                excluded.push(id);
            }
            self.start_job(job).await?;

            time::sleep(self.config.poll_interval).await;
            self.check_running_jobs().await;
        }

        time::sleep(self.config.poll_interval).await;
        Ok(())
    }

    /// Polls until no subprocess is tracked
    async fn drain(&mut self) {
        while !self.running.is_empty() {
            self.check_running_jobs().await;
            if !self.running.is_empty() {
                time::sleep(self.config.poll_interval).await;
            }
        }
    }

    /// Claims and launches a job
    ///
    /// Losing the claim to another supervisor is not an error.
    async fn start_job(&mut self, mut job: Job) -> Result<()> {
        let proposed = self
            .service
            .state_hook()
            .on_state_change(&job, JobState::Running);

        if proposed == JobState::Canceled {
            info!(job_id = ?job.id, "Start vetoed, canceling job");
            self.service.close_job(&mut job, JobState::Canceled).await?;
            self.summary.closed += 1;
            return Ok(());
        }
        if proposed != JobState::Running {
            warn!(job_id = ?job.id, state = %proposed, "Ignoring unsupported start state");
        }

        job.set_state(JobState::Running)?;
        match self.service.save(&mut job).await {
            Ok(_) => {}
            Err(StoreError::Conflict { id, .. }) => {
                debug!(job_id = %id, "Job was claimed by someone else");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        match self.launcher.launch(&job) {
            Ok(process) => {
                info!(job_id = ?job.id, pid = ?process.pid(), command = %job.command, "Started job");
                self.summary.started += 1;
                self.running.push(RunningJob {
                    job,
                    process,
                    started: Instant::now(),
                    exited: None,
                    closing: None,
                });
            }
            Err(e) => {
                error!(job_id = ?job.id, "Failed to launch job: {:#}", e);
                job.add_error_output(&format!("{:#}\n", e));
                job.runtime = Some(0);
                self.service.close_job(&mut job, JobState::Failed).await?;
                self.summary.closed += 1;
            }
        }

        Ok(())
    }

    /// Polls every tracked subprocess once
    async fn check_running_jobs(&mut self) {
        let mut still_running = Vec::with_capacity(self.running.len());

        for mut entry in std::mem::take(&mut self.running) {
            match self.poll(&mut entry).await {
                Ok(true) => still_running.push(entry),
                Ok(false) => self.summary.closed += 1,
                Err(e) if is_transient(&e) => {
                    warn!(job_id = ?entry.job.id, "Transient failure, retrying next poll: {:#}", e);
                    still_running.push(entry);
                }
                Err(e) => {
                    error!(job_id = ?entry.job.id, "Giving up on job: {:#}", e);
                    if self.abandon(entry, &e).await {
                        self.summary.closed += 1;
                    }
                }
            }
        }

        self.running = still_running;
    }

    /// Returns whether the job is still tracked
    async fn poll(&self, entry: &mut RunningJob) -> Result<bool> {
        if let Some(state) = entry.closing {
            return self.close(entry, state).await;
        }
        if let Some(exited) = entry.exited.take() {
            return self.complete(entry, exited).await;
        }

        match entry.process.try_exit_code()? {
            None => {
                let output = entry.process.read_new_output();
                let error_output = entry.process.read_new_error_output();
                self.append(&mut entry.job, output, error_output);

                let limit = entry.job.max_runtime;
                if limit > 0 && entry.started.elapsed() > Duration::from_secs(limit) {
                    warn!(job_id = ?entry.job.id, max_runtime = limit, "Job exceeded its maximum runtime, stopping it");
                    entry.process.stop(self.config.stop_grace_period).await?;

                    let (rest, error_rest) = entry.process.finish().await;
                    self.append(&mut entry.job, rest, error_rest);
                    entry.job.runtime = Some(entry.started.elapsed().as_secs());
                    entry.closing = Some(JobState::Terminated);
                    return self.close(entry, JobState::Terminated).await;
                }

                entry.job.checked();
                self.service.save(&mut entry.job).await?;
                Ok(true)
            }
            Some(code) => {
                let mut output = entry.process.read_new_output();
                let mut error_output = entry.process.read_new_error_output();
                let (rest, error_rest) = entry.process.finish().await;
                output.push_str(&rest);
                error_output.push_str(&error_rest);

                entry.job.runtime = Some(entry.started.elapsed().as_secs());
                self.complete(
                    entry,
                    Exited {
                        code,
                        output,
                        error_output,
                    },
                )
                .await
            }
        }
    }

    /// Writes the exit status to the job and closes it
    ///
    /// The output stays on the entry until the job has been reloaded.
    async fn complete(&self, entry: &mut RunningJob, exited: Exited) -> Result<bool> {
        let runtime = entry.job.runtime;

        // The child may have updated its own record.
        if let Err(e) = self.service.refresh(&mut entry.job).await {
            entry.exited = Some(exited);
            return Err(e.into());
        }

        self.append(&mut entry.job, exited.output, exited.error_output);
        entry.job.exit_code = Some(exited.code);
        entry.job.runtime = runtime;

        let state = if exited.code == 0 {
            JobState::Finished
        } else {
            JobState::Failed
        };
        info!(job_id = ?entry.job.id, exit_code = exited.code, state = %state, "Job exited");

        entry.closing = Some(state);
        self.close(entry, state).await
    }

    /// Stops a job that can no longer be watched and closes it as incomplete
    ///
    /// Returns whether the job was closed here.
    async fn abandon(&self, mut entry: RunningJob, cause: &anyhow::Error) -> bool {
        let Some(id) = entry.job.id else {
            return false;
        };

        if !matches!(entry.process.try_exit_code(), Ok(Some(_))) {
            if let Err(e) = entry.process.stop(self.config.stop_grace_period).await {
                warn!(job_id = %id, "Failed to stop job: {:#}", e);
            }
        }
        let (rest, error_rest) = entry.process.finish().await;

        let mut job = match self.service.get_by_id(id).await {
            Ok(job) => job,
            Err(e) => {
                error!(job_id = %id, "Failed to reload abandoned job: {:#}", e);
                return false;
            }
        };
        if job.state() != JobState::Running {
            debug!(job_id = %id, state = %job.state(), "Abandoned job was already closed");
            return false;
        }

        if let Some(exited) = entry.exited.take() {
            self.append(&mut job, exited.output, exited.error_output);
        }
        self.append(&mut job, rest, error_rest);
        job.add_error_output(&format!("Supervisor stopped watching the job: {:#}\n", cause));
        job.runtime = Some(entry.started.elapsed().as_secs());

        match self.service.close_job(&mut job, JobState::Incomplete).await {
            Ok(_) => {
                warn!(job_id = %id, "Closed abandoned job as incomplete");
                true
            }
            Err(e) => {
                error!(job_id = %id, "Failed to close abandoned job: {:#}", e);
                false
            }
        }
    }

    async fn close(&self, entry: &mut RunningJob, state: JobState) -> Result<bool> {
        let report = self.service.close_job(&mut entry.job, state).await?;
        debug!(
            job_id = ?entry.job.id,
            visited = report.visited.len(),
            spawned = report.spawned.len(),
            "Close-out done"
        );
        Ok(false)
    }

    fn append(&self, job: &mut Job, output: String, error_output: String) {
        if !output.is_empty() {
            let output = self.output_hook.on_new_output(job, output, OutputStream::Stdout);
            job.add_output(&output);
        }
        if !error_output.is_empty() {
            let error_output = self
                .output_hook
                .on_new_output(job, error_output, OutputStream::Stderr);
            job.add_error_output(&error_output);
        }
    }
}

fn is_transient(err: &anyhow::Error) -> bool {
    err.downcast_ref::<StoreError>()
        .is_some_and(StoreError::is_transient)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cadence_core::RelatedEntity;
    use cadence_core::hooks::ExpirationPolicy;
    use cadence_store::{InMemoryJobStore, JobStore};
    use chrono::{DateTime, Utc};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    type StoreResult<T> = std::result::Result<T, StoreError>;

    fn service() -> JobService {
        JobService::new(Arc::new(InMemoryJobStore::new()))
    }

    fn config(budget_ms: u64) -> SupervisorConfig {
        SupervisorConfig::new(Duration::from_millis(budget_ms), 2, Duration::from_millis(50))
            .with_poll_interval(Duration::from_millis(20))
            .with_stop_grace_period(Duration::from_secs(1))
    }

    async fn shell(service: &JobService, script: &str) -> Job {
        let mut job = Job::new("sh", vec!["-c".to_string(), script.to_string()]);
        service.save(&mut job).await.unwrap();
        job
    }

    async fn reload(service: &JobService, job: &Job) -> Job {
        service.get_by_id(job.id.unwrap()).await.unwrap()
    }

    #[tokio::test]
    async fn test_successful_job_finishes() {
        let service = service();
        let job = shell(&service, "echo hello; echo warn >&2").await;

        let summary = Supervisor::new(config(300), service.clone())
            .run()
            .await
            .unwrap();

        assert_eq!(summary.started, 1);
        let job = reload(&service, &job).await;
        assert_eq!(job.state(), JobState::Finished);
        assert_eq!(job.exit_code, Some(0));
        assert_eq!(job.output.as_deref(), Some("hello\n"));
        assert_eq!(job.error_output.as_deref(), Some("warn\n"));
        assert!(job.runtime.is_some());
    }

    #[tokio::test]
    async fn test_failing_job_fails() {
        let service = service();
        let job = shell(&service, "exit 3").await;

        Supervisor::new(config(300), service.clone())
            .run()
            .await
            .unwrap();

        let job = reload(&service, &job).await;
        assert_eq!(job.state(), JobState::Failed);
        assert_eq!(job.exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_job_id_is_passed_to_child() {
        let service = service();
        let job = shell(&service, "printf %s \"$CADENCE_JOB_ID\"").await;

        Supervisor::new(config(300), service.clone())
            .run()
            .await
            .unwrap();

        let job = reload(&service, &job).await;
        assert_eq!(job.output, Some(job.id.unwrap().to_string()));
    }

    #[tokio::test]
    async fn test_overrunning_job_is_terminated() {
        let service = service();
        let mut job = Job::new("sh", vec!["-c".to_string(), "exec sleep 30".to_string()])
            .with_max_runtime(1);
        service.save(&mut job).await.unwrap();

        let started = Instant::now();
        Supervisor::new(config(200), service.clone())
            .run()
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(10));
        let job = reload(&service, &job).await;
        assert_eq!(job.state(), JobState::Terminated);
        assert!(job.closed_at.is_some());
    }

    #[tokio::test]
    async fn test_failed_job_is_retried() {
        let service = service();
        let mut job = Job::new("sh", vec!["-c".to_string(), "exit 1".to_string()])
            .with_max_retries(1);
        service.save(&mut job).await.unwrap();

        let summary = Supervisor::new(config(1000), service.clone())
            .run()
            .await
            .unwrap();

        assert_eq!(summary.started, 2);
        let original = reload(&service, &job).await;
        assert_eq!(original.state(), JobState::Failed);
        assert_eq!(original.retry_jobs.len(), 1);

        let retry = service.get_by_id(original.retry_jobs[0]).await.unwrap();
        assert_eq!(retry.state(), JobState::Failed);
    }

    #[tokio::test]
    async fn test_launch_failure_fails_job() {
        let service = service();
        let mut job = Job::new("/nonexistent/cadence-test-binary", vec![]);
        service.save(&mut job).await.unwrap();

        Supervisor::new(config(200), service.clone())
            .run()
            .await
            .unwrap();

        let job = reload(&service, &job).await;
        assert_eq!(job.state(), JobState::Failed);
        assert!(job
            .error_output
            .as_deref()
            .is_some_and(|e| e.contains("Failed to spawn")));
    }

    #[tokio::test]
    async fn test_expired_job_is_canceled_instead_of_started() {
        let service = service().with_state_hook(Arc::new(ExpirationPolicy));
        let mut job = Job::new("sh", vec!["-c".to_string(), "exit 0".to_string()])
            .with_expires_at(Utc::now() - chrono::Duration::seconds(1));
        service.save(&mut job).await.unwrap();

        let summary = Supervisor::new(config(200), service.clone())
            .run()
            .await
            .unwrap();

        assert_eq!(summary.started, 0);
        let job = reload(&service, &job).await;
        assert_eq!(job.state(), JobState::Canceled);
        assert!(job.started_at.is_none());
    }

    #[tokio::test]
    async fn test_dependent_job_runs_after_dependency() {
        let service = service();
        let first = shell(&service, "echo first").await;
        let mut second = Job::new("sh", vec!["-c".to_string(), "echo second".to_string()]);
        service.add_dependency(&mut second, &first).await.unwrap();
        service.save(&mut second).await.unwrap();

        Supervisor::new(config(1000), service.clone())
            .run()
            .await
            .unwrap();

        let first = reload(&service, &first).await;
        let second = reload(&service, &second).await;
        assert_eq!(first.state(), JobState::Finished);
        assert_eq!(second.state(), JobState::Finished);
        assert!(second.started_at >= first.closed_at);
    }

    #[tokio::test]
    async fn test_concurrency_limit() {
        let service = service();
        for _ in 0..3 {
            shell(&service, "sleep 0.3").await;
        }

        let mut supervisor = Supervisor::new(
            SupervisorConfig::new(Duration::from_millis(100), 2, Duration::from_millis(50))
                .with_poll_interval(Duration::from_millis(20)),
            service.clone(),
        );
        let summary = supervisor.run().await.unwrap();

        assert_eq!(summary.started, 2);
        let pending = service.list_jobs(Some(JobState::Pending), 10).await.unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn test_recovery_runs_at_startup() {
        let service = service();
        let mut stale = Job::new("ghost", vec![]);
        service.save(&mut stale).await.unwrap();
        stale.set_state(JobState::Running).unwrap();
        service.save(&mut stale).await.unwrap();

        let summary = Supervisor::new(config(100), service.clone())
            .run()
            .await
            .unwrap();

        assert_eq!(summary.recovered, 1);
        let stale = reload(&service, &stale).await;
        assert_eq!(stale.state(), JobState::Incomplete);
    }

    /// In-memory store whose first `failures` refreshes hit a dead pool
    struct FlakyRefresh {
        inner: InMemoryJobStore,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl JobStore for FlakyRefresh {
        async fn insert(&self, job: &mut Job) -> StoreResult<JobId> {
            self.inner.insert(job).await
        }

        async fn update(&self, job: &mut Job) -> StoreResult<()> {
            self.inner.update(job).await
        }

        async fn delete(&self, id: JobId) -> StoreResult<bool> {
            self.inner.delete(id).await
        }

        async fn find_by_id(&self, id: JobId) -> StoreResult<Option<Job>> {
            self.inner.find_by_id(id).await
        }

        async fn refresh(&self, job: &mut Job) -> StoreResult<()> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
            }
            self.inner.refresh(job).await
        }

        async fn find_pending_job(
            &self,
            excluded_ids: &[JobId],
            now: DateTime<Utc>,
        ) -> StoreResult<Option<Job>> {
            self.inner.find_pending_job(excluded_ids, now).await
        }

        async fn find_by_state(&self, state: JobState) -> StoreResult<Vec<Job>> {
            self.inner.find_by_state(state).await
        }

        async fn find_job(&self, command: &str, args: &[String]) -> StoreResult<Option<Job>> {
            self.inner.find_job(command, args).await
        }

        async fn find_incoming_dependencies(&self, id: JobId) -> StoreResult<Vec<Job>> {
            self.inner.find_incoming_dependencies(id).await
        }

        async fn find_all_for_related_entity(
            &self,
            entity: &RelatedEntity,
        ) -> StoreResult<Vec<Job>> {
            self.inner.find_all_for_related_entity(entity).await
        }

        async fn find_job_for_related_entity(
            &self,
            command: &str,
            entity: &RelatedEntity,
        ) -> StoreResult<Option<Job>> {
            self.inner.find_job_for_related_entity(command, entity).await
        }

        async fn find_last_jobs_with_error(&self, limit: usize) -> StoreResult<Vec<Job>> {
            self.inner.find_last_jobs_with_error(limit).await
        }

        async fn list_jobs(&self, state: Option<JobState>, limit: usize) -> StoreResult<Vec<Job>> {
            self.inner.list_jobs(state, limit).await
        }
    }

    #[tokio::test]
    async fn test_output_survives_failed_reload() {
        let store = Arc::new(FlakyRefresh {
            inner: InMemoryJobStore::new(),
            failures: AtomicUsize::new(1),
        });
        let service = JobService::new(store.clone());
        let job = shell(&service, "echo hello; echo warn >&2").await;

        Supervisor::new(config(300), service.clone())
            .run()
            .await
            .unwrap();

        assert_eq!(store.failures.load(Ordering::SeqCst), 0);
        let job = reload(&service, &job).await;
        assert_eq!(job.state(), JobState::Finished);
        assert_eq!(job.exit_code, Some(0));
        assert_eq!(job.output.as_deref(), Some("hello\n"));
        assert_eq!(job.error_output.as_deref(), Some("warn\n"));
    }

    /// A child whose status can never be read
    struct UnwatchableChild {
        stopped: Arc<AtomicBool>,
    }

    #[async_trait]
    impl ChildProcess for UnwatchableChild {
        fn pid(&self) -> Option<u32> {
            None
        }

        fn read_new_output(&mut self) -> String {
            String::new()
        }

        fn read_new_error_output(&mut self) -> String {
            String::new()
        }

        fn try_exit_code(&mut self) -> Result<Option<i32>> {
            anyhow::bail!("wait failed")
        }

        async fn stop(&mut self, _grace: Duration) -> Result<()> {
            self.stopped.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn finish(&mut self) -> (String, String) {
            ("partial\n".to_string(), String::new())
        }
    }

    struct UnwatchableLauncher {
        stopped: Arc<AtomicBool>,
    }

    impl ProcessLauncher for UnwatchableLauncher {
        fn launch(&self, _job: &Job) -> Result<Box<dyn ChildProcess>> {
            Ok(Box::new(UnwatchableChild {
                stopped: self.stopped.clone(),
            }))
        }
    }

    #[tokio::test]
    async fn test_unwatchable_job_is_closed_as_incomplete() {
        let service = service();
        let job = shell(&service, "true").await;
        let stopped = Arc::new(AtomicBool::new(false));

        let summary = Supervisor::new(config(200), service.clone())
            .with_launcher(Arc::new(UnwatchableLauncher {
                stopped: stopped.clone(),
            }))
            .run()
            .await
            .unwrap();

        assert_eq!(summary.started, 1);
        assert_eq!(summary.closed, 1);
        assert!(stopped.load(Ordering::SeqCst));

        let job = reload(&service, &job).await;
        assert_eq!(job.state(), JobState::Incomplete);
        assert!(job.closed_at.is_some());
        assert_eq!(job.output.as_deref(), Some("partial\n"));
        assert!(job
            .error_output
            .as_deref()
            .is_some_and(|e| e.contains("wait failed")));
    }
}
