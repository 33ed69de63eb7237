//! Job Service
//!
//! Business logic for job management and selection.

use cadence_core::hooks::{NoopHook, StateChangeHook};
use cadence_core::{Job, JobError, JobId, JobState, RelatedEntity};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;

use crate::error::{Result, StoreError};
use crate::repository::JobStore;
use crate::service::close_out::CloseOutReport;

/// Entry point for everything that reads or changes jobs
#[derive(Clone)]
pub struct JobService {
    store: Arc<dyn JobStore>,
    state_hook: Arc<dyn StateChangeHook>,
}

impl JobService {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            state_hook: Arc::new(NoopHook),
        }
    }

    /// Replaces the hook consulted before state changes
    pub fn with_state_hook(mut self, hook: Arc<dyn StateChangeHook>) -> Self {
        self.state_hook = hook;
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn state_hook(&self) -> &Arc<dyn StateChangeHook> {
        &self.state_hook
    }

    /// Inserts unsaved jobs, writes back persisted ones
    pub async fn save(&self, job: &mut Job) -> Result<JobId> {
        match job.id {
            Some(id) => {
                self.store.update(job).await?;
                Ok(id)
            }
            None => self.store.insert(job).await,
        }
    }

    pub async fn refresh(&self, job: &mut Job) -> Result<()> {
        self.store.refresh(job).await
    }

    /// Get a job by ID
    pub async fn get_by_id(&self, id: JobId) -> Result<Job> {
        self.store
            .find_by_id(id)
            .await?
            .ok_or(StoreError::NotFound(id))
    }

    pub async fn find_job(&self, command: &str, args: &[String]) -> Result<Option<Job>> {
        self.store.find_job(command, args).await
    }

    /// Like `find_job`, but a missing job is an error
    pub async fn get_job(&self, command: &str, args: &[String]) -> Result<Job> {
        self.find_job(command, args)
            .await?
            .ok_or_else(|| StoreError::JobNotFoundForCommand {
                command: command.to_string(),
                args: args.to_vec(),
            })
    }

    pub async fn find_pending_job(&self, excluded_ids: &[JobId]) -> Result<Option<Job>> {
        self.store.find_pending_job(excluded_ids, Utc::now()).await
    }

    /// Jobs that depend on `job`
    pub async fn find_incoming_dependencies(&self, job: &Job) -> Result<Vec<Job>> {
        match job.id {
            Some(id) => self.store.find_incoming_dependencies(id).await,
            None => Ok(Vec::new()),
        }
    }

    /// Finds the newest due pending job whose dependencies have all finished
    ///
    /// Candidates that are not startable yet are appended to `excluded_ids`
    /// so the caller can carry the exclusions through its current pass.
    pub async fn find_startable_job(&self, excluded_ids: &mut Vec<JobId>) -> Result<Option<Job>> {
        while let Some(job) = self.find_pending_job(excluded_ids).await? {
            if job.is_startable() {
                return Ok(Some(job));
            }

            if let Some(id) = job.id {
                tracing::debug!(job_id = %id, "Skipping job with unfinished dependencies");
                excluded_ids.push(id);
            }
        }

        Ok(None)
    }

    /// Returns the job for `(command, args)`, creating it if there is none
    ///
    /// Racing callers each insert an unconfirmed job, then keep only the
    /// earliest one. Losers delete their own insert.
    pub async fn get_or_create_if_not_exists(
        &self,
        command: &str,
        args: Vec<String>,
    ) -> Result<Job> {
        if let Some(job) = self.find_job(command, &args).await? {
            return Ok(job);
        }

        let mut job = Job::new_unconfirmed(command, args);
        let id = self.store.insert(&mut job).await?;

        let first = self.get_job(command, &job.args).await?;
        if first.id == Some(id) {
            job.set_state(JobState::Pending)?;
            self.store.update(&mut job).await?;
            tracing::info!(job_id = %id, command = %command, "Created job");
            return Ok(job);
        }

        self.store.delete(id).await?;
        tracing::debug!(job_id = %id, "Discarded duplicate job");
        Ok(first)
    }

    /// Moves an unconfirmed job to `pending` and saves it
    pub async fn confirm(&self, job: &mut Job) -> Result<()> {
        job.set_state(JobState::Pending)?;
        self.save(job).await?;
        Ok(())
    }

    /// Makes `job` wait for `dependency`
    ///
    /// Only the in-memory job changes; save it afterwards. Fails with
    /// `StoreError::DependencyCycle` if `dependency` already waits for `job`.
    pub async fn add_dependency(&self, job: &mut Job, dependency: &Job) -> Result<()> {
        if let (Some(job_id), Some(dep_id)) = (job.id, dependency.id) {
            if job_id != dep_id && self.waits_for(dep_id, job_id).await? {
                return Err(StoreError::DependencyCycle {
                    job: job_id,
                    dependency: dep_id,
                });
            }
        }

        job.add_dependency(dependency)?;
        Ok(())
    }

    /// Whether `from` reaches `target` over stored dependency edges
    async fn waits_for(&self, from: JobId, target: JobId) -> Result<bool> {
        let mut stack = vec![from];
        let mut seen = HashSet::new();

        while let Some(id) = stack.pop() {
            if id == target {
                return Ok(true);
            }
            if !seen.insert(id) {
                continue;
            }
            if let Some(job) = self.store.find_by_id(id).await? {
                stack.extend(job.dependencies.iter().map(|dep| dep.id));
            }
        }

        Ok(false)
    }

    /// Schedules a fresh copy of a job that ended badly
    pub async fn retry_job(&self, id: JobId) -> Result<Job> {
        let job = self.get_by_id(id).await?;
        if !matches!(
            job.state(),
            JobState::Failed | JobState::Terminated | JobState::Incomplete
        ) {
            return Err(StoreError::NotRetryable {
                id,
                state: job.state(),
            });
        }

        let mut copy = job.clone_for_rescheduling();
        let new_id = self.store.insert(&mut copy).await?;
        tracing::info!(job_id = %id, retry_id = %new_id, "Rescheduled job");

        Ok(copy)
    }

    /// Cancels a job that has not started, cascading to its dependents
    pub async fn cancel_job(&self, id: JobId) -> Result<CloseOutReport> {
        let mut job = self.get_by_id(id).await?;
        if !matches!(job.state(), JobState::New | JobState::Pending) {
            return Err(JobError::InvalidStateTransition {
                job: job.to_string(),
                from: job.state(),
                to: JobState::Canceled,
                allowed: job.state().allowed_transitions().to_vec(),
            }
            .into());
        }

        self.close_job(&mut job, JobState::Canceled).await
    }

    /// Closes out a job whose supervisor disappeared
    pub async fn mark_incomplete(&self, id: JobId) -> Result<CloseOutReport> {
        let mut job = self.get_by_id(id).await?;
        if job.state() != JobState::Running {
            return Err(JobError::InvalidStateTransition {
                job: job.to_string(),
                from: job.state(),
                to: JobState::Incomplete,
                allowed: job.state().allowed_transitions().to_vec(),
            }
            .into());
        }

        self.close_job(&mut job, JobState::Incomplete).await
    }

    pub async fn find_all_for_related_entity(&self, entity: &RelatedEntity) -> Result<Vec<Job>> {
        self.store.find_all_for_related_entity(entity).await
    }

    pub async fn find_job_for_related_entity(
        &self,
        command: &str,
        entity: &RelatedEntity,
    ) -> Result<Option<Job>> {
        self.store.find_job_for_related_entity(command, entity).await
    }

    pub async fn find_last_jobs_with_error(&self, limit: usize) -> Result<Vec<Job>> {
        self.store.find_last_jobs_with_error(limit).await
    }

    pub async fn list_jobs(&self, state: Option<JobState>, limit: usize) -> Result<Vec<Job>> {
        self.store.list_jobs(state, limit).await
    }
}
