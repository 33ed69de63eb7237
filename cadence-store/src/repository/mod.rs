//! Repository Module
//!
//! Data access layer for jobs. `JobStore` is the storage contract; the
//! services only ever talk to it, so backends are interchangeable.

pub mod job;
pub mod memory;

use async_trait::async_trait;
use cadence_core::{Job, JobId, JobState, RelatedEntity};
use chrono::{DateTime, Utc};

use crate::error::Result;

pub use job::PgJobStore;
pub use memory::InMemoryJobStore;

/// Storage contract for jobs
///
/// Loaded jobs carry fresh dependency snapshots and their retry job IDs.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Inserts a new job and assigns its ID
    ///
    /// Dependency edges and related entities are written along with it.
    async fn insert(&self, job: &mut Job) -> Result<JobId>;

    /// Writes back a persisted job
    ///
    /// Succeeds only if the stored state still equals
    /// `job.persisted_state()`; otherwise returns `StoreError::Conflict`.
    /// New dependency edges and related entities are added, existing ones
    /// are never removed.
    async fn update(&self, job: &mut Job) -> Result<()>;

    /// Deletes a job by ID
    async fn delete(&self, id: JobId) -> Result<bool>;

    /// Find a job by ID
    async fn find_by_id(&self, id: JobId) -> Result<Option<Job>>;

    /// Replaces `job` with its stored version
    ///
    /// Unsaved jobs are left untouched.
    async fn refresh(&self, job: &mut Job) -> Result<()> {
        let Some(id) = job.id else {
            return Ok(());
        };

        *job = self
            .find_by_id(id)
            .await?
            .ok_or(crate::error::StoreError::NotFound(id))?;
        Ok(())
    }

    /// Newest-created pending job that is due and not excluded
    async fn find_pending_job(&self, excluded_ids: &[JobId], now: DateTime<Utc>)
    -> Result<Option<Job>>;

    /// Find jobs by state, oldest first
    async fn find_by_state(&self, state: JobState) -> Result<Vec<Job>>;

    /// Earliest-created job with exactly this command and arguments
    async fn find_job(&self, command: &str, args: &[String]) -> Result<Option<Job>>;

    /// Jobs that depend on the given job
    async fn find_incoming_dependencies(&self, id: JobId) -> Result<Vec<Job>>;

    /// Jobs associated with a related entity
    async fn find_all_for_related_entity(&self, entity: &RelatedEntity) -> Result<Vec<Job>>;

    /// The job with this command associated with a related entity
    async fn find_job_for_related_entity(
        &self,
        command: &str,
        entity: &RelatedEntity,
    ) -> Result<Option<Job>>;

    /// Most recently closed failed or terminated jobs that are not retries
    async fn find_last_jobs_with_error(&self, limit: usize) -> Result<Vec<Job>>;

    /// Newest jobs first, optionally filtered by state
    async fn list_jobs(&self, state: Option<JobState>, limit: usize) -> Result<Vec<Job>>;
}
