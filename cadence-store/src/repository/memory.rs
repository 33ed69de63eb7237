//! In-memory job store
//!
//! Keeps jobs in a `BTreeMap` behind a mutex. Used by the tests and by
//! anything that wants the queue semantics without a database.

use async_trait::async_trait;
use cadence_core::{DependencyRef, Job, JobError, JobId, JobState, RelatedEntity};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::{Result, StoreError};
use crate::repository::JobStore;

#[derive(Default)]
struct MemoryState {
    next_id: i64,
    jobs: BTreeMap<JobId, Job>,
}

impl MemoryState {
    /// Returns a copy of the stored job with fresh dependency states and retry links
    fn load(&self, id: JobId) -> Option<Job> {
        let mut job = self.jobs.get(&id)?.clone();

        job.dependencies = job
            .dependencies
            .iter()
            .filter_map(|dep| {
                self.jobs.get(&dep.id).map(|stored| DependencyRef {
                    id: dep.id,
                    state: stored.state(),
                })
            })
            .collect();
        job.retry_jobs = self
            .jobs
            .values()
            .filter(|other| other.original_job == Some(id))
            .filter_map(|other| other.id)
            .collect();
        job.mark_persisted();

        Some(job)
    }

    fn load_where(&self, predicate: impl Fn(&Job) -> bool) -> Vec<Job> {
        let ids: Vec<JobId> = self
            .jobs
            .iter()
            .filter(|(_, job)| predicate(job))
            .map(|(id, _)| *id)
            .collect();

        ids.into_iter().filter_map(|id| self.load(id)).collect()
    }
}

/// Job store that lives in process memory
#[derive(Default)]
pub struct InMemoryJobStore {
    state: Mutex<MemoryState>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored jobs
    pub fn len(&self) -> usize {
        self.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: &mut Job) -> Result<JobId> {
        let mut state = self.lock();

        for dep in &job.dependencies {
            if !state.jobs.contains_key(&dep.id) {
                return Err(StoreError::NotFound(dep.id));
            }
        }

        state.next_id += 1;
        let id = JobId(state.next_id);
        job.id = Some(id);
        job.mark_persisted();
        state.jobs.insert(id, job.clone());

        Ok(id)
    }

    async fn update(&self, job: &mut Job) -> Result<()> {
        let id = job.id.ok_or_else(|| JobError::NotPersisted {
            job: job.to_string(),
        })?;
        let expected = job.persisted_state().ok_or_else(|| JobError::NotPersisted {
            job: job.to_string(),
        })?;

        let mut state = self.lock();
        let stored = state.jobs.get(&id).ok_or(StoreError::NotFound(id))?;

        if stored.state() != expected {
            return Err(StoreError::Conflict { id, expected });
        }

        let mut next = job.clone();
        for dep in &stored.dependencies {
            if !next.has_dependency(dep.id) {
                next.dependencies.push(*dep);
            }
        }
        for entity in &stored.related_entities {
            next.add_related_entity(entity.clone());
        }
        next.mark_persisted();
        state.jobs.insert(id, next);

        job.mark_persisted();
        Ok(())
    }

    async fn delete(&self, id: JobId) -> Result<bool> {
        let mut state = self.lock();
        let removed = state.jobs.remove(&id).is_some();

        if removed {
            for job in state.jobs.values_mut() {
                job.dependencies.retain(|dep| dep.id != id);
                if job.original_job == Some(id) {
                    job.original_job = None;
                }
            }
        }

        Ok(removed)
    }

    async fn find_by_id(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.lock().load(id))
    }

    async fn find_pending_job(
        &self,
        excluded_ids: &[JobId],
        now: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        let state = self.lock();
        let candidate = state
            .jobs
            .values()
            .filter(|job| job.state() == JobState::Pending && job.execute_after < now)
            .filter_map(|job| job.id.map(|id| (job.created_at, id)))
            .filter(|(_, id)| !excluded_ids.contains(id))
            .max();

        Ok(candidate.and_then(|(_, id)| state.load(id)))
    }

    async fn find_by_state(&self, job_state: JobState) -> Result<Vec<Job>> {
        let mut jobs = self.lock().load_where(|job| job.state() == job_state);
        jobs.sort_by_key(|job| (job.created_at, job.id));
        Ok(jobs)
    }

    async fn find_job(&self, command: &str, args: &[String]) -> Result<Option<Job>> {
        let state = self.lock();
        let id = state
            .jobs
            .values()
            .find(|job| job.command == command && job.args == args)
            .and_then(|job| job.id);

        Ok(id.and_then(|id| state.load(id)))
    }

    async fn find_incoming_dependencies(&self, id: JobId) -> Result<Vec<Job>> {
        Ok(self.lock().load_where(|job| job.has_dependency(id)))
    }

    async fn find_all_for_related_entity(&self, entity: &RelatedEntity) -> Result<Vec<Job>> {
        Ok(self
            .lock()
            .load_where(|job| job.related_entities.contains(entity)))
    }

    async fn find_job_for_related_entity(
        &self,
        command: &str,
        entity: &RelatedEntity,
    ) -> Result<Option<Job>> {
        Ok(self
            .lock()
            .load_where(|job| job.command == command && job.related_entities.contains(entity))
            .into_iter()
            .next())
    }

    async fn find_last_jobs_with_error(&self, limit: usize) -> Result<Vec<Job>> {
        let mut jobs = self.lock().load_where(|job| {
            matches!(job.state(), JobState::Failed | JobState::Terminated) && !job.is_retry_job()
        });
        jobs.sort_by(|a, b| (b.closed_at, b.id).cmp(&(a.closed_at, a.id)));
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn list_jobs(&self, job_state: Option<JobState>, limit: usize) -> Result<Vec<Job>> {
        let mut jobs = self
            .lock()
            .load_where(|job| job_state.is_none_or(|s| job.state() == s));
        jobs.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        jobs.truncate(limit);
        Ok(jobs)
    }
}
