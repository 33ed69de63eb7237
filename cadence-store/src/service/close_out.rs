//! Close-out
//!
//! Applies a final state to a job and propagates it through the dependency
//! and retry graphs. The traversal works on job IDs with an explicit
//! worklist; every job is handled at most once per call.

use cadence_core::{Job, JobError, JobId, JobState};
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};

use crate::error::{Result, StoreError};
use crate::service::job::JobService;

/// What a close-out touched
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CloseOutReport {
    /// Every job handled, in traversal order
    pub visited: Vec<JobId>,
    /// Retry attempts and recurring copies inserted along the way
    pub spawned: Vec<JobId>,
    /// Visited jobs that ended badly and are not retry attempts
    ///
    /// Callers must drop these from whatever they keep in memory.
    pub detached: Vec<JobId>,
}

/// Per-call state of the traversal
struct Cascade {
    root: JobId,
    working: HashMap<JobId, Job>,
    visited: HashSet<JobId>,
    worklist: Vec<(JobId, JobState)>,
    report: CloseOutReport,
}

impl Cascade {
    fn push(&mut self, id: JobId, state: JobState) {
        if !self.visited.contains(&id) {
            self.worklist.push((id, state));
        }
    }
}

impl JobService {
    /// Closes `job` with `final_state` and cascades the result
    ///
    /// `job` is replaced with its persisted version when the call returns.
    pub async fn close_job(&self, job: &mut Job, final_state: JobState) -> Result<CloseOutReport> {
        let root = job.id.ok_or_else(|| JobError::NotPersisted {
            job: job.to_string(),
        })?;

        let mut cascade = Cascade {
            root,
            working: HashMap::from([(root, job.clone())]),
            visited: HashSet::new(),
            worklist: vec![(root, final_state)],
            report: CloseOutReport::default(),
        };

        while let Some((id, state)) = cascade.worklist.pop() {
            if !cascade.visited.insert(id) {
                continue;
            }
            cascade.report.visited.push(id);

            let mut current = self.take(&mut cascade, id).await?;
            let result = self.close_one(&mut current, state, &mut cascade).await;
            cascade.working.insert(id, current);
            result?;
        }

        if let Some(closed) = cascade.working.get(&root) {
            *job = closed.clone();
        }

        let Cascade {
            working,
            mut report,
            ..
        } = cascade;
        report.detached = report
            .visited
            .iter()
            .filter(|id| {
                working
                    .get(id)
                    .is_some_and(|j| j.is_closed_non_successful() && !j.is_retry_job())
            })
            .copied()
            .collect();

        Ok(report)
    }

    async fn close_one(
        &self,
        job: &mut Job,
        proposed: JobState,
        cascade: &mut Cascade,
    ) -> Result<()> {
        let final_state = if job.is_retry_job() || job.retry_jobs.is_empty() {
            self.state_hook().on_state_change(job, proposed)
        } else {
            proposed
        };
        let id = job.id.ok_or_else(|| JobError::NotPersisted {
            job: job.to_string(),
        })?;

        tracing::debug!(job_id = %id, state = %final_state, "Closing job");

        match final_state {
            JobState::Canceled => {
                // A running original only gets here through one of its retries.
                // A running root is left to set_state, which refuses it.
                let applied = match job.state() {
                    JobState::Running if id != cascade.root => JobState::Incomplete,
                    _ => JobState::Canceled,
                };
                job.set_state(applied)?;
                self.store().update(job).await?;

                match job.original_job {
                    Some(original) => cascade.push(original, JobState::Canceled),
                    None => self.push_dependents(id, cascade).await?,
                }
            }

            JobState::Failed | JobState::Terminated | JobState::Incomplete => {
                if let Some(original) = job.original_job {
                    job.set_state(final_state)?;
                    self.store().update(job).await?;
                    cascade.push(original, final_state);
                    return Ok(());
                }

                if job.max_retries > 0 && self.adopt_stored_retries(job, id).await? {
                    // An earlier close-out of this copy already scheduled the retry.
                    self.store().update(job).await?;
                    tracing::info!(job_id = %id, "Retry was already scheduled");
                    return Ok(());
                }

                if job.is_retry_allowed() {
                    let mut retry = job.new_retry_attempt();
                    job.add_retry_job(&mut retry)?;
                    let retry_id = self.store().insert(&mut retry).await?;
                    job.record_retry_job(retry_id);
                    self.store().update(job).await?;

                    tracing::info!(
                        job_id = %id,
                        retry_id = %retry_id,
                        attempt = job.retry_jobs.len(),
                        "Scheduled retry"
                    );
                    cascade.report.spawned.push(retry_id);
                    return Ok(());
                }

                job.set_state(final_state)?;
                self.store().update(job).await?;
                self.push_dependents(id, cascade).await?;
            }

            JobState::Finished => {
                let mut recurring = job.clone();

                if let Some(original_id) = job.original_job {
                    let mut original = self.take(cascade, original_id).await?;
                    let result = match original.set_state(JobState::Finished) {
                        Ok(()) => self.store().update(&mut original).await,
                        Err(err) => Err(err.into()),
                    };
                    recurring = original.clone();
                    cascade.working.insert(original_id, original);
                    result?;
                }

                job.set_state(JobState::Finished)?;
                self.store().update(job).await?;

                if let Some(interval) = recurring.interval {
                    let mut next = recurring.clone_for_rescheduling();
                    next.execute_after = next_run(interval);
                    let next_id = self.store().insert(&mut next).await?;

                    tracing::info!(
                        job_id = %id,
                        next_id = %next_id,
                        execute_after = %next.execute_after,
                        "Rescheduled recurring job"
                    );
                    cascade.report.spawned.push(next_id);
                }
            }

            other => return Err(StoreError::InvalidCloseOutState(other)),
        }

        tracing::info!(job_id = %id, state = %job.state(), "Job closed");
        Ok(())
    }

    /// Records retries that exist in the store but not on `job`
    ///
    /// A close-out that failed halfway may have inserted a retry that the
    /// caller's copy does not know about. Returns true when any was found.
    async fn adopt_stored_retries(&self, job: &mut Job, id: JobId) -> Result<bool> {
        let known = job.retry_jobs.len();
        if let Some(stored) = self.store().find_by_id(id).await? {
            for retry_id in stored.retry_jobs {
                job.record_retry_job(retry_id);
            }
        }
        Ok(job.retry_jobs.len() > known)
    }

    /// Removes a job from the working set, loading it on first touch
    async fn take(&self, cascade: &mut Cascade, id: JobId) -> Result<Job> {
        match cascade.working.remove(&id) {
            Some(job) => Ok(job),
            None => self.get_by_id(id).await,
        }
    }

    async fn push_dependents(&self, id: JobId, cascade: &mut Cascade) -> Result<()> {
        for dependent in self.store().find_incoming_dependencies(id).await? {
            if let Some(dep_id) = dependent.id {
                cascade.working.entry(dep_id).or_insert(dependent);
                cascade.push(dep_id, JobState::Canceled);
            }
        }
        Ok(())
    }
}

/// `interval` seconds from now, saturating at the latest representable instant
fn next_run(interval: u64) -> DateTime<Utc> {
    i64::try_from(interval)
        .ok()
        .and_then(Duration::try_seconds)
        .and_then(|delay| Utc::now().checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
