//! Job domain types
//!
//! The job entity and the state machine that governs it. `Job::set_state` is
//! the only way a job's state changes; everything else (close-out, the
//! supervisor, recovery) routes through it.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::domain::related::RelatedEntity;
use crate::error::JobError;

/// Job identifier, assigned by the store on first persistence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl JobId {
    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for JobId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl FromStr for JobId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<i64>().map(JobId)
    }
}

/// Job lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Inserted, but not yet confirmed; never started in this state
    New,
    /// Confirmed and might be started, once all dependencies are finished
    Pending,
    /// Never started, and never will be
    Canceled,
    /// Started and not yet exited
    Running,
    /// Exited with a successful exit code
    Finished,
    /// Exited with a non-successful exit code
    Failed,
    /// Stopped after exceeding its maximum runtime
    Terminated,
    /// The supervisor running it went away before it was closed out
    Incomplete,
}

impl JobState {
    pub const ALL: [JobState; 8] = [
        JobState::New,
        JobState::Pending,
        JobState::Canceled,
        JobState::Running,
        JobState::Finished,
        JobState::Failed,
        JobState::Terminated,
        JobState::Incomplete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::New => "new",
            JobState::Pending => "pending",
            JobState::Canceled => "canceled",
            JobState::Running => "running",
            JobState::Finished => "finished",
            JobState::Failed => "failed",
            JobState::Terminated => "terminated",
            JobState::Incomplete => "incomplete",
        }
    }

    /// States reachable from this one in a single transition
    pub fn allowed_transitions(&self) -> &'static [JobState] {
        match self {
            JobState::New => &[JobState::Pending, JobState::Canceled],
            JobState::Pending => &[JobState::Running, JobState::Canceled],
            JobState::Running => &[
                JobState::Finished,
                JobState::Failed,
                JobState::Terminated,
                JobState::Incomplete,
            ],
            JobState::Finished
            | JobState::Failed
            | JobState::Terminated
            | JobState::Incomplete
            | JobState::Canceled => &[],
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(
            self,
            JobState::Canceled
                | JobState::Finished
                | JobState::Failed
                | JobState::Terminated
                | JobState::Incomplete
        )
    }

    pub fn is_non_successful_final(&self) -> bool {
        matches!(
            self,
            JobState::Canceled | JobState::Failed | JobState::Incomplete | JobState::Terminated
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| JobError::UnknownState(s.to_string()))
    }
}

/// A dependency edge together with the dependency's state when loaded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyRef {
    pub id: JobId,
    pub state: JobState,
}

/// A schedulable unit of work wrapping an external command invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Option<JobId>,
    state: JobState,
    pub command: String,
    pub args: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub checked_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub execute_after: DateTime<Utc>,
    /// Seconds between runs of a recurring job
    pub interval: Option<u64>,
    pub expires_at: Option<DateTime<Utc>>,
    pub output: Option<String>,
    pub error_output: Option<String>,
    pub exit_code: Option<i32>,
    /// Seconds; 0 means unlimited
    pub max_runtime: u64,
    pub max_retries: u32,
    /// Wall-clock seconds of the last run
    pub runtime: Option<u64>,
    pub memory_usage: Option<u64>,
    pub memory_usage_real: Option<u64>,
    pub stack_trace: Option<String>,
    pub dependencies: Vec<DependencyRef>,
    pub original_job: Option<JobId>,
    pub retry_jobs: Vec<JobId>,
    pub related_entities: Vec<RelatedEntity>,
    #[serde(skip)]
    persisted_state: Option<JobState>,
}

impl Job {
    /// Creates a confirmed job, ready to be picked up once startable
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self::with_state(command.into(), args, JobState::Pending)
    }

    /// Creates a job in state `new`; it must be confirmed before it can run
    pub fn new_unconfirmed(command: impl Into<String>, args: Vec<String>) -> Self {
        Self::with_state(command.into(), args, JobState::New)
    }

    fn with_state(command: String, args: Vec<String>, state: JobState) -> Self {
        let now = Utc::now();
        Self {
            id: None,
            state,
            command,
            args,
            created_at: now,
            started_at: None,
            checked_at: None,
            closed_at: None,
            execute_after: now - Duration::seconds(1),
            interval: None,
            expires_at: None,
            output: None,
            error_output: None,
            exit_code: None,
            max_runtime: 0,
            max_retries: 0,
            runtime: None,
            memory_usage: None,
            memory_usage_real: None,
            stack_trace: None,
            dependencies: Vec::new(),
            original_job: None,
            retry_jobs: Vec::new(),
            related_entities: Vec::new(),
            persisted_state: None,
        }
    }

    /// Rehydrates a job read from storage
    ///
    /// Sets the stored state without consulting the transition table. Only
    /// stores should call this.
    pub fn restored(mut self, id: JobId, state: JobState) -> Self {
        self.id = Some(id);
        self.state = state;
        self.persisted_state = Some(state);
        self
    }

    pub fn with_max_runtime(mut self, seconds: u64) -> Self {
        self.max_runtime = seconds;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_interval(mut self, seconds: u64) -> Self {
        self.interval = Some(seconds);
        self
    }

    pub fn with_execute_after(mut self, execute_after: DateTime<Utc>) -> Self {
        self.execute_after = execute_after;
        self
    }

    pub fn with_expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// State as of the last successful load or save
    ///
    /// Stores use it as the expected value of their compare-and-swap.
    pub fn persisted_state(&self) -> Option<JobState> {
        self.persisted_state
    }

    /// Records that the current state has been written to the store
    pub fn mark_persisted(&mut self) {
        self.persisted_state = Some(self.state);
    }

    /// Moves the job to `new_state`, following the transition table
    ///
    /// Requesting the current state is a no-op.
    pub fn set_state(&mut self, new_state: JobState) -> Result<(), JobError> {
        if new_state == self.state {
            return Ok(());
        }

        let allowed = self.state.allowed_transitions();
        if !allowed.contains(&new_state) {
            return Err(JobError::InvalidStateTransition {
                job: self.to_string(),
                from: self.state,
                to: new_state,
                allowed: allowed.to_vec(),
            });
        }

        let now = Utc::now();
        match (self.state, new_state) {
            (JobState::Pending, JobState::Running) => {
                self.started_at = Some(now);
                self.checked_at = Some(now);
            }
            (_, JobState::Canceled) | (JobState::Running, _) => {
                self.closed_at = Some(now);
            }
            _ => {}
        }

        self.state = new_state;
        Ok(())
    }

    /// True when every dependency has finished
    pub fn is_startable(&self) -> bool {
        self.dependencies
            .iter()
            .all(|dep| dep.state == JobState::Finished)
    }

    /// Whether a supervisor could already have picked this job up
    pub fn might_have_started(&self) -> bool {
        if self.id.is_none() {
            return false;
        }

        match self.state {
            JobState::New => false,
            JobState::Pending => self.is_startable(),
            _ => true,
        }
    }

    pub fn has_dependency(&self, id: JobId) -> bool {
        self.dependencies.iter().any(|dep| dep.id == id)
    }

    pub fn add_dependency(&mut self, dependency: &Job) -> Result<(), JobError> {
        let dep_id = dependency.id.ok_or_else(|| JobError::UnsavedDependency {
            job: self.to_string(),
            dependency: dependency.to_string(),
        })?;

        if self.id == Some(dep_id) {
            return Err(JobError::SelfDependency {
                job: self.to_string(),
            });
        }

        if self.has_dependency(dep_id) {
            return Ok(());
        }

        if self.might_have_started() {
            return Err(JobError::DependencyAfterStart {
                job: self.to_string(),
            });
        }

        self.dependencies.push(DependencyRef {
            id: dep_id,
            state: dependency.state,
        });
        Ok(())
    }

    pub fn is_retry_allowed(&self) -> bool {
        if self.max_retries == 0 {
            return false;
        }

        self.retry_jobs.len() < self.max_retries as usize
    }

    pub fn is_retry_job(&self) -> bool {
        self.original_job.is_some()
    }

    /// The job that owns the retry chain: the original for retry jobs, else itself
    pub fn original_job_id(&self) -> Option<JobId> {
        self.original_job.or(self.id)
    }

    pub fn set_original_job(&mut self, original: JobId) -> Result<(), JobError> {
        if self.state != JobState::Pending {
            return Err(JobError::OriginalJobNotPending {
                job: self.to_string(),
                state: self.state,
            });
        }

        if self.original_job.is_some() {
            return Err(JobError::OriginalJobAlreadySet {
                job: self.to_string(),
            });
        }

        self.original_job = Some(original);
        Ok(())
    }

    /// Links `retry` as a retry attempt of this job
    ///
    /// The retry's ID is recorded with `record_retry_job` once the store has
    /// assigned one.
    pub fn add_retry_job(&self, retry: &mut Job) -> Result<(), JobError> {
        if self.state != JobState::Running {
            return Err(JobError::RetryOnNonRunningJob {
                job: self.to_string(),
                state: self.state,
            });
        }

        let id = self.id.ok_or_else(|| JobError::NotPersisted {
            job: self.to_string(),
        })?;

        retry.set_original_job(id)
    }

    pub fn record_retry_job(&mut self, retry_id: JobId) {
        if !self.retry_jobs.contains(&retry_id) {
            self.retry_jobs.push(retry_id);
        }
    }

    /// Creates the next attempt after a retryable failure
    pub fn new_retry_attempt(&self) -> Job {
        Job::new(self.command.clone(), self.args.clone()).with_max_runtime(self.max_runtime)
    }

    pub fn add_related_entity(&mut self, entity: RelatedEntity) {
        if !self.related_entities.contains(&entity) {
            self.related_entities.push(entity);
        }
    }

    pub fn find_related_entity(&self, kind: &str) -> Option<&RelatedEntity> {
        self.related_entities.iter().find(|e| e.kind == kind)
    }

    pub fn is_closed_non_successful(&self) -> bool {
        self.state.is_non_successful_final()
    }

    /// Updates the liveness timestamp of a running job
    pub fn checked(&mut self) {
        self.checked_at = Some(Utc::now());
    }

    pub fn add_output(&mut self, output: &str) {
        if !output.is_empty() {
            self.output.get_or_insert_with(String::new).push_str(output);
        }
    }

    pub fn add_error_output(&mut self, output: &str) {
        if !output.is_empty() {
            self.error_output
                .get_or_insert_with(String::new)
                .push_str(output);
        }
    }

    /// Copies this job into a fresh pending job with no execution results
    ///
    /// Used for recurring jobs and manual retries. The copy has no ID and no
    /// retry links; dependencies and related entities are kept.
    pub fn clone_for_rescheduling(&self) -> Job {
        let mut copy = self.clone();
        copy.id = None;
        copy.state = JobState::Pending;
        copy.persisted_state = None;
        copy.created_at = Utc::now();
        copy.started_at = None;
        copy.checked_at = None;
        copy.closed_at = None;
        copy.output = None;
        copy.error_output = None;
        copy.exit_code = None;
        copy.stack_trace = None;
        copy.runtime = None;
        copy.memory_usage = None;
        copy.memory_usage_real = None;
        copy.original_job = None;
        copy.retry_jobs = Vec::new();
        copy
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id {
            Some(id) => write!(f, "Job(id = {}, command = {:?})", id, self.command),
            None => write!(f, "Job(new, command = {:?})", self.command),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_in(state: JobState) -> Job {
        Job::new("cmd", vec![]).restored(JobId(1), state)
    }

    #[test]
    fn test_transition_table() {
        for from in JobState::ALL {
            for to in JobState::ALL {
                let mut job = job_in(from);
                let result = job.set_state(to);
                let expected = from == to || from.allowed_transitions().contains(&to);

                assert_eq!(result.is_ok(), expected, "{} -> {}", from, to);
                if expected {
                    assert_eq!(job.state(), to);
                } else {
                    assert_eq!(job.state(), from, "state must not change on rejection");
                }
            }
        }
    }

    #[test]
    fn test_rejected_transition_reports_allowed_states() {
        let mut job = job_in(JobState::Pending);
        let err = job.set_state(JobState::Finished).unwrap_err();

        match err {
            JobError::InvalidStateTransition {
                from, to, allowed, ..
            } => {
                assert_eq!(from, JobState::Pending);
                assert_eq!(to, JobState::Finished);
                assert_eq!(allowed, vec![JobState::Running, JobState::Canceled]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_terminal_states_reject_everything() {
        for state in [
            JobState::Finished,
            JobState::Failed,
            JobState::Terminated,
            JobState::Incomplete,
            JobState::Canceled,
        ] {
            assert!(state.is_final());
            assert!(state.allowed_transitions().is_empty());
            assert!(job_in(state).set_state(JobState::Running).is_err());
        }
    }

    #[test]
    fn test_same_state_is_noop() {
        let mut job = job_in(JobState::Finished);
        assert!(job.set_state(JobState::Finished).is_ok());
        assert!(job.closed_at.is_none());
    }

    #[test]
    fn test_transition_timestamps() {
        let mut job = Job::new("cmd", vec![]);
        job.set_state(JobState::Running).unwrap();
        assert!(job.started_at.is_some());
        assert!(job.checked_at.is_some());
        assert!(job.closed_at.is_none());

        job.set_state(JobState::Failed).unwrap();
        assert!(job.closed_at.is_some());

        let mut unconfirmed = Job::new_unconfirmed("cmd", vec![]);
        assert_eq!(unconfirmed.state(), JobState::New);
        unconfirmed.set_state(JobState::Canceled).unwrap();
        assert!(unconfirmed.closed_at.is_some());
        assert!(unconfirmed.started_at.is_none());
    }

    #[test]
    fn test_state_strings() {
        for state in JobState::ALL {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert_eq!(
            "bogus".parse::<JobState>(),
            Err(JobError::UnknownState("bogus".to_string()))
        );
        assert_eq!(
            serde_json::to_string(&JobState::Incomplete).unwrap(),
            "\"incomplete\""
        );
    }

    #[test]
    fn test_startable_requires_all_dependencies_finished() {
        let a = job_in(JobState::Finished).restored(JobId(10), JobState::Finished);
        let b = job_in(JobState::Running).restored(JobId(11), JobState::Running);

        let mut job = Job::new("cmd", vec![]);
        assert!(job.is_startable());

        job.add_dependency(&a).unwrap();
        job.add_dependency(&b).unwrap();
        assert!(!job.is_startable());

        job.dependencies[1].state = JobState::Finished;
        assert!(job.is_startable());

        job.dependencies[0].state = JobState::Failed;
        assert!(!job.is_startable());
    }

    #[test]
    fn test_add_dependency_rules() {
        let dep = job_in(JobState::Pending).restored(JobId(5), JobState::Pending);
        let unsaved = Job::new("other", vec![]);

        let mut job = Job::new("cmd", vec![]);
        assert!(matches!(
            job.add_dependency(&unsaved),
            Err(JobError::UnsavedDependency { .. })
        ));

        job.add_dependency(&dep).unwrap();
        job.add_dependency(&dep).unwrap();
        assert_eq!(job.dependencies.len(), 1);

        // Persisted, pending and blocked on `dep`: still editable.
        let mut job = job.restored(JobId(6), JobState::Pending);
        let another = job_in(JobState::Pending).restored(JobId(7), JobState::Pending);
        job.add_dependency(&another).unwrap();

        let mut startable = Job::new("cmd", vec![]).restored(JobId(8), JobState::Pending);
        assert!(matches!(
            startable.add_dependency(&dep),
            Err(JobError::DependencyAfterStart { .. })
        ));

        let mut running = job_in(JobState::Running).restored(JobId(9), JobState::Running);
        assert!(running.add_dependency(&dep).is_err());

        let mut itself = Job::new("cmd", vec![]).restored(JobId(5), JobState::New);
        assert!(matches!(
            itself.add_dependency(&dep),
            Err(JobError::SelfDependency { .. })
        ));
    }

    #[test]
    fn test_retry_allowed() {
        let mut job = job_in(JobState::Running);
        assert!(!job.is_retry_allowed());

        job.max_retries = 2;
        assert!(job.is_retry_allowed());
        job.record_retry_job(JobId(2));
        assert!(job.is_retry_allowed());
        job.record_retry_job(JobId(3));
        assert!(!job.is_retry_allowed());

        job.record_retry_job(JobId(3));
        assert_eq!(job.retry_jobs.len(), 2);
    }

    #[test]
    fn test_add_retry_job_links_original() {
        let original = job_in(JobState::Running);
        let mut retry = original.new_retry_attempt();

        original.add_retry_job(&mut retry).unwrap();
        assert_eq!(retry.original_job, Some(JobId(1)));
        assert!(retry.is_retry_job());
        assert_eq!(retry.original_job_id(), Some(JobId(1)));

        assert!(matches!(
            retry.set_original_job(JobId(99)),
            Err(JobError::OriginalJobAlreadySet { .. })
        ));

        let pending = job_in(JobState::Pending);
        let mut another = pending.new_retry_attempt();
        assert!(matches!(
            pending.add_retry_job(&mut another),
            Err(JobError::RetryOnNonRunningJob { .. })
        ));

        let mut running_retry = job_in(JobState::Running);
        assert!(matches!(
            running_retry.set_original_job(JobId(1)),
            Err(JobError::OriginalJobNotPending { .. })
        ));
    }

    #[test]
    fn test_retry_attempt_copies_command_and_runtime() {
        let job = Job::new("import", vec!["--full".to_string()])
            .with_max_runtime(30)
            .with_max_retries(3)
            .with_interval(60);
        let retry = job.new_retry_attempt();

        assert_eq!(retry.command, "import");
        assert_eq!(retry.args, vec!["--full".to_string()]);
        assert_eq!(retry.max_runtime, 30);
        assert_eq!(retry.max_retries, 0);
        assert_eq!(retry.interval, None);
        assert_eq!(retry.state(), JobState::Pending);
    }

    #[test]
    fn test_clone_for_rescheduling_resets_results() {
        let mut job = Job::new("sync", vec!["a".to_string()])
            .with_interval(60)
            .with_max_runtime(10)
            .restored(JobId(4), JobState::Running);
        job.started_at = Some(Utc::now());
        job.checked_at = Some(Utc::now());
        job.add_output("out");
        job.add_error_output("err");
        job.exit_code = Some(1);
        job.runtime = Some(3);
        job.memory_usage = Some(1024);
        job.memory_usage_real = Some(2048);
        job.stack_trace = Some("trace".to_string());
        job.original_job = Some(JobId(2));
        job.retry_jobs = vec![JobId(5)];
        job.set_state(JobState::Finished).unwrap();

        let copy = job.clone_for_rescheduling();

        assert_eq!(copy.id, None);
        assert_eq!(copy.state(), JobState::Pending);
        assert_eq!(copy.persisted_state(), None);
        assert!(copy.created_at >= job.created_at);
        assert!(copy.started_at.is_none());
        assert!(copy.checked_at.is_none());
        assert!(copy.closed_at.is_none());
        assert!(copy.output.is_none());
        assert!(copy.error_output.is_none());
        assert!(copy.exit_code.is_none());
        assert!(copy.runtime.is_none());
        assert!(copy.memory_usage.is_none());
        assert!(copy.memory_usage_real.is_none());
        assert!(copy.stack_trace.is_none());
        assert!(copy.original_job.is_none());
        assert!(copy.retry_jobs.is_empty());
        assert_eq!(copy.command, "sync");
        assert_eq!(copy.interval, Some(60));
        assert_eq!(copy.max_runtime, 10);
    }

    #[test]
    fn test_output_accumulates() {
        let mut job = Job::new("cmd", vec![]);
        job.add_output("");
        assert!(job.output.is_none());

        job.add_output("a");
        job.add_output("b");
        job.add_error_output("c");
        assert_eq!(job.output.as_deref(), Some("ab"));
        assert_eq!(job.error_output.as_deref(), Some("c"));
    }

    #[test]
    fn test_related_entities() {
        let mut job = Job::new("cmd", vec![]);
        job.add_related_entity(RelatedEntity::new("invoice", "1"));
        job.add_related_entity(RelatedEntity::new("invoice", "1"));
        job.add_related_entity(RelatedEntity::new("user", "7"));

        assert_eq!(job.related_entities.len(), 2);
        assert_eq!(
            job.find_related_entity("user"),
            Some(&RelatedEntity::new("user", "7"))
        );
        assert!(job.find_related_entity("order").is_none());
    }

    #[test]
    fn test_display() {
        let job = Job::new("report", vec![]);
        assert_eq!(job.to_string(), "Job(new, command = \"report\")");
        let job = job.restored(JobId(3), JobState::Pending);
        assert_eq!(job.to_string(), "Job(id = 3, command = \"report\")");
    }

    #[test]
    fn test_new_job_is_immediately_due() {
        let job = Job::new("cmd", vec![]);
        assert!(job.execute_after < Utc::now());
        assert_eq!(job.state(), JobState::Pending);
    }
}
