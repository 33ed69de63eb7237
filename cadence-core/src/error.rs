//! Error types for job invariants

use thiserror::Error;

use crate::domain::job::JobState;

/// Errors raised when an operation would break a job invariant
///
/// These indicate a bug or a lost update. Callers propagate them; they are
/// never a normal job outcome.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    /// The requested state is not reachable from the current one
    #[error(
        "invalid state transition for {job}: {from} -> {to} (allowed: {})",
        format_states(.allowed)
    )]
    InvalidStateTransition {
        job: String,
        from: JobState,
        to: JobState,
        allowed: Vec<JobState>,
    },

    /// Dependencies are frozen once a job might have been started
    #[error("cannot add a dependency to {job}, which might have been started already")]
    DependencyAfterStart { job: String },

    /// Dependencies are tracked by ID, so they must be persisted first
    #[error("dependency {dependency} of {job} has not been persisted")]
    UnsavedDependency { job: String, dependency: String },

    /// A job cannot depend on itself
    #[error("{job} cannot depend on itself")]
    SelfDependency { job: String },

    /// The original job link can only be set on a fresh retry job
    #[error("{job} must be in state \"pending\" to get an original job (is {state})")]
    OriginalJobNotPending { job: String, state: JobState },

    /// The original job link is write-once
    #[error("{job} already has an original job set")]
    OriginalJobAlreadySet { job: String },

    /// Only a running job can spawn retry attempts
    #[error("retry jobs can only be added to running jobs; {job} is {state}")]
    RetryOnNonRunningJob { job: String, state: JobState },

    /// The operation needs an ID assigned by the store
    #[error("{job} has not been persisted")]
    NotPersisted { job: String },

    /// A stored state string did not match any known state
    #[error("unknown job state: {0}")]
    UnknownState(String),
}

fn format_states(states: &[JobState]) -> String {
    if states.is_empty() {
        return "none".to_string();
    }

    states
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_transition_message_lists_allowed_states() {
        let err = JobError::InvalidStateTransition {
            job: "Job(id = 7, command = \"report\")".to_string(),
            from: JobState::Pending,
            to: JobState::Finished,
            allowed: vec![JobState::Running, JobState::Canceled],
        };

        assert_eq!(
            err.to_string(),
            "invalid state transition for Job(id = 7, command = \"report\"): pending -> finished (allowed: running, canceled)"
        );
    }

    #[test]
    fn test_terminal_transition_message_says_none() {
        let err = JobError::InvalidStateTransition {
            job: "Job(new, command = \"x\")".to_string(),
            from: JobState::Failed,
            to: JobState::Running,
            allowed: vec![],
        };

        assert!(err.to_string().ends_with("(allowed: none)"));
    }
}
