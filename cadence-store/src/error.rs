//! Error types for the store and its services

use cadence_core::{JobError, JobId, JobState};
use thiserror::Error;

/// Result type alias for store operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur when reading or mutating jobs
#[derive(Debug, Error)]
pub enum StoreError {
    /// The database rejected or failed a query
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A JSON column could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A job invariant was violated
    #[error(transparent)]
    Job(#[from] JobError),

    /// No job with this ID exists
    #[error("Job {0} not found")]
    NotFound(JobId),

    /// No job matched the command and arguments
    #[error("Found no job for command {command:?} with args {args:?}")]
    JobNotFoundForCommand { command: String, args: Vec<String> },

    /// The stored state changed since the job was loaded
    #[error("Job {id} was modified concurrently (expected stored state {expected})")]
    Conflict { id: JobId, expected: JobState },

    /// The dependency would make the job wait on itself
    #[error("Adding dependency {dependency} to job {job} would create a cycle")]
    DependencyCycle { job: JobId, dependency: JobId },

    /// Close-out was asked to apply a state that is not a final state
    #[error("State {0} is not allowed in close-out")]
    InvalidCloseOutState(JobState),

    /// Only jobs that ended badly can be retried by hand
    #[error("Job {id} cannot be retried in state {state}")]
    NotRetryable { id: JobId, state: JobState },

    /// A stored value is out of range for the domain type
    #[error("Invalid stored value: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Check if another writer got to the job first
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Check if retrying the same operation later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}
