//! Extension hooks
//!
//! Hooks are consulted at fixed points of the job lifecycle:
//! - `StateChangeHook` before a supervisor starts a job and before close-out
//!   applies a final state. It may override the proposed state.
//! - `OutputHook` whenever a running job produced new output. It may rewrite
//!   the chunk before it is persisted.

use chrono::Utc;
use std::fmt;

use crate::domain::job::{Job, JobState};

/// Which stream a chunk of job output came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputStream::Stdout => f.write_str("stdout"),
            OutputStream::Stderr => f.write_str("stderr"),
        }
    }
}

/// Hook consulted before a job changes state
pub trait StateChangeHook: Send + Sync {
    /// Returns the state that should be applied instead of `proposed`
    fn on_state_change(&self, job: &Job, proposed: JobState) -> JobState;
}

/// Hook consulted for every new chunk of job output
pub trait OutputHook: Send + Sync {
    /// Returns the chunk that should be persisted
    fn on_new_output(&self, job: &Job, output: String, stream: OutputStream) -> String;
}

/// Hook that accepts everything unchanged
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHook;

impl StateChangeHook for NoopHook {
    fn on_state_change(&self, _job: &Job, proposed: JobState) -> JobState {
        proposed
    }
}

impl OutputHook for NoopHook {
    fn on_new_output(&self, _job: &Job, output: String, _stream: OutputStream) -> String {
        output
    }
}

/// Cancels jobs whose `expires_at` has passed before they could start
#[derive(Debug, Default, Clone, Copy)]
pub struct ExpirationPolicy;

impl StateChangeHook for ExpirationPolicy {
    fn on_state_change(&self, job: &Job, proposed: JobState) -> JobState {
        match (proposed, job.expires_at) {
            (JobState::Running, Some(expires_at)) if expires_at <= Utc::now() => JobState::Canceled,
            _ => proposed,
        }
    }
}
