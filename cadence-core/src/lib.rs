//! Cadence Core
//!
//! Core types and abstractions for the Cadence job queue.
//!
//! This crate contains:
//! - Domain types: the job entity and its state machine
//! - Hooks: extension points consulted on state changes and new output
//! - Errors: violations of the job invariants

pub mod domain;
pub mod error;
pub mod hooks;

pub use domain::job::{DependencyRef, Job, JobId, JobState};
pub use domain::related::RelatedEntity;
pub use error::JobError;
