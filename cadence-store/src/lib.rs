//! Cadence Store
//!
//! Persistence and lifecycle services for the job queue.
//!
//! Architecture:
//! - Database: pool creation and idempotent schema migrations
//! - Repositories: the `JobStore` contract with Postgres and in-memory backends
//! - Services: job selection, de-duplication and the close-out cascade
//!
//! Every write of an existing job is a compare-and-swap on the state it was
//! loaded with, so several supervisors can share one store.

pub mod db;
pub mod error;
pub mod repository;
pub mod service;

pub use error::StoreError;
pub use repository::{InMemoryJobStore, JobStore, PgJobStore};
pub use service::{CloseOutReport, JobService};
