//! Scheduler layer for the supervisor
//!
//! This layer owns the run-loop: it picks startable jobs, tracks their
//! subprocesses and hands finished ones to the close-out.

pub mod supervisor;

pub use supervisor::{RunSummary, Supervisor};
