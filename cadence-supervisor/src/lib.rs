//! Cadence Supervisor
//!
//! Runs queued jobs as local subprocesses.
//!
//! Architecture:
//! - Config: run budget, concurrency and timing
//! - Process: launching children and capturing their output
//! - Scheduler: the polling run-loop
//! - Recovery: closing out jobs a dead supervisor left behind

pub mod config;
pub mod process;
pub mod recovery;
pub mod scheduler;

pub use config::SupervisorConfig;
pub use process::{ChildProcess, CommandLauncher, ProcessLauncher};
pub use recovery::{ProcessRecoveryInvoker, RecoveryInvoker, TaskRecoveryInvoker};
pub use scheduler::{RunSummary, Supervisor};
