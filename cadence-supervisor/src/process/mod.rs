//! Process layer
//!
//! Launching and observing the subprocess behind a running job. The
//! supervisor only talks to `ProcessLauncher` and `ChildProcess`, so tests
//! and alternative runtimes can swap the local implementation out.

pub mod local;
pub mod output;

use async_trait::async_trait;
use cadence_core::Job;
use std::time::Duration;

pub use local::{CommandLauncher, JOB_ID_ENV, LocalChild};
pub use output::OutputBuffer;

/// Starts the subprocess for a job
pub trait ProcessLauncher: Send + Sync {
    /// Spawns the job's command
    ///
    /// # Arguments
    /// * `job` - A persisted job; its ID is handed to the child
    fn launch(&self, job: &Job) -> anyhow::Result<Box<dyn ChildProcess>>;
}

/// Handle on a launched subprocess
#[async_trait]
pub trait ChildProcess: Send {
    /// OS process ID, if known
    fn pid(&self) -> Option<u32>;

    /// Stdout produced since the last call
    fn read_new_output(&mut self) -> String;

    /// Stderr produced since the last call
    fn read_new_error_output(&mut self) -> String;

    /// Exit code once the process has exited, `None` while it runs
    fn try_exit_code(&mut self) -> anyhow::Result<Option<i32>>;

    /// Stops the process: SIGTERM, then SIGKILL once `grace` has passed
    async fn stop(&mut self, grace: Duration) -> anyhow::Result<()>;

    /// Waits for the pipes to close and returns unread (stdout, stderr)
    async fn finish(&mut self) -> (String, String);
}
