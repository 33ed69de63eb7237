//! Local subprocesses
//!
//! Runs jobs as children of the supervisor with piped stdout and stderr.

use anyhow::{Context, Result};
use async_trait::async_trait;
use cadence_core::Job;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::output::{OutputBuffer, spawn_reader};
use super::{ChildProcess, ProcessLauncher};

/// Environment variable carrying the job ID into the child
pub const JOB_ID_ENV: &str = "CADENCE_JOB_ID";

/// Upper bound for waiting on pipe readers after the child exited
const READER_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Launches `job.command` with `job.args` as a local child process
#[derive(Debug, Default, Clone)]
pub struct CommandLauncher {
    working_dir: Option<std::path::PathBuf>,
}

impl CommandLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs children in `dir` instead of the supervisor's working directory
    pub fn with_working_dir(mut self, dir: impl Into<std::path::PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

impl ProcessLauncher for CommandLauncher {
    fn launch(&self, job: &Job) -> Result<Box<dyn ChildProcess>> {
        let job_id = job.id.context("Cannot launch a job that has not been saved")?;

        let mut command = Command::new(&job.command);
        command
            .args(&job.args)
            .env(JOB_ID_ENV, job_id.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to spawn {:?}", job.command))?;

        let stdout = OutputBuffer::new();
        let stderr = OutputBuffer::new();
        let mut readers = Vec::with_capacity(2);
        if let Some(pipe) = child.stdout.take() {
            readers.push(spawn_reader(pipe, stdout.clone()));
        }
        if let Some(pipe) = child.stderr.take() {
            readers.push(spawn_reader(pipe, stderr.clone()));
        }

        debug!(job_id = %job_id, pid = ?child.id(), "Spawned child process");

        Ok(Box::new(LocalChild {
            pid: child.id(),
            child,
            stdout,
            stderr,
            readers,
            exit_status: None,
        }))
    }
}

/// A running child process and its captured output
pub struct LocalChild {
    pid: Option<u32>,
    child: Child,
    stdout: OutputBuffer,
    stderr: OutputBuffer,
    readers: Vec<JoinHandle<()>>,
    exit_status: Option<ExitStatus>,
}

impl LocalChild {
    fn record(&mut self, status: ExitStatus) -> i32 {
        self.exit_status = Some(status);
        exit_code(status)
    }

    fn terminate(&self) -> Result<()> {
        let Some(pid) = self.pid else {
            return Ok(());
        };
        let pid = i32::try_from(pid).context("PID out of range")?;

        match signal::kill(Pid::from_raw(pid), Signal::SIGTERM) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(e) => Err(e).context("Failed to send SIGTERM"),
        }
    }
}

#[async_trait]
impl ChildProcess for LocalChild {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn read_new_output(&mut self) -> String {
        self.stdout.read_new()
    }

    fn read_new_error_output(&mut self) -> String {
        self.stderr.read_new()
    }

    fn try_exit_code(&mut self) -> Result<Option<i32>> {
        if let Some(status) = self.exit_status {
            return Ok(Some(exit_code(status)));
        }

        let status = self
            .child
            .try_wait()
            .context("Failed to check child process")?;
        Ok(status.map(|status| self.record(status)))
    }

    async fn stop(&mut self, grace: Duration) -> Result<()> {
        if self.try_exit_code()?.is_some() {
            return Ok(());
        }

        self.terminate()?;

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => {
                self.record(status.context("Failed to wait for child process")?);
            }
            Err(_) => {
                warn!(pid = ?self.pid, "Child ignored SIGTERM, killing it");
                self.child
                    .kill()
                    .await
                    .context("Failed to kill child process")?;
                let status = self
                    .child
                    .wait()
                    .await
                    .context("Failed to wait for child process")?;
                self.record(status);
            }
        }

        Ok(())
    }

    async fn finish(&mut self) -> (String, String) {
        for reader in self.readers.drain(..) {
            let abort = reader.abort_handle();
            if tokio::time::timeout(READER_JOIN_TIMEOUT, reader).await.is_err() {
                // A grandchild still holds the pipe open.
                debug!(pid = ?self.pid, "Pipe reader did not finish in time");
                abort.abort();
            }
        }

        (self.stdout.read_rest(), self.stderr.read_rest())
    }
}

/// Exit code of a finished process; signals map to 128 + signal number
fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::{JobId, JobState};

    fn shell(script: &str) -> Job {
        Job::new("sh", vec!["-c".to_string(), script.to_string()])
            .restored(JobId(7), JobState::Running)
    }

    async fn wait_for_exit(child: &mut Box<dyn ChildProcess>) -> i32 {
        for _ in 0..200 {
            if let Some(code) = child.try_exit_code().unwrap() {
                return code;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("child did not exit");
    }

    #[tokio::test]
    async fn test_captures_output_and_exit_code() {
        let launcher = CommandLauncher::new();
        let mut child = launcher
            .launch(&shell("echo out; echo err >&2; exit 3"))
            .unwrap();

        assert!(child.pid().is_some());
        assert_eq!(wait_for_exit(&mut child).await, 3);

        let (stdout, stderr) = child.finish().await;
        assert_eq!(stdout, "out\n");
        assert_eq!(stderr, "err\n");
    }

    #[tokio::test]
    async fn test_passes_job_id() {
        let launcher = CommandLauncher::new();
        let mut child = launcher.launch(&shell("echo $CADENCE_JOB_ID")).unwrap();

        assert_eq!(wait_for_exit(&mut child).await, 0);
        let (stdout, _) = child.finish().await;
        assert_eq!(stdout.trim(), "7");
    }

    #[tokio::test]
    async fn test_stop_terminates_long_running_child() {
        let launcher = CommandLauncher::new();
        let mut child = launcher.launch(&shell("exec sleep 30")).unwrap();
        assert!(child.try_exit_code().unwrap().is_none());

        child.stop(Duration::from_secs(2)).await.unwrap();
        assert_eq!(child.try_exit_code().unwrap(), Some(128 + 15));
    }

    #[tokio::test]
    async fn test_stop_kills_after_grace_period() {
        let launcher = CommandLauncher::new();
        let mut child = launcher
            .launch(&shell("trap '' TERM; while true; do sleep 0.05; done"))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        child.stop(Duration::from_millis(200)).await.unwrap();
        assert_eq!(child.try_exit_code().unwrap(), Some(128 + 9));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_an_error() {
        let launcher = CommandLauncher::new();
        let job = Job::new("/nonexistent/cadence-test-binary", vec![])
            .restored(JobId(1), JobState::Running);

        let err = launcher.launch(&job).err().unwrap();
        assert!(err.to_string().contains("Failed to spawn"));
    }

    #[test]
    fn test_unsaved_job_is_rejected() {
        let launcher = CommandLauncher::new();
        let err = launcher.launch(&Job::new("true", vec![])).err().unwrap();
        assert!(err.to_string().contains("not been saved"));
    }
}
