//! Supervisor configuration
//!
//! Defines the run budget, concurrency limit and the timing knobs of the
//! polling loop.

use std::time::Duration;

/// Supervisor configuration
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Unique identifier for this supervisor instance, used in logs
    pub supervisor_id: String,

    /// Wall-clock budget for starting new jobs
    pub max_runtime: Duration,

    /// Upper bound on subprocesses tracked at once
    pub max_concurrent_jobs: usize,

    /// Sleep after an empty queue or a failed iteration
    pub idle_time: Duration,

    /// Sleep between starting a job and re-polling the running ones
    pub poll_interval: Duration,

    /// Time a stopped subprocess gets between SIGTERM and SIGKILL
    pub stop_grace_period: Duration,

    /// Close out jobs left `running` by a previous supervisor at startup
    pub recovery_enabled: bool,
}

impl SupervisorConfig {
    /// Creates a new configuration with defaults
    pub fn new(max_runtime: Duration, max_concurrent_jobs: usize, idle_time: Duration) -> Self {
        Self {
            supervisor_id: uuid::Uuid::new_v4().to_string(),
            max_runtime,
            max_concurrent_jobs,
            idle_time,
            poll_interval: Duration::from_secs(1),
            stop_grace_period: Duration::from_secs(5),
            recovery_enabled: true,
        }
    }

    /// Builds a configuration from user supplied limits
    ///
    /// Rejects non-positive values so that nothing is touched with a broken
    /// configuration.
    pub fn from_limits(
        max_runtime_secs: i64,
        max_concurrent_jobs: i64,
        idle_time_secs: i64,
    ) -> anyhow::Result<Self> {
        if max_runtime_secs <= 0 {
            anyhow::bail!("max-runtime must be greater than 0, got {}", max_runtime_secs);
        }

        if max_concurrent_jobs <= 0 {
            anyhow::bail!(
                "max-concurrent-jobs must be greater than 0, got {}",
                max_concurrent_jobs
            );
        }

        if idle_time_secs <= 0 {
            anyhow::bail!("idle-time must be greater than 0, got {}", idle_time_secs);
        }

        let config = Self::new(
            Duration::from_secs(max_runtime_secs.unsigned_abs()),
            usize::try_from(max_concurrent_jobs)?,
            Duration::from_secs(idle_time_secs.unsigned_abs()),
        );
        config.validate()?;

        Ok(config)
    }

    /// Applies optional overrides from environment variables
    ///
    /// Recognized variables:
    /// - CADENCE_POLL_INTERVAL_MS (milliseconds, default: 1000)
    /// - CADENCE_STOP_GRACE_PERIOD (seconds, default: 5)
    /// - CADENCE_RECOVERY (`0`/`false` disables stale-job recovery)
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(ms) = std::env::var("CADENCE_POLL_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        {
            self.poll_interval = Duration::from_millis(ms);
        }

        if let Some(secs) = std::env::var("CADENCE_STOP_GRACE_PERIOD")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        {
            self.stop_grace_period = Duration::from_secs(secs);
        }

        if let Ok(value) = std::env::var("CADENCE_RECOVERY") {
            self.recovery_enabled = !matches!(value.as_str(), "0" | "false" | "no");
        }

        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_stop_grace_period(mut self, grace: Duration) -> Self {
        self.stop_grace_period = grace;
        self
    }

    pub fn with_recovery(mut self, enabled: bool) -> Self {
        self.recovery_enabled = enabled;
        self
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.supervisor_id.is_empty() {
            anyhow::bail!("supervisor_id cannot be empty");
        }

        if self.max_runtime.is_zero() {
            anyhow::bail!("max_runtime must be greater than 0");
        }

        if self.max_concurrent_jobs == 0 {
            anyhow::bail!("max_concurrent_jobs must be greater than 0");
        }

        if self.idle_time.is_zero() {
            anyhow::bail!("idle_time must be greater than 0");
        }

        if self.poll_interval.is_zero() {
            anyhow::bail!("poll_interval must be greater than 0");
        }

        Ok(())
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(900), 4, Duration::from_secs(2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SupervisorConfig::default();
        assert_eq!(config.max_runtime, Duration::from_secs(900));
        assert_eq!(config.max_concurrent_jobs, 4);
        assert_eq!(config.idle_time, Duration::from_secs(2));
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.stop_grace_period, Duration::from_secs(5));
        assert!(config.recovery_enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_limits_rejects_non_positive_values() {
        assert!(SupervisorConfig::from_limits(60, 2, 1).is_ok());

        assert!(SupervisorConfig::from_limits(0, 2, 1).is_err());
        assert!(SupervisorConfig::from_limits(60, -1, 1).is_err());
        assert!(SupervisorConfig::from_limits(60, 2, 0).is_err());

        let err = SupervisorConfig::from_limits(-5, 2, 1).unwrap_err();
        assert!(err.to_string().contains("max-runtime"));
    }

    #[test]
    fn test_config_validation() {
        let mut config = SupervisorConfig::default();
        assert!(config.validate().is_ok());

        config.supervisor_id = String::new();
        assert!(config.validate().is_err());
        config.supervisor_id = "test".to_string();

        config.poll_interval = Duration::ZERO;
        assert!(config.validate().is_err());

        config = config.with_poll_interval(Duration::from_millis(50));
        assert!(config.validate().is_ok());
    }
}
