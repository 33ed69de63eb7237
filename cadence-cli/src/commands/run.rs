//! Run command handler
//!
//! Starts a supervisor against the configured store.

use anyhow::{Context, Result};
use cadence_core::hooks::ExpirationPolicy;
use cadence_supervisor::{ProcessRecoveryInvoker, Supervisor, SupervisorConfig};
use clap::Args;
use colored::*;
use std::sync::Arc;

use crate::config::Config;
use crate::hooks::EchoOutputHook;

/// Arguments of `cadence run`
#[derive(Args)]
pub struct RunArgs {
    /// Seconds during which new jobs are started
    #[arg(long, default_value_t = 900, allow_negative_numbers = true)]
    pub max_runtime: i64,

    /// Maximum number of jobs running at once
    #[arg(long, default_value_t = 4, allow_negative_numbers = true)]
    pub max_concurrent_jobs: i64,

    /// Seconds to wait when there is nothing to start
    #[arg(long, default_value_t = 2, allow_negative_numbers = true)]
    pub idle_time: i64,

    /// Echo job output to the terminal
    #[arg(short, long)]
    pub verbose: bool,
}

impl RunArgs {
    /// Builds the supervisor configuration, rejecting invalid limits
    pub fn supervisor_config(&self) -> Result<SupervisorConfig> {
        Ok(
            SupervisorConfig::from_limits(self.max_runtime, self.max_concurrent_jobs, self.idle_time)?
                .with_env_overrides(),
        )
    }
}

/// Handle the run command
pub async fn handle_run_command(args: RunArgs, config: &Config) -> Result<()> {
    // Validate before the store is touched
    let supervisor_config = args.supervisor_config()?;
    supervisor_config.validate()?;

    let service = config
        .connect()
        .await?
        .with_state_hook(Arc::new(ExpirationPolicy));

    let recovery = ProcessRecoveryInvoker::current_exe()
        .context("Failed to set up stale-job recovery")?
        .env("DATABASE_URL", config.database_url.clone());

    let mut supervisor =
        Supervisor::new(supervisor_config, service).with_recovery_invoker(Arc::new(recovery));
    if args.verbose {
        supervisor = supervisor.with_output_hook(Arc::new(EchoOutputHook));
    }

    let summary = supervisor.run().await?;

    println!(
        "{} Started {} job(s), closed {} job(s), recovered {} stale job(s)",
        "✓".green(),
        summary.started.to_string().bold(),
        summary.closed.to_string().bold(),
        summary.recovered.to_string().bold()
    );

    Ok(())
}
