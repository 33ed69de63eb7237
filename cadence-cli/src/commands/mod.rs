//! Commands module
//!
//! Defines all CLI commands and their handlers.

mod job;
mod run;

pub use job::JobCommands;
pub use run::RunArgs;

use anyhow::Result;
use cadence_core::JobId;
use clap::Subcommand;
use colored::*;

use crate::config::Config;

/// Top-level CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run queued jobs until the time budget is used up
    Run(RunArgs),
    /// Job management
    Job {
        #[command(subcommand)]
        command: JobCommands,
    },
    /// Close out a job whose supervisor went away
    #[command(hide = true)]
    MarkIncomplete {
        /// Job ID
        job_id: JobId,
    },
}

/// Handle a CLI command
///
/// Routes the command to the appropriate handler module.
///
/// # Arguments
/// * `command` - The command to execute
/// * `config` - The CLI configuration
pub async fn handle_command(command: Commands, config: &Config) -> Result<()> {
    match command {
        Commands::Run(args) => run::handle_run_command(args, config).await,
        Commands::Job { command } => job::handle_job_command(command, config).await,
        Commands::MarkIncomplete { job_id } => mark_incomplete(job_id, config).await,
    }
}

async fn mark_incomplete(job_id: JobId, config: &Config) -> Result<()> {
    let service = config.connect().await?;
    let report = service.mark_incomplete(job_id).await?;

    println!(
        "{} Job {} marked as incomplete ({} job(s) visited)",
        "✓".green(),
        job_id,
        report.visited.len()
    );
    Ok(())
}
