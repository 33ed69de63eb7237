//! Job command handlers
//!
//! Handles all job-related CLI commands including submission, listing,
//! inspection, manual retry and cancellation.

use anyhow::{Context, Result};
use cadence_core::{Job, JobId, JobState, RelatedEntity};
use cadence_store::JobService;
use chrono::{Duration, Utc};
use clap::{Args, Subcommand};
use colored::*;

use crate::config::Config;

/// Job subcommands
#[derive(Subcommand)]
pub enum JobCommands {
    /// Queue a new job
    Add(AddArgs),
    /// List jobs, newest first
    List {
        /// Only show jobs in this state
        #[arg(long)]
        state: Option<JobState>,

        /// Maximum number of jobs to show
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Get job details
    Show {
        /// Job ID
        id: JobId,
    },
    /// Queue a fresh copy of a failed, terminated or incomplete job
    Retry {
        /// Job ID
        id: JobId,
    },
    /// Cancel a job that has not started, along with its dependents
    Cancel {
        /// Job ID
        id: JobId,
    },
    /// Show the most recent jobs that failed or were terminated
    Errors {
        /// Maximum number of jobs to show
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

/// Arguments of `cadence job add`
#[derive(Args)]
pub struct AddArgs {
    /// Seconds the job may run before it is terminated (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    pub max_runtime: u64,

    /// Number of retry attempts after a failure
    #[arg(long, default_value_t = 0)]
    pub max_retries: u32,

    /// Re-run the job this many seconds after it finished
    #[arg(long)]
    pub interval: Option<u64>,

    /// Do not start the job for this many seconds
    #[arg(long)]
    pub delay: Option<u64>,

    /// Only start after this job finished (repeatable)
    #[arg(long = "depends-on")]
    pub depends_on: Vec<JobId>,

    /// Associate the job with an entity, as kind:id (repeatable)
    #[arg(long)]
    pub related: Vec<String>,

    /// Reuse an existing job with the same command and arguments
    #[arg(
        long,
        conflicts_with_all = ["max_runtime", "max_retries", "interval", "delay", "depends_on", "related"]
    )]
    pub unique: bool,

    /// Command to run
    pub command: String,

    /// Command arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

/// Handle job commands
///
/// Routes job subcommands to their respective handlers.
///
/// # Arguments
/// * `command` - The job command to execute
/// * `config` - The CLI configuration
pub async fn handle_job_command(command: JobCommands, config: &Config) -> Result<()> {
    let service = config.connect().await?;

    match command {
        JobCommands::Add(args) => add_job(&service, args).await,
        JobCommands::List { state, limit } => list_jobs(&service, state, limit).await,
        JobCommands::Show { id } => show_job(&service, id).await,
        JobCommands::Retry { id } => retry_job(&service, id).await,
        JobCommands::Cancel { id } => cancel_job(&service, id).await,
        JobCommands::Errors { limit } => list_errors(&service, limit).await,
    }
}

/// Queue a new job
async fn add_job(service: &JobService, args: AddArgs) -> Result<()> {
    if args.unique {
        let job = service
            .get_or_create_if_not_exists(&args.command, args.args)
            .await?;
        println!(
            "{} Job {} ({})",
            "✓".green(),
            display_id(&job).cyan(),
            colorize_state(job.state())
        );
        return Ok(());
    }

    let mut job = build_job(&args)?;
    for id in &args.depends_on {
        let dependency = service
            .get_by_id(*id)
            .await
            .with_context(|| format!("Cannot depend on job {}", id))?;
        service.add_dependency(&mut job, &dependency).await?;
    }

    let id = service.save(&mut job).await?;
    println!("{} Created job {}", "✓".green(), id.to_string().cyan());

    Ok(())
}

/// Builds the job described by `job add`, without dependencies
fn build_job(args: &AddArgs) -> Result<Job> {
    let mut job = Job::new(args.command.clone(), args.args.clone())
        .with_max_runtime(args.max_runtime)
        .with_max_retries(args.max_retries);

    if let Some(interval) = args.interval {
        job = job.with_interval(interval);
    }

    if let Some(delay) = args.delay {
        let delay = i64::try_from(delay)
            .ok()
            .and_then(Duration::try_seconds)
            .context("delay is too large")?;
        job = job.with_execute_after(Utc::now() + delay);
    }

    for related in &args.related {
        let entity = RelatedEntity::parse(related)
            .with_context(|| format!("Invalid related entity {:?}, expected kind:id", related))?;
        job.add_related_entity(entity);
    }

    Ok(job)
}

/// List jobs
async fn list_jobs(service: &JobService, state: Option<JobState>, limit: usize) -> Result<()> {
    let jobs = service.list_jobs(state, limit).await?;

    if jobs.is_empty() {
        println!("{}", "No jobs found.".yellow());
    } else {
        println!("{}", format!("Found {} job(s):", jobs.len()).bold());
        println!();
        for job in jobs {
            print_job_summary(&job);
        }
    }

    Ok(())
}

/// Get and display a single job
async fn show_job(service: &JobService, id: JobId) -> Result<()> {
    let job = service.get_by_id(id).await?;
    print_job_details(&job);
    Ok(())
}

/// Queue a copy of a job that ended badly
async fn retry_job(service: &JobService, id: JobId) -> Result<()> {
    let copy = service.retry_job(id).await?;
    println!(
        "{} Job {} queued again as job {}",
        "✓".green(),
        id,
        display_id(&copy).cyan()
    );
    Ok(())
}

/// Cancel a job and its dependents
async fn cancel_job(service: &JobService, id: JobId) -> Result<()> {
    let report = service.cancel_job(id).await?;

    println!("{} Canceled job {}", "✓".green(), id);
    let cascaded: Vec<String> = report
        .visited
        .iter()
        .filter(|visited| **visited != id)
        .map(ToString::to_string)
        .collect();
    if !cascaded.is_empty() {
        println!("  {} {}", "Also closed:".dimmed(), cascaded.join(", "));
    }

    Ok(())
}

/// List the most recent failures
async fn list_errors(service: &JobService, limit: usize) -> Result<()> {
    let jobs = service.find_last_jobs_with_error(limit).await?;

    if jobs.is_empty() {
        println!("{}", "No failed jobs found.".green());
        return Ok(());
    }

    println!("{}", format!("Last {} failed job(s):", jobs.len()).bold());
    println!();
    for job in jobs {
        print_job_summary(&job);
        if let Some(error) = job.error_output.as_deref().and_then(|e| e.lines().last()) {
            println!("    {}", error.red());
            println!();
        }
    }

    Ok(())
}

fn display_id(job: &Job) -> String {
    job.id.map(|id| id.to_string()).unwrap_or_else(|| "-".to_string())
}

/// Print a one-entry job summary
fn print_job_summary(job: &Job) {
    println!("  {} Job {}", "▸".cyan(), display_id(job).dimmed());
    println!("    Command: {}", command_line(job));
    println!("    State:   {}", colorize_state(job.state()));
    println!(
        "    Created: {}",
        job.created_at
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
            .dimmed()
    );
    println!();
}

/// Print detailed job information
fn print_job_details(job: &Job) {
    println!("{}", "Job Details:".bold());
    println!("  ID:            {}", display_id(job).cyan());
    println!("  Command:       {}", command_line(job));
    println!("  State:         {}", colorize_state(job.state()));
    println!(
        "  Created:       {}",
        job.created_at.format("%Y-%m-%d %H:%M:%S")
    );
    println!(
        "  Execute after: {}",
        job.execute_after.format("%Y-%m-%d %H:%M:%S")
    );

    if let Some(started) = job.started_at {
        println!("  Started:       {}", started.format("%Y-%m-%d %H:%M:%S"));
    }

    if let Some(checked) = job.checked_at {
        println!("  Checked:       {}", checked.format("%Y-%m-%d %H:%M:%S"));
    }

    if let Some(closed) = job.closed_at {
        println!("  Closed:        {}", closed.format("%Y-%m-%d %H:%M:%S"));
    }

    if let Some(runtime) = job.runtime {
        println!("  Runtime:       {}s", runtime);
    }

    if job.max_runtime > 0 {
        println!("  Max runtime:   {}s", job.max_runtime);
    }

    if let Some(interval) = job.interval {
        println!("  Interval:      {}s", interval);
    }

    if let Some(expires) = job.expires_at {
        println!("  Expires:       {}", expires.format("%Y-%m-%d %H:%M:%S"));
    }

    if let Some(code) = job.exit_code {
        let code = if code == 0 {
            code.to_string().green()
        } else {
            code.to_string().red()
        };
        println!("  Exit Code:     {}", code);
    }

    if !job.dependencies.is_empty() {
        println!("\n{}", "Dependencies:".bold());
        for dep in &job.dependencies {
            println!("  {} {}", dep.id.to_string().cyan(), colorize_state(dep.state));
        }
    }

    if let Some(original) = job.original_job {
        println!("\n{}", "Retry of:".bold());
        println!("  {}", original.to_string().cyan());
    }

    if !job.retry_jobs.is_empty() || job.max_retries > 0 {
        println!(
            "\n{} {}/{}",
            "Retries:".bold(),
            job.retry_jobs.len(),
            job.max_retries
        );
        for retry in &job.retry_jobs {
            println!("  {}", retry.to_string().cyan());
        }
    }

    if !job.related_entities.is_empty() {
        println!("\n{}", "Related:".bold());
        for entity in &job.related_entities {
            println!("  {}", entity);
        }
    }

    if let Some(output) = &job.output {
        println!("\n{}", "Output:".bold());
        println!("{}", output.trim_end());
    }

    if let Some(error) = &job.error_output {
        println!("\n{}", "Error Output:".bold());
        println!("{}", error.trim_end().red());
    }
}

fn command_line(job: &Job) -> String {
    std::iter::once(job.command.as_str())
        .chain(job.args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Colorize job state for display
fn colorize_state(state: JobState) -> ColoredString {
    let label = state.as_str();
    match state {
        JobState::New | JobState::Pending => label.yellow(),
        JobState::Running => label.cyan(),
        JobState::Finished => label.green(),
        JobState::Failed | JobState::Terminated => label.red(),
        JobState::Canceled | JobState::Incomplete => label.dimmed(),
    }
}
