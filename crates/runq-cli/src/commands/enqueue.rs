//! Enqueue command - Add a job to the queue
//!
//! Usage:
//! ```bash
//! runq enqueue '{"command": "echo hello"}'
//! runq enqueue '{"id": "nightly", "command": "./backup.sh"}' --priority 10
//! runq enqueue '{"command": "date"}' --run-at 2026-01-01T00:00:00Z
//! ```

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use colored::Colorize;

use runq_queue::{NewJob, QueueBackend};

use crate::home::Home;

/// Arguments for the enqueue command
#[derive(Args)]
pub struct EnqueueArgs {
    /// Job as JSON: {"command": ..., "id"?, "run_at"?, "max_retries"?, "priority"?}
    job: String,

    /// Earliest start time (RFC 3339), overrides "run_at"
    #[arg(long, value_name = "TIME")]
    run_at: Option<String>,

    /// Retries before the job is dead-lettered, overrides "max_retries"
    #[arg(long)]
    max_retries: Option<u32>,

    /// Higher runs first, overrides "priority"
    #[arg(long, allow_hyphen_values = true)]
    priority: Option<i64>,

    /// Print the new id as JSON
    #[arg(long)]
    json: bool,
}

/// Run the enqueue command
pub async fn run(args: EnqueueArgs, home: &Home) -> Result<()> {
    let job = build_job(&args)?;
    let queue = home.open_queue().await?;
    let id = queue.enqueue(job).await.context("Failed to enqueue job")?;

    if args.json {
        println!("{}", serde_json::json!({ "id": id }));
    } else {
        crate::print_success(&format!("Enqueued job {}", id.green().bold()));
    }
    Ok(())
}

fn build_job(args: &EnqueueArgs) -> Result<NewJob> {
    let mut job: NewJob = serde_json::from_str(&args.job)
        .with_context(|| format!("Invalid job JSON: {}", args.job))?;

    if let Some(run_at) = &args.run_at {
        job.run_at = Some(parse_time(run_at)?);
    }
    if let Some(max_retries) = args.max_retries {
        job.max_retries = Some(max_retries);
    }
    if let Some(priority) = args.priority {
        job.priority = Some(priority);
    }
    job.validate()?;
    Ok(job)
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .with_context(|| format!("Invalid --run-at time (expected RFC 3339): {value}"))
}
