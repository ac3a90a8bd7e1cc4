//! Dead-letter queue commands
//!
//! Usage:
//! ```bash
//! runq dlq list
//! runq dlq retry nightly-report
//! ```

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use colored::Colorize;
use comfy_table::{Cell, Color};

use runq_queue::QueueBackend;

use super::jobs::{format_time, new_table, truncate};
use crate::home::Home;

/// Arguments for the dlq command
#[derive(Args)]
pub struct DlqArgs {
    #[command(subcommand)]
    command: DlqCommand,
}

#[derive(Subcommand)]
pub enum DlqCommand {
    /// List dead-lettered jobs, most recent failure first
    #[command(name = "list")]
    List {
        /// Output raw JSON
        #[arg(long)]
        json: bool,
    },

    /// Move a dead-lettered job back into the queue with a fresh retry budget
    #[command(name = "retry")]
    Retry {
        /// Id of the dead-lettered job
        id: String,
    },
}

/// Run the dlq command
pub async fn run(args: DlqArgs, home: &Home) -> Result<()> {
    match args.command {
        DlqCommand::List { json } => list(home, json).await,
        DlqCommand::Retry { id } => retry(home, &id).await,
    }
}

async fn list(home: &Home, json: bool) -> Result<()> {
    let queue = home.open_queue().await?;
    let entries = queue
        .dlq_list()
        .await
        .context("Failed to read dead-letter queue")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        crate::print_success("Dead-letter queue is empty");
        return Ok(());
    }

    let mut table = new_table(&["ID", "Failed at", "Attempts", "Command", "Reason"]);
    for entry in &entries {
        table.add_row(vec![
            Cell::new(&entry.id).fg(Color::Green),
            Cell::new(format_time(entry.failed_at)),
            Cell::new(entry.original_job.attempts),
            Cell::new(truncate(&entry.original_job.command, 40)),
            Cell::new(entry.reason.as_deref().unwrap_or("")).fg(Color::Red),
        ]);
    }
    println!("{table}");
    println!();
    println!("Retry a job: {}", "runq dlq retry <id>".green());
    Ok(())
}

async fn retry(home: &Home, id: &str) -> Result<()> {
    let queue = home.open_queue().await?;
    let found = queue
        .dlq_retry(id)
        .await
        .with_context(|| format!("Failed to retry dead-lettered job '{id}'"))?;

    if !found {
        anyhow::bail!("{id}: not-found. Run 'runq dlq list' to see dead-lettered jobs.");
    }
    crate::print_success(&format!("{}: enqueued", id.green().bold()));
    Ok(())
}
