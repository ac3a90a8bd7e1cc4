//! List and status commands
//!
//! Usage:
//! ```bash
//! runq list --state pending --limit 20
//! runq status --json
//! ```

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use colored::Colorize;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Cell, Color, Table};

use runq_queue::{JobState, QueueBackend};

use crate::home::Home;

const COMMAND_WIDTH: usize = 40;

/// Arguments for the list command
#[derive(Args)]
pub struct ListArgs {
    /// Only show jobs in this state (pending, processing, completed)
    #[arg(long)]
    state: Option<JobState>,

    /// Maximum number of jobs to show
    #[arg(long, default_value_t = 50)]
    limit: u32,

    /// Number of jobs to skip
    #[arg(long, default_value_t = 0)]
    offset: u32,

    /// Output raw JSON
    #[arg(long)]
    json: bool,
}

/// Arguments for the status command
#[derive(Args)]
pub struct StatusArgs {
    /// Output raw JSON
    #[arg(long)]
    json: bool,
}

/// Run the list command
pub async fn list(args: ListArgs, home: &Home) -> Result<()> {
    let queue = home.open_queue().await?;
    let jobs = queue
        .list(args.state, args.limit, args.offset)
        .await
        .context("Failed to list jobs")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&jobs)?);
        return Ok(());
    }

    if jobs.is_empty() {
        crate::print_info("No jobs found");
        return Ok(());
    }

    let mut table = new_table(&[
        "ID",
        "State",
        "Attempts",
        "Priority",
        "Scheduled",
        "Command",
        "Last error",
    ]);
    for job in &jobs {
        table.add_row(vec![
            Cell::new(&job.id).fg(Color::Green),
            Cell::new(job.state).fg(state_color(job.state)),
            Cell::new(format!("{}/{}", job.attempts, job.max_retries)),
            Cell::new(job.priority),
            Cell::new(format_time(job.scheduled_at)),
            Cell::new(truncate(&job.command, COMMAND_WIDTH)),
            Cell::new(job.last_error.as_deref().unwrap_or("")).fg(Color::Red),
        ]);
    }
    println!("{table}");
    Ok(())
}

/// Run the status command
pub async fn status(args: StatusArgs, home: &Home) -> Result<()> {
    let queue = home.open_queue().await?;
    let report = queue.status().await.context("Failed to read queue status")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let dead = queue.dlq_list().await.context("Failed to read dead-letter queue")?;

    println!("{}", "runq status".bold().cyan());
    println!("{}", "═".repeat(40).cyan());
    println!();

    println!("{}", "Jobs:".bold());
    for state in [JobState::Pending, JobState::Processing, JobState::Completed] {
        println!(
            "  {:<12} {}",
            format!("{state}:").dimmed(),
            report.count(state).to_string().bold()
        );
    }
    println!("  {:<12} {}", "dead:".dimmed(), dead.len().to_string().red().bold());
    println!();

    println!("{} {}", "Workers:".bold(), report.workers.len());
    if report.workers.is_empty() {
        println!("  {} Start some with {}", "ℹ".blue(), "runq worker start".green());
        return Ok(());
    }

    let mut table = new_table(&["ID", "State", "Started", "Last heartbeat"]);
    for worker in &report.workers {
        let (label, color) = if worker.stopping {
            ("stopping", Color::Yellow)
        } else {
            ("running", Color::Green)
        };
        table.add_row(vec![
            Cell::new(&worker.id).fg(Color::Cyan),
            Cell::new(label).fg(color),
            Cell::new(format_time(worker.started_at)),
            Cell::new(format_time(worker.heartbeat_at)),
        ]);
    }
    println!("{table}");
    Ok(())
}

pub(crate) fn new_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(headers.iter().map(|h| Cell::new(h).fg(Color::Cyan)));
    table
}

pub(crate) fn format_time(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S").to_string()
}

pub(crate) fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        return text.to_string();
    }
    let head: String = text.chars().take(width.saturating_sub(1)).collect();
    format!("{head}…")
}

fn state_color(state: JobState) -> Color {
    match state {
        JobState::Pending => Color::Yellow,
        JobState::Processing => Color::Blue,
        JobState::Completed => Color::Green,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("echo hi", 40), "echo hi");
        assert_eq!(truncate("abcdefgh", 5), "abcd…");
        assert_eq!(truncate("ééééé", 5), "ééééé");
    }

    #[test]
    fn test_format_time() {
        let at = DateTime::parse_from_rfc3339("2026-03-04T05:06:07.890Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(format_time(at), "2026-03-04 05:06:07");
    }
}
