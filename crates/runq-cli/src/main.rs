//! runq CLI - durable shell job queue
//!
//! # Usage
//!
//! ```bash
//! # Enqueue a job
//! runq enqueue '{"command": "echo hello", "priority": 5}'
//!
//! # Start two background workers, then stop them
//! runq worker start --count 2
//! runq worker stop
//!
//! # Inspect the queue
//! runq status
//! runq list --state pending
//! runq dlq list
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

mod commands;
mod home;
mod supervisor;

use commands::{config, dlq, enqueue, jobs, worker};
use home::Home;

/// runq - a durable, multi-process shell job queue
///
/// Jobs are shell commands stored in a local SQLite database. Workers claim
/// them one at a time, retry failures with exponential backoff and move jobs
/// that exhaust their retries to a dead-letter queue.
#[derive(Parser)]
#[command(
    name = "runq",
    version,
    about = "runq - durable shell job queue",
    long_about = "runq runs shell commands in the background.\n\n\
                  Jobs live in a SQLite database shared by every worker process,\n\
                  so any number of workers can run side by side without ever\n\
                  executing the same job twice."
)]
struct Cli {
    /// Data directory holding the database, logs and pid file [default: ~/.runq]
    #[arg(long, env = "RUNQ_HOME", value_name = "DIR", global = true)]
    home: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a job to the queue
    #[command(name = "enqueue")]
    Enqueue(enqueue::EnqueueArgs),

    /// List jobs, newest first
    #[command(name = "list")]
    List(jobs::ListArgs),

    /// Show job counts and registered workers
    #[command(name = "status")]
    Status(jobs::StatusArgs),

    /// Inspect and retry dead-lettered jobs
    #[command(name = "dlq")]
    Dlq(dlq::DlqArgs),

    /// Read and change queue settings
    #[command(name = "config")]
    Config(config::ConfigArgs),

    /// Start, stop or run workers
    #[command(name = "worker")]
    Worker(worker::WorkerArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let home = Home::resolve(cli.home)?;

    // Worker commands pick their own log destination
    if !matches!(cli.command, Commands::Worker(_)) {
        setup_logging(cli.verbose);
    }

    match cli.command {
        Commands::Enqueue(args) => enqueue::run(args, &home).await,
        Commands::List(args) => jobs::list(args, &home).await,
        Commands::Status(args) => jobs::status(args, &home).await,
        Commands::Dlq(args) => dlq::run(args, &home).await,
        Commands::Config(args) => config::run(args, &home).await,
        Commands::Worker(args) => worker::run(args, &home, cli.verbose).await,
    }
}

fn env_filter(verbosity: u8) -> EnvFilter {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter))
}

/// Setup logging based on verbosity level
pub fn setup_logging(verbosity: u8) {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(verbosity))
        .with_writer(std::io::stderr)
        .init();
}

/// Send logs of a background worker to its own file, at info level or above
pub fn setup_file_logging(verbosity: u8, path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open worker log: {}", path.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(env_filter(verbosity.max(1)))
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .init();
    Ok(())
}

/// Print a success message with a checkmark
pub fn print_success(msg: &str) {
    println!("{} {}", "✓".green().bold(), msg);
}

/// Print a warning message
pub fn print_warning(msg: &str) {
    println!("{} {}", "⚠".yellow().bold(), msg);
}

/// Print an info message
pub fn print_info(msg: &str) {
    println!("{} {}", "ℹ".blue().bold(), msg);
}
