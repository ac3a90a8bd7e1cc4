//! Worker command - Start, stop or run workers
//!
//! Usage:
//! ```bash
//! runq worker start --count 4
//! runq worker stop
//! runq worker run --id local   # foreground, Ctrl-C to stop
//! ```

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use colored::Colorize;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use runq_queue::job::generate_id;
use runq_queue::shutdown::install_shutdown_handler;
use runq_queue::{QueueBackend, Worker, WorkerConfig};

use crate::home::Home;
use crate::supervisor::Supervisor;

/// Arguments for the worker command
#[derive(Args)]
pub struct WorkerArgs {
    #[command(subcommand)]
    command: WorkerCommand,
}

#[derive(Subcommand)]
pub enum WorkerCommand {
    /// Start background worker processes
    #[command(name = "start")]
    Start {
        /// Number of workers to start
        #[arg(long, default_value_t = 1)]
        count: usize,

        /// Idle poll interval in milliseconds [default: poll_interval_ms setting]
        #[arg(long, value_name = "MS")]
        poll_interval: Option<u64>,
    },

    /// Ask all background workers to stop after their current job
    #[command(name = "stop")]
    Stop,

    /// Run a single worker in the foreground
    #[command(name = "run")]
    Run {
        /// Worker id [default: generated]
        #[arg(long, env = "RUNQ_WORKER_ID")]
        id: Option<String>,

        /// Idle poll interval in milliseconds [default: poll_interval_ms setting]
        #[arg(long, value_name = "MS", env = "RUNQ_POLL_INTERVAL_MS")]
        poll_interval: Option<u64>,

        /// Log to stderr instead of the worker's log file
        #[arg(long)]
        foreground_logs: bool,
    },
}

/// Run the worker command
pub async fn run(args: WorkerArgs, home: &Home, verbosity: u8) -> Result<()> {
    match args.command {
        WorkerCommand::Start {
            count,
            poll_interval,
        } => {
            crate::setup_logging(verbosity);
            start(home, count, poll_interval).await
        }
        WorkerCommand::Stop => {
            crate::setup_logging(verbosity);
            stop(home)
        }
        WorkerCommand::Run {
            id,
            poll_interval,
            foreground_logs,
        } => {
            let id = id.unwrap_or_else(|| format!("w-{}", generate_id()));
            if foreground_logs {
                crate::setup_logging(verbosity.max(1));
            } else {
                crate::setup_file_logging(verbosity, &home.worker_log(&id))?;
            }
            run_worker(home, id, poll_interval).await
        }
    }
}

async fn start(home: &Home, count: usize, poll_interval: Option<u64>) -> Result<()> {
    if count == 0 {
        anyhow::bail!("--count must be at least 1");
    }

    // Create the store up front rather than in every new worker at once
    let queue = home.open_queue().await?;
    let poll_interval_ms = match poll_interval {
        Some(ms) => ms,
        None => queue.settings().await?.poll_interval.as_millis() as u64,
    };

    let supervisor = Supervisor::current_exe(home.pid_file())?;
    let started = supervisor.start(count, poll_interval_ms, home.root())?;

    for worker in &started {
        crate::print_success(&format!(
            "Started worker {} (pid {})",
            worker.id.green().bold(),
            worker.pid
        ));
    }
    println!(
        "{} {}",
        "Logs:".dimmed(),
        home.log_dir().display().to_string().underline()
    );
    Ok(())
}

fn stop(home: &Home) -> Result<()> {
    let supervisor = Supervisor::current_exe(home.pid_file())?;
    let signalled = supervisor.stop()?;

    if signalled == 0 {
        crate::print_info("No running workers");
    } else {
        crate::print_success(&format!(
            "Signalled {signalled} worker(s); they exit after their current job"
        ));
    }
    Ok(())
}

async fn run_worker(home: &Home, id: String, poll_interval: Option<u64>) -> Result<()> {
    let backend = Arc::new(home.open_queue().await?);
    let poll_interval = match poll_interval {
        Some(ms) => Duration::from_millis(ms),
        None => backend.settings().await?.poll_interval,
    };

    let shutdown = install_shutdown_handler(backend.clone(), id.clone())
        .context("Failed to install signal handlers")?;

    let config = WorkerConfig {
        poll_interval,
        log_dir: home.log_dir(),
        ..Default::default()
    };
    let worker = Worker::new(id, backend, config);
    info!(worker_id = %worker.id(), home = %home.root().display(), "Worker process ready");

    let processed = worker
        .run(shutdown)
        .await
        .with_context(|| format!("Worker {} failed", worker.id()))?;
    info!(worker_id = %worker.id(), processed, "Worker process exiting");
    Ok(())
}
