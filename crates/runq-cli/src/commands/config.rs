//! Config command - Read and change queue settings
//!
//! Settings live in the job store and are shared by every worker. Workers
//! re-read `job_timeout_ms` for each job; the other keys apply to new jobs,
//! new failures or newly started workers.
//!
//! Usage:
//! ```bash
//! runq config list
//! runq config get max_retries
//! runq config set backoff_base 3
//! ```

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use colored::Colorize;

use runq_queue::settings::KNOWN_KEYS;
use runq_queue::QueueBackend;

use crate::home::Home;

/// Arguments for the config command
#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    command: ConfigCommand,
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show all known settings
    #[command(name = "list")]
    List,

    /// Print the value of a setting
    #[command(name = "get")]
    Get { key: String },

    /// Change a setting
    #[command(name = "set")]
    Set { key: String, value: String },
}

/// Run the config command
pub async fn run(args: ConfigArgs, home: &Home) -> Result<()> {
    let queue = home.open_queue().await?;

    match args.command {
        ConfigCommand::List => {
            for key in KNOWN_KEYS {
                let value = queue.get_config(key).await?.unwrap_or_default();
                println!("{:<18} {}", key.dimmed(), value.green());
            }
        }
        ConfigCommand::Get { key } => {
            let value = queue
                .get_config(&key)
                .await
                .with_context(|| format!("Failed to read setting '{key}'"))?;
            match value {
                Some(value) => println!("{value}"),
                None => anyhow::bail!("Setting '{key}' is not set"),
            }
        }
        ConfigCommand::Set { key, value } => {
            queue
                .set_config(&key, &value)
                .await
                .with_context(|| format!("Failed to set '{key}'"))?;
            if !KNOWN_KEYS.contains(&key.as_str()) {
                crate::print_warning(&format!(
                    "'{key}' is not a setting runq uses; stored anyway"
                ));
            }
            crate::print_success(&format!("{} = {}", key.bold(), value.green()));
        }
    }
    Ok(())
}
