//! Subcommand implementations

pub mod config;
pub mod dlq;
pub mod enqueue;
pub mod jobs;
pub mod worker;
