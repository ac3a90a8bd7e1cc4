//! # runq queue
//!
//! Job lifecycle engine for a durable, multi-process shell job queue.
//!
//! Features:
//! - `QueueBackend` trait: enqueue, claim, complete/fail, dead-letter queue
//! - Retry with `backoff_base ^ attempts` second delays
//! - Sequential `Worker` loop with heartbeat and cooperative shutdown
//! - Shell command executor with per-job transcripts and timeouts
//! - In-memory backend for tests and single-process use

pub mod backend;
pub mod executor;
pub mod job;
pub mod memory;
pub mod settings;
pub mod shutdown;
pub mod worker;

pub use backend::{QueueBackend, QueueError};
pub use executor::{CommandExecutor, ExecutionOutcome};
pub use job::{
    DeadLetterEntry, FailureOutcome, Job, JobId, JobState, NewJob, StatusReport,
    WorkerRegistration,
};
pub use memory::MemoryQueue;
pub use settings::QueueSettings;
pub use worker::{Worker, WorkerConfig};
