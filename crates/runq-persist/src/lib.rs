//! # runq persistence
//!
//! SQLite storage for the job queue.
//!
//! - `SqliteStore`: opens the database in WAL mode with a busy timeout,
//!   creates the schema and seeds default settings
//! - `SqliteQueueBackend`: the durable, multi-process `QueueBackend`

pub mod queue;
pub mod sqlite;

pub use queue::SqliteQueueBackend;
pub use sqlite::{SqliteConfig, SqliteStore};
