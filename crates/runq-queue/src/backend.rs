//! Queue Backend Trait

use crate::job::{DeadLetterEntry, FailureOutcome, Job, JobId, JobState, NewJob, StatusReport};
use crate::settings::QueueSettings;
use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The store could not take its write lock within the busy timeout.
    #[error("Store busy: {0}")]
    Busy(String),
    #[error("Backend error: {0}")]
    Backend(String),
    #[error("Job not found")]
    NotFound,
    #[error("Job already exists: {0}")]
    AlreadyExists(String),
    /// An outcome was reported for a job that is no longer claimed.
    #[error("Job is not being processed: {0}")]
    NotProcessing(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl QueueError {
    /// Whether the caller may simply try again on its next tick.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Busy(_))
    }
}

/// The job engine: persistence, claim protocol and retry state machine.
///
/// Every operation re-reads from the backing store; implementations hold no
/// cached job state between calls.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Insert a new pending job and return its id
    async fn enqueue(&self, job: NewJob) -> Result<JobId, QueueError>;

    /// Fetch a single job from the active set
    async fn get(&self, id: &str) -> Result<Option<Job>, QueueError>;

    /// Jobs newest first, optionally filtered by state
    async fn list(
        &self,
        state: Option<JobState>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Job>, QueueError>;

    /// Job counts per state plus the registered workers
    async fn status(&self) -> Result<StatusReport, QueueError>;

    /// Atomically move the best eligible job to `processing` for `worker_id`.
    ///
    /// Returns `None` when nothing is eligible or another worker won the race.
    async fn claim_next(&self, worker_id: &str) -> Result<Option<Job>, QueueError>;

    /// Mark a claimed job completed and clear its last error.
    ///
    /// Fails with `NotProcessing` if the job is no longer claimed.
    async fn complete(&self, id: &str) -> Result<(), QueueError>;

    /// Record a failed attempt: reschedule with backoff, or dead-letter the
    /// job once its attempts exceed `max_retries`. Only claimed jobs qualify.
    async fn fail(&self, id: &str, error: &str) -> Result<FailureOutcome, QueueError>;

    /// Dead-letter entries, most recent failure first
    async fn dlq_list(&self) -> Result<Vec<DeadLetterEntry>, QueueError>;

    /// Re-enqueue a dead-lettered job with attempts reset.
    /// Returns `false` if no entry exists for `id`.
    async fn dlq_retry(&self, id: &str) -> Result<bool, QueueError>;

    async fn get_config(&self, key: &str) -> Result<Option<String>, QueueError>;

    async fn set_config(&self, key: &str, value: &str) -> Result<(), QueueError>;

    /// Upsert a worker registration with a fresh heartbeat and `stopping = 0`
    async fn register_worker(&self, worker_id: &str) -> Result<(), QueueError>;

    async fn heartbeat(&self, worker_id: &str) -> Result<(), QueueError>;

    async fn mark_stopping(&self, worker_id: &str) -> Result<(), QueueError>;

    async fn unregister_worker(&self, worker_id: &str) -> Result<(), QueueError>;

    /// Typed view over the configuration table, defaults filled in
    async fn settings(&self) -> Result<QueueSettings, QueueError> {
        let mut settings = QueueSettings::default();
        for key in crate::settings::KNOWN_KEYS {
            if let Some(value) = self.get_config(key).await? {
                settings.apply(key, &value)?;
            }
        }
        Ok(settings)
    }
}
