//! Worker loop: heartbeat, claim, execute, report

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::{QueueBackend, QueueError};
use crate::executor::{CommandExecutor, ExecutionOutcome};
use crate::job::{output_log_path, FailureOutcome, Job, JobId};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub poll_interval: Duration,
    /// Fallback transcript directory for jobs enqueued without an `output_log`
    pub log_dir: PathBuf,
    /// Pause after a failed store call before the next tick
    pub error_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            log_dir: PathBuf::from("logs"),
            error_backoff: Duration::from_secs(1),
        }
    }
}

/// A single sequential worker. Run one per process; the store arbitrates
/// between processes.
pub struct Worker<B: QueueBackend + ?Sized> {
    id: String,
    backend: Arc<B>,
    config: WorkerConfig,
    executor: CommandExecutor,
}

impl<B: QueueBackend + ?Sized> Worker<B> {
    pub fn new(id: impl Into<String>, backend: Arc<B>, config: WorkerConfig) -> Self {
        Self {
            id: id.into(),
            backend,
            config,
            executor: CommandExecutor::default(),
        }
    }

    pub fn with_executor(mut self, executor: CommandExecutor) -> Self {
        self.executor = executor;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Run until `shutdown` is cancelled. Returns the number of jobs executed.
    ///
    /// Cancellation is only observed between jobs, so a job that is running
    /// when the stop arrives still finishes and gets its outcome recorded.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<u64, QueueError> {
        self.backend.register_worker(&self.id).await?;
        info!(
            worker_id = %self.id,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Worker started"
        );

        let mut processed = 0;
        loop {
            if let Err(e) = self.backend.heartbeat(&self.id).await {
                warn!(worker_id = %self.id, error = %e, "Heartbeat failed");
            }
            if shutdown.is_cancelled() {
                break;
            }

            match self.backend.claim_next(&self.id).await {
                Ok(Some(job)) => {
                    self.execute(job).await;
                    processed += 1;
                }
                Ok(None) => self.pause(self.config.poll_interval, &shutdown).await,
                Err(e) => {
                    if e.is_transient() {
                        debug!(worker_id = %self.id, error = %e, "Store busy, retrying next tick");
                    } else {
                        warn!(worker_id = %self.id, error = %e, "Claim failed");
                    }
                    self.pause(self.config.error_backoff, &shutdown).await;
                }
            }
        }

        if let Err(e) = self.backend.unregister_worker(&self.id).await {
            warn!(worker_id = %self.id, error = %e, "Failed to remove worker registration");
        }
        info!(worker_id = %self.id, processed, "Worker stopped");
        Ok(processed)
    }

    /// Claim and execute at most one job, without registering or sleeping.
    pub async fn run_once(&self) -> Result<Option<JobId>, QueueError> {
        let Some(job) = self.backend.claim_next(&self.id).await? else {
            return Ok(None);
        };
        let id = job.id.clone();
        self.execute(job).await;
        Ok(Some(id))
    }

    async fn pause(&self, duration: Duration, shutdown: &CancellationToken) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = shutdown.cancelled() => {}
        }
    }

    async fn execute(&self, job: Job) {
        // Re-read so `config set job_timeout_ms` applies without a restart
        let timeout = match self.backend.settings().await {
            Ok(settings) => settings.job_timeout,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Could not read settings, running without timeout");
                None
            }
        };
        let log_path = job
            .output_log
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| output_log_path(&self.config.log_dir, &job.id));

        info!(
            worker_id = %self.id,
            job_id = %job.id,
            attempt = job.attempts + 1,
            "Processing job"
        );

        let outcome = self.executor.run(&job, &log_path, timeout).await;
        self.report(&job, outcome).await;
    }

    /// Record the outcome, retrying store contention until it sticks.
    ///
    /// A stop request does not cut this short: a job whose outcome is never
    /// recorded would stay `processing` forever.
    async fn report(&self, job: &Job, outcome: ExecutionOutcome) {
        loop {
            let result = match &outcome {
                ExecutionOutcome::Success => self.backend.complete(&job.id).await.map(|()| None),
                ExecutionOutcome::Failed(reason) => {
                    self.backend.fail(&job.id, reason).await.map(Some)
                }
            };

            match result {
                Ok(None) => info!(job_id = %job.id, "Job completed"),
                Ok(Some(FailureOutcome::Retrying {
                    attempts,
                    scheduled_at,
                })) => info!(
                    job_id = %job.id,
                    attempts,
                    %scheduled_at,
                    error = outcome.error().unwrap_or_default(),
                    "Job failed, scheduling retry with backoff"
                ),
                Ok(Some(FailureOutcome::DeadLettered { attempts })) => warn!(
                    job_id = %job.id,
                    attempts,
                    error = outcome.error().unwrap_or_default(),
                    "Job exhausted retries, moved to dead-letter queue"
                ),
                Err(e) if e.is_transient() => {
                    warn!(
                        job_id = %job.id,
                        error = %e,
                        "Store busy while recording outcome, retrying"
                    );
                    tokio::time::sleep(self.config.error_backoff).await;
                    continue;
                }
                Err(e) => error!(job_id = %job.id, error = %e, "Failed to record job outcome"),
            }
            return;
        }
    }
}
