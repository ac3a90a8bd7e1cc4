//! In-memory queue implementation
//!
//! Single-process stand-in for the durable store. One mutex guards all state,
//! so the claim compare-and-swap is trivially atomic.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use tokio::sync::Mutex;

use crate::backend::{QueueBackend, QueueError};
use crate::job::{
    generate_id, output_log_path, DeadLetterEntry, FailureOutcome, Job, JobId, JobState, NewJob,
    StatusReport, WorkerRegistration,
};
use crate::settings::{self, QueueSettings};

#[derive(Debug)]
struct State {
    jobs: HashMap<JobId, Job>,
    dlq: HashMap<JobId, DeadLetterEntry>,
    config: BTreeMap<String, String>,
    workers: BTreeMap<String, WorkerRegistration>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            jobs: HashMap::new(),
            dlq: HashMap::new(),
            config: settings::DEFAULTS
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            workers: BTreeMap::new(),
        }
    }
}

impl State {
    fn settings(&self) -> Result<QueueSettings, QueueError> {
        let mut settings = QueueSettings::default();
        for (key, value) in &self.config {
            settings.apply(key, value)?;
        }
        Ok(settings)
    }

    fn insert(&mut self, job: NewJob, log_dir: Option<&PathBuf>) -> Result<JobId, QueueError> {
        job.validate()?;
        let id = job.id.clone().unwrap_or_else(generate_id);
        if self.jobs.contains_key(&id) {
            return Err(QueueError::AlreadyExists(id));
        }

        let now = Utc::now();
        let run_at = job.run_at.unwrap_or(now);
        let max_retries = match job.max_retries {
            Some(n) => n,
            None => self.settings()?.max_retries,
        };

        self.jobs.insert(
            id.clone(),
            Job {
                id: id.clone(),
                command: job.command,
                state: JobState::Pending,
                attempts: 0,
                max_retries,
                priority: job.priority.unwrap_or(0),
                run_at,
                scheduled_at: run_at,
                created_at: now,
                updated_at: now,
                last_error: None,
                worker_id: None,
                output_log: log_dir.map(|dir| output_log_path(dir, &id).display().to_string()),
            },
        );
        Ok(id)
    }
}

#[derive(Debug, Default)]
pub struct MemoryQueue {
    state: Mutex<State>,
    log_dir: Option<PathBuf>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign transcript paths under `dir` to newly enqueued jobs
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    async fn enqueue(&self, job: NewJob) -> Result<JobId, QueueError> {
        let mut state = self.state.lock().await;
        state.insert(job, self.log_dir.as_ref())
    }

    async fn get(&self, id: &str) -> Result<Option<Job>, QueueError> {
        Ok(self.state.lock().await.jobs.get(id).cloned())
    }

    async fn list(
        &self,
        state_filter: Option<JobState>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Job>, QueueError> {
        let state = self.state.lock().await;
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|job| state_filter.map_or(true, |s| job.state == s))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn status(&self) -> Result<StatusReport, QueueError> {
        let state = self.state.lock().await;
        let mut report = StatusReport::default();
        for job in state.jobs.values() {
            *report.counts.entry(job.state).or_insert(0) += 1;
        }
        report.workers = state.workers.values().cloned().collect();
        Ok(report)
    }

    async fn claim_next(&self, worker_id: &str) -> Result<Option<Job>, QueueError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        let next = state
            .jobs
            .values()
            .filter(|job| job.is_eligible(now))
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.created_at.cmp(&b.created_at))
            })
            .map(|job| job.id.clone());

        let Some(id) = next else {
            return Ok(None);
        };
        let Some(job) = state.jobs.get_mut(&id) else {
            return Ok(None);
        };
        if job.state != JobState::Pending {
            return Ok(None);
        }
        job.state = JobState::Processing;
        job.worker_id = Some(worker_id.to_string());
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn complete(&self, id: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let job = state.jobs.get_mut(id).ok_or(QueueError::NotFound)?;
        if job.state != JobState::Processing {
            return Err(QueueError::NotProcessing(id.to_string()));
        }
        job.state = JobState::Completed;
        job.last_error = None;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn fail(&self, id: &str, error: &str) -> Result<FailureOutcome, QueueError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let settings = state.settings()?;
        let now = Utc::now();

        let job = state.jobs.get_mut(id).ok_or(QueueError::NotFound)?;
        if job.state != JobState::Processing {
            return Err(QueueError::NotProcessing(id.to_string()));
        }
        let attempts = job.attempts + 1;
        job.attempts = attempts;
        job.last_error = Some(error.to_string());
        job.updated_at = now;

        if attempts > job.max_retries {
            let Some(snapshot) = state.jobs.remove(id) else {
                return Err(QueueError::NotFound);
            };
            state.dlq.insert(
                id.to_string(),
                DeadLetterEntry {
                    id: id.to_string(),
                    original_job: snapshot,
                    failed_at: now,
                    reason: Some(error.to_string()),
                },
            );
            tracing::debug!(job_id = %id, attempts, "Job moved to dead-letter queue");
            return Ok(FailureOutcome::DeadLettered { attempts });
        }

        let delay = settings.backoff_delay(attempts);
        let scheduled_at = now + Duration::seconds(delay.as_secs() as i64);
        job.state = JobState::Pending;
        job.scheduled_at = scheduled_at;

        tracing::debug!(
            job_id = %id,
            attempts,
            delay_secs = delay.as_secs(),
            "Re-queuing job with backoff"
        );
        Ok(FailureOutcome::Retrying {
            attempts,
            scheduled_at,
        })
    }

    async fn dlq_list(&self) -> Result<Vec<DeadLetterEntry>, QueueError> {
        let state = self.state.lock().await;
        let mut entries: Vec<DeadLetterEntry> = state.dlq.values().cloned().collect();
        entries.sort_by(|a, b| b.failed_at.cmp(&a.failed_at));
        Ok(entries)
    }

    async fn dlq_retry(&self, id: &str) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        let Some(entry) = state.dlq.get(id).cloned() else {
            return Ok(false);
        };
        state.insert(entry.to_new_job(), self.log_dir.as_ref())?;
        state.dlq.remove(id);
        Ok(true)
    }

    async fn get_config(&self, key: &str) -> Result<Option<String>, QueueError> {
        Ok(self.state.lock().await.config.get(key).cloned())
    }

    async fn set_config(&self, key: &str, value: &str) -> Result<(), QueueError> {
        settings::validate(key, value)?;
        self.state
            .lock()
            .await
            .config
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn register_worker(&self, worker_id: &str) -> Result<(), QueueError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        state
            .workers
            .entry(worker_id.to_string())
            .and_modify(|w| {
                w.heartbeat_at = now;
                w.stopping = false;
            })
            .or_insert_with(|| WorkerRegistration {
                id: worker_id.to_string(),
                started_at: now,
                heartbeat_at: now,
                stopping: false,
            });
        Ok(())
    }

    async fn heartbeat(&self, worker_id: &str) -> Result<(), QueueError> {
        if let Some(w) = self.state.lock().await.workers.get_mut(worker_id) {
            w.heartbeat_at = Utc::now();
        }
        Ok(())
    }

    async fn mark_stopping(&self, worker_id: &str) -> Result<(), QueueError> {
        if let Some(w) = self.state.lock().await.workers.get_mut(worker_id) {
            w.stopping = true;
        }
        Ok(())
    }

    async fn unregister_worker(&self, worker_id: &str) -> Result<(), QueueError> {
        self.state.lock().await.workers.remove(worker_id);
        Ok(())
    }
}
