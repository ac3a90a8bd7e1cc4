//! Job definitions

use chrono::{DateTime, Datelike, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::backend::QueueError;

/// Job Identifier
pub type JobId = String;

const ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const GENERATED_ID_LEN: usize = 12;
const MAX_ID_LEN: usize = 64;
/// Latest year a timestamp can carry and still sort correctly as stored text
const MAX_YEAR: i32 = 9999;

/// Generate a random 12 character `[0-9a-z]` job id
pub fn generate_id() -> JobId {
    let mut rng = rand::rng();
    (0..GENERATED_ID_LEN)
        .map(|_| ID_ALPHABET[rng.random_range(0..ID_ALPHABET.len())] as char)
        .collect()
}

/// Transcript path for a job inside `log_dir`
pub fn output_log_path(log_dir: &Path, id: &str) -> PathBuf {
    log_dir.join(format!("job-{id}.log"))
}

/// Job State
///
/// Dead-lettered jobs leave the job set entirely, so there is no state for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Waiting in queue
    Pending,
    /// Claimed by a worker
    Processing,
    /// Finished with exit code 0
    Completed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            other => Err(QueueError::InvalidInput(format!("unknown job state: {other}"))),
        }
    }
}

/// A persisted job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub command: String,
    pub state: JobState,
    pub attempts: u32,
    pub max_retries: u32,
    pub priority: i64,
    pub run_at: DateTime<Utc>,
    /// Earliest time the job may be claimed; moved forward on every retry
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub worker_id: Option<String>,
    pub output_log: Option<String>,
}

impl Job {
    /// Whether a worker may claim this job at `now`
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Pending && self.scheduled_at <= now
    }
}

/// Input to `QueueBackend::enqueue`.
///
/// Only `command` is required. Defaults: a generated id, `run_at` now,
/// `max_retries` from configuration, priority 0.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NewJob {
    pub command: String,
    #[serde(default)]
    pub id: Option<JobId>,
    #[serde(default)]
    pub run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub priority: Option<i64>,
}

impl NewJob {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<JobId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn run_at(mut self, at: DateTime<Utc>) -> Self {
        self.run_at = Some(at);
        self
    }

    /// Reject malformed input before anything is persisted
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.command.trim().is_empty() {
            return Err(QueueError::InvalidInput("command must not be empty".into()));
        }
        if let Some(id) = &self.id {
            let valid_chars = id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
            if id.is_empty() || id.len() > MAX_ID_LEN || !valid_chars {
                return Err(QueueError::InvalidInput(format!(
                    "job id must be 1-{MAX_ID_LEN} characters of [A-Za-z0-9_-], got {id:?}"
                )));
            }
        }
        if let Some(run_at) = self.run_at {
            // Stored timestamps are fixed-width text; 5-digit or signed years break ordering
            if !(0..=MAX_YEAR).contains(&run_at.year()) {
                return Err(QueueError::InvalidInput(format!(
                    "run_at must be between years 0000 and {MAX_YEAR}, got {run_at}"
                )));
            }
        }
        Ok(())
    }
}

/// Terminal failure record for a job that exhausted its retries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: JobId,
    /// The job row as it was when it was dead-lettered
    pub original_job: Job,
    pub failed_at: DateTime<Utc>,
    pub reason: Option<String>,
}

impl DeadLetterEntry {
    /// Fresh pending job rebuilt from the snapshot: same id, command, priority
    /// and retry budget, attempts reset.
    pub fn to_new_job(&self) -> NewJob {
        NewJob {
            command: self.original_job.command.clone(),
            id: Some(self.id.clone()),
            run_at: None,
            max_retries: Some(self.original_job.max_retries),
            priority: Some(self.original_job.priority),
        }
    }
}

/// Liveness record of a running worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRegistration {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
    pub stopping: bool,
}

/// Output of `QueueBackend::status`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub counts: BTreeMap<JobState, u64>,
    pub workers: Vec<WorkerRegistration>,
}

impl StatusReport {
    pub fn count(&self, state: JobState) -> u64 {
        self.counts.get(&state).copied().unwrap_or(0)
    }
}

/// What `QueueBackend::fail` did with the job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Back to pending, eligible again at `scheduled_at`
    Retrying {
        attempts: u32,
        scheduled_at: DateTime<Utc>,
    },
    /// Removed from the job set and recorded in the dead-letter queue
    DeadLettered { attempts: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids() {
        let a = generate_id();
        let b = generate_id();
        assert_eq!(a.len(), 12);
        assert!(a.bytes().all(|c| ID_ALPHABET.contains(&c)));
        assert_ne!(a, b);
    }

    #[test]
    fn test_state_round_trips_through_str() {
        for state in [JobState::Pending, JobState::Processing, JobState::Completed] {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert!("dead".parse::<JobState>().is_err());
    }

    #[test]
    fn test_new_job_validation() {
        assert!(NewJob::new("echo hi").validate().is_ok());
        assert!(NewJob::new("   ").validate().is_err());
        assert!(NewJob::new("true").with_id("job_1-a").validate().is_ok());
        assert!(NewJob::new("true").with_id("../etc").validate().is_err());
        assert!(NewJob::new("true").with_id("").validate().is_err());
    }

    #[test]
    fn test_run_at_outside_four_digit_years_is_rejected() {
        let far: NewJob =
            serde_json::from_str(r#"{"command": "true", "run_at": "+10000-01-01T00:00:00Z"}"#)
                .unwrap();
        assert!(matches!(far.validate(), Err(QueueError::InvalidInput(_))));

        let last: NewJob =
            serde_json::from_str(r#"{"command": "true", "run_at": "9999-12-31T23:59:59Z"}"#)
                .unwrap();
        assert!(last.validate().is_ok());
    }

    #[test]
    fn test_new_job_from_json() {
        let job: NewJob =
            serde_json::from_str(r#"{"command": "echo hi", "priority": 5, "max_retries": 1}"#)
                .unwrap();
        assert_eq!(job.command, "echo hi");
        assert_eq!(job.priority, Some(5));
        assert_eq!(job.max_retries, Some(1));
        assert_eq!(job.id, None);

        let missing_command = serde_json::from_str::<NewJob>(r#"{"id": "x"}"#);
        assert!(missing_command.is_err());

        let unknown_field = serde_json::from_str::<NewJob>(r#"{"command": "x", "cmd": "y"}"#);
        assert!(unknown_field.is_err());
    }

    #[test]
    fn test_status_report_serializes_state_keys() {
        let mut report = StatusReport::default();
        report.counts.insert(JobState::Pending, 2);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["counts"]["pending"], 2);
        assert_eq!(report.count(JobState::Completed), 0);
    }

    #[test]
    fn test_output_log_path() {
        let path = output_log_path(Path::new("/tmp/logs"), "abc");
        assert_eq!(path, PathBuf::from("/tmp/logs/job-abc.log"));
    }
}
