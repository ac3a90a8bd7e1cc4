//! Runtime settings stored in the queue's configuration table

use std::time::Duration;

use crate::backend::QueueError;

pub const MAX_RETRIES: &str = "max_retries";
pub const BACKOFF_BASE: &str = "backoff_base";
pub const POLL_INTERVAL_MS: &str = "poll_interval_ms";
pub const JOB_TIMEOUT_MS: &str = "job_timeout_ms";

pub const KNOWN_KEYS: [&str; 4] = [MAX_RETRIES, BACKOFF_BASE, POLL_INTERVAL_MS, JOB_TIMEOUT_MS];

/// Values seeded into a fresh store. Existing values are never overwritten.
pub const DEFAULTS: [(&str, &str); 4] = [
    (MAX_RETRIES, "3"),
    (BACKOFF_BASE, "2"),
    (POLL_INTERVAL_MS, "500"),
    (JOB_TIMEOUT_MS, "0"),
];

/// Upper bound on a single retry delay so the reschedule time stays representable.
const MAX_BACKOFF_SECS: u64 = 365 * 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSettings {
    pub max_retries: u32,
    pub backoff_base: u64,
    pub poll_interval: Duration,
    /// `None` means commands may run forever
    pub job_timeout: Option<Duration>,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: 2,
            poll_interval: Duration::from_millis(500),
            job_timeout: None,
        }
    }
}

impl QueueSettings {
    /// Overlay one stored key. Unknown keys are ignored.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<(), QueueError> {
        validate(key, value)?;
        let parsed = || parse_number(key, value);
        match key {
            MAX_RETRIES => self.max_retries = parsed()? as u32,
            BACKOFF_BASE => self.backoff_base = parsed()?,
            POLL_INTERVAL_MS => self.poll_interval = Duration::from_millis(parsed()?),
            JOB_TIMEOUT_MS => {
                let ms = parsed()?;
                self.job_timeout = (ms > 0).then(|| Duration::from_millis(ms));
            }
            _ => {}
        }
        Ok(())
    }

    /// Retry delay after the `attempts`-th failure: `backoff_base ^ attempts` seconds.
    pub fn backoff_delay(&self, attempts: u32) -> Duration {
        backoff_delay(self.backoff_base, attempts)
    }
}

pub fn backoff_delay(base: u64, attempts: u32) -> Duration {
    let secs = base
        .checked_pow(attempts)
        .unwrap_or(MAX_BACKOFF_SECS)
        .min(MAX_BACKOFF_SECS);
    Duration::from_secs(secs)
}

/// Reject values for known keys that the engine could not use.
pub fn validate(key: &str, value: &str) -> Result<(), QueueError> {
    if !KNOWN_KEYS.contains(&key) {
        return Ok(());
    }
    let n = parse_number(key, value)?;
    if key == MAX_RETRIES && n > u64::from(u32::MAX) {
        return Err(QueueError::InvalidInput(format!("{key} is too large: {n}")));
    }
    if key == BACKOFF_BASE && n == 0 {
        return Err(QueueError::InvalidInput(format!("{key} must be at least 1")));
    }
    Ok(())
}

fn parse_number(key: &str, value: &str) -> Result<u64, QueueError> {
    value.trim().parse::<u64>().map_err(|_| {
        QueueError::InvalidInput(format!(
            "{key} must be a non-negative integer, got {value:?}"
        ))
    })
}
