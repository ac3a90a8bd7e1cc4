//! Durable queue backend using SQLite
//!
//! Mutations that read before they write run inside `BEGIN IMMEDIATE`, which
//! takes the database write lock up front. The claim additionally guards its
//! update with `state = 'pending'` and checks the affected row count; that
//! guard is what keeps two workers from ever holding the same job.

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use sqlx::pool::PoolConnection;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, warn};

use runq_queue::job::{generate_id, output_log_path};
use runq_queue::settings::{self, QueueSettings};
use runq_queue::{
    DeadLetterEntry, FailureOutcome, Job, JobId, JobState, NewJob, QueueBackend, QueueError,
    StatusReport, WorkerRegistration,
};

use crate::sqlite::{db_err, SqliteStore};

const JOB_COLUMNS: &str = "id, command, state, attempts, max_retries, priority, run_at, \
     scheduled_at, created_at, updated_at, last_error, worker_id, output_log";

/// Durable queue backend using SQLite
#[derive(Debug, Clone)]
pub struct SqliteQueueBackend {
    pool: SqlitePool,
    log_dir: Option<PathBuf>,
}

impl SqliteQueueBackend {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            log_dir: None,
        }
    }

    pub fn from_store(store: &SqliteStore) -> Self {
        Self::new(store.pool().clone())
    }

    /// Record `<dir>/job-<id>.log` as the transcript of newly enqueued jobs
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    /// Start an exclusive write transaction on a dedicated connection
    async fn begin_immediate(&self) -> Result<PoolConnection<Sqlite>, QueueError> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut *conn)
            .await
            .map_err(db_err)?;
        Ok(conn)
    }

    async fn insert_job(
        &self,
        conn: &mut SqliteConnection,
        job: NewJob,
    ) -> Result<JobId, QueueError> {
        job.validate()?;
        let id = job.id.clone().unwrap_or_else(generate_id);
        let now = Utc::now();
        let run_at = job.run_at.unwrap_or(now);
        let max_retries = match job.max_retries {
            Some(n) => n,
            None => read_settings(&mut *conn).await?.max_retries,
        };
        let output_log = self
            .log_dir
            .as_ref()
            .map(|dir| output_log_path(dir, &id).display().to_string());

        sqlx::query(
            r#"
            INSERT INTO jobs (id, command, state, attempts, max_retries, priority,
                              run_at, scheduled_at, created_at, updated_at, output_log)
            VALUES (?, ?, 'pending', 0, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&job.command)
        .bind(i64::from(max_retries))
        .bind(job.priority.unwrap_or(0))
        .bind(ts(run_at))
        .bind(ts(run_at))
        .bind(ts(now))
        .bind(ts(now))
        .bind(output_log)
        .execute(&mut *conn)
        .await
        .map_err(|e| match db_err(e) {
            QueueError::AlreadyExists(_) => QueueError::AlreadyExists(id.clone()),
            other => other,
        })?;

        Ok(id)
    }

    async fn dlq_retry_in_tx(
        &self,
        conn: &mut SqliteConnection,
        id: &str,
    ) -> Result<bool, QueueError> {
        let row = sqlx::query("SELECT id, original_job, failed_at, reason FROM dlq WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(db_err)?;
        let Some(row) = row else {
            return Ok(false);
        };
        let entry = dead_letter_from_row(&row)?;

        self.insert_job(&mut *conn, entry.to_new_job()).await?;
        sqlx::query("DELETE FROM dlq WHERE id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await
            .map_err(db_err)?;
        Ok(true)
    }
}

/// Commit on success, roll back on error. A failed commit is rolled back too.
async fn finish<T>(
    mut conn: PoolConnection<Sqlite>,
    result: Result<T, QueueError>,
) -> Result<T, QueueError> {
    let result = match result {
        Ok(value) => match sqlx::query("COMMIT").execute(&mut *conn).await {
            Ok(_) => return Ok(value),
            Err(e) => Err(db_err(e)),
        },
        Err(e) => Err(e),
    };
    if let Err(e) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
        warn!(error = %e, "Rollback failed");
    }
    result
}

async fn claim_in_tx(
    conn: &mut SqliteConnection,
    worker_id: &str,
) -> Result<Option<Job>, QueueError> {
    let now = ts(Utc::now());
    let row = sqlx::query(&format!(
        "SELECT {JOB_COLUMNS} FROM jobs \
         WHERE state = 'pending' AND scheduled_at <= ? \
         ORDER BY priority DESC, created_at ASC \
         LIMIT 1"
    ))
    .bind(&now)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_err)?;

    let Some(row) = row else {
        return Ok(None);
    };
    let mut job = job_from_row(&row)?;

    let changed = sqlx::query(
        "UPDATE jobs SET state = 'processing', worker_id = ?, updated_at = ? \
         WHERE id = ? AND state = 'pending'",
    )
    .bind(worker_id)
    .bind(&now)
    .bind(&job.id)
    .execute(&mut *conn)
    .await
    .map_err(db_err)?
    .rows_affected();

    if changed == 0 {
        debug!(job_id = %job.id, worker_id, "Lost claim race");
        return Ok(None);
    }

    job.state = JobState::Processing;
    job.worker_id = Some(worker_id.to_string());
    job.updated_at = parse_ts(&now)?;
    Ok(Some(job))
}

async fn fail_in_tx(
    conn: &mut SqliteConnection,
    id: &str,
    error: &str,
) -> Result<FailureOutcome, QueueError> {
    let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?"))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err)?
        .ok_or(QueueError::NotFound)?;
    let mut job = job_from_row(&row)?;
    if job.state != JobState::Processing {
        return Err(QueueError::NotProcessing(id.to_string()));
    }

    let now = Utc::now();
    let attempts = job.attempts + 1;

    if attempts > job.max_retries {
        job.attempts = attempts;
        job.last_error = Some(error.to_string());
        job.updated_at = now;
        let snapshot = serde_json::to_string(&job)?;

        sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await
            .map_err(db_err)?;
        sqlx::query("INSERT INTO dlq (id, original_job, failed_at, reason) VALUES (?, ?, ?, ?)")
            .bind(id)
            .bind(snapshot)
            .bind(ts(now))
            .bind(error)
            .execute(&mut *conn)
            .await
            .map_err(db_err)?;

        return Ok(FailureOutcome::DeadLettered { attempts });
    }

    let delay = read_settings(&mut *conn).await?.backoff_delay(attempts);
    let scheduled_at = parse_ts(&ts(now + Duration::seconds(delay.as_secs() as i64)))?;

    sqlx::query(
        "UPDATE jobs SET state = 'pending', attempts = ?, scheduled_at = ?, \
         last_error = ?, updated_at = ? WHERE id = ?",
    )
    .bind(i64::from(attempts))
    .bind(ts(scheduled_at))
    .bind(error)
    .bind(ts(now))
    .bind(id)
    .execute(&mut *conn)
    .await
    .map_err(db_err)?;

    debug!(
        job_id = %id,
        attempts,
        delay_secs = delay.as_secs(),
        "Re-queued job with backoff"
    );
    Ok(FailureOutcome::Retrying {
        attempts,
        scheduled_at,
    })
}

async fn read_settings(conn: &mut SqliteConnection) -> Result<QueueSettings, QueueError> {
    let rows = sqlx::query("SELECT key, value FROM config")
        .fetch_all(&mut *conn)
        .await
        .map_err(db_err)?;
    let mut settings = QueueSettings::default();
    for row in rows {
        let key: String = row.try_get("key").map_err(db_err)?;
        let value: String = row.try_get("value").map_err(db_err)?;
        settings.apply(&key, &value)?;
    }
    Ok(settings)
}

#[async_trait]
impl QueueBackend for SqliteQueueBackend {
    async fn enqueue(&self, job: NewJob) -> Result<JobId, QueueError> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        self.insert_job(&mut conn, job).await
    }

    async fn get(&self, id: &str) -> Result<Option<Job>, QueueError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn list(
        &self,
        state: Option<JobState>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Job>, QueueError> {
        let rows = match state {
            Some(state) => {
                sqlx::query(&format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE state = ? \
                     ORDER BY created_at DESC LIMIT ? OFFSET ?"
                ))
                .bind(state.as_str())
                .bind(i64::from(limit))
                .bind(i64::from(offset))
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at DESC LIMIT ? OFFSET ?"
                ))
                .bind(i64::from(limit))
                .bind(i64::from(offset))
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(db_err)?;

        rows.iter().map(job_from_row).collect()
    }

    async fn status(&self) -> Result<StatusReport, QueueError> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS c FROM jobs GROUP BY state")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        let mut counts = BTreeMap::new();
        for row in rows {
            let state: String = row.try_get("state").map_err(db_err)?;
            let count: i64 = row.try_get("c").map_err(db_err)?;
            counts.insert(state.parse::<JobState>()?, count as u64);
        }

        let rows = sqlx::query(
            "SELECT id, started_at, heartbeat_at, stopping FROM workers ORDER BY started_at",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        let workers = rows
            .iter()
            .map(worker_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(StatusReport { counts, workers })
    }

    async fn claim_next(&self, worker_id: &str) -> Result<Option<Job>, QueueError> {
        let mut conn = self.begin_immediate().await?;
        let result = claim_in_tx(&mut conn, worker_id).await;
        finish(conn, result).await
    }

    async fn complete(&self, id: &str) -> Result<(), QueueError> {
        let changed = sqlx::query(
            "UPDATE jobs SET state = 'completed', last_error = NULL, updated_at = ? \
             WHERE id = ? AND state = 'processing'",
        )
        .bind(ts(Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?
        .rows_affected();

        if changed == 0 {
            // Tell a stale report apart from a missing job
            return match self.get(id).await? {
                Some(_) => Err(QueueError::NotProcessing(id.to_string())),
                None => Err(QueueError::NotFound),
            };
        }
        Ok(())
    }

    async fn fail(&self, id: &str, error: &str) -> Result<FailureOutcome, QueueError> {
        let mut conn = self.begin_immediate().await?;
        let result = fail_in_tx(&mut conn, id, error).await;
        finish(conn, result).await
    }

    async fn dlq_list(&self) -> Result<Vec<DeadLetterEntry>, QueueError> {
        let rows = sqlx::query(
            "SELECT id, original_job, failed_at, reason FROM dlq ORDER BY failed_at DESC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(dead_letter_from_row).collect()
    }

    async fn dlq_retry(&self, id: &str) -> Result<bool, QueueError> {
        let mut conn = self.begin_immediate().await?;
        let result = self.dlq_retry_in_tx(&mut conn, id).await;
        finish(conn, result).await
    }

    async fn get_config(&self, key: &str) -> Result<Option<String>, QueueError> {
        sqlx::query_scalar("SELECT value FROM config WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)
    }

    async fn set_config(&self, key: &str, value: &str) -> Result<(), QueueError> {
        settings::validate(key, value)?;
        sqlx::query(
            "INSERT INTO config (key, value) VALUES (?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn settings(&self) -> Result<QueueSettings, QueueError> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        read_settings(&mut conn).await
    }

    async fn register_worker(&self, worker_id: &str) -> Result<(), QueueError> {
        let now = ts(Utc::now());
        sqlx::query(
            "INSERT INTO workers (id, started_at, heartbeat_at, stopping) VALUES (?, ?, ?, 0) \
             ON CONFLICT(id) DO UPDATE SET heartbeat_at = excluded.heartbeat_at, stopping = 0",
        )
        .bind(worker_id)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn heartbeat(&self, worker_id: &str) -> Result<(), QueueError> {
        sqlx::query("UPDATE workers SET heartbeat_at = ? WHERE id = ?")
            .bind(ts(Utc::now()))
            .bind(worker_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn mark_stopping(&self, worker_id: &str) -> Result<(), QueueError> {
        sqlx::query("UPDATE workers SET stopping = 1 WHERE id = ?")
            .bind(worker_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn unregister_worker(&self, worker_id: &str) -> Result<(), QueueError> {
        sqlx::query("DELETE FROM workers WHERE id = ?")
            .bind(worker_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

/// Fixed-width UTC timestamp; lexical order in SQL matches time order
pub fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, QueueError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| QueueError::Backend(format!("invalid timestamp {s:?}: {e}")))
}

fn job_from_row(row: &SqliteRow) -> Result<Job, QueueError> {
    let state: String = row.try_get("state").map_err(db_err)?;
    let attempts: i64 = row.try_get("attempts").map_err(db_err)?;
    let max_retries: i64 = row.try_get("max_retries").map_err(db_err)?;
    let run_at: String = row.try_get("run_at").map_err(db_err)?;
    let scheduled_at: String = row.try_get("scheduled_at").map_err(db_err)?;
    let created_at: String = row.try_get("created_at").map_err(db_err)?;
    let updated_at: String = row.try_get("updated_at").map_err(db_err)?;

    Ok(Job {
        id: row.try_get("id").map_err(db_err)?,
        command: row.try_get("command").map_err(db_err)?,
        state: state.parse()?,
        attempts: to_u32("attempts", attempts)?,
        max_retries: to_u32("max_retries", max_retries)?,
        priority: row.try_get("priority").map_err(db_err)?,
        run_at: parse_ts(&run_at)?,
        scheduled_at: parse_ts(&scheduled_at)?,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
        last_error: row.try_get("last_error").map_err(db_err)?,
        worker_id: row.try_get("worker_id").map_err(db_err)?,
        output_log: row.try_get("output_log").map_err(db_err)?,
    })
}

fn worker_from_row(row: &SqliteRow) -> Result<WorkerRegistration, QueueError> {
    let started_at: String = row.try_get("started_at").map_err(db_err)?;
    let heartbeat_at: String = row.try_get("heartbeat_at").map_err(db_err)?;
    let stopping: i64 = row.try_get("stopping").map_err(db_err)?;
    Ok(WorkerRegistration {
        id: row.try_get("id").map_err(db_err)?,
        started_at: parse_ts(&started_at)?,
        heartbeat_at: parse_ts(&heartbeat_at)?,
        stopping: stopping != 0,
    })
}

fn dead_letter_from_row(row: &SqliteRow) -> Result<DeadLetterEntry, QueueError> {
    let original_job: String = row.try_get("original_job").map_err(db_err)?;
    let failed_at: String = row.try_get("failed_at").map_err(db_err)?;
    Ok(DeadLetterEntry {
        id: row.try_get("id").map_err(db_err)?,
        original_job: serde_json::from_str(&original_job)?,
        failed_at: parse_ts(&failed_at)?,
        reason: row.try_get("reason").map_err(db_err)?,
    })
}

fn to_u32(column: &str, value: i64) -> Result<u32, QueueError> {
    u32::try_from(value)
        .map_err(|_| QueueError::Backend(format!("{column} out of range: {value}")))
}
