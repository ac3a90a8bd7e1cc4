//! SQLite store bootstrap: connection pool, schema and default settings

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use runq_queue::settings::DEFAULTS;
use runq_queue::QueueError;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    command TEXT NOT NULL,
    state TEXT NOT NULL DEFAULT 'pending',
    attempts INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL DEFAULT 3,
    priority INTEGER NOT NULL DEFAULT 0,
    run_at TEXT NOT NULL,
    scheduled_at TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    last_error TEXT,
    worker_id TEXT,
    output_log TEXT
);
CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state);
CREATE INDEX IF NOT EXISTS idx_jobs_scheduled ON jobs(scheduled_at);
CREATE TABLE IF NOT EXISTS dlq (
    id TEXT PRIMARY KEY,
    original_job TEXT NOT NULL,
    failed_at TEXT NOT NULL,
    reason TEXT
);
CREATE TABLE IF NOT EXISTS config (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS workers (
    id TEXT PRIMARY KEY,
    started_at TEXT NOT NULL,
    heartbeat_at TEXT NOT NULL,
    stopping INTEGER NOT NULL DEFAULT 0
);
"#;

/// SQLite configuration options
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// Database file, created if missing. `None` opens a private in-memory database.
    pub path: Option<PathBuf>,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Enable WAL journal mode so readers and the writer don't block each other
    pub wal_mode: bool,
    /// How long a statement waits for another process's write lock
    pub busy_timeout: Duration,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: Some(PathBuf::from("runq.db")),
            max_connections: 5,
            wal_mode: true,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

impl SqliteConfig {
    /// Config for an on-disk database at `path`
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Default::default()
        }
    }

    /// Create config for in-memory database (testing)
    pub fn memory() -> Self {
        Self {
            path: None,
            max_connections: 1,
            wal_mode: false,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

/// Open handle to the queue database
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database file at `path` with default settings
    pub async fn open_path(path: impl AsRef<Path>) -> Result<Self, QueueError> {
        Self::open(SqliteConfig::file(path.as_ref())).await
    }

    /// In-memory store, mainly for tests
    pub async fn memory() -> Result<Self, QueueError> {
        Self::open(SqliteConfig::memory()).await
    }

    /// Connect, ensure the schema exists and seed missing default settings.
    ///
    /// Safe to call from many processes at once and on every start: nothing
    /// that already exists is modified.
    pub async fn open(config: SqliteConfig) -> Result<Self, QueueError> {
        let mut pool_options = SqlitePoolOptions::new().max_connections(config.max_connections);

        let mut options = match &config.path {
            Some(path) => {
                if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                    tokio::fs::create_dir_all(dir).await?;
                }
                SqliteConnectOptions::new()
                    .filename(path)
                    .create_if_missing(true)
            }
            None => {
                // An in-memory database lives exactly as long as its connection
                pool_options = pool_options
                    .min_connections(1)
                    .idle_timeout(None)
                    .max_lifetime(None);
                SqliteConnectOptions::from_str("sqlite::memory:").map_err(connection_err)?
            }
        };

        options = options.busy_timeout(config.busy_timeout);
        if config.wal_mode {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(connection_err)?;

        info!(
            path = ?config.path,
            wal = config.wal_mode,
            busy_timeout_ms = config.busy_timeout.as_millis() as u64,
            "Connected to SQLite"
        );

        let store = Self { pool };
        store.ensure_schema().await?;
        store.seed_defaults().await?;
        Ok(store)
    }

    /// Get the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close all connections, waiting for in-flight statements
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn ensure_schema(&self) -> Result<(), QueueError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn seed_defaults(&self) -> Result<(), QueueError> {
        for (key, value) in DEFAULTS {
            sqlx::query("INSERT INTO config (key, value) VALUES (?, ?) ON CONFLICT(key) DO NOTHING")
                .bind(key)
                .bind(value)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        }
        Ok(())
    }
}

fn connection_err(e: sqlx::Error) -> QueueError {
    QueueError::Backend(format!("connection failed: {e}"))
}

/// Map a driver error, separating lock contention from real failures
pub(crate) fn db_err(e: sqlx::Error) -> QueueError {
    if let sqlx::Error::PoolTimedOut = e {
        return QueueError::Busy(e.to_string());
    }
    if let Some(db) = e.as_database_error() {
        if db.is_unique_violation() {
            return QueueError::AlreadyExists(db.message().to_string());
        }
        // SQLITE_BUSY (5) and SQLITE_LOCKED (6), including extended codes
        let primary = db
            .code()
            .and_then(|code| code.parse::<i32>().ok())
            .map(|code| code & 0xff);
        if matches!(primary, Some(5) | Some(6)) {
            return QueueError::Busy(db.message().to_string());
        }
    }
    QueueError::Backend(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_is_seeded() {
        let store = SqliteStore::memory().await.unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM config")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count, DEFAULTS.len() as i64);
    }

    #[tokio::test]
    async fn test_open_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("queue.db");

        let store = SqliteStore::open_path(&path).await.unwrap();
        store.close().await;
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_file_store_uses_wal() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open_path(dir.path().join("queue.db"))
            .await
            .unwrap();

        let mode: String = sqlx::query_scalar("PRAGMA journal_mode")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }
}
