//! Data directory layout

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use runq_persist::{SqliteQueueBackend, SqliteStore};

/// Directory name under the user's home when no `--home` is given
const DEFAULT_DIR: &str = ".runq";

/// The runq data directory:
///
/// ```text
/// <home>/queue.db      job store
/// <home>/logs/         job transcripts and worker logs
/// <home>/pids.json     workers started by `runq worker start`
/// ```
#[derive(Debug, Clone)]
pub struct Home {
    root: PathBuf,
}

impl Home {
    /// Use `explicit` (from `--home` or `RUNQ_HOME`), falling back to `~/.runq`
    pub fn resolve(explicit: Option<PathBuf>) -> Result<Self> {
        let root = match explicit {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not determine home directory; pass --home or set RUNQ_HOME")?
                .join(DEFAULT_DIR),
        };
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn db_path(&self) -> PathBuf {
        self.root.join("queue.db")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.root.join("pids.json")
    }

    pub fn worker_log(&self, worker_id: &str) -> PathBuf {
        self.log_dir().join(format!("worker-{worker_id}.log"))
    }

    /// Open the job store, creating the directory, schema and defaults on first use
    pub async fn open_queue(&self) -> Result<SqliteQueueBackend> {
        let path = self.db_path();
        let store = SqliteStore::open_path(&path)
            .await
            .with_context(|| format!("Failed to open job store: {}", path.display()))?;
        Ok(SqliteQueueBackend::from_store(&store).with_log_dir(self.log_dir()))
    }
}
