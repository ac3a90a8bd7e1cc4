//! Background worker processes
//!
//! `runq worker start` re-executes the current binary as `runq worker run` once
//! per worker and records the children in a pid file; `runq worker stop` sends
//! each of them SIGTERM. Workers finish their current job before exiting.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, info, warn};

use runq_queue::job::generate_id;

/// A worker process started in the background
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerProcess {
    pub pid: u32,
    pub id: String,
    pub started_at: DateTime<Utc>,
}

pub struct Supervisor {
    pid_file: PathBuf,
    program: PathBuf,
    /// Arguments placed before the generated `worker run ...` arguments
    base_args: Vec<OsString>,
}

impl Supervisor {
    pub fn new(pid_file: impl Into<PathBuf>, program: impl Into<PathBuf>) -> Self {
        Self {
            pid_file: pid_file.into(),
            program: program.into(),
            base_args: Vec::new(),
        }
    }

    /// Supervise copies of the running executable
    pub fn current_exe(pid_file: impl Into<PathBuf>) -> Result<Self> {
        let exe = std::env::current_exe().context("Failed to locate the runq executable")?;
        Ok(Self::new(pid_file, exe))
    }

    pub fn with_base_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.base_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Workers recorded in the pid file
    pub fn running(&self) -> Result<Vec<WorkerProcess>> {
        match std::fs::read_to_string(&self.pid_file) {
            Ok(content) if content.trim().is_empty() => Ok(Vec::new()),
            Ok(content) => serde_json::from_str(&content)
                .with_context(|| format!("Corrupt pid file: {}", self.pid_file.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e)
                .with_context(|| format!("Failed to read pid file: {}", self.pid_file.display())),
        }
    }

    /// Spawn `count` detached workers sharing `home`
    pub fn start(
        &self,
        count: usize,
        poll_interval_ms: u64,
        home: &Path,
    ) -> Result<Vec<WorkerProcess>> {
        let mut recorded = self.running()?;
        let mut started = Vec::with_capacity(count);

        for _ in 0..count {
            let id = format!("w-{}", generate_id());
            let poll = poll_interval_ms.to_string();

            let child = Command::new(&self.program)
                .args(&self.base_args)
                .arg("--home")
                .arg(home)
                .args(["worker", "run", "--id", &id, "--poll-interval", &poll])
                .env("RUNQ_HOME", home)
                .env("RUNQ_WORKER_ID", &id)
                .env("RUNQ_POLL_INTERVAL_MS", &poll)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                // Keep terminal Ctrl-C away from background workers
                .process_group(0)
                .spawn()
                .with_context(|| format!("Failed to spawn worker {id}"))?;

            info!(worker_id = %id, pid = child.id(), "Started worker");
            let process = WorkerProcess {
                pid: child.id(),
                id,
                started_at: Utc::now(),
            };
            recorded.push(process.clone());
            started.push(process);

            // Record as we go so a later spawn failure doesn't orphan earlier workers
            self.save(&recorded)?;
        }

        Ok(started)
    }

    /// SIGTERM every recorded worker and clear the pid file.
    ///
    /// Returns how many processes were signalled; already-exited ones are skipped.
    pub fn stop(&self) -> Result<usize> {
        let workers = self.running()?;
        let mut signalled = 0;

        for worker in &workers {
            let pid = i32::try_from(worker.pid)
                .with_context(|| format!("Invalid pid in pid file: {}", worker.pid))?;
            if !runs_worker(worker) {
                warn!(
                    worker_id = %worker.id,
                    pid,
                    "Pid no longer belongs to this worker, not signalling"
                );
                continue;
            }
            match kill(Pid::from_raw(pid), Signal::SIGTERM) {
                Ok(()) => {
                    info!(worker_id = %worker.id, pid, "Sent SIGTERM");
                    signalled += 1;
                }
                Err(Errno::ESRCH) => {
                    debug!(worker_id = %worker.id, pid, "Worker already exited");
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("Failed to signal worker {} (pid {pid})", worker.id)
                    });
                }
            }
        }

        self.save(&[])?;
        Ok(signalled)
    }

    fn save(&self, workers: &[WorkerProcess]) -> Result<()> {
        if let Some(dir) = self.pid_file.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let content = serde_json::to_string_pretty(workers)?;
        std::fs::write(&self.pid_file, content)
            .with_context(|| format!("Failed to write pid file: {}", self.pid_file.display()))
    }
}

/// Whether `worker.pid` still runs the recorded worker.
///
/// Checks the process's arguments for the worker id where `/proc` is
/// available, so a pid reused by an unrelated process is left alone.
/// Elsewhere, and for processes that are already gone, it defers to `kill`.
fn runs_worker(worker: &WorkerProcess) -> bool {
    match std::fs::read(format!("/proc/{}/cmdline", worker.pid)) {
        Ok(cmdline) => cmdline
            .split(|b| *b == 0)
            .any(|arg| arg == worker.id.as_bytes()),
        Err(_) => true,
    }
}
