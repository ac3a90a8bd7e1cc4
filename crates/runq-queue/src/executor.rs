//! Shell command execution with transcript capture and timeout enforcement
//!
//! Each command runs as `sh -c <command>` in its own process group with stdout
//! and stderr appended to the job's transcript. A timeout terminates the whole
//! group: SIGTERM first, SIGKILL once the grace period runs out.

use chrono::{SecondsFormat, Utc};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::job::Job;

/// Error text recorded when a command exceeds `job_timeout_ms`
pub const TIMEOUT_ERROR: &str = "timeout";

/// Result of running one attempt of a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Exit code 0
    Success,
    /// Nonzero exit, signal, timeout or spawn failure
    Failed(String),
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Success => None,
            Self::Failed(reason) => Some(reason),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandExecutor {
    shell: String,
    kill_grace: Duration,
}

impl Default for CommandExecutor {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            kill_grace: Duration::from_secs(2),
        }
    }
}

impl CommandExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// How long a timed-out process group gets between SIGTERM and SIGKILL
    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    /// Run one attempt of `job`, appending its transcript to `log_path`.
    ///
    /// Never returns an error: every failure, including an unwritable
    /// transcript, becomes `ExecutionOutcome::Failed`.
    pub async fn run(&self, job: &Job, log_path: &Path, timeout: Option<Duration>) -> ExecutionOutcome {
        match self.run_logged(job, log_path, timeout).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(job_id = %job.id, log = %log_path.display(), error = %e, "Could not write job transcript");
                ExecutionOutcome::Failed(format!("transcript: {e}"))
            }
        }
    }

    async fn run_logged(
        &self,
        job: &Job,
        log_path: &Path,
        timeout: Option<Duration>,
    ) -> std::io::Result<ExecutionOutcome> {
        if let Some(dir) = log_path.parent() {
            fs::create_dir_all(dir).await?;
        }
        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .await?;

        log.write_all(
            format!(
                "[{}] START command=\"{}\" (attempt {}/{})\n",
                now(),
                job.command,
                job.attempts + 1,
                job.max_retries
            )
            .as_bytes(),
        )
        .await?;
        log.flush().await?;

        let outcome = self.spawn_and_wait(job, &log, timeout).await;

        if let ExecutionOutcome::Failed(error) = &outcome {
            log.write_all(format!("\n[{}] ERROR: {}\n", now(), error).as_bytes())
                .await?;
        }
        log.write_all(format!("[{}] END\n\n", now()).as_bytes())
            .await?;
        log.flush().await?;

        Ok(outcome)
    }

    async fn spawn_and_wait(
        &self,
        job: &Job,
        log: &fs::File,
        timeout: Option<Duration>,
    ) -> ExecutionOutcome {
        let child = match self.spawn(job, log).await {
            Ok(child) => child,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Failed to spawn command");
                return ExecutionOutcome::Failed(e.to_string());
            }
        };
        self.wait(job, child, timeout).await
    }

    async fn spawn(&self, job: &Job, log: &fs::File) -> std::io::Result<Child> {
        let stdout = log.try_clone().await?.into_std().await;
        let stderr = stdout.try_clone()?;

        debug!(job_id = %job.id, command = %job.command, "Spawning command");

        Command::new(&self.shell)
            .arg("-c")
            .arg(&job.command)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
    }

    async fn wait(&self, job: &Job, mut child: Child, timeout: Option<Duration>) -> ExecutionOutcome {
        let status = match timeout {
            None => child.wait().await,
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    info!(
                        job_id = %job.id,
                        timeout_ms = limit.as_millis() as u64,
                        "Command timed out, terminating process group"
                    );
                    self.terminate(&mut child).await;
                    return ExecutionOutcome::Failed(TIMEOUT_ERROR.to_string());
                }
            },
        };

        match status {
            Ok(status) => outcome_from_status(status),
            Err(e) => ExecutionOutcome::Failed(e.to_string()),
        }
    }

    async fn terminate(&self, child: &mut Child) {
        let Some(pid) = child.id() else {
            return;
        };
        let group = Pid::from_raw(pid as i32);

        if let Err(e) = killpg(group, Signal::SIGTERM) {
            debug!(pid, error = %e, "SIGTERM to process group failed");
        }
        if tokio::time::timeout(self.kill_grace, child.wait()).await.is_ok() {
            return;
        }
        if let Err(e) = killpg(group, Signal::SIGKILL) {
            debug!(pid, error = %e, "SIGKILL to process group failed");
        }
        let _ = child.wait().await;
    }
}

fn outcome_from_status(status: ExitStatus) -> ExecutionOutcome {
    use std::os::unix::process::ExitStatusExt;

    if status.success() {
        return ExecutionOutcome::Success;
    }
    match (status.code(), status.signal()) {
        (Some(code), _) => ExecutionOutcome::Failed(format!("exit code {code}")),
        (None, Some(signal)) => ExecutionOutcome::Failed(format!("terminated by signal {signal}")),
        (None, None) => ExecutionOutcome::Failed("command failed".to_string()),
    }
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
