//! Cooperative worker shutdown
//!
//! A stop request never interrupts a running command: it cancels the token the
//! worker loop checks once per tick and marks the registration `stopping`.

use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backend::QueueBackend;

/// Ask a worker to stop after its current job
pub async fn request_stop<B>(backend: &B, worker_id: &str, token: &CancellationToken)
where
    B: QueueBackend + ?Sized,
{
    token.cancel();
    if let Err(e) = backend.mark_stopping(worker_id).await {
        warn!(worker_id, error = %e, "Failed to persist stopping flag");
    }
}

/// Install a handler that turns SIGTERM or SIGINT into a stop request.
///
/// Returns the token the worker loop should watch. The handler task ends when
/// a signal arrives or the token is cancelled some other way.
pub fn install_shutdown_handler<B>(
    backend: Arc<B>,
    worker_id: String,
) -> std::io::Result<CancellationToken>
where
    B: QueueBackend + ?Sized + 'static,
{
    let token = CancellationToken::new();
    let task_token = token.clone();
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                info!(worker_id = %worker_id, "Received SIGTERM, finishing current job before exit");
            }
            _ = sigint.recv() => {
                info!(worker_id = %worker_id, "Received SIGINT, finishing current job before exit");
            }
            _ = task_token.cancelled() => return,
        }
        request_stop(backend.as_ref(), &worker_id, &task_token).await;
    });

    Ok(token)
}
