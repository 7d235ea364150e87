//! services/api/src/queue.rs
//!
//! The in-process task queue feeding the orchestrator. Commands are
//! submitted by the web layer and consumed by a worker loop that spawns one
//! long-lived tokio task per generation, bounded by a semaphore: parallel
//! across courses, sequential within one (the orchestrator claim takes care
//! of the latter).

use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::pipeline::{GenerationCommand, Orchestrator};

/// Producer handle for the generation queue.
#[derive(Clone)]
pub struct GenerationQueue {
    tx: mpsc::Sender<GenerationCommand>,
}

impl GenerationQueue {
    /// Enqueues a command; fails only when the worker has shut down or the
    /// queue is saturated.
    pub async fn enqueue(&self, command: GenerationCommand) -> Result<(), QueueClosed> {
        self.tx.send(command).await.map_err(|_| QueueClosed)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("the generation queue is closed")]
pub struct QueueClosed;

/// Spawns the consumer loop and returns the producer handle. `concurrency`
/// bounds the fan-out across independent courses; `shutdown` stops the loop
/// and cancels in-flight generations between stages.
pub fn spawn_worker(
    orchestrator: Arc<Orchestrator>,
    capacity: usize,
    concurrency: usize,
    shutdown: CancellationToken,
) -> GenerationQueue {
    let (tx, mut rx) = mpsc::channel::<GenerationCommand>(capacity);
    tokio::spawn(async move {
        let semaphore = Arc::new(Semaphore::new(concurrency));
        loop {
            let command = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = rx.recv() => match received {
                    Some(command) => command,
                    None => break,
                },
            };

            let permit = match Arc::clone(&semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break, // semaphore closed, shutting down
            };
            let orchestrator = Arc::clone(&orchestrator);
            let cancel = shutdown.child_token();
            tokio::spawn(async move {
                let _permit = permit;
                let outcome = orchestrator.handle(command, cancel).await;
                info!(?outcome, "generation task finished");
            });
        }
        warn!("generation queue worker stopped");
    });
    GenerationQueue { tx }
}

/// Convenience used by handlers that must not block the request on a full
/// queue: logs instead of propagating.
pub async fn enqueue_or_log(queue: &GenerationQueue, command: GenerationCommand) {
    if let Err(e) = queue.enqueue(command).await {
        error!(error = %e, "dropping generation command");
    }
}
