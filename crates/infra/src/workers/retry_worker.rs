use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::idempotency::IdempotentEventHandlerService;

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: Option<oneshot::Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the worker to stop. A retry pass
    /// already in progress is allowed to finish.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(JoinHandle::is_finished)
    }
}

/// Periodically re-dispatches FAILED events through
/// [`IdempotentEventHandlerService::retry_failed_events`].
#[derive(Debug)]
pub struct RetryWorker;

impl RetryWorker {
    /// Spawn on the current tokio runtime. The first pass runs after one `interval`.
    pub fn spawn(
        service: Arc<IdempotentEventHandlerService>,
        interval: Duration,
        batch_size: usize,
    ) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let join = tokio::spawn(worker_loop(service, interval, batch_size, shutdown_rx));

        WorkerHandle {
            shutdown: Some(shutdown_tx),
            join: Some(join),
        }
    }
}

async fn worker_loop(
    service: Arc<IdempotentEventHandlerService>,
    interval: Duration,
    batch_size: usize,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    info!(interval_ms = interval.as_millis() as u64, batch_size, "retry worker started");
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            _ = ticker.tick() => {
                match service.retry_failed_events(batch_size).await {
                    Ok(report) => debug!(?report, "retry pass complete"),
                    Err(err) => warn!(error = %err, "retry pass failed"),
                }
            }
        }
    }

    info!("retry worker stopped");
}
