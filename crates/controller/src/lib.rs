//! Labeller controller: routes cache events into the work queue and runs the reconcile workers.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use labeller_core::ResourceCache;
use labeller_queue::WorkQueue;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

mod reconcile;
mod router;
mod worker;

pub use reconcile::{Outcome, ReconcileError, Reconciler};
pub use router::EventRouter;

/// Name used for the work queue and in metrics labels.
pub const QUEUE_NAME: &str = "pod-labeller";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Created,
    CacheSyncing,
    Running,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ControllerState::Created => "created",
            ControllerState::CacheSyncing => "cache-syncing",
            ControllerState::Running => "running",
            ControllerState::ShuttingDown => "shutting-down",
            ControllerState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("resource cache did not sync: cancelled before it became ready")]
    CacheSyncCancelled,
    #[error("resource cache did not sync within {0:?}")]
    CacheSyncTimeout(Duration),
}

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub workers: usize,
    pub cache_sync_timeout: Duration,
}

impl Default for ControllerOptions {
    fn default() -> Self { Self { workers: 1, cache_sync_timeout: Duration::from_secs(60) } }
}

pub struct Controller {
    cache: Arc<dyn ResourceCache>,
    queue: WorkQueue<String>,
    reconciler: Arc<Reconciler>,
    opts: ControllerOptions,
    state_tx: watch::Sender<ControllerState>,
}

impl Controller {
    pub fn new(
        cache: Arc<dyn ResourceCache>,
        queue: WorkQueue<String>,
        reconciler: Reconciler,
        opts: ControllerOptions,
    ) -> Self {
        let (state_tx, _) = watch::channel(ControllerState::Created);
        Self { cache, queue, reconciler: Arc::new(reconciler), opts, state_tx }
    }

    pub fn state(&self) -> ControllerState { *self.state_tx.borrow() }

    pub fn subscribe_state(&self) -> watch::Receiver<ControllerState> { self.state_tx.subscribe() }

    fn transition(&self, next: ControllerState) {
        let prev = self.state_tx.send_replace(next);
        debug!(from = %prev, to = %next, "controller state");
    }

    /// Wait for the cache, run the workers until `cancel` fires, then drain and stop.
    ///
    /// A cache that is not ready before the sync timeout or cancellation is a
    /// startup failure; workers are never started in that case.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), ControllerError> {
        self.transition(ControllerState::CacheSyncing);
        let synced = tokio::time::timeout(self.opts.cache_sync_timeout, self.cache.wait_until_synced(&cancel)).await;
        let failure = match synced {
            Ok(true) => None,
            Ok(false) => Some(ControllerError::CacheSyncCancelled),
            Err(_) => Some(ControllerError::CacheSyncTimeout(self.opts.cache_sync_timeout)),
        };
        if let Some(e) = failure {
            self.queue.shut_down();
            self.transition(ControllerState::Stopped);
            return Err(e);
        }

        self.transition(ControllerState::Running);
        let workers = self.opts.workers.max(1);
        info!(workers, "controller started, watching pods");
        let handles: Vec<_> = (0..workers)
            .map(|id| {
                tokio::spawn(worker::run_worker(id, self.queue.clone(), Arc::clone(&self.reconciler), cancel.clone()))
            })
            .collect();

        cancel.cancelled().await;
        self.transition(ControllerState::ShuttingDown);
        info!("controller shutting down");
        self.queue.shut_down();
        for h in handles {
            if let Err(e) = h.await {
                error!(error = %e, "worker task failed");
            }
        }
        self.transition(ControllerState::Stopped);
        info!("controller stopped");
        Ok(())
    }
}
