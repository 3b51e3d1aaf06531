use std::sync::Arc;
use std::time::Instant;

use labeller_queue::WorkQueue;
use metrics::{counter, histogram};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::reconcile::Reconciler;

/// Handle one key. Returns `false` once the queue is shut down and drained.
pub(crate) async fn process_next_work_item(
    queue: &WorkQueue<String>,
    reconciler: &Reconciler,
    cancel: &CancellationToken,
) -> bool {
    let Some(key) = queue.get().await else {
        info!("shutting down processor");
        return false;
    };

    let started = Instant::now();
    match reconciler.reconcile(&key, cancel).await {
        Ok(outcome) => {
            counter!("labeller_reconcile_total", 1u64, "result" => outcome.as_str());
            queue.forget(&key);
        }
        Err(e) => {
            counter!("labeller_reconcile_total", 1u64, "result" => "error");
            warn!(error = %e, key = %key, retries = queue.num_requeues(&key), "failed to reconcile");
            queue.add_rate_limited(key.clone());
        }
    }
    histogram!("labeller_reconcile_latency_ms", started.elapsed().as_secs_f64() * 1000.0);
    queue.done(&key);
    true
}

#[instrument(skip_all, fields(worker = id))]
pub(crate) async fn run_worker(
    id: usize,
    queue: WorkQueue<String>,
    reconciler: Arc<Reconciler>,
    cancel: CancellationToken,
) {
    while process_next_work_item(&queue, &reconciler, &cancel).await {}
}
