//! Labeller work queue: deduplicated keys, one in-flight reconcile per key, per-key backoff.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use metrics::{counter, gauge};
use rustc_hash::FxHashSet;
use tokio::sync::{watch, Notify};
use tracing::{debug, trace};

mod rate_limiter;

pub use rate_limiter::{
    controller_rate_limiter, BucketRateLimiter, ItemExponentialBackoff, MaxOf, RateLimiter, DEFAULT_BASE_DELAY,
    DEFAULT_BURST, DEFAULT_MAX_DELAY, DEFAULT_QPS,
};

struct State<K> {
    /// FIFO of keys ready to hand out. Every entry is also in `dirty`.
    queue: VecDeque<K>,
    /// Keys waiting to be processed, including ones parked behind an in-flight reconcile.
    dirty: FxHashSet<K>,
    processing: FxHashSet<K>,
    shutting_down: bool,
}

struct Inner<K> {
    name: String,
    state: Mutex<State<K>>,
    ready: Notify,
    shutdown_tx: watch::Sender<bool>,
    limiter: Box<dyn RateLimiter<K>>,
}

impl<K> Inner<K> {
    fn lock(&self) -> MutexGuard<'_, State<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish the ready-queue length; called after every change to `state.queue`.
    fn report_depth(&self, state: &State<K>) {
        gauge!("labeller_queue_depth", state.queue.len() as f64, "queue" => self.name.clone());
    }
}

/// Shared handle to a rate-limited work queue. Clones refer to the same queue.
///
/// A key is either absent, queued, in flight, or in flight with a parked
/// follow-up. `add` on a queued key is a no-op; `add` on an in-flight key parks
/// it until `done`, so no two callers of `get` ever hold the same key.
pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self { Self { inner: Arc::clone(&self.inner) } }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + std::fmt::Debug + 'static,
{
    pub fn new(name: impl Into<String>, limiter: impl RateLimiter<K> + 'static) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: FxHashSet::default(),
                    processing: FxHashSet::default(),
                    shutting_down: false,
                }),
                ready: Notify::new(),
                shutdown_tx,
                limiter: Box::new(limiter),
            }),
        }
    }

    /// Queue with exponential per-key backoff between `base` and `max`, capped
    /// overall by a [`DEFAULT_QPS`]/[`DEFAULT_BURST`] token bucket.
    pub fn with_backoff(name: impl Into<String>, base: Duration, max: Duration) -> Self {
        Self::new(name, controller_rate_limiter(base, max))
    }

    pub fn add(&self, key: K) {
        let mut state = self.inner.lock();
        if state.shutting_down {
            trace!(queue = %self.inner.name, ?key, "queue shutting down; dropping add");
            return;
        }
        if !state.dirty.insert(key.clone()) {
            return;
        }
        counter!("labeller_queue_adds_total", 1u64, "queue" => self.inner.name.clone());
        if state.processing.contains(&key) {
            debug!(queue = %self.inner.name, ?key, "key in flight; parked until done");
            return;
        }
        state.queue.push_back(key);
        self.inner.report_depth(&state);
        drop(state);
        self.inner.ready.notify_one();
    }

    /// Wait for the next key and mark it in flight. `None` once shut down and drained.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.inner.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    self.inner.report_depth(&state);
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Release the in-flight marker; a key added meanwhile becomes ready again.
    pub fn done(&self, key: &K) {
        let mut state = self.inner.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.clone());
            self.inner.report_depth(&state);
            drop(state);
            self.inner.ready.notify_one();
        }
    }

    /// Re-add `key` after its next backoff delay.
    pub fn add_rate_limited(&self, key: K) {
        let delay = self.inner.limiter.when(&key);
        counter!("labeller_queue_retries_total", 1u64, "queue" => self.inner.name.clone());
        debug!(queue = %self.inner.name, ?key, delay_ms = delay.as_millis() as u64, "requeue with backoff");
        self.add_after(key, delay);
    }

    /// Re-add `key` once `delay` has elapsed, unless the queue shuts down first.
    pub fn add_after(&self, key: K, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = self.clone();
        let shutdown_rx = self.inner.shutdown_tx.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => queue.add(key),
                _ = closed(shutdown_rx) => {}
            }
        });
    }

    /// Clear the backoff history of `key`.
    pub fn forget(&self, key: &K) { self.inner.limiter.forget(key); }

    pub fn num_requeues(&self, key: &K) -> u32 { self.inner.limiter.num_requeues(key) }

    /// Number of keys ready to be handed out.
    pub fn len(&self) -> usize { self.inner.lock().queue.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Stop accepting keys. `get` keeps returning what is already queued, then `None`.
    pub fn shut_down(&self) {
        self.inner.lock().shutting_down = true;
        self.inner.shutdown_tx.send_replace(true);
        self.inner.ready.notify_waiters();
        debug!(queue = %self.inner.name, "work queue shut down");
    }

    pub fn is_shutting_down(&self) -> bool { self.inner.lock().shutting_down }
}

async fn closed(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}
