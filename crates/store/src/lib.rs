//! Labeller store: cache builder, published snapshots and the ingest loop that feeds handlers.

#![forbid(unsafe_code)]

use std::sync::Arc;

use arc_swap::ArcSwap;
use labeller_core::{Delta, EventHandler, ResourceCache, ResourceKey, ResourceSnapshot};
use metrics::{counter, gauge};
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Immutable view of every cached object at one point in time.
#[derive(Debug, Clone, Default)]
pub struct CacheSnapshot {
    pub epoch: u64,
    pub items: FxHashMap<ResourceKey, Arc<ResourceSnapshot>>,
}

/// What handlers must hear about after a batch has been published.
#[derive(Debug, Clone)]
pub enum Notification {
    Added(Arc<ResourceSnapshot>),
    Updated { old: Arc<ResourceSnapshot>, new: Arc<ResourceSnapshot> },
}

impl Notification {
    pub fn dispatch(&self, handler: &dyn EventHandler) {
        match self {
            Notification::Added(obj) => handler.on_add(obj),
            Notification::Updated { old, new } => handler.on_update(old, new),
        }
    }
}

/// Single writer of cache contents.
pub struct CacheBuilder {
    epoch: u64,
    items: FxHashMap<ResourceKey, Arc<ResourceSnapshot>>,
    synced: bool,
}

impl Default for CacheBuilder {
    fn default() -> Self { Self::new() }
}

impl CacheBuilder {
    pub fn new() -> Self { Self { epoch: 0, items: FxHashMap::default(), synced: false } }

    /// True once a full relist has been applied.
    pub fn is_synced(&self) -> bool { self.synced }

    pub fn len(&self) -> usize { self.items.len() }

    pub fn is_empty(&self) -> bool { self.items.is_empty() }

    /// Apply a batch of deltas in order and return the notifications they produce.
    pub fn apply(&mut self, batch: Vec<Delta>) -> Vec<Notification> {
        let mut out = Vec::new();
        for d in batch {
            match d {
                Delta::Applied(obj) => {
                    let Some(key) = keyed(&obj) else { continue };
                    let new = Arc::new(obj);
                    match self.items.insert(key, Arc::clone(&new)) {
                        Some(old) => out.push(Notification::Updated { old, new }),
                        None => out.push(Notification::Added(new)),
                    }
                }
                Delta::Deleted(obj) => {
                    if let Some(key) = keyed(&obj) {
                        self.items.remove(&key);
                    }
                }
                Delta::Relisted(list) => {
                    let mut next = FxHashMap::default();
                    for obj in list {
                        let Some(key) = keyed(&obj) else { continue };
                        let new = Arc::new(obj);
                        match self.items.get(&key) {
                            Some(old) => out.push(Notification::Updated { old: Arc::clone(old), new: Arc::clone(&new) }),
                            None => out.push(Notification::Added(Arc::clone(&new))),
                        }
                        next.insert(key, new);
                    }
                    debug!(count = next.len(), dropped = self.items.len().saturating_sub(next.len()), "relist applied");
                    self.items = next;
                    self.synced = true;
                }
            }
        }
        self.epoch = self.epoch.saturating_add(1);
        out
    }

    pub fn freeze(&self) -> Arc<CacheSnapshot> {
        Arc::new(CacheSnapshot { epoch: self.epoch, items: self.items.clone() })
    }
}

fn keyed(obj: &ResourceSnapshot) -> Option<ResourceKey> {
    match obj.key() {
        Ok(k) => Some(k),
        Err(e) => {
            warn!(error = %e, namespace = ?obj.namespace, "skipping object without a usable key");
            None
        }
    }
}

/// Read handle over the published snapshot. Cheap to clone.
#[derive(Clone)]
pub struct CacheHandle {
    snap: Arc<ArcSwap<CacheSnapshot>>,
    synced_rx: watch::Receiver<bool>,
}

impl CacheHandle {
    pub fn current(&self) -> Arc<CacheSnapshot> { self.snap.load_full() }
}

#[async_trait::async_trait]
impl ResourceCache for CacheHandle {
    fn get(&self, key: &ResourceKey) -> Option<Arc<ResourceSnapshot>> {
        self.snap.load().items.get(key).cloned()
    }

    fn has_synced(&self) -> bool { *self.synced_rx.borrow() }

    async fn wait_until_synced(&self, cancel: &CancellationToken) -> bool {
        let mut rx = self.synced_rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return true;
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
                _ = cancel.cancelled() => return false,
            }
        }
    }
}

/// Spawn the ingest loop.
///
/// Each received delta is applied together with whatever else is already
/// queued (up to `cap`), the result is published, and only then are handlers
/// told about adds and updates so they never observe a stale cache.
/// The loop ends when every sender is dropped.
pub fn spawn_ingest(cap: usize, handler: Arc<dyn EventHandler>) -> (mpsc::Sender<Delta>, CacheHandle, JoinHandle<()>) {
    let cap = cap.max(1);
    let (tx, mut rx) = mpsc::channel::<Delta>(cap);
    let snap = Arc::new(ArcSwap::from_pointee(CacheSnapshot::default()));
    let (synced_tx, synced_rx) = watch::channel(false);
    let snap_clone = Arc::clone(&snap);

    let task = tokio::spawn(async move {
        let mut builder = CacheBuilder::new();
        while let Some(first) = rx.recv().await {
            let mut batch = vec![first];
            while batch.len() < cap {
                match rx.try_recv() {
                    Ok(d) => batch.push(d),
                    Err(_) => break,
                }
            }
            counter!("labeller_cache_deltas_total", batch.len() as u64);
            let notes = builder.apply(batch);
            snap_clone.store(builder.freeze());
            gauge!("labeller_cache_objects", builder.len() as f64);
            if builder.is_synced() && !*synced_tx.borrow() {
                info!(objects = builder.len(), "cache synced");
                synced_tx.send_replace(true);
            }
            for n in &notes {
                n.dispatch(handler.as_ref());
            }
        }
        debug!("delta channel closed; ingest loop stopped");
    });

    (tx, CacheHandle { snap, synced_rx }, task)
}
