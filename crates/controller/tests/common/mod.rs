#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use labeller_core::{Delta, LabelPatch, LabelPatcher, Labels, PatchError, ResourceSnapshot};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

pub fn labels(pairs: &[(&str, &str)]) -> Labels {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

pub fn pod(ns: &str, name: &str, labels: Option<Labels>, deleting: bool) -> ResourceSnapshot {
    ResourceSnapshot {
        namespace: Some(ns.to_string()),
        name: name.to_string(),
        labels,
        deleting,
        resource_version: Some("1".to_string()),
    }
}

/// Stands in for the API server: fails the first `failures` patches, applies the
/// rest to its own copy of each pod and echoes the result back as a watch event.
pub struct FakeApiServer {
    pods: Mutex<HashMap<String, ResourceSnapshot>>,
    failures: AtomicUsize,
    calls: Mutex<Vec<(String, Labels, Instant)>>,
    watch_tx: mpsc::Sender<Delta>,
    patched_tx: watch::Sender<usize>,
}

impl FakeApiServer {
    pub fn new(pods: &[ResourceSnapshot], failures: usize, watch_tx: mpsc::Sender<Delta>) -> Arc<Self> {
        let (patched_tx, _) = watch::channel(0);
        Arc::new(Self {
            pods: Mutex::new(pods.iter().map(|p| (p.key().unwrap().to_string(), p.clone())).collect()),
            failures: AtomicUsize::new(failures),
            calls: Mutex::new(Vec::new()),
            watch_tx,
            patched_tx,
        })
    }

    pub fn calls(&self) -> Vec<(String, Labels, Instant)> { self.calls.lock().unwrap().clone() }

    pub fn patched(&self) -> watch::Receiver<usize> { self.patched_tx.subscribe() }

    pub fn labels_of(&self, key: &str) -> Option<Labels> {
        self.pods.lock().unwrap().get(key).and_then(|p| p.labels.clone())
    }
}

#[async_trait::async_trait]
impl LabelPatcher for FakeApiServer {
    async fn patch_labels(&self, namespace: &str, name: &str, patch: &LabelPatch) -> Result<(), PatchError> {
        let key = format!("{namespace}/{name}");
        self.calls.lock().unwrap().push((key.clone(), patch.as_map().clone(), Instant::now()));

        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(PatchError::Remote("503 service unavailable".into()));
        }

        let updated = {
            let mut pods = self.pods.lock().unwrap();
            let Some(p) = pods.get_mut(&key) else {
                return Err(PatchError::Remote(format!("pods {name:?} not found").into()));
            };
            let merged = p.labels.get_or_insert_with(Labels::new);
            merged.extend(patch.as_map().iter().map(|(k, v)| (k.clone(), v.clone())));
            let rv: u64 = p.resource_version.as_deref().unwrap_or("0").parse().unwrap_or(0);
            p.resource_version = Some((rv + 1).to_string());
            p.clone()
        };
        self.patched_tx.send_modify(|n| *n += 1);
        let _ = self.watch_tx.send(Delta::Applied(updated)).await;
        Ok(())
    }
}
