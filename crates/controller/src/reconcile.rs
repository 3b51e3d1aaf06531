use std::sync::Arc;
use std::time::Duration;

use labeller_core::{compute_label_patch, DesiredLabels, LabelPatcher, PatchError, ResourceCache, ResourceKey};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("patch failed for {key}: {source}")]
    Patch {
        key: ResourceKey,
        #[source]
        source: PatchError,
    },
    #[error("patch for {key} timed out after {timeout:?}")]
    Timeout { key: ResourceKey, timeout: Duration },
    #[error("patch for {key} cancelled by shutdown")]
    Cancelled { key: ResourceKey },
}

/// How a reconcile that needs no retry ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Patched,
    InSync,
    NotFound,
    Deleting,
    /// Key could not be parsed; retrying would never help.
    Malformed,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Patched => "patched",
            Outcome::InSync => "in_sync",
            Outcome::NotFound => "not_found",
            Outcome::Deleting => "deleting",
            Outcome::Malformed => "malformed",
        }
    }
}

/// Drives one key toward the desired labels. Every `Ok` is final, every `Err` is retryable.
pub struct Reconciler {
    cache: Arc<dyn ResourceCache>,
    patcher: Arc<dyn LabelPatcher>,
    desired: Arc<DesiredLabels>,
    request_timeout: Duration,
}

impl Reconciler {
    pub fn new(
        cache: Arc<dyn ResourceCache>,
        patcher: Arc<dyn LabelPatcher>,
        desired: Arc<DesiredLabels>,
        request_timeout: Duration,
    ) -> Self {
        Self { cache, patcher, desired, request_timeout }
    }

    pub async fn reconcile(&self, raw_key: &str, cancel: &CancellationToken) -> Result<Outcome, ReconcileError> {
        let key: ResourceKey = match raw_key.parse() {
            Ok(k) => k,
            Err(e) => {
                error!(error = %e, key = %raw_key, "could not parse key");
                return Ok(Outcome::Malformed);
            }
        };

        let Some(pod) = self.cache.get(&key) else {
            info!(pod = %key, "pod not found, must have been deleted");
            return Ok(Outcome::NotFound);
        };

        if pod.deleting {
            info!(pod = %key, "pod is being deleted, skipping");
            return Ok(Outcome::Deleting);
        }

        let Some(patch) = compute_label_patch(pod.labels.as_ref(), &self.desired) else {
            debug!(pod = %key, rv = ?pod.resource_version, "labels in desired state");
            return Ok(Outcome::InSync);
        };

        info!(pod = %key, labels = ?patch.as_map(), "labels not in desired state - reconciling");

        let call = self.patcher.patch_labels(key.namespace(), key.name(), &patch);
        let res = tokio::select! {
            _ = cancel.cancelled() => None,
            res = tokio::time::timeout(self.request_timeout, call) => Some(res),
        };
        match res {
            Some(Ok(Ok(()))) => {
                info!(pod = %key, "labels patched");
                Ok(Outcome::Patched)
            }
            Some(Ok(Err(source))) => Err(ReconcileError::Patch { key, source }),
            Some(Err(_)) => Err(ReconcileError::Timeout { key, timeout: self.request_timeout }),
            None => Err(ReconcileError::Cancelled { key }),
        }
    }
}
