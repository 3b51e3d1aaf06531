//! Pod labeller core types, label diff and the seams to the outside world.

#![forbid(unsafe_code)]

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

mod key;
mod labels;

pub use key::{KeyError, ResourceKey};
pub use labels::{compute_label_patch, DesiredLabels, LabelPatch, LabelSetError, Labels};

/// Cached view of one watched resource.
///
/// `resource_version` is carried for staleness diagnostics only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub namespace: Option<String>,
    pub name: String,
    /// Labels as observed; `None` when the object carries no label map at all.
    pub labels: Option<Labels>,
    /// Set once a graceful delete has been requested upstream.
    pub deleting: bool,
    pub resource_version: Option<String>,
}

impl ResourceSnapshot {
    pub fn key(&self) -> Result<ResourceKey, KeyError> {
        ResourceKey::for_object(self)
    }
}

/// A change observed on the watch stream, in the order it was received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Delta {
    Applied(ResourceSnapshot),
    Deleted(ResourceSnapshot),
    /// Full relist; replaces everything known so far.
    Relisted(Vec<ResourceSnapshot>),
}

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error("encoding label patch: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("remote patch failed: {0}")]
    Remote(#[source] BoxError),
}

/// Read side of the resource cache, as consumed by the reconciler and the lifecycle.
#[async_trait::async_trait]
pub trait ResourceCache: Send + Sync {
    fn get(&self, key: &ResourceKey) -> Option<Arc<ResourceSnapshot>>;

    fn has_synced(&self) -> bool;

    /// Resolve `true` once the initial list has been published, `false` if
    /// `cancel` fires first.
    async fn wait_until_synced(&self, cancel: &CancellationToken) -> bool;
}

/// Add/update notifications delivered by the cache. Deletes are never delivered.
pub trait EventHandler: Send + Sync {
    fn on_add(&self, obj: &ResourceSnapshot);
    fn on_update(&self, old: &ResourceSnapshot, new: &ResourceSnapshot);
}

/// Remote mutation provider. Only the labels named in `patch` are touched.
#[async_trait::async_trait]
pub trait LabelPatcher: Send + Sync {
    async fn patch_labels(&self, namespace: &str, name: &str, patch: &LabelPatch) -> Result<(), PatchError>;
}
