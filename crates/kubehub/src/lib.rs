//! Labeller kubehub – client setup, connectivity probe, Pod watcher and label patcher

#![forbid(unsafe_code)]

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Api, ListParams, Patch, PatchParams},
    config::{KubeConfigOptions, Kubeconfig},
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client, Config,
};
use labeller_core::{BoxError, Delta, LabelPatch, LabelPatcher, PatchError, ResourceSnapshot};
use metrics::counter;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Field manager recorded on every label patch.
pub const FIELD_MANAGER: &str = "pod-labeller";

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("loading kubeconfig {path:?}: {source}")]
    Kubeconfig {
        path: Option<PathBuf>,
        #[source]
        source: BoxError,
    },
    #[error("creating kubernetes client: {0}")]
    Client(#[source] kube::Error),
    #[error("connectivity check in namespace {namespace:?} failed: {source}")]
    Probe {
        namespace: String,
        #[source]
        source: kube::Error,
    },
    #[error("connectivity check in namespace {namespace:?} timed out after {timeout:?}")]
    ProbeTimeout { namespace: String, timeout: Duration },
}

/// Build a client from in-cluster credentials, falling back to a kubeconfig.
///
/// With no `kubeconfig` path the usual `KUBECONFIG` / `~/.kube/config` lookup applies.
pub async fn connect(kubeconfig: Option<&Path>) -> Result<Client, ConnectError> {
    let path = kubeconfig.map(Path::to_path_buf);
    let config = resolve_config(Config::incluster, || load_kubeconfig(path)).await.map_err(|source| {
        ConnectError::Kubeconfig { path: kubeconfig.map(Path::to_path_buf), source }
    })?;
    let client = Client::try_from(config).map_err(ConnectError::Client)?;
    info!("kubernetes client created");
    Ok(client)
}

async fn load_kubeconfig(path: Option<PathBuf>) -> Result<Config, BoxError> {
    let options = KubeConfigOptions::default();
    let config = match path {
        Some(p) => {
            let kc = Kubeconfig::read_from(&p)?;
            Config::from_custom_kubeconfig(kc, &options).await?
        }
        None => Config::from_kubeconfig(&options).await?,
    };
    Ok(config)
}

/// Try `in_cluster` first and only consult `kubeconfig` when it fails.
pub async fn resolve_config<I, E, K, Fut>(in_cluster: I, kubeconfig: K) -> Result<Config, BoxError>
where
    I: FnOnce() -> Result<Config, E>,
    E: std::fmt::Display,
    K: FnOnce() -> Fut,
    Fut: Future<Output = Result<Config, BoxError>>,
{
    info!("attempting in-cluster config");
    match in_cluster() {
        Ok(config) => Ok(config),
        Err(e) => {
            info!(error = %e, "in-cluster config failed, falling back to kubeconfig");
            kubeconfig().await
        }
    }
}

/// List at most one Pod in `namespace` to prove the API is reachable and we may read it.
pub async fn check_connectivity(client: &Client, namespace: &str, timeout: Duration) -> Result<(), ConnectError> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    match tokio::time::timeout(timeout, pods.list(&ListParams::default().limit(1))).await {
        Ok(Ok(_)) => {
            info!(ns = %namespace, "connection successful");
            Ok(())
        }
        Ok(Err(source)) => Err(ConnectError::Probe { namespace: namespace.to_string(), source }),
        Err(_) => Err(ConnectError::ProbeTimeout { namespace: namespace.to_string(), timeout }),
    }
}

pub fn snapshot_from(pod: &Pod) -> ResourceSnapshot {
    let meta = &pod.metadata;
    ResourceSnapshot {
        namespace: meta.namespace.clone(),
        name: meta.name.clone().unwrap_or_default(),
        labels: meta.labels.clone(),
        deleting: meta.deletion_timestamp.is_some(),
        resource_version: meta.resource_version.clone(),
    }
}

fn delta_from(ev: Event<Pod>) -> Delta {
    match ev {
        Event::Applied(p) => Delta::Applied(snapshot_from(&p)),
        Event::Deleted(p) => Delta::Deleted(snapshot_from(&p)),
        Event::Restarted(list) => Delta::Relisted(list.iter().map(snapshot_from).collect()),
    }
}

/// List+watch Pods in `namespace` and forward deltas until `cancel` fires.
///
/// Watch errors are logged and retried with the watcher's default backoff.
pub async fn start_watcher(
    client: Client,
    namespace: &str,
    delta_tx: mpsc::Sender<Delta>,
    cancel: CancellationToken,
) -> Result<()> {
    let api: Api<Pod> = Api::namespaced(client, namespace);
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);
    info!(ns = %namespace, "watcher started");
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                info!("watcher cancelled");
                return Ok(());
            }
            next = stream.next() => next,
        };
        match next {
            Some(Ok(ev)) => {
                if let Event::Restarted(list) = &ev {
                    debug!(count = list.len(), "watch restart");
                }
                if delta_tx.send(delta_from(ev)).await.is_err() {
                    warn!("cache ingest closed; stopping watcher");
                    return Ok(());
                }
            }
            Some(Err(e)) => {
                counter!("labeller_watch_errors_total", 1u64);
                warn!(error = %e, "watch error; backing off");
            }
            None => {
                warn!("watcher stream ended");
                return Ok(());
            }
        }
    }
}

/// Applies label patches to Pods as JSON merge patches.
#[derive(Clone)]
pub struct KubePatcher {
    client: Client,
}

impl KubePatcher {
    pub fn new(client: Client) -> Self { Self { client } }
}

#[async_trait::async_trait]
impl LabelPatcher for KubePatcher {
    async fn patch_labels(&self, namespace: &str, name: &str, patch: &LabelPatch) -> Result<(), PatchError> {
        let body = patch.merge_body()?;
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pp = PatchParams { field_manager: Some(FIELD_MANAGER.to_string()), ..Default::default() };
        pods.patch(name, &pp, &Patch::Merge(&body)).await.map_err(|e| PatchError::Remote(Box::new(e)))?;
        counter!("labeller_patch_total", 1u64);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

    use super::*;

    fn test_config() -> Config {
        Config::new("https://10.0.0.1:6443".parse().unwrap())
    }

    #[tokio::test]
    async fn in_cluster_config_wins() {
        let got = resolve_config(|| Ok::<_, String>(test_config()), || async {
            Err::<Config, BoxError>("kubeconfig must not be read".into())
        })
        .await;
        assert!(got.is_ok());
    }

    #[tokio::test]
    async fn falls_back_to_kubeconfig() {
        let got = resolve_config(|| Err::<Config, _>("not in a cluster"), || async { Ok(test_config()) }).await;
        assert_eq!(got.unwrap().cluster_url.host(), Some("10.0.0.1"));
    }

    #[tokio::test]
    async fn both_sources_failing_is_an_error() {
        let got = resolve_config(|| Err::<Config, _>("not in a cluster"), || async {
            Err::<Config, BoxError>("kubeconfig not found".into())
        })
        .await;
        assert_eq!(got.unwrap_err().to_string(), "kubeconfig not found");
    }

    #[test]
    fn pod_maps_to_snapshot() {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("web-0".into()),
                namespace: Some("prod".into()),
                labels: Some(BTreeMap::from([("app".to_string(), "web".to_string())])),
                resource_version: Some("42".into()),
                deletion_timestamp: Some(Time(k8s_openapi::chrono::Utc::now())),
                ..Default::default()
            },
            ..Default::default()
        };
        let s = snapshot_from(&pod);
        assert_eq!(s.key().unwrap().to_string(), "prod/web-0");
        assert!(s.deleting);
        assert_eq!(s.labels.unwrap().get("app").map(String::as_str), Some("web"));
        assert_eq!(s.resource_version.as_deref(), Some("42"));
    }

    #[test]
    fn restart_becomes_relist() {
        let pod = |n: &str| Pod {
            metadata: ObjectMeta { name: Some(n.into()), namespace: Some("prod".into()), ..Default::default() },
            ..Default::default()
        };
        match delta_from(Event::Restarted(vec![pod("a"), pod("b")])) {
            Delta::Relisted(list) => assert_eq!(list.len(), 2),
            other => panic!("unexpected delta {other:?}"),
        }
        assert!(matches!(delta_from(Event::Deleted(pod("a"))), Delta::Deleted(_)));
    }
}
