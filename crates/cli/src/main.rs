#![forbid(unsafe_code)]

mod config;

use std::net::SocketAddr;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use labeller_controller::{Controller, ControllerOptions, EventRouter, Reconciler, QUEUE_NAME};
use labeller_kubehub::KubePatcher;
use labeller_queue::WorkQueue;
use labeller_store::spawn_ingest;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{Cli, Config, LogLevel};

/// Bound on deltas waiting for the ingest loop.
const INGEST_CAPACITY: usize = 1024;

/// Build the log filter: a `LABELLER_LOG` directive wins over `--log-level` when it parses.
/// Returns the rejected directive and its parse error so they can be reported once logging is up.
fn log_filter(level: LogLevel, directive: Option<String>) -> (EnvFilter, Option<(String, String)>) {
    match directive {
        Some(d) => match EnvFilter::from_str(&d) {
            Ok(filter) => (filter, None),
            Err(e) => (EnvFilter::new(level.as_str()), Some((d, e.to_string()))),
        },
        None => (EnvFilter::new(level.as_str()), None),
    }
}

fn init_tracing(level: LogLevel) {
    let (filter, rejected) = log_filter(level, std::env::var("LABELLER_LOG").ok());
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
    if let Some((directive, e)) = rejected {
        warn!(directive = %directive, error = %e, level = level.as_str(), "invalid LABELLER_LOG; using log-level");
    }
}

fn init_metrics(addr: Option<SocketAddr>) {
    let Some(sock) = addr else { return };
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    match builder.with_http_listener(sock).install() {
        Ok(()) => info!(addr = %sock, "Prometheus metrics exporter listening"),
        Err(e) => warn!(error = %e, "failed to install metrics exporter"),
    }
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("interrupt received"),
        _ = terminate => info!("SIGTERM received"),
    }
}

async fn run(cfg: Config) -> Result<()> {
    let client = labeller_kubehub::connect(cfg.kubeconfig.as_deref()).await.context("building kubernetes client")?;
    labeller_kubehub::check_connectivity(&client, &cfg.namespace, cfg.request_timeout)
        .await
        .context("checking API server connectivity")?;
    info!(ns = %cfg.namespace, "connected to API server");

    let queue: WorkQueue<String> = WorkQueue::with_backoff(QUEUE_NAME, cfg.backoff_base, cfg.backoff_max);
    let router = Arc::new(EventRouter::new(cfg.namespace.clone(), queue.clone()));
    let (delta_tx, cache, ingest) = spawn_ingest(INGEST_CAPACITY, router);

    let cancel = CancellationToken::new();
    let watcher = tokio::spawn({
        let client = client.clone();
        let ns = cfg.namespace.clone();
        let cancel = cancel.clone();
        async move {
            if let Err(e) = labeller_kubehub::start_watcher(client, &ns, delta_tx, cancel).await {
                error!(error = ?e, "pod watcher failed");
            }
        }
    });

    let reconciler = Reconciler::new(
        Arc::new(cache.clone()),
        Arc::new(KubePatcher::new(client)),
        Arc::new(cfg.labels),
        cfg.request_timeout,
    );
    let controller = Controller::new(
        Arc::new(cache),
        queue,
        reconciler,
        ControllerOptions { workers: cfg.workers, cache_sync_timeout: cfg.cache_sync_timeout },
    );

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            cancel.cancel();
        }
    });

    let outcome = controller.run(cancel.clone()).await;

    // Stop the watcher; dropping its sender ends the ingest loop.
    cancel.cancel();
    if let Err(e) = watcher.await {
        warn!(error = %e, "watcher task panicked");
    }
    if let Err(e) = ingest.await {
        warn!(error = %e, "ingest task panicked");
    }

    outcome.context("running controller")
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let cfg = match Config::try_from(cli) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("pod-labeller: invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    init_tracing(cfg.log_level);
    init_metrics(cfg.metrics_addr);
    info!(
        ns = %cfg.namespace,
        labels = ?cfg.labels.as_map(),
        workers = cfg.workers,
        log_level = cfg.log_level.as_str(),
        "starting pod-labeller"
    );

    match run(cfg).await {
        Ok(()) => {
            info!("shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %format!("{e:#}"), "fatal error");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_directive_overrides_level() {
        let (filter, rejected) = log_filter(LogLevel::Info, Some("labeller_queue=trace".into()));
        assert!(rejected.is_none());
        assert_eq!(filter.to_string(), EnvFilter::new("labeller_queue=trace").to_string());
    }

    #[test]
    fn invalid_log_directive_falls_back_and_is_reported() {
        let (filter, rejected) = log_filter(LogLevel::Warn, Some("labeller_queue=loud".into()));
        assert_eq!(filter.to_string(), EnvFilter::new("warn").to_string());
        let (directive, _) = rejected.unwrap();
        assert_eq!(directive, "labeller_queue=loud");
    }

    #[test]
    fn level_is_used_without_directive() {
        let (filter, rejected) = log_filter(LogLevel::Debug, None);
        assert_eq!(filter.to_string(), EnvFilter::new("debug").to_string());
        assert!(rejected.is_none());
    }
}
