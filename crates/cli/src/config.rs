use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use labeller_core::{DesiredLabels, LabelSetError, Labels};

#[derive(Parser, Debug)]
#[command(name = "pod-labeller", version, about = "Keeps a fixed set of labels on every Pod in a namespace")]
pub struct Cli {
    /// Namespace for the controller to watch
    #[arg(long, env = "LABELLER_NAMESPACE", default_value = "default")]
    pub namespace: String,

    /// Labels to add to pods, as comma-separated key=value pairs
    #[arg(
        long,
        env = "LABELLER_LABELS",
        value_delimiter = ',',
        default_value = "example.com/managed-by=pod-labeller"
    )]
    pub labels: Vec<String>,

    /// Path to kubeconfig (used when not running in-cluster)
    #[arg(long, env = "LABELLER_KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Log level (debug, info, warn, error)
    #[arg(long = "log-level", env = "LABELLER_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Number of concurrent reconcile workers
    #[arg(long, env = "LABELLER_WORKERS", default_value_t = 1)]
    pub workers: usize,

    /// Seconds to wait for the initial pod list before giving up
    #[arg(long = "cache-sync-timeout-secs", env = "LABELLER_CACHE_SYNC_TIMEOUT_SECS", default_value_t = 60)]
    pub cache_sync_timeout_secs: u64,

    /// Timeout in seconds for each call to the API server
    #[arg(long = "request-timeout-secs", env = "LABELLER_REQUEST_TIMEOUT_SECS", default_value_t = 5)]
    pub request_timeout_secs: u64,

    /// First retry delay for a failing pod, in milliseconds
    #[arg(long = "backoff-base-ms", env = "LABELLER_BACKOFF_BASE_MS", default_value_t = 5)]
    pub backoff_base_ms: u64,

    /// Upper bound on the retry delay, in seconds
    #[arg(long = "backoff-max-secs", env = "LABELLER_BACKOFF_MAX_SECS", default_value_t = 1000)]
    pub backoff_max_secs: u64,

    /// Serve Prometheus metrics on ip:port (e.g. 0.0.0.0:9100)
    #[arg(long = "metrics-addr", env = "LABELLER_METRICS_ADDR")]
    pub metrics_addr: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("log-level {0:?}: must be one of [debug, error, info, warn]")]
    LogLevel(String),
    #[error("namespace cannot be empty; please specify a valid namespace for the controller to watch")]
    EmptyNamespace,
    #[error("invalid label {0:?}: must be key=value")]
    InvalidLabel(String),
    #[error("invalid label {0:?}: key cannot be empty")]
    EmptyLabelKey(String),
    #[error("duplicate label key {0:?}")]
    DuplicateLabel(String),
    #[error(transparent)]
    Labels(#[from] LabelSetError),
    #[error("workers must be at least 1")]
    NoWorkers,
    #[error("backoff-base-ms must be greater than 0")]
    ZeroBackoff,
    #[error("{0} must be greater than 0")]
    ZeroTimeout(&'static str),
    #[error("metrics-addr {addr:?}: expected ip:port")]
    MetricsAddr {
        addr: String,
        #[source]
        source: std::net::AddrParseError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    fn parse(raw: &str) -> Result<Self, ConfigError> {
        let lower = raw.to_lowercase();
        match lower.as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(ConfigError::LogLevel(lower)),
        }
    }
}

/// Validated runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub namespace: String,
    pub labels: DesiredLabels,
    pub kubeconfig: Option<PathBuf>,
    pub log_level: LogLevel,
    pub workers: usize,
    pub cache_sync_timeout: Duration,
    pub request_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub metrics_addr: Option<SocketAddr>,
}

/// Split `key=value` on the first `=`, trimming both sides.
fn parse_labels(raw: &[String]) -> Result<Labels, ConfigError> {
    let mut out = Labels::new();
    for item in raw {
        let Some((k, v)) = item.split_once('=') else {
            return Err(ConfigError::InvalidLabel(item.clone()));
        };
        let (k, v) = (k.trim(), v.trim());
        if k.is_empty() {
            return Err(ConfigError::EmptyLabelKey(item.clone()));
        }
        if out.insert(k.to_string(), v.to_string()).is_some() {
            return Err(ConfigError::DuplicateLabel(k.to_string()));
        }
    }
    Ok(out)
}

impl TryFrom<Cli> for Config {
    type Error = ConfigError;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let log_level = LogLevel::parse(&cli.log_level)?;
        if cli.namespace.trim().is_empty() {
            return Err(ConfigError::EmptyNamespace);
        }
        let labels = DesiredLabels::new(parse_labels(&cli.labels)?)?;
        if cli.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if cli.backoff_base_ms == 0 {
            return Err(ConfigError::ZeroBackoff);
        }
        if cli.cache_sync_timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout("cache-sync-timeout-secs"));
        }
        if cli.request_timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout("request-timeout-secs"));
        }
        let metrics_addr = cli
            .metrics_addr
            .map(|addr| addr.parse().map_err(|source| ConfigError::MetricsAddr { addr, source }))
            .transpose()?;

        Ok(Config {
            namespace: cli.namespace,
            labels,
            kubeconfig: cli.kubeconfig.filter(|p| !p.as_os_str().is_empty()),
            log_level,
            workers: cli.workers,
            cache_sync_timeout: Duration::from_secs(cli.cache_sync_timeout_secs),
            request_timeout: Duration::from_secs(cli.request_timeout_secs),
            backoff_base: Duration::from_millis(cli.backoff_base_ms),
            backoff_max: Duration::from_secs(cli.backoff_max_secs),
            metrics_addr,
        })
    }
}
