//! Environment-driven controller configuration.

use crate::error::ControllerError;
use kube::config::KubeConfigOptions;
use std::env;
use std::net::SocketAddr;
use std::time::Duration;

/// Default interval at which every Placement is re-enqueued.
pub const DEFAULT_RESYNC_PERIOD: Duration = Duration::from_secs(10 * 60 * 60);

const DEFAULT_METRICS_ADDR: &str = "0.0.0.0:8080";

/// Kubeconfig cluster entry pointing at the kcp shard root.
pub const DEFAULT_KUBECONFIG_CLUSTER: &str = "base";

/// Kubeconfig user allowed to read the wildcard view.
pub const DEFAULT_KUBECONFIG_USER: &str = "shard-admin";

/// Runtime configuration of the Placement Controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Overrides the server URL from the kubeconfig
    pub base_url: Option<String>,
    /// Number of reconcile workers
    pub workers: usize,
    /// Full re-enqueue interval
    pub resync_period: Duration,
    /// Listen address for `/metrics`, `/healthz` and `/readyz`
    pub metrics_addr: SocketAddr,
    /// Kubeconfig cluster overriding the current context's (None keeps it)
    pub kubeconfig_cluster: Option<String>,
    /// Kubeconfig user overriding the current context's (None keeps it)
    pub kubeconfig_user: Option<String>,
}

impl ControllerConfig {
    /// Loads configuration from the process environment.
    ///
    /// - `KCP_BASE_URL`: server URL without any `/clusters/...` suffix
    /// - `PLACEMENT_WORKERS`: worker count (default 1)
    /// - `RESYNC_PERIOD_SECS`: resync interval in seconds (default 10h)
    /// - `METRICS_ADDR`: probe/metrics listen address (default `0.0.0.0:8080`)
    /// - `KCP_KUBECONFIG_CLUSTER`: kubeconfig cluster entry (default `base`)
    /// - `KCP_KUBECONFIG_USER`: kubeconfig user entry (default `shard-admin`)
    ///
    /// Setting either override to the empty string keeps the current
    /// context's value. With both cleared the config is inferred, which also
    /// covers in-cluster service accounts.
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Loads configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let base_url = lookup("KCP_BASE_URL").filter(|url| !url.is_empty());

        let workers = match lookup("PLACEMENT_WORKERS") {
            Some(raw) => raw.parse::<usize>().map_err(|_| {
                ControllerError::InvalidConfig(format!("PLACEMENT_WORKERS must be a positive integer, got {raw:?}"))
            })?,
            None => 1,
        };
        if workers == 0 {
            return Err(ControllerError::InvalidConfig(
                "PLACEMENT_WORKERS must be at least 1".to_string(),
            ));
        }

        let resync_period = match lookup("RESYNC_PERIOD_SECS") {
            Some(raw) => match raw.parse::<u64>() {
                Ok(secs) if secs > 0 => Duration::from_secs(secs),
                _ => {
                    return Err(ControllerError::InvalidConfig(format!(
                        "RESYNC_PERIOD_SECS must be a positive integer, got {raw:?}"
                    )));
                }
            },
            None => DEFAULT_RESYNC_PERIOD,
        };

        let raw_addr = lookup("METRICS_ADDR").unwrap_or_else(|| DEFAULT_METRICS_ADDR.to_string());
        let metrics_addr = raw_addr.parse::<SocketAddr>().map_err(|e| {
            ControllerError::InvalidConfig(format!("METRICS_ADDR {raw_addr:?} is not a socket address: {e}"))
        })?;

        let override_or = |key: &str, default: &str| match lookup(key) {
            Some(value) if value.is_empty() => None,
            Some(value) => Some(value),
            None => Some(default.to_string()),
        };
        let kubeconfig_cluster = override_or("KCP_KUBECONFIG_CLUSTER", DEFAULT_KUBECONFIG_CLUSTER);
        let kubeconfig_user = override_or("KCP_KUBECONFIG_USER", DEFAULT_KUBECONFIG_USER);

        Ok(Self {
            base_url,
            workers,
            resync_period,
            metrics_addr,
            kubeconfig_cluster,
            kubeconfig_user,
        })
    }

    /// Kubeconfig selection applied on top of the current context, or `None`
    /// when nothing is overridden.
    pub fn kubeconfig_options(&self) -> Option<KubeConfigOptions> {
        if self.kubeconfig_cluster.is_none() && self.kubeconfig_user.is_none() {
            return None;
        }
        Some(KubeConfigOptions {
            context: None,
            cluster: self.kubeconfig_cluster.clone(),
            user: self.kubeconfig_user.clone(),
        })
    }
}

/// Server URL scoped to one logical cluster (or `*` for the wildcard view).
///
/// Any `/clusters/<name>` suffix already present on `base` is replaced.
pub fn cluster_url(base: &str, cluster: &str) -> String {
    let trimmed = base.trim_end_matches('/');
    let root = match trimmed.find("/clusters/") {
        Some(idx) => &trimmed[..idx],
        None => trimmed,
    };
    format!("{root}/clusters/{cluster}")
}
