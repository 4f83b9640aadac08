//! Placement status writes.
//!
//! The `StatusWriter` trait abstracts the API round trip so the reconciler
//! can be exercised against an in-memory mock. Writes carry the last
//! observed `resourceVersion`, so the API server rejects a write computed
//! from a stale view with 409 Conflict.

use crate::config::cluster_url;
use crds::{ClusterKey, LogicalCluster, Placement, PlacementStatus};
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tracing::debug;

/// Distinguishable outcomes of a failed status write.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WriteError {
    /// The Placement no longer exists
    #[error("placement {0} not found")]
    NotFound(ClusterKey),

    /// The Placement changed since it was read
    #[error("placement {0} was modified concurrently")]
    Conflict(ClusterKey),

    /// Network or server failure
    #[error("failed to update placement {key}: {message}")]
    Transient {
        /// Placement being written
        key: ClusterKey,
        /// Underlying failure
        message: String,
    },
}

/// Trait for persisting computed Placement status
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait StatusWriter: Send + Sync {
    /// Replaces the status of `key`, conditional on `expected_resource_version`.
    async fn update_status(
        &self,
        key: &ClusterKey,
        status: &PlacementStatus,
        expected_resource_version: Option<&str>,
    ) -> Result<(), WriteError>;
}

/// Status writer talking to the API server, one client per logical cluster.
pub struct KubeStatusWriter {
    base: kube::Config,
    clients: Mutex<HashMap<LogicalCluster, Client>>,
}

impl KubeStatusWriter {
    /// Creates a writer deriving per-cluster clients from `base`.
    pub fn new(base: kube::Config) -> Self {
        Self {
            base,
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn client_for(&self, key: &ClusterKey) -> Result<Client, WriteError> {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(client) = clients.get(&key.cluster) {
            return Ok(client.clone());
        }

        let transient = |message: String| WriteError::Transient {
            key: key.clone(),
            message,
        };
        let mut config = self.base.clone();
        config.cluster_url = cluster_url(&self.base.cluster_url.to_string(), key.cluster.as_str())
            .parse()
            .map_err(|e| transient(format!("invalid cluster URL: {e}")))?;
        let client = Client::try_from(config).map_err(|e| transient(format!("failed to build client: {e}")))?;

        debug!(cluster = %key.cluster, "created cluster-scoped client");
        clients.insert(key.cluster.clone(), client.clone());
        Ok(client)
    }

    /// Drops the cached client of `cluster`; the next write rebuilds it.
    ///
    /// Called on NotFound so clients of logical clusters that went away do
    /// not accumulate.
    fn evict(&self, cluster: &LogicalCluster) {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        if clients.remove(cluster).is_some() {
            debug!(%cluster, "evicted cluster-scoped client");
        }
    }

    #[cfg(test)]
    fn cached_clusters(&self) -> usize {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Merge patch replacing the status, with an optimistic-concurrency precondition.
pub fn status_patch(status: &PlacementStatus, expected_resource_version: Option<&str>) -> serde_json::Value {
    let mut patch = serde_json::json!({ "status": status });
    if let Some(resource_version) = expected_resource_version {
        patch["metadata"] = serde_json::json!({ "resourceVersion": resource_version });
    }
    patch
}

#[async_trait::async_trait]
impl StatusWriter for KubeStatusWriter {
    async fn update_status(
        &self,
        key: &ClusterKey,
        status: &PlacementStatus,
        expected_resource_version: Option<&str>,
    ) -> Result<(), WriteError> {
        let api: Api<Placement> = Api::all(self.client_for(key)?);
        let patch = status_patch(status, expected_resource_version);

        match api
            .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 404 => {
                self.evict(&key.cluster);
                Err(WriteError::NotFound(key.clone()))
            }
            Err(kube::Error::Api(response)) if response.code == 409 => Err(WriteError::Conflict(key.clone())),
            Err(e) => Err(WriteError::Transient {
                key: key.clone(),
                message: e.to_string(),
            }),
        }
    }
}
