//! Merged multi-tenant object cache.
//!
//! One store per watched kind, each keyed by `ClusterKey`. The stores are
//! written only from the watch event path and read by reconcile workers;
//! readers receive `Arc` snapshots and never hold a lock across an await.

use crds::{ClusterKey, Location, LogicalCluster, Placement};
use k8s_openapi::api::core::v1::Namespace;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::watch;
use tracing::info;

#[derive(Debug)]
struct StoreInner<K> {
    objects: HashMap<ClusterKey, Arc<K>>,
    by_cluster: HashMap<LogicalCluster, BTreeSet<String>>,
}

impl<K> Default for StoreInner<K> {
    fn default() -> Self {
        Self {
            objects: HashMap::new(),
            by_cluster: HashMap::new(),
        }
    }
}

/// Objects of one kind across every logical cluster.
#[derive(Debug)]
pub struct ClusterStore<K> {
    inner: RwLock<StoreInner<K>>,
}

impl<K> Default for ClusterStore<K> {
    fn default() -> Self {
        Self {
            inner: RwLock::new(StoreInner::default()),
        }
    }
}

impl<K> ClusterStore<K> {
    /// Looks up one object.
    pub fn get(&self, key: &ClusterKey) -> Option<Arc<K>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.objects.get(key).cloned()
    }

    /// All objects of one logical cluster, ordered by name.
    pub fn list_cluster(&self, cluster: &LogicalCluster) -> Vec<Arc<K>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let Some(names) = inner.by_cluster.get(cluster) else {
            return Vec::new();
        };
        names
            .iter()
            .filter_map(|name| {
                inner.objects.get(&ClusterKey {
                    cluster: cluster.clone(),
                    name: name.clone(),
                })
            })
            .cloned()
            .collect()
    }

    /// Every key currently cached.
    pub fn keys(&self) -> Vec<ClusterKey> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.objects.keys().cloned().collect()
    }

    /// Number of cached objects.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.objects.len()
    }

    /// Stores `obj`, returning the object it replaced.
    pub fn insert(&self, key: ClusterKey, obj: K) -> Option<Arc<K>> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner
            .by_cluster
            .entry(key.cluster.clone())
            .or_default()
            .insert(key.name.clone());
        inner.objects.insert(key, Arc::new(obj))
    }

    /// Drops `key`, returning the removed object.
    pub fn remove(&self, key: &ClusterKey) -> Option<Arc<K>> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let removed = inner.objects.remove(key)?;
        if let Some(names) = inner.by_cluster.get_mut(&key.cluster) {
            names.remove(&key.name);
            if names.is_empty() {
                inner.by_cluster.remove(&key.cluster);
            }
        }
        Some(removed)
    }
}

/// The three caches the reconciler reads.
#[derive(Debug, Default)]
pub struct ObjectCache {
    /// Tenant namespaces
    pub namespaces: ClusterStore<Namespace>,
    /// Schedulable destinations
    pub locations: ClusterStore<Location>,
    /// Reconciled requests
    pub placements: ClusterStore<Placement>,
}

/// Watched kinds that must finish their initial list before workers start.
pub const WATCHED_KINDS: [&str; 3] = ["Namespace", "Location", "Placement"];

/// Tracks initial-list completion of every watched kind.
#[derive(Debug)]
pub struct SyncTracker {
    synced: watch::Sender<BTreeSet<&'static str>>,
}

impl Default for SyncTracker {
    fn default() -> Self {
        Self {
            synced: watch::Sender::new(BTreeSet::new()),
        }
    }
}

impl SyncTracker {
    /// Records that `kind` finished its initial list.
    pub fn mark_synced(&self, kind: &'static str) {
        self.synced.send_if_modified(|synced| {
            let added = synced.insert(kind);
            if added {
                info!(kind, "cache synced");
            }
            added
        });
    }

    /// True once every watched kind has synced.
    pub fn is_synced(&self) -> bool {
        let synced = self.synced.borrow();
        WATCHED_KINDS.iter().all(|kind| synced.contains(kind))
    }

    /// Resolves once every watched kind has synced.
    pub async fn wait_for_sync(&self) {
        let mut rx = self.synced.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait
        let _ = rx
            .wait_for(|synced| WATCHED_KINDS.iter().all(|kind| synced.contains(kind)))
            .await;
    }
}
