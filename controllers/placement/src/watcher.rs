//! Kubernetes resource watchers.
//!
//! Every watch event updates the cache and the indexers before any key is
//! enqueued, so a worker always sees the state that triggered it. Handlers
//! only maintain indexes and enqueue keys; evaluation happens in workers.

use crate::cache::{ObjectCache, SyncTracker};
use crate::error::ControllerError;
use crate::indexers::PlacementIndexers;
use crate::queue::WorkQueue;
use crds::{ClusterKey, Location, Placement};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Namespace;
use kube::{Api, ResourceExt};
use kube_runtime::{watcher, WatchStreamExt};
use std::collections::{BTreeSet, HashSet};
use std::fmt::Debug;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Per-kind cache maintenance.
pub trait KindHandler<K>: Send + Sync {
    /// Applies an added or modified object.
    fn apply(&self, obj: K);
    /// Handles removal of a cached object.
    fn delete(&self, key: &ClusterKey);
    /// Keys currently cached for this kind.
    fn cached_keys(&self) -> Vec<ClusterKey>;
}

/// Shared state updated by the watch event path.
pub struct EventHandlers {
    cache: Arc<ObjectCache>,
    indexers: Arc<PlacementIndexers>,
    queue: Arc<WorkQueue<ClusterKey>>,
}

impl EventHandlers {
    /// Creates handlers writing into `cache` and `indexers` and feeding `queue`.
    pub fn new(
        cache: Arc<ObjectCache>,
        indexers: Arc<PlacementIndexers>,
        queue: Arc<WorkQueue<ClusterKey>>,
    ) -> Self {
        Self { cache, indexers, queue }
    }

    fn enqueue_all(&self, keys: BTreeSet<ClusterKey>, cause: &str, source: &ClusterKey) {
        if !keys.is_empty() {
            debug!(%source, count = keys.len(), cause, "enqueueing affected placements");
        }
        for key in keys {
            self.queue.add(key);
        }
    }
}

fn object_key<K: kube::Resource>(obj: &K, kind: &str) -> Option<ClusterKey> {
    let key = ClusterKey::from_object(obj);
    if key.is_none() {
        debug!(kind, name = ?obj.meta().name, "ignoring object without logical cluster");
    }
    key
}

impl KindHandler<Placement> for EventHandlers {
    fn apply(&self, placement: Placement) {
        let Some(key) = object_key(&placement, "Placement") else {
            return;
        };
        if let Err(e) = self.indexers.upsert_placement(&key, &placement) {
            debug!(%key, error = %e, "placement not indexed");
        }
        self.cache.placements.insert(key.clone(), placement);
        self.queue.add(key);
    }

    fn delete(&self, key: &ClusterKey) {
        self.cache.placements.remove(key);
        self.indexers.remove_placement(key);
        self.queue.add(key.clone());
    }

    fn cached_keys(&self) -> Vec<ClusterKey> {
        self.cache.placements.keys()
    }
}

impl KindHandler<Location> for EventHandlers {
    fn apply(&self, location: Location) {
        let Some(key) = object_key(&location, "Location") else {
            return;
        };
        let new_labels = location.labels().clone();
        let previous = self.cache.locations.insert(key.clone(), location);
        let affected = match &previous {
            Some(old) if old.labels() == &new_labels => return,
            Some(old) => self
                .indexers
                .placements_matching_location(&key.cluster, &[old.labels(), &new_labels]),
            None => self.indexers.placements_matching_location(&key.cluster, &[&new_labels]),
        };
        self.enqueue_all(affected, "location changed", &key);
    }

    fn delete(&self, key: &ClusterKey) {
        if let Some(old) = self.cache.locations.remove(key) {
            let affected = self.indexers.placements_matching_location(&key.cluster, &[old.labels()]);
            self.enqueue_all(affected, "location deleted", key);
        }
    }

    fn cached_keys(&self) -> Vec<ClusterKey> {
        self.cache.locations.keys()
    }
}

impl KindHandler<Namespace> for EventHandlers {
    fn apply(&self, namespace: Namespace) {
        let Some(key) = object_key(&namespace, "Namespace") else {
            return;
        };
        let new_labels = namespace.labels().clone();
        let previous = self.cache.namespaces.insert(key.clone(), namespace);
        let affected = match &previous {
            Some(old) if old.labels() == &new_labels => return,
            Some(old) => self
                .indexers
                .placements_matching_namespace(&key.cluster, &[old.labels(), &new_labels]),
            None => self.indexers.placements_matching_namespace(&key.cluster, &[&new_labels]),
        };
        self.enqueue_all(affected, "namespace changed", &key);
    }

    fn delete(&self, key: &ClusterKey) {
        if let Some(old) = self.cache.namespaces.remove(key) {
            let affected = self.indexers.placements_matching_namespace(&key.cluster, &[old.labels()]);
            self.enqueue_all(affected, "namespace deleted", key);
        }
    }

    fn cached_keys(&self) -> Vec<ClusterKey> {
        self.cache.namespaces.keys()
    }
}

/// Turns watcher events of one kind into handler calls.
///
/// A (re)list arrives as `Init`, `InitApply`*, `InitDone`. The listed
/// objects are buffered and applied on `InitDone`, and every cached object
/// missing from the list is deleted, so the cache is rebuilt in full.
pub struct EventProcessor<K> {
    kind: &'static str,
    handlers: Arc<EventHandlers>,
    sync: Arc<SyncTracker>,
    relist: Option<Vec<K>>,
}

impl<K> EventProcessor<K>
where
    K: kube::Resource,
    EventHandlers: KindHandler<K>,
{
    /// Creates a processor for `kind`.
    pub fn new(kind: &'static str, handlers: Arc<EventHandlers>, sync: Arc<SyncTracker>) -> Self {
        Self {
            kind,
            handlers,
            sync,
            relist: None,
        }
    }

    /// Handles one watcher event.
    pub fn process(&mut self, event: watcher::Event<K>) {
        match event {
            watcher::Event::Apply(obj) => self.handlers.apply(obj),
            watcher::Event::Delete(obj) => {
                if let Some(key) = object_key(&obj, self.kind) {
                    KindHandler::<K>::delete(&*self.handlers, &key);
                }
            }
            watcher::Event::Init => {
                debug!(kind = self.kind, "relist started");
                self.relist = Some(Vec::new());
            }
            watcher::Event::InitApply(obj) => match &mut self.relist {
                Some(buffer) => buffer.push(obj),
                None => self.handlers.apply(obj),
            },
            watcher::Event::InitDone => {
                let listed = self.relist.take().unwrap_or_default();
                let seen: HashSet<ClusterKey> = listed.iter().filter_map(ClusterKey::from_object).collect();
                let stale: Vec<ClusterKey> = KindHandler::<K>::cached_keys(&*self.handlers)
                    .into_iter()
                    .filter(|key| !seen.contains(key))
                    .collect();

                debug!(kind = self.kind, listed = listed.len(), stale = stale.len(), "relist complete");
                for key in &stale {
                    KindHandler::<K>::delete(&*self.handlers, key);
                }
                for obj in listed {
                    self.handlers.apply(obj);
                }
                self.sync.mark_synced(self.kind);
            }
        }
    }
}

/// Watches one resource kind across every logical cluster until the stream ends.
///
/// Watch errors are logged and retried with the default kube backoff.
pub async fn watch_resource<K>(api: Api<K>, mut processor: EventProcessor<K>) -> Result<(), ControllerError>
where
    K: kube::Resource + Clone + Debug + serde::de::DeserializeOwned + Send + 'static,
    EventHandlers: KindHandler<K>,
{
    let kind = processor.kind;
    info!(kind, "Starting watcher");

    let mut stream = watcher(api, watcher::Config::default()).default_backoff().boxed();
    while let Some(event) = stream.next().await {
        match event {
            Ok(event) => processor.process(event),
            Err(e) => warn!(kind, error = %e, "watch stream error, retrying"),
        }
    }

    Err(ControllerError::Watch(format!("{kind} watch stream ended")))
}
