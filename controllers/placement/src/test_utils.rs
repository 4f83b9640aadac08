//! Test utilities for unit testing the controller
//!
//! Builders for cluster-scoped test objects and an in-memory status writer.

use crate::cache::ObjectCache;
use crate::selector::Labels;
use crate::status_writer::{StatusWriter, WriteError};
use crds::{
    ClusterKey, LabelSelector, Location, LocationSpec, Placement, PlacementSpec, PlacementStatus,
    CLUSTER_ANNOTATION,
};
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

/// Label map from literal pairs.
pub fn labels(pairs: &[(&str, &str)]) -> Labels {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

fn test_meta(cluster: &str, name: &str, label_pairs: &[(&str, &str)]) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        labels: Some(labels(label_pairs)),
        annotations: Some(BTreeMap::from([(CLUSTER_ANNOTATION.to_string(), cluster.to_string())])),
        resource_version: Some("1".to_string()),
        generation: Some(1),
        ..Default::default()
    }
}

/// Helper to create a test Namespace in `cluster`
pub fn test_namespace(cluster: &str, name: &str, label_pairs: &[(&str, &str)]) -> Namespace {
    Namespace {
        metadata: test_meta(cluster, name, label_pairs),
        ..Default::default()
    }
}

/// Helper to create a test Location in `cluster`
pub fn test_location(cluster: &str, name: &str, label_pairs: &[(&str, &str)]) -> Location {
    Location {
        metadata: test_meta(cluster, name, label_pairs),
        spec: LocationSpec::default(),
        status: None,
    }
}

/// Helper to create a test Placement in `cluster`
pub fn test_placement(
    cluster: &str,
    name: &str,
    location_selectors: &[LabelSelector],
    namespace_selector: Option<LabelSelector>,
) -> Placement {
    Placement {
        metadata: test_meta(cluster, name, &[]),
        spec: PlacementSpec {
            location_selectors: location_selectors.to_vec(),
            namespace_selector,
        },
        status: None,
    }
}

/// Status writer that records writes instead of calling the API server.
///
/// When backed by a cache it behaves like the server would: writes to a
/// missing Placement fail with `NotFound`, writes carrying a stale
/// resource version fail with `Conflict`, and accepted writes update the
/// cached Placement and bump its resource version.
#[derive(Default)]
pub struct MockStatusWriter {
    cache: Option<Arc<ObjectCache>>,
    writes: Mutex<Vec<(ClusterKey, PlacementStatus)>>,
    scripted_errors: Mutex<VecDeque<WriteError>>,
}

impl MockStatusWriter {
    /// Writer that accepts every write.
    pub fn new() -> Self {
        Self::default()
    }

    /// Writer that applies accepted writes to `cache`.
    pub fn backed_by(cache: Arc<ObjectCache>) -> Self {
        Self {
            cache: Some(cache),
            ..Self::default()
        }
    }

    /// Fails the next write with `error`.
    pub fn fail_next(&self, error: WriteError) {
        self.scripted_errors.lock().unwrap().push_back(error);
    }

    /// Accepted writes, oldest first.
    pub fn writes(&self) -> Vec<(ClusterKey, PlacementStatus)> {
        self.writes.lock().unwrap().clone()
    }

    pub fn write_count(&self) -> usize {
        self.writes.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl StatusWriter for MockStatusWriter {
    async fn update_status(
        &self,
        key: &ClusterKey,
        status: &PlacementStatus,
        expected_resource_version: Option<&str>,
    ) -> Result<(), WriteError> {
        if let Some(error) = self.scripted_errors.lock().unwrap().pop_front() {
            return Err(error);
        }

        if let Some(cache) = &self.cache {
            let Some(current) = cache.placements.get(key) else {
                return Err(WriteError::NotFound(key.clone()));
            };
            if expected_resource_version.is_some()
                && current.metadata.resource_version.as_deref() != expected_resource_version
            {
                return Err(WriteError::Conflict(key.clone()));
            }
            let mut updated = (*current).clone();
            let next_version = updated
                .metadata
                .resource_version
                .as_deref()
                .and_then(|rv| rv.parse::<u64>().ok())
                .unwrap_or(0)
                + 1;
            updated.metadata.resource_version = Some(next_version.to_string());
            updated.status = Some(status.clone());
            cache.placements.insert(key.clone(), updated);
        }

        self.writes.lock().unwrap().push((key.clone(), status.clone()));
        Ok(())
    }
}
