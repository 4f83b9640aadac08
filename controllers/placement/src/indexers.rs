//! Secondary indexes answering "which Placements could care about this
//! Location / Namespace".
//!
//! Each Placement's selectors are registered under the terms returned by
//! [`Selector::index_terms`]. A lookup unions the Placements registered
//! under every `key=value` and `key` the object carries, plus the per-cluster
//! fallback set of selectors that cannot be indexed. The result is a superset
//! of the true matches; the reconciler evaluates the selectors exactly.

use crate::selector::{IndexRegistration, Labels, PlacementSelectors, SelectorError, Term};
use crds::{ClusterKey, LogicalCluster, Placement};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{PoisonError, RwLock};

#[derive(Debug, Default)]
struct ClusterIndex {
    /// label key -> label value -> placement names
    equals: HashMap<String, HashMap<String, HashSet<String>>>,
    /// label key -> placement names
    has_key: HashMap<String, HashSet<String>>,
    fallback: HashSet<String>,
}

impl ClusterIndex {
    fn is_empty(&self) -> bool {
        self.equals.is_empty() && self.has_key.is_empty() && self.fallback.is_empty()
    }

    fn insert(&mut self, name: &str, registration: &IndexRegistration) {
        match registration {
            IndexRegistration::Nothing => {}
            IndexRegistration::Fallback => {
                self.fallback.insert(name.to_string());
            }
            IndexRegistration::Terms(terms) => {
                for term in terms {
                    match term {
                        Term::Equals(key, value) => {
                            self.equals
                                .entry(key.clone())
                                .or_default()
                                .entry(value.clone())
                                .or_default()
                                .insert(name.to_string());
                        }
                        Term::HasKey(key) => {
                            self.has_key.entry(key.clone()).or_default().insert(name.to_string());
                        }
                    }
                }
            }
        }
    }

    fn remove(&mut self, name: &str, registration: &IndexRegistration) {
        match registration {
            IndexRegistration::Nothing => {}
            IndexRegistration::Fallback => {
                self.fallback.remove(name);
            }
            IndexRegistration::Terms(terms) => {
                for term in terms {
                    match term {
                        Term::Equals(key, value) => {
                            if let Some(values) = self.equals.get_mut(key) {
                                if let Some(names) = values.get_mut(value) {
                                    names.remove(name);
                                    if names.is_empty() {
                                        values.remove(value);
                                    }
                                }
                                if values.is_empty() {
                                    self.equals.remove(key);
                                }
                            }
                        }
                        Term::HasKey(key) => {
                            if let Some(names) = self.has_key.get_mut(key) {
                                names.remove(name);
                                if names.is_empty() {
                                    self.has_key.remove(key);
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    fn query(&self, labels: &Labels, out: &mut BTreeSet<String>) {
        out.extend(self.fallback.iter().cloned());
        for (key, value) in labels {
            if let Some(names) = self.equals.get(key).and_then(|values| values.get(value)) {
                out.extend(names.iter().cloned());
            }
            if let Some(names) = self.has_key.get(key) {
                out.extend(names.iter().cloned());
            }
        }
    }
}

/// Inverted index over one selector slot of every Placement.
#[derive(Debug, Default)]
struct SelectorIndex {
    clusters: HashMap<LogicalCluster, ClusterIndex>,
    registered: HashMap<ClusterKey, IndexRegistration>,
}

impl SelectorIndex {
    fn set(&mut self, key: &ClusterKey, registration: IndexRegistration) {
        self.remove(key);
        if registration == IndexRegistration::Nothing {
            return;
        }
        self.clusters
            .entry(key.cluster.clone())
            .or_default()
            .insert(&key.name, &registration);
        self.registered.insert(key.clone(), registration);
    }

    fn remove(&mut self, key: &ClusterKey) {
        let Some(previous) = self.registered.remove(key) else {
            return;
        };
        if let Some(index) = self.clusters.get_mut(&key.cluster) {
            index.remove(&key.name, &previous);
            if index.is_empty() {
                self.clusters.remove(&key.cluster);
            }
        }
    }

    fn query(&self, cluster: &LogicalCluster, labels: &[&Labels]) -> BTreeSet<ClusterKey> {
        let Some(index) = self.clusters.get(cluster) else {
            return BTreeSet::new();
        };
        let mut names = BTreeSet::new();
        for labels in labels {
            index.query(labels, &mut names);
        }
        names
            .into_iter()
            .map(|name| ClusterKey {
                cluster: cluster.clone(),
                name,
            })
            .collect()
    }
}

#[derive(Debug, Default)]
struct Indexes {
    by_location: SelectorIndex,
    by_namespace: SelectorIndex,
}

/// Reverse lookups from Locations and Namespaces to Placements.
///
/// Mutated from watch callbacks, which may run on several tasks at once,
/// hence the lock.
#[derive(Debug, Default)]
pub struct PlacementIndexers {
    inner: RwLock<Indexes>,
}

impl PlacementIndexers {
    /// Registers (or re-registers) a Placement's selectors.
    ///
    /// A Placement with a malformed selector is unregistered and the error
    /// returned; it is only revisited on its own updates and on resync.
    pub fn upsert_placement(&self, key: &ClusterKey, placement: &Placement) -> Result<(), SelectorError> {
        let compiled = PlacementSelectors::compile(placement);
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        match compiled {
            Ok(selectors) => {
                inner.by_location.set(key, selectors.location_registration());
                inner.by_namespace.set(key, selectors.namespace_registration());
                Ok(())
            }
            Err(e) => {
                inner.by_location.remove(key);
                inner.by_namespace.remove(key);
                Err(e)
            }
        }
    }

    /// Drops every registration of a Placement.
    pub fn remove_placement(&self, key: &ClusterKey) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.by_location.remove(key);
        inner.by_namespace.remove(key);
    }

    /// Placements whose location selectors may match a Location carrying
    /// any of the given label sets.
    pub fn placements_matching_location(
        &self,
        cluster: &LogicalCluster,
        labels: &[&Labels],
    ) -> BTreeSet<ClusterKey> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.by_location.query(cluster, labels)
    }

    /// Placements whose namespace selector may match a Namespace carrying
    /// any of the given label sets.
    pub fn placements_matching_namespace(
        &self,
        cluster: &LogicalCluster,
        labels: &[&Labels],
    ) -> BTreeSet<ClusterKey> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.by_namespace.query(cluster, labels)
    }
}
