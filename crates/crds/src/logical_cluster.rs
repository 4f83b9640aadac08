//! Logical cluster identifiers
//!
//! Every object seen through the wildcard view belongs to exactly one
//! logical cluster, recorded in the `kcp.dev/cluster` annotation. All keys in
//! the controller pair that cluster with the object's local name, so a lookup
//! without the tenant component cannot be expressed.

use kube::{Resource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Annotation carrying the owning logical cluster.
pub const CLUSTER_ANNOTATION: &str = "kcp.dev/cluster";

/// Path segment selecting every logical cluster at once.
pub const WILDCARD_CLUSTER: &str = "*";

/// Opaque tenant identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct LogicalCluster(String);

impl LogicalCluster {
    /// Wraps a cluster name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the cluster name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Reads the owning cluster from an object's annotations.
    pub fn from_object<K: Resource>(obj: &K) -> Option<Self> {
        obj.annotations()
            .get(CLUSTER_ANNOTATION)
            .filter(|c| !c.is_empty())
            .map(|c| Self(c.clone()))
    }
}

impl fmt::Display for LogicalCluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Composite (logical cluster, local name) key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClusterKey {
    /// Owning logical cluster
    pub cluster: LogicalCluster,
    /// Name local to the cluster
    pub name: String,
}

impl ClusterKey {
    /// Builds a key from its parts.
    pub fn new(cluster: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            cluster: LogicalCluster::new(cluster),
            name: name.into(),
        }
    }

    /// Key of a cluster-scoped object, if it carries a cluster annotation and a name.
    pub fn from_object<K: Resource>(obj: &K) -> Option<Self> {
        let cluster = LogicalCluster::from_object(obj)?;
        let name = obj.meta().name.clone()?;
        Some(Self { cluster, name })
    }
}

impl fmt::Display for ClusterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.cluster, self.name)
    }
}
