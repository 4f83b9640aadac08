//! Location CRD
//!
//! A schedulable destination. Its labels describe the destination
//! (region, capacity class, ...) and are what Placement location selectors
//! match against.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "scheduling.kcp.dev",
    version = "v1alpha1",
    kind = "Location",
    status = "LocationStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct LocationSpec {
    /// Resource type exposed at this location
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<GroupVersionResource>,

    /// Human-readable description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Group/version/resource triple.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GroupVersionResource {
    /// API group (empty for core)
    #[serde(default)]
    pub group: String,
    /// API version
    pub version: String,
    /// Plural resource name
    pub resource: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LocationStatus {
    /// Number of instances behind this location
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instances: Option<u32>,

    /// Number of instances currently available
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_instances: Option<u32>,
}
