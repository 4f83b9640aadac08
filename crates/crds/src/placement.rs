//! Placement CRD
//!
//! A tenant's request to bind the namespaces picked by `namespaceSelector`
//! to every Location picked by `locationSelectors`. The controller owns the
//! status sub-resource only.

use crate::label_selector::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "scheduling.kcp.dev",
    version = "v1alpha1",
    kind = "Placement",
    status = "PlacementStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PlacementSpec {
    /// Location selectors, logically ORed. An empty list selects no Location.
    #[serde(default)]
    pub location_selectors: Vec<LabelSelector>,

    /// Namespace selector. Absent selects no Namespace; `{}` selects all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<LabelSelector>,
}

/// Observed placement state.
///
/// Carries no timestamps: the status is a pure function of the cache
/// snapshot it was computed from, which keeps re-reconciles write-free.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PlacementStatus {
    /// Binding phase
    #[serde(default)]
    pub phase: PlacementPhase,

    /// Selected Location names, sorted and deduplicated
    #[serde(default)]
    pub selected_locations: Vec<String>,

    /// Generation the status was computed for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Status conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<PlacementCondition>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
/// Placement binding phase
#[serde(rename_all = "PascalCase")]
pub enum PlacementPhase {
    /// No Location satisfies the location selectors
    #[default]
    Pending,

    /// Locations match but no Namespace satisfies the namespace selector
    Unbound,

    /// At least one Location is selected
    Bound,
}

/// A single status condition.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PlacementCondition {
    /// Condition type, e.g. `SelectorValid`
    #[serde(rename = "type")]
    pub type_: String,

    /// `True`, `False` or `Unknown`
    pub status: String,

    /// Machine-readable reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Condition type reporting whether both selectors could be evaluated.
pub const CONDITION_SELECTOR_VALID: &str = "SelectorValid";

/// Condition type reporting whether any Location is bound.
pub const CONDITION_LOCATIONS_SELECTED: &str = "LocationsSelected";

impl PlacementStatus {
    /// Looks up a condition by type.
    pub fn condition(&self, type_: &str) -> Option<&PlacementCondition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }
}
