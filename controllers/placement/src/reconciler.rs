//! Placement reconciliation.
//!
//! For one Placement key, recompute the full desired status from the cache
//! (level-triggered) and write it only when it differs from the observed
//! status. The computation is a pure function of the cache snapshot:
//! `desired_status` sorts its output, so cache iteration order never leaks
//! into the result.

use crate::cache::ObjectCache;
use crate::error::ReconcileError;
use crate::metrics::Metrics;
use crate::selector::{PlacementSelectors, SelectorError};
use crate::status_writer::{StatusWriter, WriteError};
use crds::{
    ClusterKey, Location, Placement, PlacementCondition, PlacementPhase, PlacementStatus,
    CONDITION_LOCATIONS_SELECTED, CONDITION_SELECTOR_VALID,
};
use k8s_openapi::api::core::v1::Namespace;
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What the worker should do with a key after a successful reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Nothing to do until the inputs change
    AwaitChange,
    /// Reconcile again after the given delay
    RequeueAfter(Duration),
}

impl Action {
    /// No follow-up.
    #[must_use]
    pub fn await_change() -> Self {
        Self::AwaitChange
    }

    /// Follow-up after `after`.
    #[must_use]
    pub fn requeue(after: Duration) -> Self {
        Self::RequeueAfter(after)
    }
}

fn condition(type_: &str, ok: bool, reason: &str, message: String) -> PlacementCondition {
    PlacementCondition {
        type_: type_.to_string(),
        status: if ok { "True" } else { "False" }.to_string(),
        reason: Some(reason.to_string()),
        message: Some(message),
    }
}

/// Computes the status `placement` should carry given the Locations and
/// Namespaces of its logical cluster.
///
/// A Location is selected when any location selector matches it and at
/// least one Namespace satisfies the namespace selector. One matching
/// Namespace is enough; the count does not matter.
pub fn desired_status(
    placement: &Placement,
    locations: &[Arc<Location>],
    namespaces: &[Arc<Namespace>],
) -> Result<PlacementStatus, SelectorError> {
    let selectors = PlacementSelectors::compile(placement)?;

    let mut candidates: Vec<String> = locations
        .iter()
        .filter(|location| selectors.matches_location(location.labels()))
        .map(|location| location.name_any())
        .collect();
    candidates.sort();
    candidates.dedup();

    let has_workload = namespaces
        .iter()
        .any(|namespace| selectors.matches_namespace(namespace.labels()));

    let (phase, selected_locations, selected_condition) = if candidates.is_empty() {
        (
            PlacementPhase::Pending,
            Vec::new(),
            condition(
                CONDITION_LOCATIONS_SELECTED,
                false,
                "NoMatchingLocations",
                "no Location matches the location selectors".to_string(),
            ),
        )
    } else if !has_workload {
        (
            PlacementPhase::Unbound,
            Vec::new(),
            condition(
                CONDITION_LOCATIONS_SELECTED,
                false,
                "NoMatchingNamespaces",
                format!(
                    "{} Location(s) match but no Namespace matches the namespace selector",
                    candidates.len()
                ),
            ),
        )
    } else {
        let message = format!("{} Location(s) selected", candidates.len());
        (
            PlacementPhase::Bound,
            candidates,
            condition(CONDITION_LOCATIONS_SELECTED, true, "LocationsBound", message),
        )
    };

    Ok(PlacementStatus {
        phase,
        selected_locations,
        observed_generation: placement.metadata.generation,
        conditions: vec![
            condition(
                CONDITION_SELECTOR_VALID,
                true,
                "SelectorsValid",
                "selectors are valid".to_string(),
            ),
            selected_condition,
        ],
    })
}

/// Status reported for a Placement whose selectors cannot be evaluated.
///
/// Nothing is selected: an unevaluable selector cannot justify a binding.
pub fn invalid_selector_status(placement: &Placement, error: &SelectorError) -> PlacementStatus {
    PlacementStatus {
        phase: PlacementPhase::Pending,
        selected_locations: Vec::new(),
        observed_generation: placement.metadata.generation,
        conditions: vec![
            condition(CONDITION_SELECTOR_VALID, false, "InvalidSelector", error.to_string()),
            condition(
                CONDITION_LOCATIONS_SELECTED,
                false,
                "InvalidSelector",
                "selectors cannot be evaluated".to_string(),
            ),
        ],
    }
}

/// True when the observed status differs from the desired one.
pub fn status_needs_update(current: Option<&PlacementStatus>, desired: &PlacementStatus) -> bool {
    current != Some(desired)
}

/// Reconciles Placements against the shared cache.
pub struct Reconciler {
    cache: Arc<ObjectCache>,
    writer: Arc<dyn StatusWriter>,
    metrics: Arc<Metrics>,
    invalid_selector_retry: Duration,
}

impl Reconciler {
    /// Creates a reconciler. Placements with malformed selectors are retried
    /// every `invalid_selector_retry`.
    pub fn new(
        cache: Arc<ObjectCache>,
        writer: Arc<dyn StatusWriter>,
        metrics: Arc<Metrics>,
        invalid_selector_retry: Duration,
    ) -> Self {
        Self {
            cache,
            writer,
            metrics,
            invalid_selector_retry,
        }
    }

    /// Reconciles one Placement.
    ///
    /// This method:
    /// 1. Fetches the Placement from the cache (absent: stale key, done)
    /// 2. Computes the desired status from the Locations and Namespaces of
    ///    the same logical cluster
    /// 3. Writes the status only if it changed, conditional on the observed
    ///    resource version
    pub async fn reconcile(&self, key: &ClusterKey) -> Result<Action, ReconcileError> {
        let Some(placement) = self.cache.placements.get(key) else {
            debug!(%key, "placement no longer exists, dropping key");
            return Ok(Action::await_change());
        };

        let locations = self.cache.locations.list_cluster(&key.cluster);
        let namespaces = self.cache.namespaces.list_cluster(&key.cluster);

        let (desired, action) = match desired_status(&placement, &locations, &namespaces) {
            Ok(status) => (status, Action::await_change()),
            Err(e) => {
                warn!(%key, error = %e, "placement has an invalid selector");
                (
                    invalid_selector_status(&placement, &e),
                    Action::requeue(self.invalid_selector_retry),
                )
            }
        };

        if !status_needs_update(placement.status.as_ref(), &desired) {
            debug!(%key, "placement already up-to-date");
            return Ok(action);
        }

        match self
            .writer
            .update_status(key, &desired, placement.metadata.resource_version.as_deref())
            .await
        {
            Ok(()) => {
                self.metrics.record_status_write();
                info!(
                    %key,
                    phase = ?desired.phase,
                    selected = ?desired.selected_locations,
                    "updated placement status"
                );
                Ok(action)
            }
            Err(WriteError::NotFound(_)) => {
                debug!(%key, "placement deleted before status write");
                Ok(Action::await_change())
            }
            Err(WriteError::Conflict(_)) => Err(ReconcileError::Conflict(key.clone())),
            Err(WriteError::Transient { message, .. }) => Err(ReconcileError::Transient {
                key: key.clone(),
                message,
            }),
        }
    }
}
