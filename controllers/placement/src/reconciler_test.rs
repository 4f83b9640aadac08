//! Unit tests for Placement reconciliation

#[cfg(test)]
mod tests {
    use crate::cache::ObjectCache;
    use crate::error::ReconcileError;
    use crate::metrics::Metrics;
    use crate::reconciler::{desired_status, status_needs_update, Action, Reconciler};
    use crate::status_writer::WriteError;
    use crate::test_utils::*;
    use crds::{
        ClusterKey, LabelSelector, Location, Placement, PlacementPhase, PlacementStatus,
        CONDITION_LOCATIONS_SELECTED, CONDITION_SELECTOR_VALID,
    };
    use k8s_openapi::api::core::v1::Namespace;
    use std::sync::Arc;
    use std::time::Duration;

    const RETRY: Duration = Duration::from_secs(600);

    struct Fixture {
        cache: Arc<ObjectCache>,
        writer: Arc<MockStatusWriter>,
        metrics: Arc<Metrics>,
        reconciler: Reconciler,
    }

    fn fixture() -> Fixture {
        let cache = Arc::new(ObjectCache::default());
        let writer = Arc::new(MockStatusWriter::backed_by(Arc::clone(&cache)));
        let metrics = Arc::new(Metrics::new().unwrap());
        let reconciler = Reconciler::new(Arc::clone(&cache), writer.clone(), Arc::clone(&metrics), RETRY);
        Fixture {
            cache,
            writer,
            metrics,
            reconciler,
        }
    }

    impl Fixture {
        fn add_location(&self, location: Location) {
            let key = ClusterKey::from_object(&location).unwrap();
            self.cache.locations.insert(key, location);
        }

        fn add_namespace(&self, namespace: Namespace) {
            let key = ClusterKey::from_object(&namespace).unwrap();
            self.cache.namespaces.insert(key, namespace);
        }

        fn add_placement(&self, placement: Placement) -> ClusterKey {
            let key = ClusterKey::from_object(&placement).unwrap();
            self.cache.placements.insert(key.clone(), placement);
            key
        }

        fn status(&self, key: &ClusterKey) -> PlacementStatus {
            self.cache
                .placements
                .get(key)
                .and_then(|p| p.status.clone())
                .expect("placement should have a status")
        }
    }

    fn us_for_team_a(cluster: &str, name: &str) -> Placement {
        test_placement(
            cluster,
            name,
            &[LabelSelector::from_labels([("region", "us")])],
            Some(LabelSelector::from_labels([("team", "a")])),
        )
    }

    #[tokio::test]
    async fn test_binding_follows_namespace_lifecycle() {
        let f = fixture();
        f.add_location(test_location("c1", "l1", &[("region", "us")]));
        f.add_location(test_location("c1", "l2", &[("region", "eu")]));
        f.add_namespace(test_namespace("c1", "n1", &[("team", "a")]));
        let key = f.add_placement(us_for_team_a("c1", "p1"));

        assert_eq!(f.reconciler.reconcile(&key).await.unwrap(), Action::AwaitChange);
        let status = f.status(&key);
        assert_eq!(status.phase, PlacementPhase::Bound);
        assert_eq!(status.selected_locations, vec!["l1".to_string()]);
        assert_eq!(status.observed_generation, Some(1));

        // The only matching namespace goes away
        f.cache.namespaces.remove(&ClusterKey::new("c1", "n1"));
        f.reconciler.reconcile(&key).await.unwrap();
        let status = f.status(&key);
        assert_eq!(status.phase, PlacementPhase::Unbound);
        assert!(status.selected_locations.is_empty());
        let condition = status.condition(CONDITION_LOCATIONS_SELECTED).unwrap();
        assert_eq!(condition.status, "False");
        assert_eq!(condition.reason.as_deref(), Some("NoMatchingNamespaces"));

        // Another one appears
        f.add_namespace(test_namespace("c1", "n2", &[("team", "a")]));
        f.reconciler.reconcile(&key).await.unwrap();
        assert_eq!(f.status(&key).selected_locations, vec!["l1".to_string()]);
        assert_eq!(f.writer.write_count(), 3);
        assert_eq!(f.metrics.status_write_count(), 3);
    }

    #[tokio::test]
    async fn test_second_pass_writes_nothing() {
        let f = fixture();
        f.add_location(test_location("c1", "l1", &[("region", "us")]));
        f.add_namespace(test_namespace("c1", "n1", &[("team", "a")]));
        let key = f.add_placement(us_for_team_a("c1", "p1"));

        f.reconciler.reconcile(&key).await.unwrap();
        f.reconciler.reconcile(&key).await.unwrap();
        assert_eq!(f.writer.write_count(), 1);
    }

    #[tokio::test]
    async fn test_no_matching_location_is_pending() {
        let f = fixture();
        f.add_location(test_location("c1", "l2", &[("region", "eu")]));
        f.add_namespace(test_namespace("c1", "n1", &[("team", "a")]));
        let key = f.add_placement(us_for_team_a("c1", "p1"));

        f.reconciler.reconcile(&key).await.unwrap();
        let status = f.status(&key);
        assert_eq!(status.phase, PlacementPhase::Pending);
        assert_eq!(
            status.condition(CONDITION_LOCATIONS_SELECTED).unwrap().reason.as_deref(),
            Some("NoMatchingLocations")
        );
    }

    #[tokio::test]
    async fn test_tenants_are_isolated() {
        let f = fixture();
        // Matching objects exist, but only in another logical cluster
        f.add_location(test_location("c2", "l1", &[("region", "us")]));
        f.add_namespace(test_namespace("c2", "n1", &[("team", "a")]));
        f.add_location(test_location("c1", "l9", &[("region", "us")]));
        let key = f.add_placement(us_for_team_a("c1", "p1"));

        f.reconciler.reconcile(&key).await.unwrap();
        let status = f.status(&key);
        assert_eq!(status.phase, PlacementPhase::Unbound);
        assert!(status.selected_locations.is_empty());

        // Same-named placement in c2 sees only c2
        let other = f.add_placement(us_for_team_a("c2", "p1"));
        f.reconciler.reconcile(&other).await.unwrap();
        assert_eq!(f.status(&other).selected_locations, vec!["l1".to_string()]);
        assert_eq!(f.status(&key).phase, PlacementPhase::Unbound);
    }

    #[tokio::test]
    async fn test_location_selectors_are_ored_and_deduplicated() {
        let f = fixture();
        f.add_location(test_location("c1", "b", &[("region", "us"), ("tier", "gold")]));
        f.add_location(test_location("c1", "a", &[("region", "eu")]));
        f.add_location(test_location("c1", "c", &[("region", "ap")]));
        f.add_namespace(test_namespace("c1", "n1", &[]));
        let key = f.add_placement(test_placement(
            "c1",
            "p1",
            &[
                LabelSelector::from_labels([("tier", "gold")]),
                LabelSelector::default().with_expression("region", "In", &["us", "eu"]),
            ],
            Some(LabelSelector::default()),
        ));

        f.reconciler.reconcile(&key).await.unwrap();
        assert_eq!(f.status(&key).selected_locations, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_empty_and_absent_selectors_select_nothing() {
        let f = fixture();
        f.add_location(test_location("c1", "l1", &[("region", "us")]));
        f.add_namespace(test_namespace("c1", "n1", &[("team", "a")]));

        let no_locations = f.add_placement(test_placement("c1", "none", &[], Some(LabelSelector::default())));
        f.reconciler.reconcile(&no_locations).await.unwrap();
        assert_eq!(f.status(&no_locations).phase, PlacementPhase::Pending);

        let no_namespaces = f.add_placement(test_placement(
            "c1",
            "unset",
            &[LabelSelector::default()],
            None,
        ));
        f.reconciler.reconcile(&no_namespaces).await.unwrap();
        assert_eq!(f.status(&no_namespaces).phase, PlacementPhase::Unbound);
    }

    #[test]
    fn test_desired_status_ignores_input_order() {
        let placement = test_placement(
            "c1",
            "p1",
            &[LabelSelector::default().with_expression("region", "Exists", &[])],
            Some(LabelSelector::default()),
        );
        let mut locations: Vec<Arc<Location>> = ["l3", "l1", "l2", "l0"]
            .iter()
            .map(|name| Arc::new(test_location("c1", name, &[("region", "us")])))
            .collect();
        let namespaces = vec![Arc::new(test_namespace("c1", "n1", &[]))];

        let first = desired_status(&placement, &locations, &namespaces).unwrap();
        locations.reverse();
        let second = desired_status(&placement, &locations, &namespaces).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.selected_locations, vec!["l0", "l1", "l2", "l3"]);
    }

    #[test]
    fn test_status_needs_update() {
        let placement = us_for_team_a("c1", "p1");
        let desired = desired_status(&placement, &[], &[]).unwrap();
        assert!(status_needs_update(None, &desired));
        assert!(!status_needs_update(Some(&desired), &desired));

        let mut stale = desired.clone();
        stale.observed_generation = Some(0);
        assert!(status_needs_update(Some(&stale), &desired));
    }

    #[tokio::test]
    async fn test_missing_placement_is_dropped() {
        let f = fixture();
        let action = f.reconciler.reconcile(&ClusterKey::new("c1", "gone")).await.unwrap();
        assert_eq!(action, Action::AwaitChange);
        assert_eq!(f.writer.write_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_selector_is_reported_and_retried() {
        let f = fixture();
        f.add_location(test_location("c1", "l1", &[("region", "us")]));
        let key = f.add_placement(test_placement(
            "c1",
            "bad",
            &[LabelSelector::default().with_expression("region", "In", &[])],
            Some(LabelSelector::default()),
        ));

        assert_eq!(f.reconciler.reconcile(&key).await.unwrap(), Action::RequeueAfter(RETRY));
        let status = f.status(&key);
        assert_eq!(status.phase, PlacementPhase::Pending);
        assert!(status.selected_locations.is_empty());
        let condition = status.condition(CONDITION_SELECTOR_VALID).unwrap();
        assert_eq!(condition.status, "False");
        assert_eq!(condition.reason.as_deref(), Some("InvalidSelector"));

        // Retried without rewriting an unchanged status
        assert_eq!(f.reconciler.reconcile(&key).await.unwrap(), Action::RequeueAfter(RETRY));
        assert_eq!(f.writer.write_count(), 1);
    }

    #[tokio::test]
    async fn test_invalid_label_syntax_is_reported() {
        let f = fixture();
        f.add_location(test_location("c1", "l1", &[("region", "us")]));
        f.add_namespace(test_namespace("c1", "n1", &[("team", "a")]));
        let key = f.add_placement(test_placement(
            "c1",
            "typo",
            &[LabelSelector::from_labels([("region us!", "x")])],
            Some(LabelSelector::from_labels([("team", "a")])),
        ));

        assert_eq!(f.reconciler.reconcile(&key).await.unwrap(), Action::RequeueAfter(RETRY));
        let status = f.status(&key);
        assert_eq!(status.phase, PlacementPhase::Pending);
        let condition = status.condition(CONDITION_SELECTOR_VALID).unwrap();
        assert_eq!(condition.status, "False");
        assert!(condition.message.as_deref().unwrap().contains("region us!"));
    }

    #[tokio::test]
    async fn test_write_failures_map_to_reconcile_outcomes() {
        let f = fixture();
        let key = f.add_placement(us_for_team_a("c1", "p1"));

        f.writer.fail_next(WriteError::Conflict(key.clone()));
        assert!(matches!(
            f.reconciler.reconcile(&key).await,
            Err(ReconcileError::Conflict(_))
        ));

        f.writer.fail_next(WriteError::Transient {
            key: key.clone(),
            message: "timeout".to_string(),
        });
        assert!(matches!(
            f.reconciler.reconcile(&key).await,
            Err(ReconcileError::Transient { .. })
        ));

        f.writer.fail_next(WriteError::NotFound(key.clone()));
        assert_eq!(f.reconciler.reconcile(&key).await.unwrap(), Action::AwaitChange);
        assert_eq!(f.writer.write_count(), 0);
        assert_eq!(f.metrics.status_write_count(), 0);
    }

    #[tokio::test]
    async fn test_stale_resource_version_conflicts() {
        let cache = Arc::new(ObjectCache::default());
        let metrics = Arc::new(Metrics::new().unwrap());
        let key = ClusterKey::new("c1", "p1");
        cache.placements.insert(key.clone(), us_for_team_a("c1", "p1"));

        // The server already moved to a newer version than the cache holds
        let server = Arc::new(ObjectCache::default());
        let mut newer = us_for_team_a("c1", "p1");
        newer.metadata.resource_version = Some("7".to_string());
        server.placements.insert(key.clone(), newer);
        let writer = Arc::new(MockStatusWriter::backed_by(server));

        let reconciler = Reconciler::new(cache, writer.clone(), metrics, RETRY);
        assert!(matches!(
            reconciler.reconcile(&key).await,
            Err(ReconcileError::Conflict(_))
        ));
        assert_eq!(writer.write_count(), 0);
    }
}
