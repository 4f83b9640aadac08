//! Unit tests for the worker loop and resync

#[cfg(test)]
mod tests {
    use crate::backoff::ExponentialBackoff;
    use crate::cache::ObjectCache;
    use crate::controller::{process_next_item, resync_all};
    use crate::indexers::PlacementIndexers;
    use crate::metrics::{result, Metrics};
    use crate::queue::WorkQueue;
    use crate::reconciler::{desired_status, Reconciler};
    use crate::status_writer::{StatusWriter, WriteError};
    use crate::test_utils::*;
    use crate::watcher::{EventHandlers, KindHandler};
    use crds::{ClusterKey, LabelSelector, Location, PlacementPhase, PlacementStatus};
    use k8s_openapi::api::core::v1::Namespace;
    use std::sync::Arc;
    use std::time::Duration;

    const RETRY: Duration = Duration::from_secs(3600);

    struct Harness {
        cache: Arc<ObjectCache>,
        queue: Arc<WorkQueue<ClusterKey>>,
        writer: Arc<MockStatusWriter>,
        metrics: Arc<Metrics>,
        reconciler: Reconciler,
        handlers: EventHandlers,
    }

    fn harness() -> Harness {
        let cache = Arc::new(ObjectCache::default());
        let queue = WorkQueue::new(ExponentialBackoff::default());
        let writer = Arc::new(MockStatusWriter::backed_by(Arc::clone(&cache)));
        let metrics = Arc::new(Metrics::new().unwrap());
        let reconciler = Reconciler::new(Arc::clone(&cache), writer.clone(), Arc::clone(&metrics), RETRY);
        let handlers = EventHandlers::new(
            Arc::clone(&cache),
            Arc::new(PlacementIndexers::default()),
            Arc::clone(&queue),
        );
        Harness {
            cache,
            queue,
            writer,
            metrics,
            reconciler,
            handlers,
        }
    }

    impl Harness {
        async fn step(&self) -> bool {
            process_next_item(&self.queue, &self.reconciler, &self.metrics).await
        }

        async fn drain(&self) {
            while !self.queue.is_empty() {
                self.step().await;
            }
        }

        fn status(&self, key: &ClusterKey) -> Option<PlacementStatus> {
            self.cache.placements.get(key).and_then(|p| p.status.clone())
        }
    }

    fn region_placement(cluster: &str, name: &str, region: &str) -> crds::Placement {
        test_placement(
            cluster,
            name,
            &[LabelSelector::from_labels([("region", region)])],
            Some(LabelSelector::from_labels([("team", "a")])),
        )
    }

    #[tokio::test]
    async fn test_success_forgets_key() {
        let h = harness();
        h.handlers.apply(test_location("c1", "l1", &[("region", "us")]));
        h.handlers.apply(test_namespace("c1", "n1", &[("team", "a")]));
        h.handlers.apply(region_placement("c1", "p1", "us"));

        assert!(h.step().await);
        let key = ClusterKey::new("c1", "p1");
        assert_eq!(h.status(&key).unwrap().selected_locations, vec!["l1".to_string()]);
        assert_eq!(h.metrics.reconcile_count(result::SUCCESS), 1);
        assert_eq!(h.queue.num_requeues(&key), 0);
        assert!(h.queue.is_empty());
    }

    #[tokio::test]
    async fn test_conflict_requeues_without_backoff() {
        let h = harness();
        h.handlers.apply(region_placement("c1", "p1", "us"));
        let key = ClusterKey::new("c1", "p1");
        h.writer.fail_next(WriteError::Conflict(key.clone()));

        h.step().await;
        assert_eq!(h.metrics.reconcile_count(result::CONFLICT), 1);
        assert_eq!(h.queue.num_requeues(&key), 0);
        // Ready again immediately
        assert_eq!(h.queue.len(), 1);

        h.step().await;
        assert_eq!(h.status(&key).unwrap().phase, PlacementPhase::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_error_backs_off() {
        let h = harness();
        h.handlers.apply(region_placement("c1", "p1", "us"));
        let key = ClusterKey::new("c1", "p1");
        h.writer.fail_next(WriteError::Transient {
            key: key.clone(),
            message: "connection refused".to_string(),
        });

        h.step().await;
        assert_eq!(h.metrics.reconcile_count(result::ERROR), 1);
        assert_eq!(h.queue.num_requeues(&key), 1);
        assert!(h.queue.is_empty());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.queue.len(), 1);
        h.step().await;
        assert_eq!(h.queue.num_requeues(&key), 0);
        assert!(h.status(&key).is_some());
    }

    #[tokio::test]
    async fn test_invalid_selector_requeues_after_retry_period() {
        let h = harness();
        let placement = test_placement(
            "c1",
            "bad",
            &[LabelSelector::default().with_expression("region", "Near", &["us"])],
            None,
        );
        h.handlers.apply(placement);

        h.step().await;
        assert_eq!(h.metrics.reconcile_count(result::REQUEUE), 1);
        assert_eq!(h.queue.num_requeues(&ClusterKey::new("c1", "bad")), 0);
        assert!(h.queue.is_empty());
    }

    struct PanickingWriter;

    #[async_trait::async_trait]
    impl StatusWriter for PanickingWriter {
        async fn update_status(
            &self,
            _key: &ClusterKey,
            _status: &PlacementStatus,
            _expected_resource_version: Option<&str>,
        ) -> Result<(), WriteError> {
            panic!("writer exploded");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_panic_is_contained() {
        let h = harness();
        let reconciler = Reconciler::new(
            Arc::clone(&h.cache),
            Arc::new(PanickingWriter),
            Arc::clone(&h.metrics),
            RETRY,
        );
        h.handlers.apply(region_placement("c1", "p1", "us"));
        let key = ClusterKey::new("c1", "p1");

        assert!(process_next_item(&h.queue, &reconciler, &h.metrics).await);
        assert_eq!(h.metrics.reconcile_count(result::PANIC), 1);
        assert_eq!(h.queue.num_requeues(&key), 1);

        // The worker keeps serving the key
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(process_next_item(&h.queue, &h.reconciler, &h.metrics).await);
        assert!(h.status(&key).is_some());
    }

    #[tokio::test]
    async fn test_shutdown_stops_worker() {
        let h = harness();
        h.queue.shut_down();
        assert!(!h.step().await);
    }

    #[tokio::test]
    async fn test_resync_enqueues_every_placement() {
        let h = harness();
        h.handlers.apply(region_placement("c1", "p1", "us"));
        h.handlers.apply(region_placement("c2", "p1", "us"));
        h.drain().await;
        let writes = h.writer.write_count();

        assert_eq!(resync_all(&h.cache, &h.queue), 2);
        assert_eq!(h.queue.len(), 2);
        h.drain().await;
        // Nothing changed, so nothing is written
        assert_eq!(h.writer.write_count(), writes);
    }

    #[tokio::test]
    async fn test_churn_converges_to_full_recomputation() {
        let h = harness();
        for cluster in ["c1", "c2"] {
            h.handlers.apply(region_placement(cluster, "us", "us"));
            h.handlers.apply(region_placement(cluster, "eu", "eu"));
            h.handlers.apply(test_placement(
                cluster,
                "any",
                &[LabelSelector::default().with_expression("region", "Exists", &[])],
                Some(LabelSelector::default()),
            ));
        }

        // Label churn interleaved with partial draining
        for round in 0..12u32 {
            let cluster = if round % 2 == 0 { "c1" } else { "c2" };
            let region = if round % 3 == 0 { "us" } else { "eu" };
            h.handlers.apply(test_location(cluster, &format!("l{}", round % 4), &[("region", region)]));
            if round % 4 == 1 {
                h.handlers.apply(test_namespace(cluster, "n1", &[("team", "a")]));
            }
            if round % 5 == 2 {
                KindHandler::<Namespace>::delete(&h.handlers, &ClusterKey::new(cluster, "n1"));
            }
            if round % 6 == 5 {
                KindHandler::<Location>::delete(&h.handlers, &ClusterKey::new(cluster, "l0"));
            }
            h.step().await;
        }
        h.drain().await;

        for key in h.cache.placements.keys() {
            let placement = h.cache.placements.get(&key).unwrap();
            let expected = desired_status(
                &placement,
                &h.cache.locations.list_cluster(&key.cluster),
                &h.cache.namespaces.list_cluster(&key.cluster),
            )
            .unwrap();
            assert_eq!(placement.status.as_ref(), Some(&expected), "placement {key} diverged");
        }
    }
}
