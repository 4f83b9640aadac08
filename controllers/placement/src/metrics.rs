//! Prometheus Metrics
//!
//! Metrics tracked:
//! - `placement_reconcile_total{result}` - reconciles by outcome
//! - `placement_status_writes_total` - successful status writes
//! - `placement_queue_depth` - items ready in the work queue

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Reconcile outcome labels.
pub mod result {
    /// Reconcile finished, nothing further to do
    pub const SUCCESS: &str = "success";
    /// Reconcile finished with a scheduled follow-up
    pub const REQUEUE: &str = "requeue";
    /// Status write conflicted
    pub const CONFLICT: &str = "conflict";
    /// Transient failure, retried with backoff
    pub const ERROR: &str = "error";
    /// Reconcile panicked
    pub const PANIC: &str = "panic";
}

/// Controller metrics on a private registry.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    reconciles: IntCounterVec,
    status_writes: IntCounter,
    queue_depth: IntGauge,
}

impl Metrics {
    /// Creates and registers every metric.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let reconciles = IntCounterVec::new(
            Opts::new("placement_reconcile_total", "Placement reconciles by result"),
            &["result"],
        )?;
        let status_writes = IntCounter::new(
            "placement_status_writes_total",
            "Placement status updates written to the API server",
        )?;
        let queue_depth = IntGauge::new(
            "placement_queue_depth",
            "Placement keys ready in the work queue",
        )?;

        registry.register(Box::new(reconciles.clone()))?;
        registry.register(Box::new(status_writes.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;

        Ok(Self {
            registry,
            reconciles,
            status_writes,
            queue_depth,
        })
    }

    /// Counts one reconcile with the given outcome.
    pub fn record_reconcile(&self, result: &str) {
        self.reconciles.with_label_values(&[result]).inc();
    }

    /// Counts one status write.
    pub fn record_status_write(&self) {
        self.status_writes.inc();
    }

    /// Publishes the current queue depth.
    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.set(i64::try_from(depth).unwrap_or(i64::MAX));
    }

    /// Reconciles counted so far with `result`.
    #[cfg(test)]
    pub fn reconcile_count(&self, result: &str) -> u64 {
        self.reconciles.with_label_values(&[result]).get()
    }

    /// Status writes counted so far.
    #[cfg(test)]
    pub fn status_write_count(&self) -> u64 {
        self.status_writes.get()
    }

    /// Renders the registry in the Prometheus text format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_recorded_values() {
        let metrics = Metrics::new().unwrap();
        metrics.record_reconcile(result::SUCCESS);
        metrics.record_reconcile(result::SUCCESS);
        metrics.record_status_write();
        metrics.set_queue_depth(3);

        let text = metrics.render().unwrap();
        assert!(text.contains(r#"placement_reconcile_total{result="success"} 2"#));
        assert!(text.contains("placement_status_writes_total 1"));
        assert!(text.contains("placement_queue_depth 3"));
        assert_eq!(metrics.reconcile_count(result::SUCCESS), 2);
        assert_eq!(metrics.status_write_count(), 1);
    }
}
