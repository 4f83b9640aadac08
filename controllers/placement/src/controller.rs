//! Main controller implementation.
//!
//! This module contains the `Controller` struct that wires the watchers,
//! the work queue and the reconcile workers of the Placement Controller.
//!
//! Startup order:
//! 1. Start the Namespace, Location and Placement watchers (wildcard view)
//! 2. Serve `/metrics`, `/healthz` and `/readyz`
//! 3. Wait until every watcher finished its initial list
//! 4. Start the workers and the periodic resync

use crate::backoff::ExponentialBackoff;
use crate::cache::{ObjectCache, SyncTracker};
use crate::config::{cluster_url, ControllerConfig};
use crate::error::{ControllerError, ReconcileError};
use crate::indexers::PlacementIndexers;
use crate::metrics::{result, Metrics};
use crate::queue::WorkQueue;
use crate::reconciler::{Action, Reconciler};
use crate::server::{self, ServerState};
use crate::status_writer::KubeStatusWriter;
use crate::watcher::{watch_resource, EventHandlers, EventProcessor};
use crds::{ClusterKey, Location, Placement, SCHEDULING_GROUP, WILDCARD_CLUSTER};
use futures::FutureExt;
use k8s_openapi::api::core::v1::Namespace;
use kube::config::Kubeconfig;
use kube::{Api, Client};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

type WatcherHandle = JoinHandle<Result<(), ControllerError>>;

/// Main controller for Placement reconciliation.
pub struct Controller {
    config: ControllerConfig,
    cache: Arc<ObjectCache>,
    queue: Arc<WorkQueue<ClusterKey>>,
    sync: Arc<SyncTracker>,
    metrics: Arc<Metrics>,
    reconciler: Arc<Reconciler>,
    namespace_watcher: WatcherHandle,
    location_watcher: WatcherHandle,
    placement_watcher: WatcherHandle,
}

impl Controller {
    /// Creates a new controller instance and starts its watchers.
    pub async fn new(config: ControllerConfig) -> Result<Self, ControllerError> {
        info!("Initializing Placement Controller");

        let mut kube_config = load_kube_config(&config).await?;
        if let Some(base_url) = &config.base_url {
            kube_config.cluster_url = base_url
                .parse()
                .map_err(|e| ControllerError::InvalidConfig(format!("KCP_BASE_URL {base_url:?}: {e}")))?;
        }

        // Watches go through the wildcard view; writes through per-cluster clients
        let mut wildcard_config = kube_config.clone();
        let wildcard_url = cluster_url(&kube_config.cluster_url.to_string(), WILDCARD_CLUSTER);
        wildcard_config.cluster_url = wildcard_url
            .parse()
            .map_err(|e| ControllerError::InvalidConfig(format!("wildcard URL {wildcard_url:?}: {e}")))?;
        info!(url = %wildcard_url, group = SCHEDULING_GROUP, "Watching all logical clusters");
        let client = Client::try_from(wildcard_config)?;

        let cache = Arc::new(ObjectCache::default());
        let indexers = Arc::new(PlacementIndexers::default());
        let metrics = Arc::new(Metrics::new()?);
        let depth_metrics = Arc::clone(&metrics);
        let queue = WorkQueue::with_depth_observer(
            ExponentialBackoff::default(),
            Box::new(move |depth| depth_metrics.set_queue_depth(depth)),
        );
        let sync = Arc::new(SyncTracker::default());

        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&cache),
            Arc::new(KubeStatusWriter::new(kube_config)),
            Arc::clone(&metrics),
            config.resync_period,
        ));

        let handlers = Arc::new(EventHandlers::new(
            Arc::clone(&cache),
            indexers,
            Arc::clone(&queue),
        ));

        let namespace_watcher = tokio::spawn(watch_resource(
            Api::<Namespace>::all(client.clone()),
            EventProcessor::new("Namespace", Arc::clone(&handlers), Arc::clone(&sync)),
        ));
        let location_watcher = tokio::spawn(watch_resource(
            Api::<Location>::all(client.clone()),
            EventProcessor::new("Location", Arc::clone(&handlers), Arc::clone(&sync)),
        ));
        let placement_watcher = tokio::spawn(watch_resource(
            Api::<Placement>::all(client),
            EventProcessor::new("Placement", handlers, Arc::clone(&sync)),
        ));

        Ok(Self {
            config,
            cache,
            queue,
            sync,
            metrics,
            reconciler,
            namespace_watcher,
            location_watcher,
            placement_watcher,
        })
    }

    /// Runs the controller until shutdown is requested or a watcher exits.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        let listener = tokio::net::TcpListener::bind(self.config.metrics_addr).await?;
        let (stop_server, server_stopped) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(server::serve(
            listener,
            ServerState {
                metrics: Arc::clone(&self.metrics),
                sync: Arc::clone(&self.sync),
            },
            async {
                let _ = server_stopped.await;
            },
        ));

        info!("Waiting for caches to sync");
        let exit = tokio::select! {
            () = self.sync.wait_for_sync() => None,
            _ = tokio::signal::ctrl_c() => Some(Ok(())),
            joined = &mut self.namespace_watcher => Some(Err(watcher_exit("Namespace", joined))),
            joined = &mut self.location_watcher => Some(Err(watcher_exit("Location", joined))),
            joined = &mut self.placement_watcher => Some(Err(watcher_exit("Placement", joined))),
        };

        let mut workers = Vec::new();
        let mut resync = None;
        let outcome = match exit {
            Some(outcome) => outcome,
            None => {
                info!(workers = self.config.workers, "Caches synced, starting workers");
                for id in 0..self.config.workers {
                    workers.push(tokio::spawn(run_worker(
                        id,
                        Arc::clone(&self.queue),
                        Arc::clone(&self.reconciler),
                        Arc::clone(&self.metrics),
                    )));
                }
                resync = Some(tokio::spawn(resync_loop(
                    Arc::clone(&self.cache),
                    Arc::clone(&self.queue),
                    self.config.resync_period,
                )));

                tokio::select! {
                    _ = tokio::signal::ctrl_c() => Ok(()),
                    joined = &mut self.namespace_watcher => Err(watcher_exit("Namespace", joined)),
                    joined = &mut self.location_watcher => Err(watcher_exit("Location", joined)),
                    joined = &mut self.placement_watcher => Err(watcher_exit("Placement", joined)),
                }
            }
        };

        info!("Shutting down Placement Controller");
        self.queue.shut_down();
        if let Some(resync) = resync {
            resync.abort();
        }
        // In-flight reconciles run to completion
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "worker task failed");
            }
        }
        self.namespace_watcher.abort();
        self.location_watcher.abort();
        self.placement_watcher.abort();

        let _ = stop_server.send(());
        match server.await {
            Ok(Err(e)) => warn!(error = %e, "metrics server failed"),
            Err(e) => warn!(error = %e, "metrics server task failed"),
            Ok(Ok(())) => {}
        }

        outcome
    }
}

async fn load_kube_config(config: &ControllerConfig) -> Result<kube::Config, ControllerError> {
    let Some(options) = config.kubeconfig_options() else {
        return Ok(kube::Config::infer().await?);
    };
    info!(
        cluster = ?options.cluster,
        user = ?options.user,
        "Loading kubeconfig with overrides (KUBECONFIG must point at the kcp server)"
    );
    let kubeconfig = Kubeconfig::read()?;
    Ok(kube::Config::from_custom_kubeconfig(kubeconfig, &options).await?)
}

fn watcher_exit(kind: &str, joined: Result<Result<(), ControllerError>, JoinError>) -> ControllerError {
    match joined {
        Ok(Ok(())) => ControllerError::Watch(format!("{kind} watcher exited")),
        Ok(Err(e)) => ControllerError::Watch(format!("{kind} watcher error: {e}")),
        Err(e) => ControllerError::Watch(format!("{kind} watcher panicked: {e}")),
    }
}

async fn run_worker(
    id: usize,
    queue: Arc<WorkQueue<ClusterKey>>,
    reconciler: Arc<Reconciler>,
    metrics: Arc<Metrics>,
) {
    debug!(worker = id, "worker started");
    while process_next_item(&queue, &reconciler, &metrics).await {}
    debug!(worker = id, "worker stopped");
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

/// Takes one key off the queue, reconciles it and settles it.
///
/// Returns false once the queue has shut down. A panicking reconcile is
/// contained here: the key is retried with backoff and the worker survives.
pub(crate) async fn process_next_item(
    queue: &Arc<WorkQueue<ClusterKey>>,
    reconciler: &Reconciler,
    metrics: &Metrics,
) -> bool {
    let Some(key) = queue.get().await else {
        return false;
    };

    let outcome = AssertUnwindSafe(reconciler.reconcile(&key)).catch_unwind().await;
    match outcome {
        Ok(Ok(Action::AwaitChange)) => {
            queue.forget(&key);
            metrics.record_reconcile(result::SUCCESS);
        }
        Ok(Ok(Action::RequeueAfter(delay))) => {
            queue.forget(&key);
            queue.add_after(key.clone(), delay);
            metrics.record_reconcile(result::REQUEUE);
        }
        Ok(Err(ReconcileError::Conflict(_))) => {
            // The watch delivers the newer object; retry right away
            warn!(%key, "status write conflict, requeueing");
            queue.add(key.clone());
            metrics.record_reconcile(result::CONFLICT);
        }
        Ok(Err(e @ ReconcileError::Transient { .. })) => {
            error!(%key, error = %e, retries = queue.num_requeues(&key), "reconcile failed, retrying with backoff");
            queue.add_rate_limited(key.clone());
            metrics.record_reconcile(result::ERROR);
        }
        Err(panic) => {
            error!(%key, panic = panic_message(panic.as_ref()), "reconcile panicked");
            queue.add_rate_limited(key.clone());
            metrics.record_reconcile(result::PANIC);
        }
    }

    queue.done(&key);
    true
}

/// Enqueues every cached Placement. Returns the number enqueued.
pub(crate) fn resync_all(cache: &ObjectCache, queue: &WorkQueue<ClusterKey>) -> usize {
    let keys = cache.placements.keys();
    let count = keys.len();
    for key in keys {
        queue.add(key);
    }
    count
}

async fn resync_loop(cache: Arc<ObjectCache>, queue: Arc<WorkQueue<ClusterKey>>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    // The first tick completes immediately; the initial list already enqueued everything
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if queue.is_shutting_down() {
            break;
        }
        let count = resync_all(&cache, &queue);
        info!(count, "Resync: re-enqueued all placements");
    }
}
