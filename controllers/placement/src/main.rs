//! Placement Controller
//!
//! Binds tenant workloads to Locations across kcp logical clusters.
//!
//! For every `Placement` the controller selects the `Location`s matching
//! its location selectors, gated on at least one `Namespace` in the same
//! logical cluster matching its namespace selector, and records the result
//! in the Placement status. Objects of different logical clusters never
//! influence each other.

mod backoff;
mod cache;
mod config;
mod controller;
mod error;
mod indexers;
mod metrics;
mod queue;
mod reconciler;
mod selector;
mod server;
mod status_writer;
mod watcher;

#[cfg(test)]
mod controller_test;
#[cfg(test)]
mod reconciler_test;
#[cfg(test)]
mod test_utils;

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use controller::Controller;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // kube's rustls-tls needs a process-wide crypto provider
    let _ = rustls::crypto::ring::default_provider().install_default();

    info!("Starting Placement Controller");

    // Load configuration from environment variables
    let config = ControllerConfig::from_env()?;

    info!("Configuration:");
    info!("  Server URL: {}", config.base_url.as_deref().unwrap_or("from kubeconfig"));
    info!("  Workers: {}", config.workers);
    info!("  Resync period: {:?}", config.resync_period);
    info!("  Metrics address: {}", config.metrics_addr);
    info!(
        "  Kubeconfig cluster/user: {}/{}",
        config.kubeconfig_cluster.as_deref().unwrap_or("current"),
        config.kubeconfig_user.as_deref().unwrap_or("current")
    );

    // Initialize and run controller
    let controller = Controller::new(config).await?;
    controller.run().await?;

    Ok(())
}
