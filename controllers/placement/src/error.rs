//! Controller-specific error types.
//!
//! This module defines the error taxonomy of the Placement Controller.
//! Reconcile errors never escape the worker loop; they are mapped onto
//! queue actions there.

use crds::ClusterKey;
use kube::Error as KubeError;
use thiserror::Error;

/// Errors that can stop the Placement Controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Config could not be inferred from the environment
    #[error("Kubeconfig error: {0}")]
    KubeConfig(#[from] kube::config::InferConfigError),

    /// Kubeconfig file could not be read or lacks the requested entries
    #[error("Kubeconfig error: {0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Listener or socket error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of a single reconcile.
///
/// A missing Placement and a malformed selector are not errors: the first
/// is a stale key, the second is reported on the Placement status.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Status write raced with another writer
    #[error("conflict updating placement {0}")]
    Conflict(ClusterKey),

    /// API server or network unavailable
    #[error("transient failure reconciling placement {key}: {message}")]
    Transient {
        /// Placement being reconciled
        key: ClusterKey,
        /// Underlying failure
        message: String,
    },
}
