//! Scheduling CRD Definitions
//!
//! Custom Resource Definitions for the placement controller, plus the
//! logical-cluster key types shared by every component that touches the
//! merged multi-tenant view.

pub mod label_selector;
pub mod location;
pub mod logical_cluster;
pub mod placement;

pub use label_selector::*;
pub use location::*;
pub use logical_cluster::*;
pub use placement::*;

/// API group served by the scheduling CRDs.
pub const SCHEDULING_GROUP: &str = "scheduling.kcp.dev";
