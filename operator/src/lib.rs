pub use common::{Error, Result};

pub mod convergence;
pub mod desired;
pub mod finalize;
pub mod handlers;
pub mod prune;
pub mod status;

/// Reconcile entry point and error policy
pub mod nodefeaturediscovery;

/// State machinery for kube, as exposeable to actix
pub mod manager;
pub use manager::{Context, Manager};

/// Generated type, for crdgen
pub use common::NodeFeatureDiscovery;

/// Metrics
mod metrics;
pub use metrics::Metrics;
