//! API layer
//!
//! HTTP handlers outside the authentication core:
//! - Metrics (Prometheus)

pub mod metrics;

pub use metrics::metrics_router;
