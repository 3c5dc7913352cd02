//! Prometheus metrics registry and instruments.
//!
//! This module is framework-agnostic and can be used from any layer.

use lazy_static::lazy_static;
use prometheus::{IntCounter, IntCounterVec, Opts, Registry};
use std::sync::Once;

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Handshake Metrics
    pub static ref HANDSHAKES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("authgate_handshakes_total", "OAuth handshake steps by provider, phase and outcome"),
        &["provider", "phase", "outcome"]
    ).expect("metric can be created");

    // Session Metrics
    pub static ref SESSIONS_CREATED_TOTAL: IntCounter = IntCounter::new(
        "authgate_sessions_created_total",
        "Total number of sessions created by a completed handshake"
    ).expect("metric can be created");
    pub static ref SESSION_CHECKS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("authgate_session_checks_total", "Session manager outcomes on protected requests"),
        &["outcome"]
    ).expect("metric can be created");

    // CSRF Metrics
    pub static ref CSRF_CHECKS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("authgate_csrf_checks_total", "CSRF guard outcomes on mutating requests"),
        &["outcome"]
    ).expect("metric can be created");

    // Error Metrics
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("authgate_errors_total", "Total number of errors rendered"),
        &["error_type"]
    ).expect("metric can be created");
}

static INIT: Once = Once::new();

/// Initialize metrics registry.
///
/// Safe to call more than once; only the first call registers.
pub fn init_metrics() {
    INIT.call_once(|| {
        REGISTRY
            .register(Box::new(HANDSHAKES_TOTAL.clone()))
            .expect("HANDSHAKES_TOTAL can be registered");
        REGISTRY
            .register(Box::new(SESSIONS_CREATED_TOTAL.clone()))
            .expect("SESSIONS_CREATED_TOTAL can be registered");
        REGISTRY
            .register(Box::new(SESSION_CHECKS_TOTAL.clone()))
            .expect("SESSION_CHECKS_TOTAL can be registered");
        REGISTRY
            .register(Box::new(CSRF_CHECKS_TOTAL.clone()))
            .expect("CSRF_CHECKS_TOTAL can be registered");
        REGISTRY
            .register(Box::new(ERRORS_TOTAL.clone()))
            .expect("ERRORS_TOTAL can be registered");

        tracing::info!("Metrics registry initialized");
    });
}

/// Record one handshake step
pub fn observe_handshake(provider: &str, phase: &str, outcome: &str) {
    HANDSHAKES_TOTAL
        .with_label_values(&[provider, phase, outcome])
        .inc();
}
