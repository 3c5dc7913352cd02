//! Authgate - OAuth sign-in, sliding sessions and CSRF protection for axum
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Handshake routes (Axum)                    │
//! │  - Login page, begin, callback, logout                       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │               Session manager / CSRF guard                   │
//! │  - Sliding expiry, cookie re-issue                           │
//! │  - Single-use CSRF tokens                                    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌──────────────────────────────┬──────────────────────────────┐
//! │         Providers            │        Storage adapter       │
//! │  - GitHub, Microsoft Entra   │  - SQLite (sqlx), in-memory  │
//! └──────────────────────────────┴──────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `auth`: Handshake orchestration, session manager and CSRF guard
//! - `providers`: Provider contract, registry and built-in providers
//! - `data`: Adapter contract, models and backends
//! - `api`: Metrics endpoint
//! - `config`: Configuration management
//! - `error`: Error types

pub mod api;
pub mod auth;
pub mod config;
pub mod data;
pub mod error;
pub mod metrics;
pub mod providers;

use std::sync::Arc;

use axum::{Router, middleware, routing::get};

use auth::AuthSettings;
use data::{Adapter, BoundedAdapter};
use error::{ErrorHandler, default_error_handler};
use providers::ProviderRegistry;

/// Application state shared across all handlers
///
/// Built once at startup and read-only afterwards; cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    /// Session, CSRF and route settings
    pub settings: Arc<AuthSettings>,

    /// Registered identity providers
    pub providers: Arc<ProviderRegistry>,

    /// Storage adapter, bounded by `settings.adapter_timeout`
    pub adapter: Arc<dyn Adapter>,

    /// Maps every hard failure to a response
    pub error_handler: ErrorHandler,
}

impl AppState {
    /// Initialize application state
    ///
    /// Every adapter call made through the state is bounded by
    /// `settings.adapter_timeout`.
    pub fn new(
        settings: AuthSettings,
        providers: ProviderRegistry,
        adapter: Arc<dyn Adapter>,
    ) -> Self {
        if providers.is_empty() {
            tracing::warn!("No identity providers registered; sign-in is unavailable");
        }

        let adapter: Arc<dyn Adapter> =
            Arc::new(BoundedAdapter::new(adapter, settings.adapter_timeout));

        Self {
            settings: Arc::new(settings),
            providers: Arc::new(providers),
            adapter,
            error_handler: default_error_handler(),
        }
    }

    /// Replace the error handler
    pub fn with_error_handler(mut self, handler: ErrorHandler) -> Self {
        self.error_handler = handler;
        self
    }
}

/// Build the Axum router
///
/// `app_routes` (plus `/session`) sit behind the session manager; the
/// handshake routes and `/metrics` stay public.
pub fn build_router(state: AppState, app_routes: Router<AppState>) -> Router {
    use tower_http::trace::TraceLayer;

    let protected = app_routes
        .route("/session", get(auth::session_info))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::protect));

    Router::new()
        .route("/health", get(health_check))
        .merge(auth::auth_router(&state))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
        .merge(api::metrics_router())
}

async fn health_check() -> &'static str {
    "OK"
}
