//! Authgate binary entry point
//!
//! Serves the handshake routes in front of a small demo application.

use std::sync::Arc;

use authgate::auth::{AuthSettings, CurrentSession, csrf_guard};
use authgate::data::SqliteAdapter;
use authgate::providers::ProviderRegistry;
use authgate::{AppState, config};
use axum::{
    Json, Router, middleware,
    response::IntoResponse,
    routing::{get, post},
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application entry point
///
/// # Setup
/// 1. Load configuration from file and environment
/// 2. Initialize tracing/logging
/// 3. Initialize metrics
/// 4. Connect storage and register providers
/// 5. Build Axum router
/// 6. Start background tasks (expired session sweep)
/// 7. Start HTTP server
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Load configuration
    let config = config::AppConfig::load()?;

    // 2. Initialize tracing/logging
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.logging.filter_directives().into());

    if config.logging.format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }

    tracing::info!(base_url = %config.server.base_url, "Starting Authgate...");
    if !config.should_use_secure_cookies() {
        tracing::warn!(
            base_url = %config.server.base_url,
            "Using insecure session cookies for local development"
        );
    }

    // 3. Initialize metrics
    authgate::metrics::init_metrics();

    // 4. Storage and providers
    let adapter = SqliteAdapter::connect(&config.database.path).await?;
    let settings = AuthSettings::from_config(&config)?;
    let providers = ProviderRegistry::from_config(&config, settings.state_ttl)?;
    let state = AppState::new(settings, providers, Arc::new(adapter));

    // 5. Build Axum router
    let app = authgate::build_router(state.clone(), demo_routes(&state));

    // 6. Start background tasks
    if config.auth.session_gc_interval_seconds > 0 {
        spawn_session_gc_task(state.clone(), config.auth.session_gc_interval_seconds);
    }

    // 7. Start HTTP server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);
    tracing::info!("Public URL: {}", config.server.base_url);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Routes served behind the session manager
fn demo_routes(state: &AppState) -> Router<AppState> {
    let mutating = Router::new()
        .route("/api/echo", post(echo))
        .route_layer(middleware::from_fn_with_state(state.clone(), csrf_guard));

    Router::new().route("/", get(home)).merge(mutating)
}

async fn home(CurrentSession(context): CurrentSession) -> impl IntoResponse {
    Json(serde_json::json!({
        "session_id": context.session_id,
        "user_id": context.user_id,
        "expires_at": context.session.expires_at,
    }))
}

async fn echo(CurrentSession(context): CurrentSession, body: String) -> impl IntoResponse {
    Json(serde_json::json!({
        "user_id": context.user_id,
        "message": body,
    }))
}

/// Spawn background task removing expired sessions
fn spawn_session_gc_task(state: AppState, interval_secs: u64) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_secs));

        loop {
            interval.tick().await;

            match state.adapter.delete_expired_sessions().await {
                Ok(0) => tracing::debug!("No expired sessions to remove"),
                Ok(removed) => tracing::info!(removed, "Expired sessions removed"),
                Err(e) => tracing::error!(error = %e, "Expired session sweep failed"),
            }
        }
    });

    tracing::info!("Session sweep task spawned");
}
