//! Error types for Authgate
//!
//! Every failure inside the handshake, the session manager and the CSRF
//! guard is an `AuthError`. Storage adapters report `AdapterError`, which the
//! core wraps without losing the not-found / I/O distinction.

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Errors reported by a storage adapter
#[derive(Debug, Error)]
pub enum AdapterError {
    /// The requested row does not exist
    #[error("{0} not found")]
    NotFound(&'static str),

    /// The input was rejected by the backend (duplicate key, bad reference)
    #[error("Validation error: {0}")]
    Validation(String),

    /// A conditional write found the row changed since it was read
    #[error("{0} changed concurrently")]
    Conflict(&'static str),

    /// The backend does not support this capability
    #[error("{0} is not implemented by this adapter")]
    Unimplemented(&'static str),

    /// The call did not finish within the configured adapter timeout
    #[error("{0} timed out")]
    Timeout(&'static str),

    /// SQLite error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Any other backend failure
    #[error("Backend error: {0}")]
    Backend(String),
}

impl AdapterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, AdapterError::NotFound(_))
    }
}

/// Authentication error
///
/// Soft failures (see [`AuthError::is_soft`]) describe an anonymous or
/// expired visitor and turn into a redirect to the login route. Everything
/// else is handed to the configured [`ErrorHandler`].
#[derive(Debug, Error)]
pub enum AuthError {
    /// No provider segment in the handshake route (400)
    #[error("missing provider name in request")]
    MissingProviderName,

    /// Provider id is not registered (400)
    #[error("no provider for {0} exists")]
    ProviderNotFound(String),

    /// Malformed handshake input, e.g. a callback without `code` (400)
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Callback state is missing, unknown, expired or already used (400)
    #[error("invalid or already used handshake state")]
    InvalidState,

    /// Provider produced an empty authorization URL (500)
    #[error("an auth URL has not been set")]
    NoAuthUrl,

    /// No session in the request context (403)
    #[error("missing session in context")]
    MissingSession,

    /// No session token on the request
    #[error("missing session cookie")]
    MissingCookie,

    /// Session token does not resolve to a stored session
    #[error("session not found")]
    SessionNotFound,

    /// Session exists but `now >= expires_at`
    #[error("session expired")]
    ExpiredSession,

    /// Authorization code exchange failed (502)
    #[error("token exchange failed: {0}")]
    TokenExchangeFailed(String),

    /// Profile lookup at the identity provider failed (502)
    #[error("upstream profile fetch failed: {0}")]
    UpstreamProfileFetchFailed(String),

    /// Storing the user or account failed (500)
    #[error("user upsert failed: {0}")]
    UserUpsertFailed(String),

    /// No CSRF token submitted (403)
    #[error("csrf token not found in request")]
    CsrfTokenNotFound,

    /// Submitted CSRF token does not match the session (403)
    #[error("csrf token invalid")]
    CsrfTokenInvalid,

    /// Session CSRF sub-record has expired (403)
    #[error("csrf token expired")]
    CsrfTokenExpired,

    /// Adapter does not support a required capability (501)
    #[error("adapter capability not implemented: {0}")]
    AdapterUnimplemented(&'static str),

    /// Any other adapter failure (500, 503 on timeout)
    #[error("Storage error: {0}")]
    Adapter(AdapterError),

    /// Configuration error (500)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server error (500)
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<AdapterError> for AuthError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::Unimplemented(capability) => AuthError::AdapterUnimplemented(capability),
            other => AuthError::Adapter(other),
        }
    }
}

impl From<config::ConfigError> for AuthError {
    fn from(err: config::ConfigError) -> Self {
        AuthError::Config(err.to_string())
    }
}

impl AuthError {
    /// Expected anonymous/expired states that resolve to a login redirect
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            AuthError::MissingCookie | AuthError::SessionNotFound | AuthError::ExpiredSession
        )
    }

    /// Default transport status for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            AuthError::MissingProviderName
            | AuthError::ProviderNotFound(_)
            | AuthError::InvalidRequest(_)
            | AuthError::InvalidState => StatusCode::BAD_REQUEST,
            AuthError::MissingSession
            | AuthError::MissingCookie
            | AuthError::SessionNotFound
            | AuthError::ExpiredSession
            | AuthError::CsrfTokenNotFound
            | AuthError::CsrfTokenInvalid
            | AuthError::CsrfTokenExpired => StatusCode::FORBIDDEN,
            AuthError::TokenExchangeFailed(_) | AuthError::UpstreamProfileFetchFailed(_) => {
                StatusCode::BAD_GATEWAY
            }
            AuthError::AdapterUnimplemented(_) => StatusCode::NOT_IMPLEMENTED,
            AuthError::Adapter(AdapterError::Timeout(_)) => StatusCode::SERVICE_UNAVAILABLE,
            AuthError::NoAuthUrl
            | AuthError::UserUpsertFailed(_)
            | AuthError::Adapter(_)
            | AuthError::Config(_)
            | AuthError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short machine-readable label, used for the JSON body and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            AuthError::MissingProviderName => "missing_provider_name",
            AuthError::ProviderNotFound(_) => "provider_not_found",
            AuthError::InvalidRequest(_) => "invalid_request",
            AuthError::InvalidState => "invalid_state",
            AuthError::NoAuthUrl => "no_auth_url",
            AuthError::MissingSession => "missing_session",
            AuthError::MissingCookie => "missing_cookie",
            AuthError::SessionNotFound => "session_not_found",
            AuthError::ExpiredSession => "expired_session",
            AuthError::TokenExchangeFailed(_) => "token_exchange_failed",
            AuthError::UpstreamProfileFetchFailed(_) => "upstream_profile_fetch_failed",
            AuthError::UserUpsertFailed(_) => "user_upsert_failed",
            AuthError::CsrfTokenNotFound => "csrf_token_not_found",
            AuthError::CsrfTokenInvalid => "csrf_token_invalid",
            AuthError::CsrfTokenExpired => "csrf_token_expired",
            AuthError::AdapterUnimplemented(_) => "adapter_unimplemented",
            AuthError::Adapter(AdapterError::Timeout(_)) => "adapter_timeout",
            AuthError::Adapter(_) => "adapter",
            AuthError::Config(_) => "config",
            AuthError::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for AuthError {
    /// Convert error to HTTP response
    ///
    /// Internal details of storage and configuration failures are not
    /// exposed in the body.
    fn into_response(self) -> Response {
        use axum::Json;

        let status = self.status_code();
        let message = match &self {
            AuthError::Adapter(_) => "Storage error".to_string(),
            AuthError::Config(_) | AuthError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        };

        use crate::metrics::ERRORS_TOTAL;
        ERRORS_TOTAL.with_label_values(&[self.kind()]).inc();

        let body = Json(serde_json::json!({
            "error": message,
            "type": self.kind(),
        }));

        (status, body).into_response()
    }
}

/// The single seam from an internal error to a transport response
pub type ErrorHandler = Arc<dyn Fn(AuthError) -> Response + Send + Sync>;

/// Default error handler: log hard failures and render the error as JSON
pub fn default_error_handler() -> ErrorHandler {
    Arc::new(|error: AuthError| {
        if error.status_code().is_server_error() {
            tracing::error!(error = %error, kind = error.kind(), "Authentication failure");
        } else {
            tracing::warn!(error = %error, kind = error.kind(), "Request rejected");
        }
        error.into_response()
    })
}

/// Result type alias using AuthError
pub type Result<T> = std::result::Result<T, AuthError>;
