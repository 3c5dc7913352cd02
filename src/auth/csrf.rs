//! CSRF guard
//!
//! Binds a single-use token to the active session. Every successful check
//! replaces the token; the new value is returned in the CSRF response
//! header for the client's next mutating request.

use axum::{
    body::Body,
    extract::State,
    middleware::Next,
    response::Response,
};
use chrono::{DateTime, Utc};
use http::{HeaderName, HeaderValue, Request};

use super::session::AuthContext;
use crate::AppState;
use crate::data::{Adapter, CsrfToken, Session};
use crate::error::{AdapterError, AuthError, Result};
use crate::metrics::CSRF_CHECKS_TOTAL;

/// Check a submitted token against the session's CSRF sub-record
pub fn verify_csrf(session: &Session, submitted: &str, now: DateTime<Utc>) -> Result<()> {
    if session.csrf.has_expired_at(now) {
        return Err(AuthError::CsrfTokenExpired);
    }
    if !session.csrf.matches(submitted) {
        return Err(AuthError::CsrfTokenInvalid);
    }
    Ok(())
}

/// Replace the session's CSRF token and persist it
///
/// The swap only succeeds while the stored token is still the one on
/// `session`. A request that loses the race gets `CsrfTokenInvalid`, so a
/// token is accepted at most once.
pub async fn rotate_csrf(
    adapter: &dyn Adapter,
    session: Session,
    ttl: chrono::Duration,
) -> Result<Session> {
    match adapter
        .swap_session_csrf(&session.session_token, &session.csrf.token, CsrfToken::issue(ttl))
        .await
    {
        Ok(session) => Ok(session),
        Err(AdapterError::NotFound(_)) => Err(AuthError::MissingSession),
        Err(AdapterError::Conflict(_)) => Err(AuthError::CsrfTokenInvalid),
        Err(e) => Err(e.into()),
    }
}

/// Attach `token` to a response under the configured header
pub(crate) fn set_csrf_header(response: &mut Response, header_name: &str, token: &str) -> Result<()> {
    let name = HeaderName::try_from(header_name)
        .map_err(|e| AuthError::Config(format!("invalid CSRF header name: {e}")))?;
    let value = HeaderValue::from_str(token).map_err(|e| AuthError::Internal(e.into()))?;
    response.headers_mut().insert(name, value);
    Ok(())
}

async fn check(state: &AppState, request: &mut Request<Body>) -> Result<AuthContext> {
    let context = request
        .extensions()
        .get::<AuthContext>()
        .cloned()
        .ok_or(AuthError::MissingSession)?;

    let submitted = state
        .settings
        .csrf_extractor
        .extract(request)
        .await?
        .ok_or(AuthError::CsrfTokenNotFound)?;

    verify_csrf(&context.session, &submitted, Utc::now())?;

    let session = rotate_csrf(state.adapter.as_ref(), context.session, state.settings.csrf_ttl).await?;
    Ok(AuthContext::new(session))
}

/// Middleware enforcing the CSRF token on state-mutating requests
///
/// Must run inside [`protect`](super::protect). Ignored methods and the
/// skip predicate are evaluated before anything else, so read-only requests
/// need neither a session nor a token.
///
/// # Usage
/// ```ignore
/// let mutating_routes = Router::new()
///     .route("/api/...", post(...))
///     .route_layer(middleware::from_fn_with_state(state, csrf_guard));
/// ```
pub async fn csrf_guard(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    if state.settings.skips_csrf(&request) {
        return next.run(request).await;
    }

    let context = match check(&state, &mut request).await {
        Ok(context) => context,
        Err(error) => {
            CSRF_CHECKS_TOTAL.with_label_values(&[error.kind()]).inc();
            return (state.error_handler)(error);
        }
    };

    CSRF_CHECKS_TOTAL.with_label_values(&["rotated"]).inc();
    tracing::debug!(session_id = %context.session_id, "CSRF token accepted and rotated");

    let token = context.session.csrf.token.clone();
    request.extensions_mut().insert(context);

    let mut response = next.run(request).await;
    if let Err(error) = set_csrf_header(&mut response, &state.settings.csrf_header_name, &token) {
        return (state.error_handler)(error);
    }
    response
}
