//! Session manager middleware
//!
//! Protects routes that require a session: resolves the session token,
//! slides the expiry and re-issues the cookie on every validated request.

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
};
use axum_extra::extract::CookieJar;
use chrono::Utc;

use super::session::{AuthContext, clear_session_cookie, resolve_session, session_cookie, slide_session};
use crate::AppState;
use crate::error::{AuthError, Result};
use crate::metrics::SESSION_CHECKS_TOTAL;

/// Resolve and slide the request's session
async fn authenticate(state: &AppState, request: &mut Request<Body>) -> Result<AuthContext> {
    let token = state
        .settings
        .session_extractor
        .extract(request)
        .await?
        .ok_or(AuthError::MissingCookie)?;

    let now = Utc::now();
    let session = resolve_session(state.adapter.as_ref(), &token, now).await?;
    let session = slide_session(state.adapter.as_ref(), session, state.settings.session_ttl, now).await?;

    Ok(AuthContext::new(session))
}

/// Middleware to require a valid session
///
/// Skips the handshake routes and anything the configured skip predicate
/// selects. Anonymous or expired visitors are redirected to the login
/// route; storage failures go to the error handler.
///
/// # Usage
/// ```ignore
/// let protected_routes = Router::new()
///     .route("/api/...", ...)
///     .layer(middleware::from_fn_with_state(state, protect));
/// ```
pub async fn protect(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    if state.settings.skips_protection(&request) {
        return next.run(request).await;
    }

    let context = match authenticate(&state, &mut request).await {
        Ok(context) => context,
        Err(error) if error.is_soft() => {
            SESSION_CHECKS_TOTAL.with_label_values(&[error.kind()]).inc();
            tracing::debug!(
                path = %request.uri().path(),
                reason = error.kind(),
                "No valid session; redirecting to login"
            );
            let jar = match error {
                AuthError::MissingCookie => CookieJar::new(),
                _ => CookieJar::new().add(clear_session_cookie(&state.settings.cookie)),
            };
            return (jar, Redirect::to(&state.settings.routes.login_url)).into_response();
        }
        Err(error) => {
            SESSION_CHECKS_TOTAL.with_label_values(&["error"]).inc();
            return (state.error_handler)(error);
        }
    };

    let cookie = match session_cookie(
        &state.settings.cookie,
        &context.session.session_token,
        context.session.expires_at,
    ) {
        Ok(cookie) => cookie,
        Err(error) => return (state.error_handler)(error),
    };

    SESSION_CHECKS_TOTAL.with_label_values(&["refreshed"]).inc();
    tracing::debug!(session_id = %context.session_id, user_id = %context.user_id, "Session refreshed");

    request.extensions_mut().insert(context);
    let response = next.run(request).await;

    (CookieJar::new().add(cookie), response).into_response()
}
