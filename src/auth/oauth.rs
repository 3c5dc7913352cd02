//! Handshake orchestration
//!
//! Drives the two-phase OAuth handshake against a registered provider:
//! BeginAuth issues a state and redirects to the provider, CompleteAuth
//! exchanges the callback for a user and creates the session.

use std::collections::HashMap;

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, Query, State},
    http::Request,
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
};
use axum_extra::extract::CookieJar;
use axum_extra::extract::cookie::{Cookie, SameSite};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use rand::Rng;
use serde::Serialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use super::csrf::{set_csrf_header, verify_csrf};
use super::session::{CurrentSession, clear_session_cookie, resolve_session, session_cookie};
use super::settings::CookieSettings;
use crate::AppState;
use crate::data::{CsrfToken, Session, User};
use crate::error::{AdapterError, AuthError, Result};
use crate::metrics::{SESSIONS_CREATED_TOTAL, observe_handshake};

/// Length of a generated handshake state
pub const STATE_LENGTH: usize = 64;

const STATE_ALPHABET: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";

/// Create authentication router
///
/// Routes (prefixes from the route settings):
/// - GET {login_url} - Login page
/// - GET {login_url}/:provider - Redirect to the provider
/// - GET {callback_url}/:provider/callback - Provider callback
/// - POST {logout_url} - Logout
pub fn auth_router(state: &AppState) -> Router<AppState> {
    let routes = &state.settings.routes;
    let login = routes.login_url.trim_end_matches('/');
    let callback = routes.callback_url.trim_end_matches('/');

    Router::new()
        .route(if login.is_empty() { "/" } else { login }, get(login_page))
        .route(&format!("{login}/:provider"), get(begin_handler))
        .route(&format!("{callback}/:provider/callback"), get(callback_handler))
        .route(&routes.logout_url, post(logout))
}

// =============================================================================
// Orchestration
// =============================================================================

/// A fresh 64-character state drawn from the base64url alphabet
pub fn generate_state() -> String {
    let mut rng = rand::rngs::OsRng;
    (0..STATE_LENGTH)
        .map(|_| STATE_ALPHABET[rng.gen_range(0..STATE_ALPHABET.len())] as char)
        .collect()
}

/// Where BeginAuth sends the visitor, and the state it bound
#[derive(Debug, Clone)]
pub struct AuthRedirect {
    pub url: String,
    pub state: String,
}

/// BeginAuth: the provider URL to redirect the visitor to
///
/// A `state` carried by the request is reused; otherwise a new one is
/// generated for this attempt.
pub async fn begin_auth(
    state: &AppState,
    provider_id: &str,
    params: &HashMap<String, String>,
) -> Result<AuthRedirect> {
    if provider_id.is_empty() {
        return Err(AuthError::MissingProviderName);
    }
    let provider = state.providers.get(provider_id)?;

    let nonce = params
        .get("state")
        .filter(|value| !value.is_empty())
        .cloned()
        .unwrap_or_else(generate_state);

    let url = provider.begin_auth(state.adapter.as_ref(), &nonce).await?;
    if url.is_empty() {
        return Err(AuthError::NoAuthUrl);
    }
    Ok(AuthRedirect { url, state: nonce })
}

/// CompleteAuth: run the provider's callback and create the session
///
/// Nothing is handed to the client unless the session row exists.
pub async fn complete_auth(
    state: &AppState,
    provider_id: &str,
    params: &HashMap<String, String>,
) -> Result<(User, Session)> {
    if provider_id.is_empty() {
        return Err(AuthError::MissingProviderName);
    }
    let provider = state.providers.get(provider_id)?;

    let user = provider.complete_auth(state.adapter.as_ref(), params).await?;

    let settings = &state.settings;
    let expires_at = Utc::now() + settings.session_ttl;
    let session = state
        .adapter
        .create_session(&user.id, expires_at, CsrfToken::issue(settings.csrf_ttl))
        .await?;

    SESSIONS_CREATED_TOTAL.inc();
    Ok((user, session))
}

// =============================================================================
// Handshake cookie
// =============================================================================

fn handshake_cookie_name(settings: &CookieSettings) -> String {
    format!("{}_handshake", settings.name)
}

fn state_digest(state: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(state.as_bytes()))
}

/// Binds a handshake to the browser that began it
///
/// Holds a digest of the state, never the state itself. Always `Lax`: the
/// provider returns the visitor with a top-level cross-site GET.
pub fn handshake_cookie(
    settings: &CookieSettings,
    state: &str,
    ttl: chrono::Duration,
) -> Cookie<'static> {
    let mut cookie = Cookie::build((handshake_cookie_name(settings), state_digest(state)))
        .path(settings.path.clone())
        .http_only(true)
        .secure(settings.secure)
        .same_site(SameSite::Lax)
        .max_age(time::Duration::seconds(ttl.num_seconds()))
        .build();
    if let Some(domain) = &settings.domain {
        cookie.set_domain(domain.clone());
    }
    cookie
}

fn clear_handshake_cookie(settings: &CookieSettings) -> Cookie<'static> {
    let mut cookie = handshake_cookie(settings, "", chrono::Duration::zero());
    cookie.make_removal();
    cookie
}

/// The callback's `state` must be the one this browser was sent off with
pub fn verify_handshake(
    jar: &CookieJar,
    settings: &CookieSettings,
    params: &HashMap<String, String>,
) -> Result<()> {
    let state = params
        .get("state")
        .filter(|state| !state.is_empty())
        .ok_or(AuthError::InvalidState)?;
    let bound = jar
        .get(&handshake_cookie_name(settings))
        .ok_or(AuthError::InvalidState)?;

    if bool::from(state_digest(state).as_bytes().ct_eq(bound.value().as_bytes())) {
        Ok(())
    } else {
        Err(AuthError::InvalidState)
    }
}

// =============================================================================
// Handlers
// =============================================================================

/// GET {login_url}
///
/// Lists the registered providers.
async fn login_page(State(state): State<AppState>) -> impl IntoResponse {
    let login = state.settings.routes.login_url.trim_end_matches('/');
    let links: String = state
        .providers
        .providers()
        .iter()
        .map(|provider| {
            format!(
                "<li><a href=\"{}/{}\">Sign in with {}</a></li>",
                login,
                html_escape::encode_double_quoted_attribute(provider.id()),
                html_escape::encode_text(provider.name()),
            )
        })
        .collect();

    Html(format!(
        r#"<!DOCTYPE html>
<html>
<head><title>Sign in</title></head>
<body>
    <h1>Sign in</h1>
    <ul>{links}</ul>
</body>
</html>
"#
    ))
}

/// GET {login_url}/:provider
///
/// Sets the handshake cookie and redirects (307) to the provider's
/// authorize URL.
async fn begin_handler(
    State(state): State<AppState>,
    Path(provider_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    jar: CookieJar,
) -> Response {
    match begin_auth(&state, &provider_id, &params).await {
        Ok(redirect) => {
            observe_handshake(&provider_id, "begin", "redirected");
            tracing::info!(provider = %provider_id, "Handshake started");
            let cookie = handshake_cookie(
                &state.settings.cookie,
                &redirect.state,
                state.settings.state_ttl,
            );
            (jar.add(cookie), Redirect::temporary(&redirect.url)).into_response()
        }
        Err(error) => {
            observe_handshake(&provider_id, "begin", error.kind());
            (state.error_handler)(error)
        }
    }
}

/// GET {callback_url}/:provider/callback
///
/// Requires the handshake cookie from BeginAuth, sets the session cookie
/// and redirects (303) to the post-login route.
async fn callback_handler(
    State(state): State<AppState>,
    Path(provider_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    jar: CookieJar,
) -> Response {
    let outcome = match verify_handshake(&jar, &state.settings.cookie, &params) {
        Ok(()) => complete_auth(&state, &provider_id, &params).await,
        Err(error) => Err(error),
    };
    let outcome = outcome.and_then(|(user, session)| {
        let cookie = session_cookie(
            &state.settings.cookie,
            &session.session_token,
            session.expires_at,
        )?;
        Ok((user, cookie))
    });

    match outcome {
        Ok((user, cookie)) => {
            observe_handshake(&provider_id, "complete", "session_created");
            tracing::info!(provider = %provider_id, user_id = %user.id, "Handshake completed");
            let jar = jar
                .add(cookie)
                .add(clear_handshake_cookie(&state.settings.cookie));
            (jar, Redirect::to(&state.settings.routes.after_login_url)).into_response()
        }
        Err(error) => {
            observe_handshake(&provider_id, "complete", error.kind());
            (state.error_handler)(error)
        }
    }
}

/// POST {logout_url}
///
/// Deletes the session, clears the cookie and redirects to login. A live
/// session must present its CSRF token; a stale or missing cookie is just
/// cleared.
async fn logout(State(state): State<AppState>, request: Request<Body>) -> Response {
    match end_session(&state, request).await {
        Ok(()) => (
            CookieJar::new().add(clear_session_cookie(&state.settings.cookie)),
            Redirect::to(&state.settings.routes.login_url),
        )
            .into_response(),
        Err(error) => (state.error_handler)(error),
    }
}

async fn end_session(state: &AppState, mut request: Request<Body>) -> Result<()> {
    let Some(token) = state.settings.session_extractor.extract(&mut request).await? else {
        return Ok(());
    };

    let now = Utc::now();
    let session = match resolve_session(state.adapter.as_ref(), &token, now).await {
        Ok(session) => session,
        Err(error) if error.is_soft() => return Ok(()),
        Err(error) => return Err(error),
    };

    let submitted = state
        .settings
        .csrf_extractor
        .extract(&mut request)
        .await?
        .ok_or(AuthError::CsrfTokenNotFound)?;
    verify_csrf(&session, &submitted, now)?;

    match state.adapter.delete_session(&token).await {
        Ok(()) => tracing::info!(session_id = %session.id, "Session deleted on logout"),
        Err(AdapterError::NotFound(_)) => {}
        Err(error) => return Err(error.into()),
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct SessionResponse {
    session_id: String,
    user_id: String,
    expires_at: chrono::DateTime<Utc>,
    csrf_token: String,
    csrf_expires_at: chrono::DateTime<Utc>,
    user: User,
}

/// GET /session
///
/// Current session with its CSRF token. An expired CSRF sub-record is
/// replaced first, so the returned token is always usable.
pub(crate) async fn session_info(
    State(state): State<AppState>,
    CurrentSession(context): CurrentSession,
) -> Response {
    match load_session_info(&state, context.session).await {
        Ok(body) => {
            let mut response = Json(&body).into_response();
            if let Err(error) =
                set_csrf_header(&mut response, &state.settings.csrf_header_name, &body.csrf_token)
            {
                return (state.error_handler)(error);
            }
            response
        }
        Err(error) => (state.error_handler)(error),
    }
}

async fn load_session_info(state: &AppState, session: Session) -> Result<SessionResponse> {
    let session = if session.csrf.has_expired() {
        let session_token = session.session_token.clone();
        match super::csrf::rotate_csrf(state.adapter.as_ref(), session, state.settings.csrf_ttl)
            .await
        {
            // Another request replaced it first; report the stored one
            Err(AuthError::CsrfTokenInvalid) => state
                .adapter
                .get_session(&session_token)
                .await
                .map_err(|e| match e {
                    AdapterError::NotFound(_) => AuthError::MissingSession,
                    other => other.into(),
                })?,
            other => other?,
        }
    } else {
        session
    };
    let user = state.adapter.get_user(&session.user_id).await?;

    Ok(SessionResponse {
        session_id: session.id,
        user_id: session.user_id,
        expires_at: session.expires_at,
        csrf_token: session.csrf.token,
        csrf_expires_at: session.csrf.expires_at,
        user,
    })
}
