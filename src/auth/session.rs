//! Server-side sessions
//!
//! Sessions live in the storage adapter; the client only holds the opaque
//! token in an HTTP-only cookie whose `Expires` follows the sliding expiry.

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::request::Parts,
};
use axum_extra::extract::cookie::Cookie;
use chrono::{DateTime, Duration, Utc};

use super::settings::CookieSettings;
use crate::data::{Adapter, Session};
use crate::error::{AdapterError, AuthError, Result};

/// Session resolved by the session manager for the current request
///
/// Inserted into request extensions by [`protect`](super::protect) and read
/// through [`CurrentSession`].
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub session: Session,
    pub session_id: String,
    pub user_id: String,
}

impl AuthContext {
    pub fn new(session: Session) -> Self {
        Self {
            session_id: session.id.clone(),
            user_id: session.user_id.clone(),
            session,
        }
    }
}

/// Extractor for the current session
///
/// Use in handlers behind the session manager.
///
/// # Usage
/// ```ignore
/// async fn handler(CurrentSession(context): CurrentSession) -> impl IntoResponse {
///     format!("Hello, {}", context.user_id)
/// }
/// ```
#[derive(Debug, Clone)]
pub struct CurrentSession(pub AuthContext);

#[async_trait]
impl<S> FromRequestParts<S> for CurrentSession
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self> {
        parts
            .extensions
            .get::<AuthContext>()
            .cloned()
            .map(CurrentSession)
            .ok_or(AuthError::MissingSession)
    }
}

/// Optional current session extractor
///
/// Returns None outside the session manager instead of an error.
#[derive(Debug, Clone)]
pub struct MaybeSession(pub Option<AuthContext>);

#[async_trait]
impl<S> FromRequestParts<S> for MaybeSession
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> std::result::Result<Self, Self::Rejection> {
        Ok(MaybeSession(parts.extensions.get::<AuthContext>().cloned()))
    }
}

// =============================================================================
// Cookies
// =============================================================================

/// Session cookie carrying `token` until `expires_at`
pub fn session_cookie(
    settings: &CookieSettings,
    token: &str,
    expires_at: DateTime<Utc>,
) -> Result<Cookie<'static>> {
    let expires = time::OffsetDateTime::from_unix_timestamp(expires_at.timestamp())
        .map_err(|e| AuthError::Internal(e.into()))?;

    let mut cookie = Cookie::build((settings.name.clone(), token.to_string()))
        .path(settings.path.clone())
        .http_only(true)
        .secure(settings.secure)
        .same_site(settings.same_site)
        .expires(expires)
        .build();
    if let Some(domain) = &settings.domain {
        cookie.set_domain(domain.clone());
    }
    Ok(cookie)
}

/// Removal cookie for the session
pub fn clear_session_cookie(settings: &CookieSettings) -> Cookie<'static> {
    let mut cookie = Cookie::build((settings.name.clone(), String::new()))
        .path(settings.path.clone())
        .http_only(true)
        .secure(settings.secure)
        .same_site(settings.same_site)
        .build();
    if let Some(domain) = &settings.domain {
        cookie.set_domain(domain.clone());
    }
    cookie.make_removal();
    cookie
}

// =============================================================================
// Resolution
// =============================================================================

/// Look up a session token and require it to be valid at `now`
///
/// Unknown tokens are `SessionNotFound` and expired sessions
/// `ExpiredSession`, both soft; other adapter failures are hard.
pub async fn resolve_session(
    adapter: &dyn Adapter,
    token: &str,
    now: DateTime<Utc>,
) -> Result<Session> {
    let session = match adapter.get_session(token).await {
        Ok(session) => session,
        Err(AdapterError::NotFound(_)) => return Err(AuthError::SessionNotFound),
        Err(e) => return Err(e.into()),
    };

    if !session.is_valid_at(now) {
        return Err(AuthError::ExpiredSession);
    }
    Ok(session)
}

/// Push the expiry to `now + ttl` in one atomic adapter call
///
/// The adapter keeps the later of the stored and requested expiry, so
/// concurrent slides never move it backwards.
pub async fn slide_session(
    adapter: &dyn Adapter,
    mut session: Session,
    ttl: Duration,
    now: DateTime<Utc>,
) -> Result<Session> {
    session.expires_at = now + ttl;
    match adapter.refresh_session(session).await {
        Ok(session) => Ok(session),
        // Deleted between lookup and refresh, e.g. a concurrent logout
        Err(AdapterError::NotFound(_)) => Err(AuthError::SessionNotFound),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthSettings;
    use crate::data::{CsrfToken, MemoryAdapter, User};
    use axum_extra::extract::cookie::SameSite;

    async fn adapter_with_session(expires_at: DateTime<Utc>) -> (MemoryAdapter, Session) {
        let adapter = MemoryAdapter::new();
        let user = adapter
            .create_user(User::new("Octo Cat", "octocat@github.com"))
            .await
            .unwrap();
        let session = adapter
            .create_session(&user.id, expires_at, CsrfToken::issue(Duration::minutes(30)))
            .await
            .unwrap();
        (adapter, session)
    }

    #[test]
    fn session_cookie_is_http_only_and_expires_with_the_session() {
        let settings = AuthSettings::default().cookie;
        let expires_at = Utc::now() + Duration::hours(7);

        let cookie = session_cookie(&settings, "token", expires_at).unwrap();

        assert_eq!(cookie.name(), "authgate_session");
        assert_eq!(cookie.value(), "token");
        assert_eq!(cookie.http_only(), Some(true));
        assert_eq!(cookie.same_site(), Some(SameSite::Lax));
        assert_eq!(cookie.path(), Some("/"));
        assert_eq!(
            cookie.expires_datetime().map(|t| t.unix_timestamp()),
            Some(expires_at.timestamp())
        );
    }

    #[test]
    fn clear_cookie_is_a_removal() {
        let settings = AuthSettings::default().cookie;
        let cookie = clear_session_cookie(&settings);

        assert_eq!(cookie.value(), "");
        assert!(cookie.expires_datetime().is_some());
    }

    #[tokio::test]
    async fn resolve_rejects_unknown_and_expired_tokens() {
        let now = Utc::now();
        let (adapter, session) = adapter_with_session(now + Duration::hours(1)).await;

        assert!(resolve_session(&adapter, &session.session_token, now).await.is_ok());

        let error = resolve_session(&adapter, "unknown", now).await.unwrap_err();
        assert!(matches!(error, AuthError::SessionNotFound));

        let later = now + Duration::hours(1);
        let error = resolve_session(&adapter, &session.session_token, later)
            .await
            .unwrap_err();
        assert!(matches!(error, AuthError::ExpiredSession));
    }

    #[tokio::test]
    async fn slide_moves_expiry_forward() {
        let now = Utc::now();
        let (adapter, session) = adapter_with_session(now + Duration::minutes(5)).await;

        let slid = slide_session(&adapter, session, Duration::hours(7), now)
            .await
            .unwrap();

        assert_eq!(slid.expires_at, now + Duration::hours(7));
        assert!(slid.is_valid_at(now));
    }

    #[tokio::test]
    async fn slide_of_a_deleted_session_is_soft() {
        let now = Utc::now();
        let (adapter, session) = adapter_with_session(now + Duration::hours(1)).await;
        adapter.delete_session(&session.session_token).await.unwrap();

        let error = slide_session(&adapter, session, Duration::hours(7), now)
            .await
            .unwrap_err();
        assert!(error.is_soft());
    }
}
