//! Runtime authentication settings
//!
//! Built once at startup, from [`AuthConfig`](crate::config::AuthConfig) or
//! from defaults, and shared read-only by the handshake routes, the session
//! manager and the CSRF guard.

use std::fmt;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use axum::body::{Body, to_bytes};
use axum::http::{Method, Request, header};
use axum_extra::extract::CookieJar;
use axum_extra::extract::cookie::SameSite;
use chrono::Duration;

use crate::config::AppConfig;
use crate::error::{AuthError, Result};

/// Largest url-encoded body buffered by [`TokenExtractor::Form`]
pub const FORM_BODY_LIMIT: usize = 64 * 1024;

/// Predicate deciding whether a request bypasses a guard
pub type SkipFn = Arc<dyn Fn(&Request<Body>) -> bool + Send + Sync>;

/// Custom token lookup
pub type ExtractFn = Arc<dyn Fn(&Request<Body>) -> Option<String> + Send + Sync>;

// =============================================================================
// Token extraction
// =============================================================================

/// Where a token is read from on an inbound request
#[derive(Clone)]
pub enum TokenExtractor {
    /// Named cookie
    Cookie(String),
    /// Named header; a `Bearer ` prefix is stripped
    Header(String),
    /// Named query parameter
    Query(String),
    /// Named field of a url-encoded form body
    Form(String),
    Custom(ExtractFn),
}

impl fmt::Debug for TokenExtractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenExtractor::Cookie(name) => f.debug_tuple("Cookie").field(name).finish(),
            TokenExtractor::Header(name) => f.debug_tuple("Header").field(name).finish(),
            TokenExtractor::Query(name) => f.debug_tuple("Query").field(name).finish(),
            TokenExtractor::Form(name) => f.debug_tuple("Form").field(name).finish(),
            TokenExtractor::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl TokenExtractor {
    /// Read the token; empty values count as absent
    ///
    /// `Form` buffers the body and puts it back for the handler.
    pub async fn extract(&self, request: &mut Request<Body>) -> Result<Option<String>> {
        let token = match self {
            TokenExtractor::Cookie(name) => CookieJar::from_headers(request.headers())
                .get(name)
                .map(|cookie| cookie.value().to_string()),
            TokenExtractor::Header(name) => request
                .headers()
                .get(name.as_str())
                .and_then(|value| value.to_str().ok())
                .map(|value| value.strip_prefix("Bearer ").unwrap_or(value).trim().to_string()),
            TokenExtractor::Query(name) => request
                .uri()
                .query()
                .and_then(|query| find_pair(query.as_bytes(), name)),
            TokenExtractor::Form(name) => read_form_field(request, name).await?,
            TokenExtractor::Custom(extract) => extract(&*request),
        };

        Ok(token.filter(|token| !token.is_empty()))
    }
}

fn find_pair(encoded: &[u8], name: &str) -> Option<String> {
    url::form_urlencoded::parse(encoded)
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

async fn read_form_field(request: &mut Request<Body>, name: &str) -> Result<Option<String>> {
    let is_form = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("application/x-www-form-urlencoded"));
    if !is_form {
        return Ok(None);
    }

    let body = std::mem::take(request.body_mut());
    let bytes = to_bytes(body, FORM_BODY_LIMIT)
        .await
        .map_err(|e| AuthError::InvalidRequest(format!("unreadable form body: {e}")))?;
    let value = find_pair(&bytes, name);
    *request.body_mut() = Body::from(bytes);
    Ok(value)
}

// =============================================================================
// Settings
// =============================================================================

/// Session cookie attributes
#[derive(Debug, Clone)]
pub struct CookieSettings {
    pub name: String,
    pub same_site: SameSite,
    pub secure: bool,
    pub path: String,
    pub domain: Option<String>,
}

/// Handshake route prefixes
#[derive(Debug, Clone)]
pub struct RouteSettings {
    pub login_url: String,
    pub logout_url: String,
    pub callback_url: String,
    pub after_login_url: String,
}

/// Everything the handshake, session manager and CSRF guard need
#[derive(Clone)]
pub struct AuthSettings {
    pub session_ttl: Duration,
    pub csrf_ttl: Duration,
    pub state_ttl: Duration,
    pub adapter_timeout: StdDuration,
    pub cookie: CookieSettings,
    pub routes: RouteSettings,
    pub session_extractor: TokenExtractor,
    pub protect_skip: Option<SkipFn>,
    /// Header the rotated CSRF token is returned in
    pub csrf_header_name: String,
    pub csrf_extractor: TokenExtractor,
    pub csrf_skip: Option<SkipFn>,
    pub csrf_ignored_methods: Vec<Method>,
}

impl Default for AuthSettings {
    fn default() -> Self {
        let cookie_name = "authgate_session".to_string();
        let csrf_header_name = "X-Csrf-Token".to_string();
        Self {
            session_ttl: Duration::hours(7),
            csrf_ttl: Duration::minutes(30),
            state_ttl: Duration::minutes(10),
            adapter_timeout: StdDuration::from_secs(5),
            cookie: CookieSettings {
                name: cookie_name.clone(),
                same_site: SameSite::Lax,
                secure: true,
                path: "/".to_string(),
                domain: None,
            },
            routes: RouteSettings {
                login_url: "/login".to_string(),
                logout_url: "/logout".to_string(),
                callback_url: "/auth".to_string(),
                after_login_url: "/".to_string(),
            },
            session_extractor: TokenExtractor::Cookie(cookie_name),
            protect_skip: None,
            csrf_extractor: TokenExtractor::Header(csrf_header_name.clone()),
            csrf_header_name,
            csrf_skip: None,
            csrf_ignored_methods: vec![Method::GET, Method::HEAD, Method::OPTIONS, Method::TRACE],
        }
    }
}

impl fmt::Debug for AuthSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSettings")
            .field("session_ttl", &self.session_ttl)
            .field("csrf_ttl", &self.csrf_ttl)
            .field("state_ttl", &self.state_ttl)
            .field("adapter_timeout", &self.adapter_timeout)
            .field("cookie", &self.cookie)
            .field("routes", &self.routes)
            .field("session_extractor", &self.session_extractor)
            .field("csrf_extractor", &self.csrf_extractor)
            .field("csrf_ignored_methods", &self.csrf_ignored_methods)
            .finish_non_exhaustive()
    }
}

impl AuthSettings {
    /// Settings described by a validated [`AppConfig`]
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let auth = &config.auth;
        let same_site = match auth.cookie.same_site.to_ascii_lowercase().as_str() {
            "lax" => SameSite::Lax,
            "strict" => SameSite::Strict,
            "none" => SameSite::None,
            other => {
                return Err(AuthError::Config(format!(
                    "unsupported same_site value: {other}"
                )));
            }
        };

        Ok(Self {
            session_ttl: Duration::seconds(auth.session_ttl_seconds),
            csrf_ttl: Duration::seconds(auth.csrf_ttl_seconds),
            state_ttl: Duration::seconds(auth.state_ttl_seconds),
            adapter_timeout: StdDuration::from_millis(auth.adapter_timeout_ms),
            cookie: CookieSettings {
                name: auth.cookie.name.clone(),
                same_site,
                secure: config.should_use_secure_cookies(),
                path: auth.cookie.path.clone(),
                domain: auth.cookie.domain.clone(),
            },
            routes: RouteSettings {
                login_url: auth.routes.login_url.clone(),
                logout_url: auth.routes.logout_url.clone(),
                callback_url: auth.routes.callback_url.clone(),
                after_login_url: auth.routes.after_login_url.clone(),
            },
            session_extractor: TokenExtractor::Cookie(auth.cookie.name.clone()),
            protect_skip: None,
            csrf_header_name: auth.csrf.header_name.clone(),
            csrf_extractor: TokenExtractor::Header(auth.csrf.header_name.clone()),
            csrf_skip: None,
            csrf_ignored_methods: vec![Method::GET, Method::HEAD, Method::OPTIONS, Method::TRACE],
        })
    }

    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    pub fn with_csrf_ttl(mut self, ttl: Duration) -> Self {
        self.csrf_ttl = ttl;
        self
    }

    pub fn with_adapter_timeout(mut self, timeout: StdDuration) -> Self {
        self.adapter_timeout = timeout;
        self
    }

    /// Rename the session cookie; a cookie extractor follows the new name
    pub fn with_cookie_name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if matches!(self.session_extractor, TokenExtractor::Cookie(_)) {
            self.session_extractor = TokenExtractor::Cookie(name.clone());
        }
        self.cookie.name = name;
        self
    }

    pub fn with_secure_cookie(mut self, secure: bool) -> Self {
        self.cookie.secure = secure;
        self
    }

    pub fn with_same_site(mut self, same_site: SameSite) -> Self {
        self.cookie.same_site = same_site;
        self
    }

    pub fn with_routes(mut self, routes: RouteSettings) -> Self {
        self.routes = routes;
        self
    }

    pub fn with_session_extractor(mut self, extractor: TokenExtractor) -> Self {
        self.session_extractor = extractor;
        self
    }

    /// Requests for which the session manager does nothing
    pub fn with_protect_skip<F>(mut self, skip: F) -> Self
    where
        F: Fn(&Request<Body>) -> bool + Send + Sync + 'static,
    {
        self.protect_skip = Some(Arc::new(skip));
        self
    }

    pub fn with_csrf_extractor(mut self, extractor: TokenExtractor) -> Self {
        self.csrf_extractor = extractor;
        self
    }

    /// Requests for which the CSRF guard does nothing
    pub fn with_csrf_skip<F>(mut self, skip: F) -> Self
    where
        F: Fn(&Request<Body>) -> bool + Send + Sync + 'static,
    {
        self.csrf_skip = Some(Arc::new(skip));
        self
    }

    pub fn with_csrf_ignored_methods(mut self, methods: Vec<Method>) -> Self {
        self.csrf_ignored_methods = methods;
        self
    }

    /// Login, logout and callback routes, which must stay reachable anonymously
    pub fn is_handshake_path(&self, path: &str) -> bool {
        [
            &self.routes.login_url,
            &self.routes.logout_url,
            &self.routes.callback_url,
        ]
        .into_iter()
        .any(|prefix| path_has_prefix(path, prefix))
    }

    pub(crate) fn skips_protection(&self, request: &Request<Body>) -> bool {
        self.is_handshake_path(request.uri().path())
            || self.protect_skip.as_ref().is_some_and(|skip| skip(request))
    }

    pub(crate) fn skips_csrf(&self, request: &Request<Body>) -> bool {
        self.csrf_ignored_methods.contains(request.method())
            || self.csrf_skip.as_ref().is_some_and(|skip| skip(request))
    }
}

/// Segment-aware prefix match: "/login" covers "/login/github", not "/loginx"
fn path_has_prefix(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}
