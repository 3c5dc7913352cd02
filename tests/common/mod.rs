//! Common test utilities for E2E tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use authgate::auth::{AuthSettings, CurrentSession, csrf_guard};
use authgate::data::{
    Adapter, AdapterResult, CsrfToken, MemoryAdapter, Session, User, VerificationToken,
};
use authgate::error::AdapterError;
use authgate::providers::{GitHubProvider, ProviderRegistry};
use authgate::{AppState, build_router};
use axum::{
    Form, Json, Router, middleware,
    routing::{get, post},
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::net::TcpListener;

pub const GITHUB_AUTHORIZE_URL: &str = "https://github.com/login/oauth/authorize";

/// Code the mock GitHub token endpoint accepts
pub const GOOD_CODE: &str = "good-code";

/// Test server instance
pub struct TestServer {
    pub addr: String,
    pub state: AppState,
    /// The unbounded backend behind `state.adapter`, for inspection
    pub adapter: Arc<MemoryAdapter>,
    /// Requests that reached the protected handlers
    pub handler_hits: Arc<AtomicUsize>,
    pub client: reqwest::Client,
}

impl TestServer {
    /// Create a new test server instance with default settings
    pub async fn new() -> Self {
        Self::with_settings(AuthSettings::default().with_secure_cookie(false)).await
    }

    /// Create a test server with GitHub pointed at a local mock upstream
    pub async fn with_settings(settings: AuthSettings) -> Self {
        let adapter = Arc::new(MemoryAdapter::new());
        Self::with_backend(settings, adapter.clone(), adapter).await
    }

    /// Create a test server whose adapter fails `operation` with a backend error
    pub async fn with_failing(operation: &'static str) -> Self {
        let adapter = Arc::new(MemoryAdapter::new());
        let failing = Arc::new(FailingAdapter {
            inner: adapter.clone(),
            operation,
        });
        Self::with_backend(
            AuthSettings::default().with_secure_cookie(false),
            failing,
            adapter,
        )
        .await
    }

    async fn with_backend(
        settings: AuthSettings,
        backend: Arc<dyn Adapter>,
        adapter: Arc<MemoryAdapter>,
    ) -> Self {
        let upstream = spawn_mock_github().await;

        let github = GitHubProvider::new(
            "test-client-id",
            "test-client-secret",
            "http://localhost/auth/github/callback",
            reqwest::Client::new(),
        )
        .with_endpoints(
            GITHUB_AUTHORIZE_URL,
            format!("{upstream}/login/oauth/access_token"),
            format!("{upstream}/user"),
            format!("{upstream}/user/emails"),
        );
        let providers = ProviderRegistry::new().with(github);

        let state = AppState::new(settings, providers, backend);
        let handler_hits = Arc::new(AtomicUsize::new(0));

        // Bind to random port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let addr_str = format!("http://{}", addr);

        let app = build_router(state.clone(), test_routes(&state, handler_hits.clone()));

        // Spawn server in background
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        // Never follow redirects; tests assert on them
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap();

        Self {
            addr: addr_str,
            state,
            adapter,
            handler_hits,
            client,
        }
    }

    /// Get base URL for requests
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    /// Store a user with a session expiring at `expires_at`
    pub async fn seed_session(&self, expires_at: DateTime<Utc>) -> Session {
        let user = self
            .adapter
            .create_user(User::new("Test User", "testuser@example.com"))
            .await
            .unwrap();

        self.adapter
            .create_session(&user.id, expires_at, CsrfToken::issue(Duration::minutes(30)))
            .await
            .unwrap()
    }

    /// `Cookie` header value carrying a session token
    pub fn session_cookie(&self, token: &str) -> String {
        format!("{}={}", self.state.settings.cookie.name, token)
    }

    pub fn hits(&self) -> usize {
        self.handler_hits.load(Ordering::SeqCst)
    }
}

/// Value of the named cookie in a response's `Set-Cookie` headers
pub fn set_cookie_value(response: &reqwest::Response, name: &str) -> Option<String> {
    let prefix = format!("{name}=");
    response
        .headers()
        .get_all("set-cookie")
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find_map(|value| {
            value
                .strip_prefix(&prefix)
                .map(|rest| rest.split(';').next().unwrap_or_default().to_string())
        })
}

/// `Cookie` header value replaying the handshake cookie set by BeginAuth
pub fn handshake_cookie(response: &reqwest::Response) -> String {
    let name = "authgate_session_handshake";
    let value = set_cookie_value(response, name).expect("handshake cookie");
    format!("{name}={value}")
}

pub fn location(response: &reqwest::Response) -> String {
    response
        .headers()
        .get("location")
        .and_then(|value| value.to_str().ok())
        .expect("location header")
        .to_string()
}

/// Query parameter of an absolute URL
pub fn query_param(url: &str, name: &str) -> Option<String> {
    url::Url::parse(url)
        .ok()?
        .query_pairs()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

/// Routes behind the session manager
fn test_routes(state: &AppState, hits: Arc<AtomicUsize>) -> Router<AppState> {
    let echo_hits = hits.clone();
    let mutating = Router::new()
        .route(
            "/api/echo",
            post(move |CurrentSession(context): CurrentSession, body: String| {
                let hits = echo_hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Json(serde_json::json!({ "user_id": context.user_id, "message": body }))
                }
            })
            .get(|| async { "read only" }),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), csrf_guard));

    Router::new()
        .route(
            "/",
            get(move |CurrentSession(context): CurrentSession| {
                let hits = hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Json(serde_json::json!({
                        "user_id": context.user_id,
                        "expires_at": context.session.expires_at,
                    }))
                }
            }),
        )
        .merge(mutating)
}

// =============================================================================
// Failing adapter
// =============================================================================

/// Delegates to a memory adapter, except that one operation reports an
/// I/O-class backend failure
pub struct FailingAdapter {
    inner: Arc<MemoryAdapter>,
    operation: &'static str,
}

impl FailingAdapter {
    fn check(&self, operation: &'static str) -> AdapterResult<()> {
        if self.operation == operation {
            return Err(AdapterError::Backend(format!("{operation}: disk I/O error")));
        }
        Ok(())
    }
}

#[async_trait]
impl Adapter for FailingAdapter {
    async fn create_user(&self, user: User) -> AdapterResult<User> {
        self.check("create_user")?;
        self.inner.create_user(user).await
    }

    async fn get_user(&self, id: &str) -> AdapterResult<User> {
        self.check("get_user")?;
        self.inner.get_user(id).await
    }

    async fn get_user_by_email(&self, email: &str) -> AdapterResult<User> {
        self.check("get_user_by_email")?;
        self.inner.get_user_by_email(email).await
    }

    async fn get_user_by_account(
        &self,
        provider: &str,
        provider_account_id: &str,
    ) -> AdapterResult<User> {
        self.check("get_user_by_account")?;
        self.inner
            .get_user_by_account(provider, provider_account_id)
            .await
    }

    async fn update_user(&self, user: User) -> AdapterResult<User> {
        self.check("update_user")?;
        self.inner.update_user(user).await
    }

    async fn delete_user(&self, id: &str) -> AdapterResult<()> {
        self.check("delete_user")?;
        self.inner.delete_user(id).await
    }

    async fn link_account(&self, account_id: &str, user_id: &str) -> AdapterResult<()> {
        self.check("link_account")?;
        self.inner.link_account(account_id, user_id).await
    }

    async fn unlink_account(&self, account_id: &str, user_id: &str) -> AdapterResult<()> {
        self.check("unlink_account")?;
        self.inner.unlink_account(account_id, user_id).await
    }

    async fn create_session(
        &self,
        user_id: &str,
        expires_at: DateTime<Utc>,
        csrf: CsrfToken,
    ) -> AdapterResult<Session> {
        self.check("create_session")?;
        self.inner.create_session(user_id, expires_at, csrf).await
    }

    async fn get_session(&self, session_token: &str) -> AdapterResult<Session> {
        self.check("get_session")?;
        self.inner.get_session(session_token).await
    }

    async fn update_session(&self, session: Session) -> AdapterResult<Session> {
        self.check("update_session")?;
        self.inner.update_session(session).await
    }

    async fn refresh_session(&self, session: Session) -> AdapterResult<Session> {
        self.check("refresh_session")?;
        self.inner.refresh_session(session).await
    }

    async fn swap_session_csrf(
        &self,
        session_token: &str,
        expected: &str,
        next: CsrfToken,
    ) -> AdapterResult<Session> {
        self.check("swap_session_csrf")?;
        self.inner
            .swap_session_csrf(session_token, expected, next)
            .await
    }

    async fn delete_session(&self, session_token: &str) -> AdapterResult<()> {
        self.check("delete_session")?;
        self.inner.delete_session(session_token).await
    }

    async fn delete_expired_sessions(&self) -> AdapterResult<u64> {
        self.check("delete_expired_sessions")?;
        self.inner.delete_expired_sessions().await
    }

    async fn create_verification_token(
        &self,
        token: VerificationToken,
    ) -> AdapterResult<VerificationToken> {
        self.check("create_verification_token")?;
        self.inner.create_verification_token(token).await
    }

    async fn use_verification_token(
        &self,
        identifier: &str,
        token: &str,
    ) -> AdapterResult<VerificationToken> {
        self.check("use_verification_token")?;
        self.inner.use_verification_token(identifier, token).await
    }
}

// =============================================================================
// Mock GitHub upstream
// =============================================================================

/// Serve the token, profile and emails endpoints; returns the base URL
async fn spawn_mock_github() -> String {
    let app = Router::new()
        .route("/login/oauth/access_token", post(mock_token))
        .route("/user", get(mock_user))
        .route("/user/emails", get(mock_emails));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

async fn mock_token(Form(form): Form<HashMap<String, String>>) -> Json<serde_json::Value> {
    if form.get("code").map(String::as_str) == Some(GOOD_CODE) {
        Json(serde_json::json!({
            "access_token": "gho_test_token",
            "token_type": "bearer",
            "scope": "read:user,user:email",
        }))
    } else {
        Json(serde_json::json!({
            "error": "bad_verification_code",
            "error_description": "The code passed is incorrect or expired.",
        }))
    }
}

async fn mock_user() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "id": 583231,
        "login": "octocat",
        "name": "The Octocat",
        "email": null,
        "avatar_url": "https://avatars.githubusercontent.com/u/583231",
    }))
}

async fn mock_emails() -> Json<serde_json::Value> {
    Json(serde_json::json!([
        { "email": "octocat@users.noreply.github.com", "primary": false, "verified": true },
        { "email": "octocat@github.com", "primary": true, "verified": true },
    ]))
}
