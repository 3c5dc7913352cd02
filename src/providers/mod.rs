//! Identity providers
//!
//! A provider implements the two-phase handshake against one external
//! identity source. Providers are collected into a [`ProviderRegistry`]
//! once at startup and shared read-only afterwards.

mod entraid;
mod github;
mod oauth2;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::AppConfig;
use crate::data::{Adapter, User};
use crate::error::{AuthError, Result};

pub use entraid::{EntraIdProvider, EntraIdTenant};
pub use github::GitHubProvider;
pub use oauth2::{
    DEFAULT_STATE_TTL_SECONDS, OAuth2Config, TokenResponse, consume_state, require_code,
    state_identifier,
};

/// Timeout applied to every upstream provider call
pub const PROVIDER_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Kind of handshake a provider performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    OAuth2,
    Oidc,
    Saml,
    Email,
    WebAuthn,
}

impl ProviderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderType::OAuth2 => "oauth2",
            ProviderType::Oidc => "oidc",
            ProviderType::Saml => "saml",
            ProviderType::Email => "email",
            ProviderType::WebAuthn => "webauthn",
        }
    }
}

/// Read access to the parameters of a callback request
///
/// Keeps providers independent of the transport.
pub trait AuthParams: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
}

impl AuthParams for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, key).cloned()
    }
}

/// One pluggable identity source
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable identifier used in routes, e.g. "github"
    fn id(&self) -> &str;

    /// Human-readable name for the login page
    fn name(&self) -> &str;

    fn provider_type(&self) -> ProviderType;

    /// Prepare the handshake for `state` and return the URL to redirect to
    async fn begin_auth(&self, adapter: &dyn Adapter, state: &str) -> Result<String>;

    /// Finish the handshake: exchange the code, fetch the profile and upsert
    /// the user with its account
    async fn complete_auth(&self, adapter: &dyn Adapter, params: &dyn AuthParams) -> Result<User>;
}

/// Providers keyed by id
///
/// Built once before serving; [`ProviderRegistry::get`] is the only lookup
/// used on the request path.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a provider; a provider with the same id is replaced
    pub fn register<P>(&mut self, provider: P)
    where
        P: Provider + 'static,
    {
        let id = provider.id().to_string();
        if self.providers.insert(id.clone(), Arc::new(provider)).is_some() {
            tracing::warn!(provider = %id, "Provider registered twice; keeping the latest");
        } else {
            tracing::info!(provider = %id, "Provider registered");
        }
    }

    /// Builder form of [`ProviderRegistry::register`]
    pub fn with<P>(mut self, provider: P) -> Self
    where
        P: Provider + 'static,
    {
        self.register(provider);
        self
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn Provider>> {
        self.providers
            .get(id)
            .cloned()
            .ok_or_else(|| AuthError::ProviderNotFound(id.to_string()))
    }

    /// Registered providers ordered by id
    pub fn providers(&self) -> Vec<Arc<dyn Provider>> {
        let mut providers: Vec<_> = self.providers.values().cloned().collect();
        providers.sort_by(|a, b| a.id().cmp(b.id()));
        providers
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Built-in providers for every `[providers.*]` section of the config
    pub fn from_config(config: &AppConfig, state_ttl: chrono::Duration) -> Result<Self> {
        let mut registry = Self::new();
        let sections = &config.providers;
        if sections.github.is_none() && sections.entraid.is_none() {
            return Ok(registry);
        }

        let http = default_http_client()?;

        if let Some(github) = &sections.github {
            let mut provider = GitHubProvider::new(
                &github.client_id,
                &github.client_secret,
                config.redirect_url("github"),
                http.clone(),
            )
            .with_state_ttl(state_ttl);
            if !github.scopes.is_empty() {
                provider = provider.with_scopes(github.scopes.iter().cloned());
            }
            registry.register(provider);
        }

        if let Some(entraid) = &sections.entraid {
            let mut provider = EntraIdProvider::new(
                &entraid.client_id,
                &entraid.client_secret,
                config.redirect_url("entraid"),
                EntraIdTenant::parse(&entraid.tenant),
                http,
            )
            .with_state_ttl(state_ttl);
            if !entraid.scopes.is_empty() {
                provider = provider.with_scopes(entraid.scopes.iter().cloned());
            }
            registry.register(provider);
        }

        Ok(registry)
    }
}

/// HTTP client shared by the built-in providers
pub fn default_http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(concat!("authgate/", env!("CARGO_PKG_VERSION")))
        .timeout(PROVIDER_HTTP_TIMEOUT)
        .build()
        .map_err(|e| AuthError::Internal(e.into()))
}
