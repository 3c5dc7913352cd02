//! Microsoft Entra ID (Azure AD) provider

use std::fmt;

use async_trait::async_trait;
use chrono::Duration;
use serde::Deserialize;

use super::oauth2::{self, DEFAULT_STATE_TTL_SECONDS, OAuth2Config};
use super::{AuthParams, Provider, ProviderType};
use crate::data::{Account, AccountType, Adapter, User};
use crate::error::{AuthError, Result};

const AUTHORITY: &str = "https://login.microsoftonline.com";
const PROFILE_URL: &str = "https://graph.microsoft.com/v1.0/me";

const DEFAULT_SCOPES: [&str; 4] = ["openid", "profile", "email", "User.Read"];

/// Which directories may sign in
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntraIdTenant {
    /// Work, school and personal accounts
    Common,
    /// Work and school accounts only
    Organizations,
    /// Personal Microsoft accounts only
    Consumers,
    /// A single directory, by id or domain
    Tenant(String),
}

impl EntraIdTenant {
    pub fn parse(value: &str) -> Self {
        match value {
            "" | "common" => EntraIdTenant::Common,
            "organizations" => EntraIdTenant::Organizations,
            "consumers" => EntraIdTenant::Consumers,
            other => EntraIdTenant::Tenant(other.to_string()),
        }
    }
}

impl fmt::Display for EntraIdTenant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntraIdTenant::Common => f.write_str("common"),
            EntraIdTenant::Organizations => f.write_str("organizations"),
            EntraIdTenant::Consumers => f.write_str("consumers"),
            EntraIdTenant::Tenant(id) => f.write_str(id),
        }
    }
}

/// Graph `/me`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphUser {
    id: String,
    display_name: Option<String>,
    mail: Option<String>,
    user_principal_name: Option<String>,
}

/// Entra ID sign-in through the v2.0 endpoints
pub struct EntraIdProvider {
    oauth: OAuth2Config,
    profile_url: String,
    http: reqwest::Client,
}

impl EntraIdProvider {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        redirect_url: impl Into<String>,
        tenant: EntraIdTenant,
        http: reqwest::Client,
    ) -> Self {
        Self {
            oauth: OAuth2Config {
                client_id: client_id.into(),
                client_secret: client_secret.into(),
                redirect_url: redirect_url.into(),
                auth_url: format!("{AUTHORITY}/{tenant}/oauth2/v2.0/authorize"),
                token_url: format!("{AUTHORITY}/{tenant}/oauth2/v2.0/token"),
                scopes: DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect(),
                state_ttl: Duration::seconds(DEFAULT_STATE_TTL_SECONDS),
            },
            profile_url: PROFILE_URL.to_string(),
            http,
        }
    }

    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.oauth.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    /// Point the provider at other endpoints (sovereign clouds, test doubles)
    pub fn with_endpoints(
        mut self,
        auth_url: impl Into<String>,
        token_url: impl Into<String>,
        profile_url: impl Into<String>,
    ) -> Self {
        self.oauth.auth_url = auth_url.into();
        self.oauth.token_url = token_url.into();
        self.profile_url = profile_url.into();
        self
    }

    pub fn with_state_ttl(mut self, ttl: Duration) -> Self {
        self.oauth.state_ttl = ttl;
        self
    }

    async fn fetch_profile(&self, access_token: &str) -> Result<GraphUser> {
        self.http
            .get(&self.profile_url)
            .bearer_auth(access_token)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| AuthError::UpstreamProfileFetchFailed(e.to_string()))?
            .json()
            .await
            .map_err(|e| AuthError::UpstreamProfileFetchFailed(e.to_string()))
    }
}

#[async_trait]
impl Provider for EntraIdProvider {
    fn id(&self) -> &str {
        "entraid"
    }

    fn name(&self) -> &str {
        "Microsoft"
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::Oidc
    }

    async fn begin_auth(&self, adapter: &dyn Adapter, state: &str) -> Result<String> {
        self.oauth.bind_state(adapter, self.id(), state).await?;
        self.oauth.auth_code_url(state)
    }

    async fn complete_auth(&self, adapter: &dyn Adapter, params: &dyn AuthParams) -> Result<User> {
        let code = oauth2::require_code(params)?;
        oauth2::consume_state(adapter, self.id(), params).await?;

        let token = self.oauth.exchange(&self.http, &code).await?;
        let profile = self.fetch_profile(&token.access_token).await?;

        let email = profile
            .mail
            .filter(|mail| !mail.is_empty())
            .or(profile.user_principal_name)
            .ok_or_else(|| {
                AuthError::UpstreamProfileFetchFailed(
                    "Graph profile has neither mail nor userPrincipalName".to_string(),
                )
            })?;

        let name = profile.display_name.unwrap_or_else(|| email.clone());
        let mut user = User::new(name, email);

        let mut account = Account::new(AccountType::Oidc, self.id(), profile.id);
        token.apply_to(&mut account);
        user.accounts.push(account);

        let user = oauth2::upsert_user(adapter, user).await?;
        tracing::info!(provider = "entraid", user_id = %user.id, "Entra ID sign-in completed");
        Ok(user)
    }
}
