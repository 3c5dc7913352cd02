//! GitHub OAuth provider

use async_trait::async_trait;
use chrono::Duration;
use serde::Deserialize;

use super::oauth2::{self, DEFAULT_STATE_TTL_SECONDS, OAuth2Config};
use super::{AuthParams, Provider, ProviderType};
use crate::data::{Account, AccountType, Adapter, User};
use crate::error::{AuthError, Result};

const AUTH_URL: &str = "https://github.com/login/oauth/authorize";
const TOKEN_URL: &str = "https://github.com/login/oauth/access_token";
const PROFILE_URL: &str = "https://api.github.com/user";
const EMAILS_URL: &str = "https://api.github.com/user/emails";

const DEFAULT_SCOPES: [&str; 2] = ["user:email", "read:user"];

/// GitHub (or GitHub Enterprise) sign-in
pub struct GitHubProvider {
    oauth: OAuth2Config,
    profile_url: String,
    emails_url: String,
    http: reqwest::Client,
}

/// GET /user
#[derive(Debug, Deserialize)]
struct GitHubUser {
    id: i64,
    login: String,
    name: Option<String>,
    email: Option<String>,
    avatar_url: Option<String>,
}

/// GET /user/emails entry
#[derive(Debug, Deserialize)]
struct GitHubEmail {
    email: String,
    primary: bool,
    verified: bool,
}

impl GitHubProvider {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        redirect_url: impl Into<String>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            oauth: OAuth2Config {
                client_id: client_id.into(),
                client_secret: client_secret.into(),
                redirect_url: redirect_url.into(),
                auth_url: AUTH_URL.to_string(),
                token_url: TOKEN_URL.to_string(),
                scopes: DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect(),
                state_ttl: Duration::seconds(DEFAULT_STATE_TTL_SECONDS),
            },
            profile_url: PROFILE_URL.to_string(),
            emails_url: EMAILS_URL.to_string(),
            http,
        }
    }

    /// Replace the requested scopes
    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.oauth.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    /// Point the provider at other endpoints (GitHub Enterprise, test doubles)
    pub fn with_endpoints(
        mut self,
        auth_url: impl Into<String>,
        token_url: impl Into<String>,
        profile_url: impl Into<String>,
        emails_url: impl Into<String>,
    ) -> Self {
        self.oauth.auth_url = auth_url.into();
        self.oauth.token_url = token_url.into();
        self.profile_url = profile_url.into();
        self.emails_url = emails_url.into();
        self
    }

    pub fn with_state_ttl(mut self, ttl: Duration) -> Self {
        self.oauth.state_ttl = ttl;
        self
    }

    fn may_read_emails(&self) -> bool {
        self.oauth
            .scopes
            .iter()
            .any(|scope| scope == "user" || scope == "user:email")
    }

    async fn fetch_profile(&self, access_token: &str) -> Result<GitHubUser> {
        self.http
            .get(&self.profile_url)
            .bearer_auth(access_token)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| AuthError::UpstreamProfileFetchFailed(e.to_string()))?
            .json()
            .await
            .map_err(|e| AuthError::UpstreamProfileFetchFailed(e.to_string()))
    }

    /// Primary verified address, for accounts without a public email
    async fn fetch_primary_email(&self, access_token: &str) -> Result<Option<String>> {
        let emails: Vec<GitHubEmail> = self
            .http
            .get(&self.emails_url)
            .bearer_auth(access_token)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| AuthError::UpstreamProfileFetchFailed(e.to_string()))?
            .json()
            .await
            .map_err(|e| AuthError::UpstreamProfileFetchFailed(e.to_string()))?;

        Ok(emails
            .into_iter()
            .find(|entry| entry.primary && entry.verified)
            .map(|entry| entry.email))
    }
}

#[async_trait]
impl Provider for GitHubProvider {
    fn id(&self) -> &str {
        "github"
    }

    fn name(&self) -> &str {
        "GitHub"
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::OAuth2
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

        let (email, email_verified) = match profile.email.filter(|email| !email.is_empty()) {
            Some(email) => (email, false),
            None if self.may_read_emails() => match self.fetch_primary_email(&token.access_token).await? {
                Some(email) => (email, true),
                None => {
                    return Err(AuthError::UpstreamProfileFetchFailed(
                        "no primary verified email on the GitHub account".to_string(),
                    ));
                }
            },
            None => {
                return Err(AuthError::UpstreamProfileFetchFailed(
                    "GitHub profile has no public email".to_string(),
                ));
            }
        };

        let mut user = User::new(profile.name.unwrap_or_else(|| profile.login.clone()), email);
        user.email_verified = email_verified;
        user.image = profile.avatar_url;

        let mut account = Account::new(AccountType::OAuth2, self.id(), profile.id.to_string());
        token.apply_to(&mut account);
        user.accounts.push(account);

        let user = oauth2::upsert_user(adapter, user).await?;
        tracing::info!(provider = "github", login = %profile.login, user_id = %user.id, "GitHub sign-in completed");
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::data::MemoryAdapter;

    fn provider() -> GitHubProvider {
        GitHubProvider::new(
            "client-id",
            "client-secret",
            "http://localhost:8080/auth/github/callback",
            reqwest::Client::new(),
        )
    }

    #[tokio::test]
    async fn begin_auth_points_at_github_authorize() {
        let adapter = MemoryAdapter::new();
        let url = provider().begin_auth(&adapter, "nonce").await.unwrap();

        assert!(url.starts_with("https://github.com/login/oauth/authorize?"));
        assert!(url.contains("state=nonce"));
        assert!(url.contains("client_id=client-id"));
    }

    #[tokio::test]
    async fn complete_auth_without_code_creates_nothing() {
        let adapter = MemoryAdapter::new();
        let github = provider();
        github.begin_auth(&adapter, "nonce").await.unwrap();

        let mut params = HashMap::new();
        params.insert("state".to_string(), "nonce".to_string());

        let error = github.complete_auth(&adapter, &params).await.unwrap_err();
        assert!(matches!(error, AuthError::InvalidRequest(_)));

        // The state survives, so a retried callback with a code is still bound
        let params: HashMap<String, String> = [("state".to_string(), "nonce".to_string())].into();
        assert!(oauth2::consume_state(&adapter, "github", &params).await.is_ok());
    }

    #[test]
    fn email_scope_controls_the_emails_lookup() {
        assert!(provider().may_read_emails());
        assert!(!provider().with_scopes(["read:user"]).may_read_emails());
    }
}
