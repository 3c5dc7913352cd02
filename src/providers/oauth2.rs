//! Authorization code flow plumbing shared by the built-in providers
//!
//! Binds the handshake state to the provider through a verification token,
//! builds authorize URLs and exchanges codes for tokens.

use chrono::{Duration, Utc};
use serde::Deserialize;
use url::Url;

use super::AuthParams;
use crate::data::{Account, Adapter, User, VerificationToken};
use crate::error::{AdapterError, AuthError, Result};

/// Default lifetime of an issued handshake state
pub const DEFAULT_STATE_TTL_SECONDS: i64 = 600;

/// Client registration and endpoints of one OAuth2 provider
#[derive(Debug, Clone)]
pub struct OAuth2Config {
    pub client_id: String,
    pub client_secret: String,
    /// Absolute callback URL registered with the provider
    pub redirect_url: String,
    pub auth_url: String,
    pub token_url: String,
    pub scopes: Vec<String>,
    pub state_ttl: Duration,
}

impl OAuth2Config {
    /// Authorize URL carrying client id, redirect, scopes and state
    pub fn auth_code_url(&self, state: &str) -> Result<String> {
        let scope = self.scopes.join(" ");
        let url = Url::parse_with_params(
            &self.auth_url,
            &[
                ("client_id", self.client_id.as_str()),
                ("redirect_uri", self.redirect_url.as_str()),
                ("response_type", "code"),
                ("scope", scope.as_str()),
                ("state", state),
            ],
        )
        .map_err(|e| AuthError::Config(format!("invalid authorize URL {}: {e}", self.auth_url)))?;
        Ok(url.into())
    }

    /// Exchange an authorization code for tokens
    ///
    /// Codes are single-use; a failure here is never retried.
    pub async fn exchange(&self, http: &reqwest::Client, code: &str) -> Result<TokenResponse> {
        let response = http
            .post(&self.token_url)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", self.redirect_url.as_str()),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| AuthError::TokenExchangeFailed(e.to_string()))?;

        let status = response.status();
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| AuthError::TokenExchangeFailed(format!("{status}: {e}")))?;

        if let Some(error) = token.error.as_deref() {
            let description = token.error_description.as_deref().unwrap_or_default();
            return Err(AuthError::TokenExchangeFailed(format!(
                "{error} {description}"
            )));
        }
        if !status.is_success() || token.access_token.is_empty() {
            return Err(AuthError::TokenExchangeFailed(format!(
                "token endpoint returned {status}"
            )));
        }

        Ok(token)
    }

    /// Store `state` so the callback can prove it started here
    pub async fn bind_state(&self, adapter: &dyn Adapter, provider: &str, state: &str) -> Result<()> {
        let token = VerificationToken::new(state_identifier(provider), state, self.state_ttl);
        adapter.create_verification_token(token).await?;
        Ok(())
    }
}

/// Token endpoint response (RFC 6749 section 5.1, plus the error form)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenResponse {
    #[serde(default)]
    pub access_token: String,
    pub token_type: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_in: Option<i64>,
    pub scope: Option<String>,
    pub id_token: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

impl TokenResponse {
    /// Copy the opaque provider tokens onto an account
    pub fn apply_to(&self, account: &mut Account) {
        account.access_token = Some(self.access_token.clone());
        account.refresh_token = self.refresh_token.clone();
        account.token_type = self.token_type.clone();
        account.scope = self.scope.clone();
        account.id_token = self.id_token.clone();
        account.expires_at = self
            .expires_in
            .filter(|seconds| *seconds > 0)
            .map(|seconds| Utc::now() + Duration::seconds(seconds));
    }
}

/// Verification token identifier for a provider's handshake state
pub fn state_identifier(provider: &str) -> String {
    format!("oauth_state:{provider}")
}

/// The `code` parameter of a callback
pub fn require_code(params: &dyn AuthParams) -> Result<String> {
    params
        .get("code")
        .filter(|code| !code.is_empty())
        .ok_or_else(|| AuthError::InvalidRequest("missing code parameter".to_string()))
}

/// Consume the callback's state; it is accepted at most once
pub async fn consume_state(
    adapter: &dyn Adapter,
    provider: &str,
    params: &dyn AuthParams,
) -> Result<String> {
    let state = params
        .get("state")
        .filter(|state| !state.is_empty())
        .ok_or(AuthError::InvalidState)?;

    match adapter
        .use_verification_token(&state_identifier(provider), &state)
        .await
    {
        Ok(_) => Ok(state),
        Err(AdapterError::NotFound(_)) => Err(AuthError::InvalidState),
        Err(e) => Err(e.into()),
    }
}

/// Store the provider's user through the adapter's upsert
pub(super) async fn upsert_user(adapter: &dyn Adapter, user: User) -> Result<User> {
    adapter.create_user(user).await.map_err(|e| match e {
        AdapterError::Unimplemented(capability) => AuthError::AdapterUnimplemented(capability),
        timeout @ AdapterError::Timeout(_) => AuthError::Adapter(timeout),
        other => AuthError::UserUpsertFailed(other.to_string()),
    })
}
