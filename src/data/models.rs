//! Data models
//!
//! Users, linked provider accounts, sessions and verification tokens.
//! All models use ULID for IDs and chrono for timestamps.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

// =============================================================================
// ID Types
// =============================================================================

/// Entity ID wrapper (ULID format, 26 characters)
///
/// Example: "01ARZ3NDEKTSV4RRFFQ69G5FAV"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    /// Generate a new ULID
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

/// Generate an opaque, unguessable token (32 CSPRNG bytes, base64url)
pub fn generate_token() -> String {
    let mut bytes = [0_u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

// =============================================================================
// User & Account
// =============================================================================

/// Kind of external identity an account represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountType {
    OAuth2,
    Oidc,
    Saml,
    Email,
    WebAuthn,
}

impl AccountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::OAuth2 => "oauth2",
            AccountType::Oidc => "oidc",
            AccountType::Saml => "saml",
            AccountType::Email => "email",
            AccountType::WebAuthn => "webauthn",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "oauth2" => Some(AccountType::OAuth2),
            "oidc" => Some(AccountType::Oidc),
            "saml" => Some(AccountType::Saml),
            "email" => Some(AccountType::Email),
            "webauthn" => Some(AccountType::WebAuthn),
            _ => None,
        }
    }
}

/// An application user
///
/// Created on the first completed handshake, matched afterwards by linked
/// account or email.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    pub email: String,
    pub email_verified: bool,
    /// Avatar URL
    pub image: Option<String>,
    #[serde(default)]
    pub accounts: Vec<Account>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// A user as reported by a provider, not yet stored
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: EntityId::new().0,
            name: name.into(),
            email: email.into(),
            email_verified: false,
            image: None,
            accounts: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// One linked external identity
///
/// Provider tokens are opaque payload; the core never interprets them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub account_type: AccountType,
    /// Provider id, e.g. "github"
    pub provider: String,
    /// Account id at the provider
    pub provider_account_id: String,
    #[serde(skip_serializing)]
    pub access_token: Option<String>,
    #[serde(skip_serializing)]
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub token_type: Option<String>,
    pub scope: Option<String>,
    #[serde(skip_serializing)]
    pub id_token: Option<String>,
    pub session_state: Option<String>,
    pub user_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub fn new(
        account_type: AccountType,
        provider: impl Into<String>,
        provider_account_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: EntityId::new().0,
            account_type,
            provider: provider.into(),
            provider_account_id: provider_account_id.into(),
            access_token: None,
            refresh_token: None,
            expires_at: None,
            token_type: None,
            scope: None,
            id_token: None,
            session_state: None,
            user_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// =============================================================================
// Session
// =============================================================================

/// CSRF sub-record embedded in a session
///
/// Has its own, shorter expiry than the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsrfToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl CsrfToken {
    /// Issue a fresh random token valid for `ttl`
    pub fn issue(ttl: Duration) -> Self {
        Self {
            token: generate_token(),
            expires_at: Utc::now() + ttl,
        }
    }

    pub fn has_expired(&self) -> bool {
        self.has_expired_at(Utc::now())
    }

    pub fn has_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Constant-time comparison against a submitted token
    pub fn matches(&self, candidate: &str) -> bool {
        self.token.as_bytes().ct_eq(candidate.as_bytes()).into()
    }
}

/// A server-tracked login session
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: String,
    /// Opaque cookie value
    #[serde(skip_serializing)]
    pub session_token: String,
    pub user_id: String,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing)]
    pub csrf: CsrfToken,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Valid iff `now < expires_at`
    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

// =============================================================================
// Verification Token
// =============================================================================

/// Single-use token bound to an identifier (handshake state, email links)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationToken {
    pub identifier: String,
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl VerificationToken {
    pub fn new(identifier: impl Into<String>, token: impl Into<String>, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            identifier: identifier.into(),
            token: token.into(),
            expires_at: now + ttl,
            created_at: now,
        }
    }

    pub fn has_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}
