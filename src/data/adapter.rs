//! Storage adapter contract
//!
//! The adapter is the only durable owner of users, accounts, sessions and
//! verification tokens. The core never locks; adapters must make
//! `refresh_session` and `update_session` atomic read-modify-write
//! operations whose session expiry never moves backwards, and
//! `swap_session_csrf` a compare-and-swap on the CSRF token.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::models::{CsrfToken, Session, User, VerificationToken};
use crate::error::AdapterError;

/// Adapter result type
pub type AdapterResult<T> = std::result::Result<T, AdapterError>;

/// Persistence boundary consumed by the orchestrator, session manager and
/// CSRF guard.
///
/// Every method is required. A backend that lacks a capability returns
/// [`AdapterError::Unimplemented`]; [`UnimplementedAdapter`] can be used as a
/// delegate for the methods a backend does not support.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Insert or match a user, then insert or refresh its accounts
    ///
    /// Matching order: any `(provider, provider_account_id)` of the incoming
    /// accounts, then email. Returns the stored user with its accounts.
    async fn create_user(&self, user: User) -> AdapterResult<User>;

    async fn get_user(&self, id: &str) -> AdapterResult<User>;

    async fn get_user_by_email(&self, email: &str) -> AdapterResult<User>;

    async fn get_user_by_account(
        &self,
        provider: &str,
        provider_account_id: &str,
    ) -> AdapterResult<User>;

    async fn update_user(&self, user: User) -> AdapterResult<User>;

    /// Delete a user with its accounts and sessions
    async fn delete_user(&self, id: &str) -> AdapterResult<()>;

    async fn link_account(&self, account_id: &str, user_id: &str) -> AdapterResult<()>;

    async fn unlink_account(&self, account_id: &str, user_id: &str) -> AdapterResult<()>;

    /// Create a session with a fresh opaque token and the given CSRF seed
    async fn create_session(
        &self,
        user_id: &str,
        expires_at: DateTime<Utc>,
        csrf: CsrfToken,
    ) -> AdapterResult<Session>;

    /// Look up a session by its token; unknown tokens are `NotFound`
    async fn get_session(&self, session_token: &str) -> AdapterResult<Session>;

    /// Replace the CSRF sub-record; expiry becomes `max(stored, session.expires_at)`
    async fn update_session(&self, session: Session) -> AdapterResult<Session>;

    /// Slide the expiry to `max(stored, session.expires_at)`
    async fn refresh_session(&self, session: Session) -> AdapterResult<Session>;

    /// Replace the CSRF sub-record only while the stored token is `expected`
    ///
    /// Must compare and replace atomically. A stored token other than
    /// `expected` is [`AdapterError::Conflict`]; the session expiry is left
    /// untouched.
    async fn swap_session_csrf(
        &self,
        session_token: &str,
        expected: &str,
        next: CsrfToken,
    ) -> AdapterResult<Session>;

    async fn delete_session(&self, session_token: &str) -> AdapterResult<()>;

    /// Remove sessions whose expiry has passed; returns the number removed
    async fn delete_expired_sessions(&self) -> AdapterResult<u64>;

    async fn create_verification_token(
        &self,
        token: VerificationToken,
    ) -> AdapterResult<VerificationToken>;

    /// Consume a token; a second use, or an expired token, is `NotFound`
    async fn use_verification_token(
        &self,
        identifier: &str,
        token: &str,
    ) -> AdapterResult<VerificationToken>;
}

/// Adapter whose every capability is unimplemented
#[derive(Debug, Clone, Copy, Default)]
pub struct UnimplementedAdapter;

#[async_trait]
impl Adapter for UnimplementedAdapter {
    async fn create_user(&self, _user: User) -> AdapterResult<User> {
        Err(AdapterError::Unimplemented("create_user"))
    }

    async fn get_user(&self, _id: &str) -> AdapterResult<User> {
        Err(AdapterError::Unimplemented("get_user"))
    }

    async fn get_user_by_email(&self, _email: &str) -> AdapterResult<User> {
        Err(AdapterError::Unimplemented("get_user_by_email"))
    }

    async fn get_user_by_account(
        &self,
        _provider: &str,
        _provider_account_id: &str,
    ) -> AdapterResult<User> {
        Err(AdapterError::Unimplemented("get_user_by_account"))
    }

    async fn update_user(&self, _user: User) -> AdapterResult<User> {
        Err(AdapterError::Unimplemented("update_user"))
    }

    async fn delete_user(&self, _id: &str) -> AdapterResult<()> {
        Err(AdapterError::Unimplemented("delete_user"))
    }

    async fn link_account(&self, _account_id: &str, _user_id: &str) -> AdapterResult<()> {
        Err(AdapterError::Unimplemented("link_account"))
    }

    async fn unlink_account(&self, _account_id: &str, _user_id: &str) -> AdapterResult<()> {
        Err(AdapterError::Unimplemented("unlink_account"))
    }

    async fn create_session(
        &self,
        _user_id: &str,
        _expires_at: DateTime<Utc>,
        _csrf: CsrfToken,
    ) -> AdapterResult<Session> {
        Err(AdapterError::Unimplemented("create_session"))
    }

    async fn get_session(&self, _session_token: &str) -> AdapterResult<Session> {
        Err(AdapterError::Unimplemented("get_session"))
    }

    async fn update_session(&self, _session: Session) -> AdapterResult<Session> {
        Err(AdapterError::Unimplemented("update_session"))
    }

    async fn refresh_session(&self, _session: Session) -> AdapterResult<Session> {
        Err(AdapterError::Unimplemented("refresh_session"))
    }

    async fn swap_session_csrf(
        &self,
        _session_token: &str,
        _expected: &str,
        _next: CsrfToken,
    ) -> AdapterResult<Session> {
        Err(AdapterError::Unimplemented("swap_session_csrf"))
    }

    async fn delete_session(&self, _session_token: &str) -> AdapterResult<()> {
        Err(AdapterError::Unimplemented("delete_session"))
    }

    async fn delete_expired_sessions(&self) -> AdapterResult<u64> {
        Err(AdapterError::Unimplemented("delete_expired_sessions"))
    }

    async fn create_verification_token(
        &self,
        _token: VerificationToken,
    ) -> AdapterResult<VerificationToken> {
        Err(AdapterError::Unimplemented("create_verification_token"))
    }

    async fn use_verification_token(
        &self,
        _identifier: &str,
        _token: &str,
    ) -> AdapterResult<VerificationToken> {
        Err(AdapterError::Unimplemented("use_verification_token"))
    }
}

/// Run one adapter call under the request's deadline
///
/// Dropping the returned future cancels the call.
pub async fn bounded<T, F>(limit: StdDuration, operation: &'static str, call: F) -> AdapterResult<T>
where
    F: Future<Output = AdapterResult<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(operation, timeout_ms = limit.as_millis() as u64, "Adapter call timed out");
            Err(AdapterError::Timeout(operation))
        }
    }
}

/// Adapter decorator that applies [`bounded`] to every call
///
/// The core only talks to storage through this wrapper, so a slow backend
/// cannot hold a request past `limit`.
#[derive(Clone)]
pub struct BoundedAdapter {
    inner: Arc<dyn Adapter>,
    limit: StdDuration,
}

impl BoundedAdapter {
    pub fn new(inner: Arc<dyn Adapter>, limit: StdDuration) -> Self {
        Self { inner, limit }
    }
}

#[async_trait]
impl Adapter for BoundedAdapter {
    async fn create_user(&self, user: User) -> AdapterResult<User> {
        bounded(self.limit, "create_user", self.inner.create_user(user)).await
    }

    async fn get_user(&self, id: &str) -> AdapterResult<User> {
        bounded(self.limit, "get_user", self.inner.get_user(id)).await
    }

    async fn get_user_by_email(&self, email: &str) -> AdapterResult<User> {
        bounded(self.limit, "get_user_by_email", self.inner.get_user_by_email(email)).await
    }

    async fn get_user_by_account(
        &self,
        provider: &str,
        provider_account_id: &str,
    ) -> AdapterResult<User> {
        bounded(
            self.limit,
            "get_user_by_account",
            self.inner.get_user_by_account(provider, provider_account_id),
        )
        .await
    }

    async fn update_user(&self, user: User) -> AdapterResult<User> {
        bounded(self.limit, "update_user", self.inner.update_user(user)).await
    }

    async fn delete_user(&self, id: &str) -> AdapterResult<()> {
        bounded(self.limit, "delete_user", self.inner.delete_user(id)).await
    }

    async fn link_account(&self, account_id: &str, user_id: &str) -> AdapterResult<()> {
        bounded(
            self.limit,
            "link_account",
            self.inner.link_account(account_id, user_id),
        )
        .await
    }

    async fn unlink_account(&self, account_id: &str, user_id: &str) -> AdapterResult<()> {
        bounded(
            self.limit,
            "unlink_account",
            self.inner.unlink_account(account_id, user_id),
        )
        .await
    }

    async fn create_session(
        &self,
        user_id: &str,
        expires_at: DateTime<Utc>,
        csrf: CsrfToken,
    ) -> AdapterResult<Session> {
        bounded(
            self.limit,
            "create_session",
            self.inner.create_session(user_id, expires_at, csrf),
        )
        .await
    }

    async fn get_session(&self, session_token: &str) -> AdapterResult<Session> {
        bounded(self.limit, "get_session", self.inner.get_session(session_token)).await
    }

    async fn update_session(&self, session: Session) -> AdapterResult<Session> {
        bounded(self.limit, "update_session", self.inner.update_session(session)).await
    }

    async fn refresh_session(&self, session: Session) -> AdapterResult<Session> {
        bounded(self.limit, "refresh_session", self.inner.refresh_session(session)).await
    }

    async fn swap_session_csrf(
        &self,
        session_token: &str,
        expected: &str,
        next: CsrfToken,
    ) -> AdapterResult<Session> {
        bounded(
            self.limit,
            "swap_session_csrf",
            self.inner.swap_session_csrf(session_token, expected, next),
        )
        .await
    }

    async fn delete_session(&self, session_token: &str) -> AdapterResult<()> {
        bounded(self.limit, "delete_session", self.inner.delete_session(session_token)).await
    }

    async fn delete_expired_sessions(&self) -> AdapterResult<u64> {
        bounded(
            self.limit,
            "delete_expired_sessions",
            self.inner.delete_expired_sessions(),
        )
        .await
    }

    async fn create_verification_token(
        &self,
        token: VerificationToken,
    ) -> AdapterResult<VerificationToken> {
        bounded(
            self.limit,
            "create_verification_token",
            self.inner.create_verification_token(token),
        )
        .await
    }

    async fn use_verification_token(
        &self,
        identifier: &str,
        token: &str,
    ) -> AdapterResult<VerificationToken> {
        bounded(
            self.limit,
            "use_verification_token",
            self.inner.use_verification_token(identifier, token),
        )
        .await
    }
}
