//! In-memory storage adapter
//!
//! Volatile and cleared on restart. A single `RwLock` makes every
//! operation atomic, which is what the session manager and CSRF guard rely
//! on for concurrent requests on one session.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::adapter::{Adapter, AdapterResult};
use super::models::{Account, CsrfToken, EntityId, Session, User, VerificationToken, generate_token};
use crate::error::AdapterError;

#[derive(Default)]
struct Tables {
    /// User ID -> User (accounts kept separately)
    users: HashMap<String, User>,
    /// Account ID -> Account
    accounts: HashMap<String, Account>,
    /// Session token -> Session
    sessions: HashMap<String, Session>,
    /// (identifier, token) -> VerificationToken
    verification_tokens: HashMap<(String, String), VerificationToken>,
}

impl Tables {
    fn user_with_accounts(&self, id: &str) -> Option<User> {
        let mut user = self.users.get(id)?.clone();
        let mut accounts: Vec<Account> = self
            .accounts
            .values()
            .filter(|account| account.user_id.as_deref() == Some(id))
            .cloned()
            .collect();
        accounts.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        user.accounts = accounts;
        Some(user)
    }

    fn find_account(&self, provider: &str, provider_account_id: &str) -> Option<&Account> {
        self.accounts.values().find(|account| {
            account.provider == provider && account.provider_account_id == provider_account_id
        })
    }
}

/// Adapter backed by process memory
#[derive(Default)]
pub struct MemoryAdapter {
    tables: RwLock<Tables>,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn user_count(&self) -> usize {
        self.tables.read().await.users.len()
    }

    /// Stored sessions, expired ones included until swept
    pub async fn session_count(&self) -> usize {
        self.tables.read().await.sessions.len()
    }
}

#[async_trait]
impl Adapter for MemoryAdapter {
    async fn create_user(&self, user: User) -> AdapterResult<User> {
        let mut tables = self.tables.write().await;
        let now = Utc::now();

        let existing_id = user
            .accounts
            .iter()
            .find_map(|incoming| {
                tables
                    .find_account(&incoming.provider, &incoming.provider_account_id)
                    .and_then(|stored| stored.user_id.clone())
            })
            .or_else(|| {
                if user.email.is_empty() || !user.email_verified {
                    return None;
                }
                tables
                    .users
                    .values()
                    .find(|stored| {
                        stored.email_verified && stored.email.eq_ignore_ascii_case(&user.email)
                    })
                    .map(|stored| stored.id.clone())
            });

        let user_id = match existing_id {
            Some(id) => {
                if let Some(stored) = tables.users.get_mut(&id) {
                    stored.updated_at = now;
                }
                id
            }
            None => {
                let mut stored = user.clone();
                stored.accounts.clear();
                stored.created_at = now;
                stored.updated_at = now;
                let id = stored.id.clone();
                tables.users.insert(id.clone(), stored);
                id
            }
        };

        for incoming in user.accounts {
            let existing = tables
                .find_account(&incoming.provider, &incoming.provider_account_id)
                .map(|stored| stored.id.clone());

            match existing {
                Some(account_id) => {
                    if let Some(stored) = tables.accounts.get_mut(&account_id) {
                        stored.access_token = incoming.access_token;
                        stored.refresh_token = incoming.refresh_token;
                        stored.expires_at = incoming.expires_at;
                        stored.token_type = incoming.token_type;
                        stored.scope = incoming.scope;
                        stored.id_token = incoming.id_token;
                        stored.session_state = incoming.session_state;
                        stored.user_id = Some(user_id.clone());
                        stored.updated_at = now;
                    }
                }
                None => {
                    let mut account = incoming;
                    account.user_id = Some(user_id.clone());
                    account.created_at = now;
                    account.updated_at = now;
                    tables.accounts.insert(account.id.clone(), account);
                }
            }
        }

        tables
            .user_with_accounts(&user_id)
            .ok_or(AdapterError::NotFound("user"))
    }

    async fn get_user(&self, id: &str) -> AdapterResult<User> {
        let tables = self.tables.read().await;
        tables
            .user_with_accounts(id)
            .ok_or(AdapterError::NotFound("user"))
    }

    async fn get_user_by_email(&self, email: &str) -> AdapterResult<User> {
        let tables = self.tables.read().await;
        let id = tables
            .users
            .values()
            .filter(|user| user.email.eq_ignore_ascii_case(email))
            .min_by_key(|user| (!user.email_verified, user.created_at))
            .map(|user| user.id.clone())
            .ok_or(AdapterError::NotFound("user"))?;
        tables
            .user_with_accounts(&id)
            .ok_or(AdapterError::NotFound("user"))
    }

    async fn get_user_by_account(
        &self,
        provider: &str,
        provider_account_id: &str,
    ) -> AdapterResult<User> {
        let tables = self.tables.read().await;
        let user_id = tables
            .find_account(provider, provider_account_id)
            .and_then(|account| account.user_id.clone())
            .ok_or(AdapterError::NotFound("user"))?;
        tables
            .user_with_accounts(&user_id)
            .ok_or(AdapterError::NotFound("user"))
    }

    async fn update_user(&self, user: User) -> AdapterResult<User> {
        let mut tables = self.tables.write().await;
        let stored = tables
            .users
            .get_mut(&user.id)
            .ok_or(AdapterError::NotFound("user"))?;
        stored.name = user.name;
        stored.email = user.email;
        stored.email_verified = user.email_verified;
        stored.image = user.image;
        stored.updated_at = Utc::now();
        tables
            .user_with_accounts(&user.id)
            .ok_or(AdapterError::NotFound("user"))
    }

    async fn delete_user(&self, id: &str) -> AdapterResult<()> {
        let mut tables = self.tables.write().await;
        if tables.users.remove(id).is_none() {
            return Err(AdapterError::NotFound("user"));
        }
        tables
            .accounts
            .retain(|_, account| account.user_id.as_deref() != Some(id));
        tables.sessions.retain(|_, session| session.user_id != id);
        Ok(())
    }

    async fn link_account(&self, account_id: &str, user_id: &str) -> AdapterResult<()> {
        let mut tables = self.tables.write().await;
        if !tables.users.contains_key(user_id) {
            return Err(AdapterError::NotFound("user"));
        }
        let account = tables
            .accounts
            .get_mut(account_id)
            .ok_or(AdapterError::NotFound("account"))?;
        account.user_id = Some(user_id.to_string());
        account.updated_at = Utc::now();
        Ok(())
    }

    async fn unlink_account(&self, account_id: &str, user_id: &str) -> AdapterResult<()> {
        let mut tables = self.tables.write().await;
        match tables.accounts.get_mut(account_id) {
            Some(account) if account.user_id.as_deref() == Some(user_id) => {
                account.user_id = None;
                account.updated_at = Utc::now();
                Ok(())
            }
            _ => Err(AdapterError::NotFound("account")),
        }
    }

    async fn create_session(
        &self,
        user_id: &str,
        expires_at: DateTime<Utc>,
        csrf: CsrfToken,
    ) -> AdapterResult<Session> {
        let mut tables = self.tables.write().await;
        if !tables.users.contains_key(user_id) {
            return Err(AdapterError::Validation(format!(
                "unknown user {user_id}"
            )));
        }

        let now = Utc::now();
        let session = Session {
            id: EntityId::new().0,
            session_token: generate_token(),
            user_id: user_id.to_string(),
            expires_at,
            csrf,
            created_at: now,
            updated_at: now,
        };
        tables
            .sessions
            .insert(session.session_token.clone(), session.clone());
        Ok(session)
    }

    async fn get_session(&self, session_token: &str) -> AdapterResult<Session> {
        let tables = self.tables.read().await;
        tables
            .sessions
            .get(session_token)
            .cloned()
            .ok_or(AdapterError::NotFound("session"))
    }

    async fn update_session(&self, session: Session) -> AdapterResult<Session> {
        let mut tables = self.tables.write().await;
        let stored = tables
            .sessions
            .get_mut(&session.session_token)
            .ok_or(AdapterError::NotFound("session"))?;
        stored.csrf = session.csrf;
        stored.expires_at = stored.expires_at.max(session.expires_at);
        stored.updated_at = Utc::now();
        Ok(stored.clone())
    }

    async fn refresh_session(&self, session: Session) -> AdapterResult<Session> {
        let mut tables = self.tables.write().await;
        let stored = tables
            .sessions
            .get_mut(&session.session_token)
            .ok_or(AdapterError::NotFound("session"))?;
        stored.expires_at = stored.expires_at.max(session.expires_at);
        stored.updated_at = Utc::now();
        Ok(stored.clone())
    }

    async fn swap_session_csrf(
        &self,
        session_token: &str,
        expected: &str,
        next: CsrfToken,
    ) -> AdapterResult<Session> {
        let mut tables = self.tables.write().await;
        let stored = tables
            .sessions
            .get_mut(session_token)
            .ok_or(AdapterError::NotFound("session"))?;
        if stored.csrf.token != expected {
            return Err(AdapterError::Conflict("csrf token"));
        }
        stored.csrf = next;
        stored.updated_at = Utc::now();
        Ok(stored.clone())
    }

    async fn delete_session(&self, session_token: &str) -> AdapterResult<()> {
        let mut tables = self.tables.write().await;
        tables
            .sessions
            .remove(session_token)
            .map(|_| ())
            .ok_or(AdapterError::NotFound("session"))
    }

    async fn delete_expired_sessions(&self) -> AdapterResult<u64> {
        let mut tables = self.tables.write().await;
        let now = Utc::now();
        let before = tables.sessions.len();
        tables.sessions.retain(|_, session| session.is_valid_at(now));
        Ok((before - tables.sessions.len()) as u64)
    }

    async fn create_verification_token(
        &self,
        token: VerificationToken,
    ) -> AdapterResult<VerificationToken> {
        let mut tables = self.tables.write().await;
        let key = (token.identifier.clone(), token.token.clone());
        if tables.verification_tokens.contains_key(&key) {
            return Err(AdapterError::Validation(
                "verification token already exists".to_string(),
            ));
        }
        tables.verification_tokens.insert(key, token.clone());
        Ok(token)
    }

    async fn use_verification_token(
        &self,
        identifier: &str,
        token: &str,
    ) -> AdapterResult<VerificationToken> {
        let mut tables = self.tables.write().await;
        let stored = tables
            .verification_tokens
            .remove(&(identifier.to_string(), token.to_string()))
            .ok_or(AdapterError::NotFound("verification token"))?;
        if stored.has_expired_at(Utc::now()) {
            return Err(AdapterError::NotFound("verification token"));
        }
        Ok(stored)
    }
}
