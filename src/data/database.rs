//! SQLite storage adapter
//!
//! Durable implementation of [`Adapter`] on SQLx. Session tokens are stored
//! only as SHA-256 digests; expiries are unix milliseconds so the sliding
//! window can be enforced with `MAX()` inside a single `UPDATE`.

use std::path::Path;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, TimeZone, Utc};
use sha2::{Digest, Sha256};
use sqlx::{Pool, Sqlite, SqliteConnection, SqlitePool, Transaction};

use super::adapter::{Adapter, AdapterResult};
use super::models::{
    Account, AccountType, CsrfToken, EntityId, Session, User, VerificationToken, generate_token,
};
use crate::error::AdapterError;

const SESSION_TOKEN_HASH_PREFIX: &str = "sha256:";

fn hash_session_token(session_token: &str) -> String {
    let digest = Sha256::digest(session_token.as_bytes());
    format!(
        "{}{}",
        SESSION_TOKEN_HASH_PREFIX,
        URL_SAFE_NO_PAD.encode(digest)
    )
}

fn from_millis(millis: i64) -> AdapterResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| AdapterError::Backend(format!("invalid stored timestamp: {millis}")))
}

// =============================================================================
// Rows
// =============================================================================

#[derive(sqlx::FromRow)]
struct UserRow {
    id: String,
    name: String,
    email: String,
    email_verified: bool,
    image: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl UserRow {
    fn into_user(self, accounts: Vec<Account>) -> User {
        User {
            id: self.id,
            name: self.name,
            email: self.email,
            email_verified: self.email_verified,
            image: self.image,
            accounts,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct AccountRow {
    id: String,
    account_type: String,
    provider: String,
    provider_account_id: String,
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_at: Option<DateTime<Utc>>,
    token_type: Option<String>,
    scope: Option<String>,
    id_token: Option<String>,
    session_state: Option<String>,
    user_id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<AccountRow> for Account {
    type Error = AdapterError;

    fn try_from(row: AccountRow) -> Result<Self, Self::Error> {
        let account_type = AccountType::parse(&row.account_type).ok_or_else(|| {
            AdapterError::Backend(format!("unknown account type: {}", row.account_type))
        })?;
        Ok(Account {
            id: row.id,
            account_type,
            provider: row.provider,
            provider_account_id: row.provider_account_id,
            access_token: row.access_token,
            refresh_token: row.refresh_token,
            expires_at: row.expires_at,
            token_type: row.token_type,
            scope: row.scope,
            id_token: row.id_token,
            session_state: row.session_state,
            user_id: row.user_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    user_id: String,
    expires_at: i64,
    csrf_token: String,
    csrf_expires_at: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl SessionRow {
    /// The stored row only has the token digest; the caller supplies the token
    fn into_session(self, session_token: &str) -> AdapterResult<Session> {
        Ok(Session {
            id: self.id,
            session_token: session_token.to_string(),
            user_id: self.user_id,
            expires_at: from_millis(self.expires_at)?,
            csrf: CsrfToken {
                token: self.csrf_token,
                expires_at: from_millis(self.csrf_expires_at)?,
            },
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct VerificationTokenRow {
    identifier: String,
    token: String,
    expires_at: i64,
    created_at: DateTime<Utc>,
}

const SESSION_COLUMNS: &str =
    "id, user_id, expires_at, csrf_token, csrf_expires_at, created_at, updated_at";

// =============================================================================
// Adapter
// =============================================================================

/// Adapter backed by a SQLite file
pub struct SqliteAdapter {
    pub(super) pool: Pool<Sqlite>,
}

impl SqliteAdapter {
    /// Open (creating if needed) the database file and run migrations
    pub async fn connect(path: &Path) -> AdapterResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AdapterError::Database(sqlx::Error::Io(e)))?;
        }

        let connection_string = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePool::connect(&connection_string).await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| {
                tracing::error!("Migration failed: {}", e);
                AdapterError::Backend(format!("migration failed: {e}"))
            })?;

        tracing::info!(path = %path.display(), "Database connected and migrated successfully");

        Ok(Self { pool })
    }

    /// Open a transaction that already holds the write lock
    ///
    /// A dropped transaction is rolled back before its connection is reused.
    async fn begin_write(&self) -> AdapterResult<Transaction<'static, Sqlite>> {
        let mut tx = self.pool.begin().await?;
        // Any write statement takes the RESERVED lock, even when no row matches
        sqlx::query("UPDATE users SET id = id WHERE 0")
            .execute(&mut *tx)
            .await?;
        Ok(tx)
    }

    async fn accounts_for(
        conn: &mut SqliteConnection,
        user_id: &str,
    ) -> AdapterResult<Vec<Account>> {
        let rows = sqlx::query_as::<_, AccountRow>(
            "SELECT * FROM accounts WHERE user_id = ? ORDER BY created_at ASC",
        )
        .bind(user_id)
        .fetch_all(&mut *conn)
        .await?;
        rows.into_iter().map(Account::try_from).collect()
    }

    async fn load_user(conn: &mut SqliteConnection, user_id: &str) -> AdapterResult<User> {
        let row = sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or(AdapterError::NotFound("user"))?;
        let accounts = Self::accounts_for(conn, user_id).await?;
        Ok(row.into_user(accounts))
    }

    async fn upsert_user(conn: &mut SqliteConnection, user: User) -> AdapterResult<String> {
        let now = Utc::now();

        let mut existing_id = None;
        for incoming in &user.accounts {
            existing_id = sqlx::query_scalar::<_, String>(
                "SELECT user_id FROM accounts WHERE provider = ? AND provider_account_id = ? AND user_id IS NOT NULL",
            )
            .bind(&incoming.provider)
            .bind(&incoming.provider_account_id)
            .fetch_optional(&mut *conn)
            .await?;
            if existing_id.is_some() {
                break;
            }
        }
        // Only a verified address on both sides links a new provider account
        if existing_id.is_none() && user.email_verified && !user.email.is_empty() {
            existing_id = sqlx::query_scalar::<_, String>(
                "SELECT id FROM users WHERE email = ? COLLATE NOCASE AND email_verified = 1 ORDER BY created_at ASC LIMIT 1",
            )
            .bind(&user.email)
            .fetch_optional(&mut *conn)
            .await?;
        }

        let user_id = match existing_id {
            Some(id) => {
                sqlx::query("UPDATE users SET updated_at = ? WHERE id = ?")
                    .bind(now)
                    .bind(&id)
                    .execute(&mut *conn)
                    .await?;
                id
            }
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO users (id, name, email, email_verified, image, created_at, updated_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&user.id)
                .bind(&user.name)
                .bind(&user.email)
                .bind(user.email_verified)
                .bind(&user.image)
                .bind(now)
                .bind(now)
                .execute(&mut *conn)
                .await?;
                user.id.clone()
            }
        };

        for account in &user.accounts {
            sqlx::query(
                r#"
                INSERT INTO accounts (
                    id, account_type, provider, provider_account_id, access_token,
                    refresh_token, expires_at, token_type, scope, id_token,
                    session_state, user_id, created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (provider, provider_account_id) DO UPDATE SET
                    access_token = excluded.access_token,
                    refresh_token = excluded.refresh_token,
                    expires_at = excluded.expires_at,
                    token_type = excluded.token_type,
                    scope = excluded.scope,
                    id_token = excluded.id_token,
                    session_state = excluded.session_state,
                    user_id = excluded.user_id,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&account.id)
            .bind(account.account_type.as_str())
            .bind(&account.provider)
            .bind(&account.provider_account_id)
            .bind(&account.access_token)
            .bind(&account.refresh_token)
            .bind(account.expires_at)
            .bind(&account.token_type)
            .bind(&account.scope)
            .bind(&account.id_token)
            .bind(&account.session_state)
            .bind(&user_id)
            .bind(now)
            .bind(now)
            .execute(&mut *conn)
            .await?;
        }

        Ok(user_id)
    }

    async fn user_id_by(&self, query: &str, value: &str) -> AdapterResult<User> {
        let mut conn = self.pool.acquire().await?;
        let user_id = sqlx::query_scalar::<_, String>(query)
            .bind(value)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or(AdapterError::NotFound("user"))?;
        Self::load_user(&mut *conn, &user_id).await
    }
}

#[async_trait]
impl Adapter for SqliteAdapter {
    async fn create_user(&self, user: User) -> AdapterResult<User> {
        let mut tx = self.begin_write().await?;
        let user_id = Self::upsert_user(&mut *tx, user).await?;
        let user = Self::load_user(&mut *tx, &user_id).await?;
        tx.commit().await?;
        Ok(user)
    }

    async fn get_user(&self, id: &str) -> AdapterResult<User> {
        let mut conn = self.pool.acquire().await?;
        Self::load_user(&mut *conn, id).await
    }

    async fn get_user_by_email(&self, email: &str) -> AdapterResult<User> {
        self.user_id_by(
            "SELECT id FROM users WHERE email = ? COLLATE NOCASE AND email <> '' ORDER BY email_verified DESC, created_at ASC LIMIT 1",
            email,
        )
        .await
    }

    async fn get_user_by_account(
        &self,
        provider: &str,
        provider_account_id: &str,
    ) -> AdapterResult<User> {
        let mut conn = self.pool.acquire().await?;
        let user_id = sqlx::query_scalar::<_, String>(
            "SELECT user_id FROM accounts WHERE provider = ? AND provider_account_id = ? AND user_id IS NOT NULL",
        )
        .bind(provider)
        .bind(provider_account_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(AdapterError::NotFound("user"))?;
        Self::load_user(&mut *conn, &user_id).await
    }

    async fn update_user(&self, user: User) -> AdapterResult<User> {
        let mut conn = self.pool.acquire().await?;
        let updated = sqlx::query(
            "UPDATE users SET name = ?, email = ?, email_verified = ?, image = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&user.name)
        .bind(&user.email)
        .bind(user.email_verified)
        .bind(&user.image)
        .bind(Utc::now())
        .bind(&user.id)
        .execute(&mut *conn)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(AdapterError::NotFound("user"));
        }
        Self::load_user(&mut *conn, &user.id).await
    }

    async fn delete_user(&self, id: &str) -> AdapterResult<()> {
        let mut tx = self.begin_write().await?;
        sqlx::query("DELETE FROM sessions WHERE user_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM accounts WHERE user_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(AdapterError::NotFound("user"));
        }
        tx.commit().await?;
        Ok(())
    }

    async fn link_account(&self, account_id: &str, user_id: &str) -> AdapterResult<()> {
        let user_exists = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;
        if user_exists == 0 {
            return Err(AdapterError::NotFound("user"));
        }

        let updated = sqlx::query("UPDATE accounts SET user_id = ?, updated_at = ? WHERE id = ?")
            .bind(user_id)
            .bind(Utc::now())
            .bind(account_id)
            .execute(&self.pool)
            .await?;
        if updated.rows_affected() == 0 {
            return Err(AdapterError::NotFound("account"));
        }
        Ok(())
    }

    async fn unlink_account(&self, account_id: &str, user_id: &str) -> AdapterResult<()> {
        let updated = sqlx::query(
            "UPDATE accounts SET user_id = NULL, updated_at = ? WHERE id = ? AND user_id = ?",
        )
        .bind(Utc::now())
        .bind(account_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(AdapterError::NotFound("account"));
        }
        Ok(())
    }

    async fn create_session(
        &self,
        user_id: &str,
        expires_at: DateTime<Utc>,
        csrf: CsrfToken,
    ) -> AdapterResult<Session> {
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

        sqlx::query(
            r#"
            INSERT INTO sessions (
                id, token_hash, user_id, expires_at, csrf_token, csrf_expires_at,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&session.id)
        .bind(hash_session_token(&session.session_token))
        .bind(&session.user_id)
        .bind(session.expires_at.timestamp_millis())
        .bind(&session.csrf.token)
        .bind(session.csrf.expires_at.timestamp_millis())
        .bind(session.created_at)
        .bind(session.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
                AdapterError::Validation(format!("unknown user {user_id}"))
            }
            other => AdapterError::Database(other),
        })?;

        Ok(session)
    }

    async fn get_session(&self, session_token: &str) -> AdapterResult<Session> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE token_hash = ?"
        ))
        .bind(hash_session_token(session_token))
        .fetch_optional(&self.pool)
        .await?
        .ok_or(AdapterError::NotFound("session"))?;
        row.into_session(session_token)
    }

    async fn update_session(&self, session: Session) -> AdapterResult<Session> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            r#"
            UPDATE sessions
            SET csrf_token = ?, csrf_expires_at = ?,
                expires_at = MAX(expires_at, ?), updated_at = ?
            WHERE token_hash = ?
            RETURNING {SESSION_COLUMNS}
            "#
        ))
        .bind(&session.csrf.token)
        .bind(session.csrf.expires_at.timestamp_millis())
        .bind(session.expires_at.timestamp_millis())
        .bind(Utc::now())
        .bind(hash_session_token(&session.session_token))
        .fetch_optional(&self.pool)
        .await?
        .ok_or(AdapterError::NotFound("session"))?;
        row.into_session(&session.session_token)
    }

    async fn refresh_session(&self, session: Session) -> AdapterResult<Session> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            r#"
            UPDATE sessions
            SET expires_at = MAX(expires_at, ?), updated_at = ?
            WHERE token_hash = ?
            RETURNING {SESSION_COLUMNS}
            "#
        ))
        .bind(session.expires_at.timestamp_millis())
        .bind(Utc::now())
        .bind(hash_session_token(&session.session_token))
        .fetch_optional(&self.pool)
        .await?
        .ok_or(AdapterError::NotFound("session"))?;
        row.into_session(&session.session_token)
    }

    async fn swap_session_csrf(
        &self,
        session_token: &str,
        expected: &str,
        next: CsrfToken,
    ) -> AdapterResult<Session> {
        let token_hash = hash_session_token(session_token);
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            r#"
            UPDATE sessions
            SET csrf_token = ?, csrf_expires_at = ?, updated_at = ?
            WHERE token_hash = ? AND csrf_token = ?
            RETURNING {SESSION_COLUMNS}
            "#
        ))
        .bind(&next.token)
        .bind(next.expires_at.timestamp_millis())
        .bind(Utc::now())
        .bind(&token_hash)
        .bind(expected)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.into_session(session_token),
            None => {
                let exists =
                    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM sessions WHERE token_hash = ?")
                        .bind(&token_hash)
                        .fetch_one(&self.pool)
                        .await?;
                if exists == 0 {
                    Err(AdapterError::NotFound("session"))
                } else {
                    Err(AdapterError::Conflict("csrf token"))
                }
            }
        }
    }

    async fn delete_session(&self, session_token: &str) -> AdapterResult<()> {
        let deleted = sqlx::query("DELETE FROM sessions WHERE token_hash = ?")
            .bind(hash_session_token(session_token))
            .execute(&self.pool)
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(AdapterError::NotFound("session"));
        }
        Ok(())
    }

    async fn delete_expired_sessions(&self) -> AdapterResult<u64> {
        let deleted = sqlx::query("DELETE FROM sessions WHERE expires_at <= ?")
            .bind(Utc::now().timestamp_millis())
            .execute(&self.pool)
            .await?;
        Ok(deleted.rows_affected())
    }

    async fn create_verification_token(
        &self,
        token: VerificationToken,
    ) -> AdapterResult<VerificationToken> {
        sqlx::query(
            "INSERT INTO verification_tokens (identifier, token, expires_at, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&token.identifier)
        .bind(&token.token)
        .bind(token.expires_at.timestamp_millis())
        .bind(token.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                AdapterError::Validation("verification token already exists".to_string())
            }
            other => AdapterError::Database(other),
        })?;
        Ok(token)
    }

    async fn use_verification_token(
        &self,
        identifier: &str,
        token: &str,
    ) -> AdapterResult<VerificationToken> {
        let row = sqlx::query_as::<_, VerificationTokenRow>(
            r#"
            DELETE FROM verification_tokens
            WHERE identifier = ? AND token = ?
            RETURNING identifier, token, expires_at, created_at
            "#,
        )
        .bind(identifier)
        .bind(token)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(AdapterError::NotFound("verification token"))?;

        let consumed = VerificationToken {
            identifier: row.identifier,
            token: row.token,
            expires_at: from_millis(row.expires_at)?,
            created_at: row.created_at,
        };
        if consumed.has_expired_at(Utc::now()) {
            return Err(AdapterError::NotFound("verification token"));
        }
        Ok(consumed)
    }
}
