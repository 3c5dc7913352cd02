//! Database tests

use super::*;
use chrono::{Duration, Utc};
use tempfile::TempDir;

/// Helper to create a test database
async fn create_test_db() -> (SqliteAdapter, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test.db");
    let db = SqliteAdapter::connect(&db_path).await.unwrap();
    (db, temp_dir)
}

fn github_user(provider_account_id: &str, email: &str) -> User {
    let mut user = User::new("Octo Cat", email);
    let mut account = Account::new(AccountType::OAuth2, "github", provider_account_id);
    account.access_token = Some("gho_access".to_string());
    user.accounts.push(account);
    user
}

async fn stored_user(db: &SqliteAdapter) -> User {
    let mut user = github_user("583231", "octocat@github.com");
    user.email_verified = true;
    db.create_user(user).await.unwrap()
}

#[tokio::test]
async fn test_database_connection() {
    let (_db, _temp_dir) = create_test_db().await;
}

#[tokio::test]
async fn test_create_user_with_account() {
    let (db, _temp_dir) = create_test_db().await;

    let user = stored_user(&db).await;
    assert_eq!(user.email, "octocat@github.com");
    assert_eq!(user.accounts.len(), 1);
    assert_eq!(user.accounts[0].provider, "github");
    assert_eq!(user.accounts[0].user_id.as_deref(), Some(user.id.as_str()));

    let by_account = db.get_user_by_account("github", "583231").await.unwrap();
    assert_eq!(by_account.id, user.id);

    let by_email = db.get_user_by_email("OCTOCAT@github.com").await.unwrap();
    assert_eq!(by_email.id, user.id);
}

#[tokio::test]
async fn test_create_user_matches_existing_account() {
    let (db, _temp_dir) = create_test_db().await;

    let first = stored_user(&db).await;

    let mut again = github_user("583231", "changed@example.com");
    again.accounts[0].access_token = Some("gho_rotated".to_string());
    let second = db.create_user(again).await.unwrap();

    assert_eq!(second.id, first.id);
    assert_eq!(second.accounts.len(), 1);
    assert_eq!(
        second.accounts[0].access_token.as_deref(),
        Some("gho_rotated")
    );
}

#[tokio::test]
async fn test_create_user_links_new_provider_by_verified_email() {
    let (db, _temp_dir) = create_test_db().await;

    let first = stored_user(&db).await;

    let mut entra = User::new("Octo Cat", "octocat@github.com");
    entra.email_verified = true;
    entra
        .accounts
        .push(Account::new(AccountType::Oidc, "entraid", "a1b2c3"));
    let linked = db.create_user(entra).await.unwrap();

    assert_eq!(linked.id, first.id);
    assert_eq!(linked.accounts.len(), 2);
}

#[tokio::test]
async fn test_unverified_email_creates_a_separate_user() {
    let (db, _temp_dir) = create_test_db().await;

    let victim = stored_user(&db).await;

    let mut entra = User::new("Mallory", "OctoCat@github.com");
    entra
        .accounts
        .push(Account::new(AccountType::Oidc, "entraid", "evil-tenant-oid"));
    let created = db.create_user(entra).await.unwrap();

    assert_ne!(created.id, victim.id);
    assert_eq!(db.get_user(&victim.id).await.unwrap().accounts.len(), 1);

    // Lookups by address still resolve to the verified owner
    let by_email = db.get_user_by_email("octocat@github.com").await.unwrap();
    assert_eq!(by_email.id, victim.id);
}

#[tokio::test]
async fn test_cancelled_upsert_releases_its_transaction() {
    let (db, _temp_dir) = create_test_db().await;

    // Hold the write lock so the upsert stalls inside its transaction
    let mut blocker = db.pool.begin().await.unwrap();
    sqlx::query("UPDATE users SET id = id WHERE 0")
        .execute(&mut *blocker)
        .await
        .unwrap();

    let stalled = tokio::time::timeout(
        std::time::Duration::from_millis(100),
        db.create_user(github_user("1", "stalled@example.com")),
    )
    .await;
    assert!(stalled.is_err());

    blocker.rollback().await.unwrap();

    // Every pooled connection must still accept a new write transaction
    for i in 0..12 {
        db.create_user(github_user(
            &format!("after-{i}"),
            &format!("after-{i}@example.com"),
        ))
        .await
        .unwrap();
    }
    assert!(
        db.get_user_by_account("github", "1")
            .await
            .unwrap_err()
            .is_not_found()
    );
}

#[tokio::test]
async fn test_missing_user_is_not_found() {
    let (db, _temp_dir) = create_test_db().await;

    let error = db.get_user("01ARZ3NDEKTSV4RRFFQ69G5FAV").await.unwrap_err();
    assert!(error.is_not_found());

    let error = db.get_user_by_account("github", "nope").await.unwrap_err();
    assert!(error.is_not_found());
}

#[tokio::test]
async fn test_update_and_delete_user() {
    let (db, _temp_dir) = create_test_db().await;

    let mut user = stored_user(&db).await;
    user.name = "Mona".to_string();
    user.email_verified = true;
    let updated = db.update_user(user).await.unwrap();
    assert_eq!(updated.name, "Mona");
    assert!(updated.email_verified);

    let session = db
        .create_session(
            &updated.id,
            Utc::now() + Duration::hours(7),
            CsrfToken::issue(Duration::minutes(30)),
        )
        .await
        .unwrap();

    db.delete_user(&updated.id).await.unwrap();

    assert!(db.get_user(&updated.id).await.unwrap_err().is_not_found());
    assert!(
        db.get_session(&session.session_token)
            .await
            .unwrap_err()
            .is_not_found()
    );
    assert!(
        db.get_user_by_account("github", "583231")
            .await
            .unwrap_err()
            .is_not_found()
    );
}

#[tokio::test]
async fn test_unlink_and_link_account() {
    let (db, _temp_dir) = create_test_db().await;

    let user = stored_user(&db).await;
    let account_id = user.accounts[0].id.clone();

    db.unlink_account(&account_id, &user.id).await.unwrap();
    assert!(db.get_user(&user.id).await.unwrap().accounts.is_empty());

    let error = db.unlink_account(&account_id, &user.id).await.unwrap_err();
    assert!(error.is_not_found());

    db.link_account(&account_id, &user.id).await.unwrap();
    assert_eq!(db.get_user(&user.id).await.unwrap().accounts.len(), 1);
}

#[tokio::test]
async fn test_session_roundtrip_hides_token() {
    let (db, _temp_dir) = create_test_db().await;

    let user = stored_user(&db).await;
    let expires_at = Utc::now() + Duration::hours(7);
    let session = db
        .create_session(&user.id, expires_at, CsrfToken::issue(Duration::minutes(30)))
        .await
        .unwrap();

    let stored_hash: String =
        sqlx::query_scalar("SELECT token_hash FROM sessions WHERE id = ?")
            .bind(&session.id)
            .fetch_one(&db.pool)
            .await
            .unwrap();
    assert!(stored_hash.starts_with("sha256:"));
    assert_ne!(stored_hash, session.session_token);

    let fetched = db.get_session(&session.session_token).await.unwrap();
    assert_eq!(fetched.id, session.id);
    assert_eq!(fetched.user_id, user.id);
    assert_eq!(
        fetched.expires_at.timestamp_millis(),
        expires_at.timestamp_millis()
    );
    assert_eq!(fetched.csrf.token, session.csrf.token);
}

#[tokio::test]
async fn test_create_session_rejects_unknown_user() {
    let (db, _temp_dir) = create_test_db().await;

    let error = db
        .create_session(
            "01ARZ3NDEKTSV4RRFFQ69G5FAV",
            Utc::now() + Duration::hours(7),
            CsrfToken::issue(Duration::minutes(30)),
        )
        .await
        .unwrap_err();
    assert!(matches!(error, crate::error::AdapterError::Validation(_)));
}

#[tokio::test]
async fn test_refresh_session_never_moves_expiry_backwards() {
    let (db, _temp_dir) = create_test_db().await;

    let user = stored_user(&db).await;
    let later = Utc::now() + Duration::hours(7);
    let mut session = db
        .create_session(&user.id, later, CsrfToken::issue(Duration::minutes(30)))
        .await
        .unwrap();

    session.expires_at = later - Duration::hours(1);
    let refreshed = db.refresh_session(session.clone()).await.unwrap();
    assert_eq!(
        refreshed.expires_at.timestamp_millis(),
        later.timestamp_millis()
    );

    session.expires_at = later + Duration::hours(1);
    let refreshed = db.refresh_session(session).await.unwrap();
    assert_eq!(
        refreshed.expires_at.timestamp_millis(),
        (later + Duration::hours(1)).timestamp_millis()
    );
}

#[tokio::test]
async fn test_update_session_replaces_csrf() {
    let (db, _temp_dir) = create_test_db().await;

    let user = stored_user(&db).await;
    let mut session = db
        .create_session(
            &user.id,
            Utc::now() + Duration::hours(7),
            CsrfToken::issue(Duration::minutes(30)),
        )
        .await
        .unwrap();
    let old_csrf = session.csrf.token.clone();

    session.csrf = CsrfToken::issue(Duration::minutes(30));
    let updated = db.update_session(session.clone()).await.unwrap();
    assert_ne!(updated.csrf.token, old_csrf);

    let fetched = db.get_session(&session.session_token).await.unwrap();
    assert_eq!(fetched.csrf.token, session.csrf.token);
}

#[tokio::test]
async fn test_swap_session_csrf_only_replaces_the_expected_token() {
    let (db, _temp_dir) = create_test_db().await;

    let user = stored_user(&db).await;
    let session = db
        .create_session(
            &user.id,
            Utc::now() + Duration::hours(7),
            CsrfToken::issue(Duration::minutes(30)),
        )
        .await
        .unwrap();
    let original = session.csrf.token.clone();

    let swapped = db
        .swap_session_csrf(
            &session.session_token,
            &original,
            CsrfToken::issue(Duration::minutes(30)),
        )
        .await
        .unwrap();
    assert_ne!(swapped.csrf.token, original);
    assert_eq!(swapped.expires_at, session.expires_at);

    // A second swap from the same snapshot loses
    let error = db
        .swap_session_csrf(
            &session.session_token,
            &original,
            CsrfToken::issue(Duration::minutes(30)),
        )
        .await
        .unwrap_err();
    assert!(matches!(error, crate::error::AdapterError::Conflict(_)));

    let fetched = db.get_session(&session.session_token).await.unwrap();
    assert_eq!(fetched.csrf.token, swapped.csrf.token);

    let error = db
        .swap_session_csrf("unknown", &original, CsrfToken::issue(Duration::minutes(30)))
        .await
        .unwrap_err();
    assert!(error.is_not_found());
}

#[tokio::test]
async fn test_delete_session_and_expired_sweep() {
    let (db, _temp_dir) = create_test_db().await;

    let user = stored_user(&db).await;
    let live = db
        .create_session(
            &user.id,
            Utc::now() + Duration::hours(7),
            CsrfToken::issue(Duration::minutes(30)),
        )
        .await
        .unwrap();
    let stale = db
        .create_session(
            &user.id,
            Utc::now() - Duration::seconds(1),
            CsrfToken::issue(Duration::minutes(30)),
        )
        .await
        .unwrap();

    assert_eq!(db.delete_expired_sessions().await.unwrap(), 1);
    assert!(
        db.get_session(&stale.session_token)
            .await
            .unwrap_err()
            .is_not_found()
    );

    db.delete_session(&live.session_token).await.unwrap();
    assert!(
        db.delete_session(&live.session_token)
            .await
            .unwrap_err()
            .is_not_found()
    );
}

#[tokio::test]
async fn test_verification_token_is_single_use() {
    let (db, _temp_dir) = create_test_db().await;

    let token = VerificationToken::new("oauth_state:github", "nonce", Duration::minutes(10));
    db.create_verification_token(token).await.unwrap();

    let used = db
        .use_verification_token("oauth_state:github", "nonce")
        .await
        .unwrap();
    assert_eq!(used.token, "nonce");

    let error = db
        .use_verification_token("oauth_state:github", "nonce")
        .await
        .unwrap_err();
    assert!(error.is_not_found());
}

#[tokio::test]
async fn test_expired_verification_token_is_rejected() {
    let (db, _temp_dir) = create_test_db().await;

    let token = VerificationToken::new("oauth_state:github", "old", Duration::seconds(-1));
    db.create_verification_token(token).await.unwrap();

    let error = db
        .use_verification_token("oauth_state:github", "old")
        .await
        .unwrap_err();
    assert!(error.is_not_found());
}
