//! E2E tests for the CSRF guard

mod common;

use authgate::data::{Adapter, CsrfToken};
use chrono::{Duration, Utc};
use common::TestServer;

const CSRF_HEADER: &str = "x-csrf-token";

/// Seed a session and fetch its current CSRF token via `/session`
async fn session_with_token(server: &TestServer) -> (String, String) {
    let session = server.seed_session(Utc::now() + Duration::hours(1)).await;
    let cookie = server.session_cookie(&session.session_token);

    let response = server
        .client
        .get(server.url("/session"))
        .header("Cookie", &cookie)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let token = csrf_header(&response).expect("csrf header");
    (cookie, token)
}

fn csrf_header(response: &reqwest::Response) -> Option<String> {
    response
        .headers()
        .get(CSRF_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string)
}

async fn post_echo(server: &TestServer, cookie: &str, token: Option<&str>) -> reqwest::Response {
    let mut request = server
        .client
        .post(server.url("/api/echo"))
        .header("Cookie", cookie)
        .body("hello");
    if let Some(token) = token {
        request = request.header(CSRF_HEADER, token);
    }
    request.send().await.unwrap()
}

async fn error_type(response: reqwest::Response) -> String {
    let body: serde_json::Value = response.json().await.unwrap();
    body["type"].as_str().unwrap_or_default().to_string()
}

#[tokio::test]
async fn test_post_without_token_is_forbidden() {
    let server = TestServer::new().await;
    let (cookie, _token) = session_with_token(&server).await;

    let response = post_echo(&server, &cookie, None).await;

    assert_eq!(response.status(), 403);
    assert_eq!(error_type(response).await, "csrf_token_not_found");
    assert_eq!(server.hits(), 0);
}

#[tokio::test]
async fn test_token_is_single_use_and_rotated() {
    let server = TestServer::new().await;
    let (cookie, first) = session_with_token(&server).await;

    let response = post_echo(&server, &cookie, Some(first.as_str())).await;
    assert_eq!(response.status(), 200);
    let second = csrf_header(&response).expect("rotated token");
    assert_ne!(first, second);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["message"], "hello");

    let replay = post_echo(&server, &cookie, Some(first.as_str())).await;
    assert_eq!(replay.status(), 403);
    assert_eq!(error_type(replay).await, "csrf_token_invalid");

    let response = post_echo(&server, &cookie, Some(second.as_str())).await;
    assert_eq!(response.status(), 200);
    assert_eq!(server.hits(), 2);
}

#[tokio::test]
async fn test_wrong_token_is_rejected() {
    let server = TestServer::new().await;
    let (cookie, _token) = session_with_token(&server).await;

    let response = post_echo(&server, &cookie, Some("not-the-token")).await;

    assert_eq!(response.status(), 403);
    assert_eq!(error_type(response).await, "csrf_token_invalid");
}

#[tokio::test]
async fn test_expired_token_is_rejected_then_reissued() {
    let server = TestServer::new().await;
    let mut session = server.seed_session(Utc::now() + Duration::hours(1)).await;
    let cookie = server.session_cookie(&session.session_token);

    session.csrf = CsrfToken {
        token: "expired-token".to_string(),
        expires_at: Utc::now() - Duration::seconds(1),
    };
    server.adapter.update_session(session).await.unwrap();

    let response = post_echo(&server, &cookie, Some("expired-token")).await;
    assert_eq!(response.status(), 403);
    assert_eq!(error_type(response).await, "csrf_token_expired");

    // Reading the session replaces the expired sub-record
    let response = server
        .client
        .get(server.url("/session"))
        .header("Cookie", &cookie)
        .send()
        .await
        .unwrap();
    let fresh = csrf_header(&response).expect("fresh token");
    assert_ne!(fresh, "expired-token");

    let response = post_echo(&server, &cookie, Some(fresh.as_str())).await;
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn test_read_only_methods_need_no_token() {
    let server = TestServer::new().await;
    let (cookie, _token) = session_with_token(&server).await;

    let response = server
        .client
        .get(server.url("/api/echo"))
        .header("Cookie", &cookie)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert!(csrf_header(&response).is_none());
}

#[tokio::test]
async fn test_post_without_session_never_reaches_the_guard() {
    let server = TestServer::new().await;

    let response = server
        .client
        .post(server.url("/api/echo"))
        .header(CSRF_HEADER, "anything")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 303);
    assert_eq!(server.hits(), 0);
}
