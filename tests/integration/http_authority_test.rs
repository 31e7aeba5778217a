//! Integration tests for HttpAuthority over reqwest
use std::time::Duration;

use anyhow::Result;
use mockito::Matcher;
use serde_json::json;

use benchdash_session::{AuthAuthority, AuthError, AuthorizationHeader};

use crate::test_harness::{http_authority, tokens_json, user_json};

#[tokio::test]
async fn test_exchange_code_posts_camel_case_body() -> Result<()> {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/api/auth/google")
        .match_body(Matcher::Json(json!({
            "code": "abc",
            "redirectUri": "http://localhost:3000/auth/callback"
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(tokens_json("access-1", "refresh-1"))
        .create_async()
        .await;

    let authority = http_authority(&server.url(), &AuthorizationHeader::new());
    let tokens = authority
        .exchange_code("abc", "http://localhost:3000/auth/callback")
        .await?;

    assert_eq!(tokens.access_token, "access-1");
    assert_eq!(tokens.user.unwrap().id, "7");
    mock.assert_async().await;
    Ok(())
}

#[tokio::test]
async fn test_validate_sends_bearer_token() -> Result<()> {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/api/auth/validate")
        .match_header("authorization", "Bearer access-1")
        .with_status(200)
        .with_body(json!({ "user": user_json() }).to_string())
        .create_async()
        .await;

    let authority = http_authority(&server.url(), &AuthorizationHeader::new());
    let user = authority.validate("access-1").await?;

    assert_eq!(user.email, "grace@example.com");
    assert_eq!(user.display_name.as_deref(), Some("Grace"));
    mock.assert_async().await;
    Ok(())
}

#[tokio::test]
async fn test_status_codes_are_classified() {
    let mut server = mockito::Server::new_async().await;
    let authority = http_authority(&server.url(), &AuthorizationHeader::new());

    let rejected = server
        .mock("POST", "/api/auth/validate")
        .with_status(401)
        .create_async()
        .await;
    assert_eq!(
        authority.validate("t").await,
        Err(AuthError::AuthorizationRejected { status: 401 })
    );
    rejected.remove_async().await;

    let unavailable = server
        .mock("POST", "/api/auth/validate")
        .with_status(503)
        .with_body("maintenance")
        .create_async()
        .await;
    assert!(authority.validate("t").await.unwrap_err().is_transient());
    unavailable.remove_async().await;

    let missing = server
        .mock("POST", "/api/auth/validate")
        .with_status(404)
        .create_async()
        .await;
    assert!(matches!(
        authority.validate("t").await,
        Err(AuthError::TransientNetwork { .. })
    ));
    missing.remove_async().await;

    let _malformed = server
        .mock("POST", "/api/auth/validate")
        .with_status(200)
        .with_body("not json")
        .create_async()
        .await;
    assert!(matches!(
        authority.validate("t").await,
        Err(AuthError::Validation { .. })
    ));
}

#[tokio::test]
async fn test_throttling_carries_retry_after() {
    let mut server = mockito::Server::new_async().await;
    let _throttled = server
        .mock("POST", "/api/auth/refresh")
        .with_status(429)
        .with_header("retry-after", "30")
        .create_async()
        .await;

    let authority = http_authority(&server.url(), &AuthorizationHeader::new());

    assert_eq!(
        authority.refresh("r").await,
        Err(AuthError::RemoteThrottled {
            retry_after: Some(Duration::from_secs(30))
        })
    );
}

#[tokio::test]
async fn test_unreachable_authority_is_transient() {
    // Nothing listens on the discard port
    let authority = http_authority("http://127.0.0.1:9", &AuthorizationHeader::new());

    let result = authority.logout("r").await;

    assert!(matches!(result, Err(AuthError::TransientNetwork { .. })));
}
