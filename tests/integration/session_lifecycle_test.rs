//! Integration tests for a full session lifecycle over HTTP
use std::sync::Arc;

use anyhow::Result;
use mockito::Matcher;
use serde_json::json;

use benchdash_session::auth::storage::{ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY};
use benchdash_session::{
    AuthError, AuthService, AuthorizationHeader, EventBus, EventReason, FileStorage,
    MemoryStorage, Storage,
};

use crate::test_harness::{config_for, http_authority, record_events, tokens_json, user_json, CALLER};

#[tokio::test]
async fn test_login_validate_logout() -> Result<()> {
    let mut server = mockito::Server::new_async().await;
    let exchange = server
        .mock("POST", "/api/auth/google")
        .with_status(200)
        .with_body(tokens_json("access-1", "refresh-1"))
        .expect(1)
        .create_async()
        .await;
    let validate = server
        .mock("POST", "/api/auth/validate")
        .match_header("authorization", "Bearer access-1")
        .with_status(200)
        .with_body(json!({ "user": user_json() }).to_string())
        .expect(1)
        .create_async()
        .await;
    let logout = server
        .mock("POST", "/api/auth/logout")
        .match_body(Matcher::PartialJson(json!({"refreshToken": "refresh-1"})))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let header = AuthorizationHeader::new();
    let bus = EventBus::new();
    let (events, _subscription) = record_events(&bus);
    let service = AuthService::new(
        config_for(&server.url()),
        http_authority(&server.url(), &header),
        Arc::new(MemoryStorage::new()),
        header.clone(),
        bus,
    )?;

    let user = service.login("abc", None, CALLER).await?;
    assert_eq!(user.email, "grace@example.com");
    assert_eq!(header.value().as_deref(), Some("Bearer access-1"));

    // Second call is answered from the cache
    assert!(service.validate().await);
    assert!(service.validate().await);

    service.logout().await;
    assert_eq!(header.value(), None);
    assert!(!service.is_authenticated());

    let reasons: Vec<_> = events.lock().unwrap().iter().map(|e| e.reason).collect();
    assert_eq!(
        reasons,
        vec![
            EventReason::LoginSuccess,
            EventReason::SessionValid,
            EventReason::Logout
        ]
    );

    exchange.assert_async().await;
    validate.assert_async().await;
    logout.assert_async().await;
    service.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_server_outage_does_not_log_out() -> Result<()> {
    let mut server = mockito::Server::new_async().await;
    let _exchange = server
        .mock("POST", "/api/auth/google")
        .with_status(200)
        .with_body(tokens_json("access-1", "refresh-1"))
        .create_async()
        .await;
    let _validate = server
        .mock("POST", "/api/auth/validate")
        .with_status(502)
        .with_body("bad gateway")
        .create_async()
        .await;

    let header = AuthorizationHeader::new();
    let storage = Arc::new(MemoryStorage::new());
    let service = AuthService::new(
        config_for(&server.url()),
        http_authority(&server.url(), &header),
        storage.clone(),
        header,
        EventBus::new(),
    )?;

    service.login("abc", None, CALLER).await?;
    assert!(service.validate().await);
    assert_eq!(storage.get(ACCESS_TOKEN_KEY).as_deref(), Some("access-1"));
    service.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_bad_code_is_surfaced_and_nothing_stored() -> Result<()> {
    let mut server = mockito::Server::new_async().await;
    let _exchange = server
        .mock("POST", "/api/auth/google")
        .with_status(400)
        .with_body("invalid_grant")
        .create_async()
        .await;

    let header = AuthorizationHeader::new();
    let storage = Arc::new(MemoryStorage::new());
    let service = AuthService::new(
        config_for(&server.url()),
        http_authority(&server.url(), &header),
        storage.clone(),
        header,
        EventBus::new(),
    )?;

    let result = service.login("expired-code", None, CALLER).await;

    assert!(matches!(
        result,
        Err(AuthError::UnexpectedStatus { status: 400, .. })
    ));
    assert_eq!(storage.get(ACCESS_TOKEN_KEY), None);
    assert_eq!(service.remaining_login_attempts(CALLER), 4);
    Ok(())
}

#[tokio::test]
async fn test_restore_from_file_refreshes_opaque_token() -> Result<()> {
    let path = std::env::temp_dir().join(format!("benchdash-it-{}.json", uuid::Uuid::new_v4()));
    {
        let storage = FileStorage::open(&path);
        storage.set(ACCESS_TOKEN_KEY, "opaque-access")?;
        storage.set(REFRESH_TOKEN_KEY, "stored-refresh")?;
    }

    let mut server = mockito::Server::new_async().await;
    let refresh = server
        .mock("POST", "/api/auth/refresh")
        .match_body(Matcher::Json(json!({"refreshToken": "stored-refresh"})))
        .with_status(200)
        .with_body(tokens_json("access-2", "refresh-2"))
        .expect(1)
        .create_async()
        .await;
    let _validate = server
        .mock("POST", "/api/auth/validate")
        .match_header("authorization", "Bearer access-2")
        .with_status(200)
        .with_body(user_json().to_string())
        .create_async()
        .await;

    let header = AuthorizationHeader::new();
    let service = AuthService::new(
        config_for(&server.url()),
        http_authority(&server.url(), &header),
        Arc::new(FileStorage::open(&path)),
        header,
        EventBus::new(),
    )?;

    assert!(service.restore().await);
    refresh.assert_async().await;
    service.shutdown();

    assert_eq!(
        FileStorage::open(&path).get(REFRESH_TOKEN_KEY).as_deref(),
        Some("refresh-2")
    );
    let _ = std::fs::remove_file(&path);
    Ok(())
}
