//! End-to-end scenarios for AuthService
//!
//! Each test wires a complete session manager to the scripted authority
//! and a manual clock, then checks tokens, flags and published events.

use std::sync::{Arc, Mutex};

use chrono::Duration;
use futures::future::join_all;

use crate::auth::storage::{ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY};
use crate::auth::{AuthEvent, AuthService, AuthorizationHeader, EventReason, MemoryStorage, Storage};
use crate::common::{BackoffPolicy, ManualClock};
use crate::config::{AuthConfig, OAuthConfig, RateLimitConfig, SessionConfig};
use crate::error::AuthError;
use crate::event_bus::{EventBus, Subscription};
use crate::tests::test_helpers::{test_user, MockAuthority};

const CALLER: &str = "Mozilla/5.0|2026-10-19";

struct ServiceHarness {
    service: AuthService,
    authority: Arc<MockAuthority>,
    storage: Arc<MemoryStorage>,
    clock: ManualClock,
    events: Arc<Mutex<Vec<AuthEvent>>>,
    _subscription: Subscription,
}

impl ServiceHarness {
    fn new() -> Self {
        Self::with_storage(Arc::new(MemoryStorage::new()))
    }

    fn with_storage(storage: Arc<MemoryStorage>) -> Self {
        let authority = Arc::new(MockAuthority::new());
        let clock = ManualClock::default();
        let bus = EventBus::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let subscription = {
            let events = events.clone();
            bus.subscribe(move |event| {
                events.lock().unwrap().push(event.clone());
                Ok(())
            })
        };

        let service = AuthService::with_clock(
            test_config(),
            authority.clone(),
            storage.clone(),
            AuthorizationHeader::new(),
            bus,
            Arc::new(clock.clone()),
        )
        .expect("valid test configuration");

        Self {
            service,
            authority,
            storage,
            clock,
            events,
            _subscription: subscription,
        }
    }

    fn reasons(&self) -> Vec<EventReason> {
        self.events.lock().unwrap().iter().map(|e| e.reason).collect()
    }

    fn count(&self, reason: EventReason) -> usize {
        self.reasons().into_iter().filter(|r| *r == reason).count()
    }

    async fn login(&self) {
        self.service
            .login("abc", None, CALLER)
            .await
            .expect("login succeeds");
    }
}

fn test_config() -> AuthConfig {
    AuthConfig {
        api_base_url: "http://localhost:8000/api".to_string(),
        oauth: OAuthConfig {
            client_id: "client-123".to_string(),
            authorization_endpoint: "https://accounts.example.com/o/oauth2/auth".to_string(),
            redirect_uri: "http://localhost:3000/auth/callback".to_string(),
            default_scopes: vec!["openid".to_string(), "email".to_string()],
        },
        token_store_path: None,
        request_timeout_seconds: 30,
        session: SessionConfig {
            cache_ttl_seconds: 900,
            debounce_millis: 5_000,
            refresh_threshold_seconds: 300,
            default_token_lifetime_seconds: 3600,
            proactive_refresh_check_seconds: 300,
            revalidation_interval_seconds: 60,
            min_revalidation_spacing_seconds: 30,
            max_consecutive_failures: 3,
        },
        rate_limit: RateLimitConfig {
            max_attempts: 5,
            window_seconds: 300,
            sweep_interval_seconds: 60,
        },
        login_backoff: BackoffPolicy::linear(1_000, 3),
    }
}

#[tokio::test]
async fn test_scenario_a_login_stores_tokens_and_announces() {
    let h = ServiceHarness::new();

    let user = h.service.login("abc", None, CALLER).await.unwrap();

    assert_eq!(user, test_user());
    assert_eq!(h.storage.get(ACCESS_TOKEN_KEY).as_deref(), Some("access-1"));
    assert_eq!(h.storage.get(REFRESH_TOKEN_KEY).as_deref(), Some("refresh-1"));
    assert_eq!(
        h.service.authorization_header().value().as_deref(),
        Some("Bearer access-1")
    );
    assert!(h.service.is_authenticated());
    assert_eq!(h.service.current_user(), Some(test_user()));
    assert!(h.service.revalidator().is_running());

    let events = h.events.lock().unwrap().clone();
    assert_eq!(events.len(), 1);
    assert!(events[0].is_authenticated);
    assert_eq!(events[0].reason, EventReason::LoginSuccess);
    assert_eq!(events[0].user, Some(test_user()));
}

#[tokio::test]
async fn test_scenario_b_near_expiry_refreshes_before_validating() {
    let h = ServiceHarness::new();
    h.login().await;

    // 3600s lifetime; four minutes left is inside the five minute threshold
    h.clock.advance(Duration::minutes(56));
    assert!(h.service.validate().await);

    assert_eq!(h.authority.refresh_calls(), 1);
    assert_eq!(h.authority.validate_calls(), 1);
    assert_eq!(
        h.reasons(),
        vec![
            EventReason::LoginSuccess,
            EventReason::TokenRefreshed,
            EventReason::SessionValid
        ]
    );
    assert_eq!(h.storage.get(ACCESS_TOKEN_KEY).as_deref(), Some("access-2"));
}

#[tokio::test]
async fn test_scenario_c_service_unavailable_keeps_session() {
    let h = ServiceHarness::new();
    h.login().await;
    h.authority
        .script_validate(vec![Err(AuthError::from_status(503, "unavailable"))]);

    for _ in 0..3 {
        h.clock.advance(Duration::seconds(6));
        assert!(h.service.validate().await);
        assert!(h.service.is_authenticated());
    }

    assert_eq!(h.authority.validate_calls(), 3);
    assert!(h.storage.get(ACCESS_TOKEN_KEY).is_some());
    assert_eq!(h.reasons(), vec![EventReason::LoginSuccess]);
}

#[tokio::test]
async fn test_scenario_d_rejections_in_periodic_loop_force_logout() {
    let h = ServiceHarness::new();
    h.login().await;
    h.authority
        .script_validate(vec![Err(AuthError::AuthorizationRejected { status: 401 })]);

    for _ in 0..3 {
        h.clock.advance(Duration::seconds(60));
        let outcome = h.service.revalidator().tick().await.expect("tick ran");
        assert!(outcome.is_rejection());
    }

    assert_eq!(h.storage.get(ACCESS_TOKEN_KEY), None);
    assert!(!h.service.is_authenticated());
    assert_eq!(h.count(EventReason::MultipleConsecutiveFailures), 1);
    assert_eq!(h.service.revalidator().consecutive_failures(), 0);
}

#[tokio::test]
async fn test_scenario_e_sixth_login_attempt_is_rate_limited() {
    let h = ServiceHarness::new();
    h.authority
        .script_exchange(vec![Err(AuthError::from_status(400, "invalid_grant"))]);

    for _ in 0..5 {
        assert!(h.service.login("bad", None, CALLER).await.is_err());
        h.clock.advance(Duration::seconds(10));
    }
    let sixth = h.service.login("abc", None, CALLER).await;

    assert!(matches!(sixth, Err(AuthError::RateLimitExceeded { .. })));
    assert_eq!(h.authority.exchange_calls(), 5);
    assert_eq!(h.service.remaining_login_attempts(CALLER), 0);
    assert_eq!(h.reasons(), vec![EventReason::RateLimited]);
}

#[tokio::test]
async fn test_concurrent_validations_share_one_remote_call() {
    let h = ServiceHarness::new();
    h.login().await;
    let gate = h.authority.hold_validations();

    let (results, _) = tokio::join!(
        join_all((0..10).map(|_| h.service.validate())),
        async {
            tokio::task::yield_now().await;
            gate.add_permits(1);
        }
    );

    assert!(results.into_iter().all(|valid| valid));
    assert_eq!(h.authority.validate_calls(), 1);
}

#[tokio::test]
async fn test_warm_cache_never_calls_remote() {
    let h = ServiceHarness::new();
    h.login().await;
    assert!(h.service.validate().await);

    for _ in 0..20 {
        h.clock.advance(Duration::seconds(30));
        assert!(h.service.validate().await);
    }
    assert_eq!(h.authority.validate_calls(), 1);

    h.clock.advance(Duration::seconds(300));
    assert!(h.service.validate().await);
    assert_eq!(h.authority.validate_calls(), 2);
}

#[tokio::test]
async fn test_transient_error_keeps_tokens_rejection_clears_them() {
    let h = ServiceHarness::new();
    h.login().await;
    h.authority.script_validate(vec![
        Err(AuthError::TransientNetwork {
            reason: "connection reset".to_string(),
        }),
        Err(AuthError::AuthorizationRejected { status: 401 }),
    ]);

    assert!(h.service.validate().await);
    assert!(h.storage.get(ACCESS_TOKEN_KEY).is_some());

    h.clock.advance(Duration::seconds(6));
    assert!(!h.service.validate().await);
    assert_eq!(h.storage.get(ACCESS_TOKEN_KEY), None);
    assert_eq!(h.service.authorization_header().value(), None);
    assert_eq!(h.count(EventReason::SessionExpired), 1);
}

#[tokio::test]
async fn test_logout_publishes_even_when_remote_fails() {
    let h = ServiceHarness::new();
    h.login().await;
    h.authority.script_logout(vec![Err(AuthError::from_status(500, "boom"))]);

    h.service.logout().await;

    assert_eq!(h.authority.logout_calls(), 1);
    assert_eq!(h.storage.get(REFRESH_TOKEN_KEY), None);
    assert!(!h.service.is_authenticated());
    assert!(!h.service.revalidator().is_running());
    assert_eq!(h.reasons().last(), Some(&EventReason::Logout));
}

#[tokio::test]
async fn test_restore_refreshes_pair_without_readable_expiry() {
    let storage = Arc::new(MemoryStorage::new());
    storage.set(ACCESS_TOKEN_KEY, "opaque-access").unwrap();
    storage.set(REFRESH_TOKEN_KEY, "stored-refresh").unwrap();
    let h = ServiceHarness::with_storage(storage);

    assert!(h.service.restore().await);

    assert_eq!(h.authority.refresh_calls(), 1);
    assert_eq!(h.authority.refresh_tokens_seen(), vec!["stored-refresh"]);
    assert_eq!(h.storage.get(ACCESS_TOKEN_KEY).as_deref(), Some("access-2"));
    assert!(h.service.is_authenticated());
}

#[tokio::test]
async fn test_restore_without_tokens_does_nothing() {
    let h = ServiceHarness::new();

    assert!(!h.service.restore().await);
    assert_eq!(h.authority.validate_calls(), 0);
    assert!(!h.service.revalidator().is_running());
}

#[tokio::test]
async fn test_refresh_failure_signs_out() {
    let h = ServiceHarness::new();
    h.login().await;
    h.authority
        .script_refresh(vec![Err(AuthError::AuthorizationRejected { status: 401 })]);

    let result = h.service.refresh().await;

    assert!(matches!(result, Err(AuthError::RefreshFailed { .. })));
    assert!(!h.service.is_authenticated());
    assert!(!h.service.revalidator().is_running());
    assert_eq!(h.count(EventReason::RefreshFailed), 1);
}

#[tokio::test]
async fn test_shutdown_stops_tasks_and_cancels_calls() {
    let h = ServiceHarness::new();
    h.login().await;
    assert!(h.service.revalidator().is_running());

    h.service.shutdown();
    h.service.shutdown();

    assert!(!h.service.revalidator().is_running());
    assert_eq!(
        h.service.login("abc", None, CALLER).await,
        Err(AuthError::Cancelled)
    );
    assert_eq!(h.authority.exchange_calls(), 1);
}

#[test]
fn test_authorization_url_uses_configured_redirect() {
    let h = ServiceHarness::new();

    let url = h.service.authorization_url(&[], None).unwrap();

    assert!(url.as_str().starts_with("https://accounts.example.com/o/oauth2/auth?"));
    assert!(url
        .query_pairs()
        .any(|(k, v)| k == "redirect_uri" && v == "http://localhost:3000/auth/callback"));
}
