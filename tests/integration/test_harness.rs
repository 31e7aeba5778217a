//! Shared setup for the integration tests

use std::sync::{Arc, Mutex};

use benchdash_session::{
    AuthConfig, AuthEvent, AuthorizationHeader, EventBus, HttpAuthority, ReqwestHttpClient,
    Subscription,
};
use serde_json::{json, Value};

pub const CALLER: &str = "integration-test|2026-10-19";

/// Authority backed by a real reqwest client pointed at `base_url`
pub fn http_authority(base_url: &str, header: &AuthorizationHeader) -> Arc<HttpAuthority> {
    let client = ReqwestHttpClient::with_timeout(std::time::Duration::from_secs(5))
        .expect("client builds")
        .with_default_auth(header.clone());
    Arc::new(HttpAuthority::new(Arc::new(client), format!("{}/api", base_url)))
}

pub fn config_for(base_url: &str) -> AuthConfig {
    let mut config = AuthConfig::default();
    config.api_base_url = format!("{}/api", base_url);
    config.oauth.client_id = "integration-client".to_string();
    config.oauth.authorization_endpoint = format!("{}/o/oauth2/auth", base_url);
    config.token_store_path = None;
    config.session.cache_ttl_seconds = 900;
    config.session.debounce_millis = 5_000;
    config.session.refresh_threshold_seconds = 300;
    config.rate_limit.max_attempts = 5;
    config
}

pub fn user_json() -> Value {
    json!({"id": 7, "email": "grace@example.com", "name": "Grace", "role": "user"})
}

pub fn tokens_json(access: &str, refresh: &str) -> String {
    json!({
        "accessToken": access,
        "refreshToken": refresh,
        "user": user_json(),
        "expiresIn": 3600
    })
    .to_string()
}

/// Collect every event published on `bus`
pub fn record_events(bus: &EventBus) -> (Arc<Mutex<Vec<AuthEvent>>>, Subscription) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let subscription = {
        let events = events.clone();
        bus.subscribe(move |event| {
            events.lock().unwrap().push(event.clone());
            Ok(())
        })
    };
    (events, subscription)
}
