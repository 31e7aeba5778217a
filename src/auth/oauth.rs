use std::sync::Arc;

use chrono::Duration;
use reqwest::Url;
use tracing::{debug, info, warn};

use crate::auth::authority::AuthAuthority;
use crate::auth::rate_limiter::RateLimiter;
use crate::auth::storage::TokenStore;
use crate::auth::token::{AuthEvent, EventReason, UserSnapshot};
use crate::common::{with_backoff, BackoffPolicy, Clock, ShutdownSignal};
use crate::config::AuthConfig;
use crate::error::{config_invalid, malformed_response, AuthError, AuthResult};
use crate::event_bus::EventSink;

/// Static inputs of the authorization redirect and code exchange
#[derive(Debug, Clone)]
pub struct OAuthSettings {
    pub client_id: String,
    pub authorization_endpoint: String,
    pub default_scopes: Vec<String>,
    pub default_token_lifetime: Duration,
    /// Applied to remote throttling during the code exchange
    pub backoff: BackoffPolicy,
}

impl From<&AuthConfig> for OAuthSettings {
    fn from(config: &AuthConfig) -> Self {
        Self {
            client_id: config.oauth.client_id.clone(),
            authorization_endpoint: config.oauth.authorization_endpoint.clone(),
            default_scopes: config.oauth.default_scopes.clone(),
            default_token_lifetime: config.session.default_token_lifetime(),
            backoff: config.login_backoff.clone(),
        }
    }
}

/// Drives the OAuth authorization-code login
pub struct OAuthFlowController {
    settings: OAuthSettings,
    store: Arc<TokenStore>,
    limiter: Arc<RateLimiter>,
    authority: Arc<dyn AuthAuthority>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    shutdown: ShutdownSignal,
}

impl OAuthFlowController {
    pub fn new(
        settings: OAuthSettings,
        store: Arc<TokenStore>,
        limiter: Arc<RateLimiter>,
        authority: Arc<dyn AuthAuthority>,
        events: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            settings,
            store,
            limiter,
            authority,
            events,
            clock,
            shutdown,
        }
    }

    /// Provider consent URL. Empty `scopes` means the configured defaults.
    pub fn build_authorization_url(&self, scopes: &[&str], redirect_uri: &str) -> AuthResult<Url> {
        let scope = if scopes.is_empty() {
            self.settings.default_scopes.join(" ")
        } else {
            scopes.join(" ")
        };

        Url::parse_with_params(
            &self.settings.authorization_endpoint,
            &[
                ("client_id", self.settings.client_id.as_str()),
                ("redirect_uri", redirect_uri),
                ("response_type", "code"),
                ("scope", scope.as_str()),
                ("access_type", "offline"),
                ("prompt", "consent"),
            ],
        )
        .map_err(|e| config_invalid("oauth.authorization_endpoint", e))
    }

    /// Trade an authorization code for a session.
    ///
    /// Checks the caller's login budget before any network traffic and
    /// retries only when the authority throttles.
    pub async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
        caller_key: &str,
    ) -> AuthResult<UserSnapshot> {
        if let Err(e) = self.limiter.check(caller_key) {
            self.events.publish(AuthEvent::unauthenticated(
                EventReason::RateLimited,
                self.clock.now(),
            ));
            return Err(e);
        }

        debug!(caller_key, "Exchanging authorization code");
        let exchange = with_backoff(
            &self.settings.backoff,
            "oauth_code_exchange",
            |e: &AuthError| matches!(e, AuthError::RemoteThrottled { .. }),
            || self.authority.exchange_code(code, redirect_uri),
        );
        let issued = self
            .shutdown
            .run("oauth_code_exchange", exchange)
            .await
            .map_err(|e| {
                warn!(error = %e, "Authorization code exchange failed");
                e
            })?;

        let user = issued
            .user
            .clone()
            .ok_or_else(|| malformed_response("code exchange returned no user"))?;

        self.store
            .set(issued.to_pair(self.clock.now(), self.settings.default_token_lifetime));
        info!(user_id = %user.id, "Login succeeded");
        self.events.publish(AuthEvent::authenticated(
            EventReason::LoginSuccess,
            Some(user.clone()),
            self.clock.now(),
        ));
        Ok(user)
    }
}
