use std::sync::{Arc, Mutex};

use reqwest::Url;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auth::authority::AuthAuthority;
use crate::auth::oauth::{OAuthFlowController, OAuthSettings};
use crate::auth::rate_limiter::RateLimiter;
use crate::auth::refresh::TokenRefreshScheduler;
use crate::auth::revalidator::{PeriodicRevalidator, RevalidatorSettings};
use crate::auth::storage::{AuthorizationHeader, Storage, TokenStore};
use crate::auth::token::{EventReason, TokenPair, UserSnapshot};
use crate::auth::validator::{SessionValidator, ValidationOutcome, ValidatorSettings};
use crate::common::{Clock, Shutdown, SystemClock};
use crate::config::AuthConfig;
use crate::error::{AuthError, AuthResult};
use crate::event_bus::{EventBus, EventSink};

/// The session manager.
///
/// Owns the token store, the validation cache and every background task.
/// Construct one per application and hand it to whatever owns the
/// application lifecycle.
pub struct AuthService {
    config: AuthConfig,
    store: Arc<TokenStore>,
    limiter: Arc<RateLimiter>,
    oauth: OAuthFlowController,
    refresher: Arc<TokenRefreshScheduler>,
    validator: SessionValidator,
    revalidator: PeriodicRevalidator,
    authority: Arc<dyn AuthAuthority>,
    events: EventBus,
    shutdown: Shutdown,
    /// Proactive refresh, alive while a session is
    session_tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Rate limit sweeper, alive until shutdown
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl AuthService {
    pub fn new(
        config: AuthConfig,
        authority: Arc<dyn AuthAuthority>,
        storage: Arc<dyn Storage>,
        header: AuthorizationHeader,
        events: EventBus,
    ) -> AuthResult<Self> {
        Self::with_clock(config, authority, storage, header, events, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: AuthConfig,
        authority: Arc<dyn AuthAuthority>,
        storage: Arc<dyn Storage>,
        header: AuthorizationHeader,
        events: EventBus,
        clock: Arc<dyn Clock>,
    ) -> AuthResult<Self> {
        config.validate()?;

        let shutdown = Shutdown::new();
        let sink: Arc<dyn EventSink> = Arc::new(events.clone());
        let store = Arc::new(TokenStore::load(storage, header));
        let limiter = Arc::new(RateLimiter::new(
            config.rate_limit.max_attempts,
            config.rate_limit.window(),
            clock.clone(),
        ));

        let oauth = OAuthFlowController::new(
            OAuthSettings::from(&config),
            store.clone(),
            limiter.clone(),
            authority.clone(),
            sink.clone(),
            clock.clone(),
            shutdown.signal(),
        );
        let refresher = Arc::new(TokenRefreshScheduler::new(
            store.clone(),
            authority.clone(),
            sink.clone(),
            clock.clone(),
            shutdown.signal(),
            config.session.default_token_lifetime(),
        ));
        let validator = SessionValidator::new(
            store.clone(),
            refresher.clone(),
            authority.clone(),
            sink,
            clock.clone(),
            shutdown.signal(),
            ValidatorSettings::from(&config.session),
        );
        let revalidator = PeriodicRevalidator::new(
            validator.clone(),
            clock,
            shutdown.signal(),
            RevalidatorSettings::from(&config.session),
        );

        Ok(Self {
            config,
            store,
            limiter,
            oauth,
            refresher,
            validator,
            revalidator,
            authority,
            events,
            shutdown,
            session_tasks: Mutex::new(Vec::new()),
            sweeper: Mutex::new(None),
        })
    }

    /// Provider consent URL; `redirect_uri` defaults to the configured one
    pub fn authorization_url(&self, scopes: &[&str], redirect_uri: Option<&str>) -> AuthResult<Url> {
        let redirect_uri = redirect_uri.unwrap_or(self.config.oauth.redirect_uri.as_str());
        self.oauth.build_authorization_url(scopes, redirect_uri)
    }

    /// Complete the OAuth redirect and start keeping the session alive
    pub async fn login(
        &self,
        code: &str,
        redirect_uri: Option<&str>,
        caller_key: &str,
    ) -> AuthResult<UserSnapshot> {
        self.ensure_sweeper();
        let redirect_uri = redirect_uri.unwrap_or(self.config.oauth.redirect_uri.as_str());

        let user = self.oauth.exchange_code(code, redirect_uri, caller_key).await?;
        self.validator.record_login(Some(user.clone()));
        self.start_session_tasks();
        Ok(user)
    }

    pub async fn validate(&self) -> bool {
        self.validator.validate().await
    }

    pub async fn validate_detailed(&self) -> ValidationOutcome {
        self.validator.validate_detailed().await
    }

    /// Last known flag; never calls the authority
    pub fn is_authenticated(&self) -> bool {
        self.validator.is_authenticated()
    }

    pub fn current_user(&self) -> Option<UserSnapshot> {
        self.validator.current_user()
    }

    pub async fn refresh(&self) -> AuthResult<TokenPair> {
        match self.refresher.refresh().await {
            Ok(pair) => Ok(pair),
            Err(e @ AuthError::RefreshFailed { .. }) => {
                self.validator.record_logout();
                self.stop_session_tasks();
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// End the session. The remote logout is best effort.
    pub async fn logout(&self) {
        if let Some(pair) = self.store.get() {
            let result = self
                .shutdown
                .signal()
                .run("logout", self.authority.logout(pair.refresh_token()))
                .await;
            if let Err(e) = result {
                warn!(error = %e, "Remote logout failed, clearing local session anyway");
            }
        }

        self.stop_session_tasks();
        self.validator.force_logout(EventReason::Logout);
    }

    /// Resume a persisted session at startup. Returns whether it is valid.
    pub async fn restore(&self) -> bool {
        if !self.store.has_tokens() {
            debug!("No stored session to restore");
            return false;
        }

        info!("Restoring stored session");
        self.ensure_sweeper();
        self.start_session_tasks();
        self.validator.validate().await
    }

    /// Cancel in-flight remote calls and stop every background task
    pub fn shutdown(&self) {
        if self.shutdown.trigger() {
            info!("Shutting down session manager");
        }
        self.stop_session_tasks();
        if let Some(handle) = self.lock_sweeper().take() {
            handle.abort();
        }
        self.validator.invalidate();
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn revalidator(&self) -> &PeriodicRevalidator {
        &self.revalidator
    }

    /// Shared with the HTTP transport as its default `Authorization` header
    pub fn authorization_header(&self) -> &AuthorizationHeader {
        self.store.authorization_header()
    }

    pub fn remaining_login_attempts(&self, caller_key: &str) -> usize {
        self.limiter.remaining(caller_key)
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    fn start_session_tasks(&self) {
        if self.shutdown.is_triggered() {
            return;
        }
        self.revalidator.start();

        let mut tasks = self.lock_tasks();
        tasks.retain(|handle| !handle.is_finished());
        if tasks.is_empty() {
            tasks.push(self.refresher.spawn_proactive(
                self.config.session.refresh_threshold(),
                self.config.session.proactive_refresh_check(),
            ));
        }
    }

    fn stop_session_tasks(&self) {
        self.revalidator.stop();
        for handle in self.lock_tasks().drain(..) {
            handle.abort();
        }
    }

    fn ensure_sweeper(&self) {
        if self.shutdown.is_triggered() {
            return;
        }
        let mut sweeper = self.lock_sweeper();
        if sweeper.is_none() {
            *sweeper = Some(
                self.limiter
                    .spawn_sweeper(self.config.rate_limit.sweep_interval()),
            );
        }
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.session_tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_sweeper(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.sweeper.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for AuthService {
    fn drop(&mut self) {
        self.shutdown();
    }
}
