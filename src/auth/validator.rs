use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::{debug, info, warn};

use crate::auth::authority::AuthAuthority;
use crate::auth::refresh::TokenRefreshScheduler;
use crate::auth::storage::TokenStore;
use crate::auth::token::{AuthEvent, EventReason, UserSnapshot};
use crate::common::{Clock, ShutdownSignal};
use crate::config::SessionConfig;
use crate::error::AuthError;
use crate::event_bus::EventSink;

/// Where the validator is in its cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationState {
    Idle,
    Validating,
    Valid,
    Invalid,
}

/// Last settled validation result
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationCacheEntry {
    pub is_valid: bool,
    pub timestamp: DateTime<Utc>,
    pub user: Option<UserSnapshot>,
}

/// How a validation call was answered
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationOutcome {
    /// The authority accepted the token
    Valid,
    /// The authority rejected the token; the session was cleared
    Rejected,
    /// Refreshing ahead of validation failed; the session was cleared
    RefreshFailed,
    /// No token pair is stored
    NoSession,
    /// Remote failure that leaves the session alone, with the last known flag
    Transient(bool),
    /// Answered from a fresh cache entry
    Cached(bool),
    /// Answered from the last known flag inside the debounce window
    Debounced(bool),
}

impl ValidationOutcome {
    pub fn is_authenticated(&self) -> bool {
        match self {
            Self::Valid => true,
            Self::Rejected | Self::RefreshFailed | Self::NoSession => false,
            Self::Transient(flag) | Self::Cached(flag) | Self::Debounced(flag) => *flag,
        }
    }

    /// An explicit "not authenticated" answer, as opposed to a transient one
    pub fn is_rejection(&self) -> bool {
        match self {
            Self::Rejected | Self::RefreshFailed | Self::NoSession => true,
            Self::Cached(flag) | Self::Debounced(flag) => !*flag,
            Self::Valid | Self::Transient(_) => false,
        }
    }
}

/// Validation timing knobs
#[derive(Debug, Clone, Copy)]
pub struct ValidatorSettings {
    pub cache_ttl: Duration,
    pub debounce: Duration,
    pub refresh_threshold: Duration,
}

impl Default for ValidatorSettings {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::minutes(15),
            debounce: Duration::seconds(5),
            refresh_threshold: Duration::minutes(5),
        }
    }
}

impl From<&SessionConfig> for ValidatorSettings {
    fn from(config: &SessionConfig) -> Self {
        Self {
            cache_ttl: config.cache_ttl(),
            debounce: config.debounce(),
            refresh_threshold: config.refresh_threshold(),
        }
    }
}

type InFlight = Shared<BoxFuture<'static, ValidationOutcome>>;

struct ValidatorState {
    state: ValidationState,
    cache: Option<ValidationCacheEntry>,
    last_attempt: Option<DateTime<Utc>>,
    authenticated: bool,
    user: Option<UserSnapshot>,
    in_flight: Option<(u64, InFlight)>,
    next_flight: u64,
    /// Bumped by `invalidate`; results started under an older epoch are dropped
    epoch: u64,
}

struct ValidatorInner {
    store: Arc<TokenStore>,
    refresher: Arc<TokenRefreshScheduler>,
    authority: Arc<dyn AuthAuthority>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    shutdown: ShutdownSignal,
    settings: ValidatorSettings,
    state: Mutex<ValidatorState>,
}

/// Answers "is this session still good?" with caching, debouncing and
/// at most one remote validation in flight.
#[derive(Clone)]
pub struct SessionValidator {
    inner: Arc<ValidatorInner>,
}

impl SessionValidator {
    pub fn new(
        store: Arc<TokenStore>,
        refresher: Arc<TokenRefreshScheduler>,
        authority: Arc<dyn AuthAuthority>,
        events: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
        shutdown: ShutdownSignal,
        settings: ValidatorSettings,
    ) -> Self {
        Self {
            inner: Arc::new(ValidatorInner {
                store,
                refresher,
                authority,
                events,
                clock,
                shutdown,
                settings,
                state: Mutex::new(ValidatorState {
                    state: ValidationState::Idle,
                    cache: None,
                    last_attempt: None,
                    authenticated: false,
                    user: None,
                    in_flight: None,
                    next_flight: 0,
                    epoch: 0,
                }),
            }),
        }
    }

    pub async fn validate(&self) -> bool {
        self.validate_detailed().await.is_authenticated()
    }

    pub async fn validate_detailed(&self) -> ValidationOutcome {
        let flight = {
            let mut state = self.inner.lock();

            if let Some((_, flight)) = &state.in_flight {
                debug!("Joining in-flight validation");
                flight.clone()
            } else {
                if !self.inner.store.has_tokens() {
                    state.authenticated = false;
                    state.user = None;
                    return ValidationOutcome::NoSession;
                }

                let now = self.inner.clock.now();
                if let Some(entry) = &state.cache {
                    if now - entry.timestamp < self.inner.settings.cache_ttl {
                        return ValidationOutcome::Cached(entry.is_valid);
                    }
                }
                if let Some(last) = state.last_attempt {
                    if now - last < self.inner.settings.debounce {
                        return ValidationOutcome::Debounced(state.authenticated);
                    }
                }

                state.last_attempt = Some(now);
                state.state = ValidationState::Validating;
                state.next_flight += 1;
                let id = state.next_flight;
                let epoch = state.epoch;

                let inner = self.inner.clone();
                let flight = async move { inner.run(id, epoch).await }.boxed().shared();
                state.in_flight = Some((id, flight.clone()));
                flight
            }
        };

        flight.await
    }

    /// Drop the cache, the debounce marker and any in-flight result
    pub fn invalidate(&self) {
        let mut state = self.inner.lock();
        state.epoch += 1;
        state.cache = None;
        state.last_attempt = None;
        state.in_flight = None;
        state.state = ValidationState::Idle;
    }

    /// Fresh login: authenticated until the next validation says otherwise
    pub fn record_login(&self, user: Option<UserSnapshot>) {
        self.invalidate();
        let mut state = self.inner.lock();
        state.authenticated = true;
        state.user = user;
    }

    /// Forget the session without touching tokens or publishing
    pub fn record_logout(&self) {
        self.invalidate();
        let mut state = self.inner.lock();
        state.authenticated = false;
        state.user = None;
    }

    /// End the session locally and announce why
    pub fn force_logout(&self, reason: EventReason) {
        self.inner.store.clear();
        self.record_logout();
        info!(reason = %reason, "Session ended");
        self.inner
            .events
            .publish(AuthEvent::unauthenticated(reason, self.inner.clock.now()));
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.lock().authenticated
    }

    pub fn current_user(&self) -> Option<UserSnapshot> {
        self.inner.lock().user.clone()
    }

    pub fn state(&self) -> ValidationState {
        self.inner.lock().state
    }

    pub fn cache_entry(&self) -> Option<ValidationCacheEntry> {
        self.inner.lock().cache.clone()
    }
}

impl ValidatorInner {
    fn lock(&self) -> MutexGuard<'_, ValidatorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn run(self: Arc<Self>, id: u64, epoch: u64) -> ValidationOutcome {
        let outcome = self.remote_validation(epoch).await;
        let has_tokens = self.store.has_tokens();

        let mut state = self.lock();
        if state.epoch != epoch {
            // Invalidated mid-flight; answer from the newer local state
            debug!(outcome = ?outcome, "Validation superseded while in flight");
            return if has_tokens {
                ValidationOutcome::Transient(state.authenticated)
            } else {
                ValidationOutcome::NoSession
            };
        }
        if matches!(&state.in_flight, Some((current, _)) if *current == id) {
            state.in_flight = None;
            state.state = match outcome {
                ValidationOutcome::Valid => ValidationState::Valid,
                ValidationOutcome::Rejected | ValidationOutcome::RefreshFailed => {
                    ValidationState::Invalid
                }
                _ => ValidationState::Idle,
            };
        }
        outcome
    }

    async fn remote_validation(&self, epoch: u64) -> ValidationOutcome {
        match self
            .refresher
            .ensure_fresh(self.settings.refresh_threshold)
            .await
        {
            Ok(()) => {}
            Err(AuthError::Cancelled) => return ValidationOutcome::Transient(self.last_known()),
            Err(AuthError::NotAuthenticated) => return ValidationOutcome::NoSession,
            Err(e) => {
                debug!(error = %e, "Refresh before validation failed");
                self.commit(epoch, false, None);
                return ValidationOutcome::RefreshFailed;
            }
        }

        let (pair, generation) = self.store.snapshot();
        let Some(pair) = pair else {
            return ValidationOutcome::NoSession;
        };

        let result = self
            .shutdown
            .run("session_validate", self.authority.validate(pair.access_token()))
            .await;

        match result {
            Ok(user) => {
                if self.commit(epoch, true, Some(user.clone())) {
                    debug!(user_id = %user.id, "Session validated");
                    self.events.publish(AuthEvent::authenticated(
                        EventReason::SessionValid,
                        Some(user),
                        self.clock.now(),
                    ));
                }
                ValidationOutcome::Valid
            }
            Err(e) if e.is_terminal() => {
                if !self.store.clear_if_generation(generation) {
                    debug!("Rejection applies to a replaced token pair, ignoring");
                    return ValidationOutcome::Transient(self.last_known());
                }
                warn!(error = %e, "Authority rejected the session");
                self.commit(epoch, false, None);
                self.events.publish(AuthEvent::unauthenticated(
                    EventReason::SessionExpired,
                    self.clock.now(),
                ));
                ValidationOutcome::Rejected
            }
            Err(e) => {
                warn!(error = %e, category = %e.category(), "Validation failed transiently, keeping session");
                ValidationOutcome::Transient(self.last_known())
            }
        }
    }

    /// Record a settled result unless `invalidate` ran since it started
    fn commit(&self, epoch: u64, is_valid: bool, user: Option<UserSnapshot>) -> bool {
        let now = self.clock.now();
        let mut state = self.lock();
        if state.epoch != epoch {
            debug!("Discarding validation result from before invalidation");
            return false;
        }
        if matches!(&state.cache, Some(entry) if entry.timestamp > now) {
            return false;
        }

        state.authenticated = is_valid;
        state.user = user.clone();
        state.cache = Some(ValidationCacheEntry {
            is_valid,
            timestamp: now,
            user,
        });
        true
    }

    fn last_known(&self) -> bool {
        self.lock().authenticated
    }
}
