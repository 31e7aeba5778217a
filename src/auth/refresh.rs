use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auth::authority::AuthAuthority;
use crate::auth::storage::TokenStore;
use crate::auth::token::{AuthEvent, EventReason, TokenPair};
use crate::common::{Clock, ShutdownSignal};
use crate::error::{refresh_failed, AuthError, AuthResult};
use crate::event_bus::EventSink;

/// Minimum pause between proactive refresh attempts
const PROACTIVE_RETRY_FLOOR: Duration = Duration::from_secs(10);

/// Keeps the access token ahead of its expiry.
///
/// Refreshes are serialized: a caller that queued behind a refresh that
/// already rotated the pair gets that pair back instead of spending the
/// old refresh token a second time.
pub struct TokenRefreshScheduler {
    store: Arc<TokenStore>,
    authority: Arc<dyn AuthAuthority>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    shutdown: ShutdownSignal,
    default_lifetime: ChronoDuration,
    in_progress: Mutex<()>,
}

impl TokenRefreshScheduler {
    pub fn new(
        store: Arc<TokenStore>,
        authority: Arc<dyn AuthAuthority>,
        events: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
        shutdown: ShutdownSignal,
        default_lifetime: ChronoDuration,
    ) -> Self {
        Self {
            store,
            authority,
            events,
            clock,
            shutdown,
            default_lifetime,
            in_progress: Mutex::new(()),
        }
    }

    /// Exchange the stored refresh token for a new pair
    pub async fn refresh(&self) -> AuthResult<TokenPair> {
        let observed = self.store.generation();
        let _guard = self.in_progress.lock().await;

        let (current, generation) = self.store.snapshot();
        if generation != observed {
            // Somebody else rotated (or cleared) the pair while we queued
            debug!(observed, generation, "Reusing result of concurrent refresh");
            return current.ok_or_else(|| refresh_failed("session ended during refresh"));
        }

        let Some(current) = current else {
            return Err(AuthError::NotAuthenticated);
        };

        debug!("Refreshing access token");
        let result = self
            .shutdown
            .run("token_refresh", self.authority.refresh(current.refresh_token()))
            .await;

        match result {
            Ok(issued) => {
                let refreshed = issued.to_pair(self.clock.now(), self.default_lifetime);
                if !self.store.set_if_generation(refreshed.clone(), generation) {
                    warn!("Session changed during refresh, discarding refreshed tokens");
                    return Err(refresh_failed("session changed during refresh"));
                }

                info!(expires_at = %refreshed.expires_at(), "Access token refreshed");
                self.events.publish(AuthEvent::authenticated(
                    EventReason::TokenRefreshed,
                    issued.user,
                    self.clock.now(),
                ));
                Ok(refreshed)
            }
            Err(AuthError::Cancelled) => Err(AuthError::Cancelled),
            Err(e) => {
                warn!(error = %e, "Token refresh failed, ending session");
                self.store.clear_if_generation(generation);
                self.events.publish(AuthEvent::unauthenticated(
                    EventReason::RefreshFailed,
                    self.clock.now(),
                ));
                Err(refresh_failed(e))
            }
        }
    }

    /// True if the stored access token expires within `threshold`
    pub fn is_near_expiry(&self, threshold: ChronoDuration) -> bool {
        self.store
            .get()
            .map(|pair| pair.expires_within(threshold, self.clock.now()))
            .unwrap_or(false)
    }

    /// Refresh first if the token is about to lapse
    pub async fn ensure_fresh(&self, threshold: ChronoDuration) -> AuthResult<()> {
        if self.is_near_expiry(threshold) {
            self.refresh().await?;
        }
        Ok(())
    }

    /// Refresh ahead of expiry in the background.
    ///
    /// The task wakes at `expires_at - threshold`, never sleeping longer than
    /// `max_check`, and exits on shutdown or when the scheduler is dropped.
    pub fn spawn_proactive(
        self: &Arc<Self>,
        threshold: ChronoDuration,
        max_check: Duration,
    ) -> JoinHandle<()> {
        let scheduler: Weak<Self> = Arc::downgrade(self);
        let mut signal = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                if signal.is_triggered() {
                    break;
                }

                let wait = match scheduler.upgrade() {
                    Some(scheduler) => scheduler.time_until_refresh(threshold, max_check),
                    None => break,
                };

                if wait.is_zero() {
                    let Some(scheduler) = scheduler.upgrade() else {
                        break;
                    };
                    if let Err(e) = scheduler.refresh().await {
                        debug!(error = %e, "Proactive refresh did not complete");
                    }
                    drop(scheduler);
                    tokio::select! {
                        _ = tokio::time::sleep(PROACTIVE_RETRY_FLOOR) => {}
                        _ = signal.triggered() => break,
                    }
                    continue;
                }

                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = signal.triggered() => break,
                }
            }
            debug!("Proactive refresh task stopped");
        })
    }

    fn time_until_refresh(&self, threshold: ChronoDuration, max_check: Duration) -> Duration {
        match self.store.get() {
            Some(pair) => (pair.expires_at() - threshold - self.clock.now())
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(max_check),
            None => max_check,
        }
    }
}
