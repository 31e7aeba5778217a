use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::auth::token::EventReason;
use crate::auth::validator::{SessionValidator, ValidationOutcome};
use crate::common::{Clock, ShutdownSignal};
use crate::config::SessionConfig;

#[derive(Debug, Clone, Copy)]
pub struct RevalidatorSettings {
    pub interval: Duration,
    /// Minimum time between two validations started by the loop
    pub min_spacing: ChronoDuration,
    pub max_consecutive_failures: u32,
}

impl Default for RevalidatorSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            min_spacing: ChronoDuration::seconds(30),
            max_consecutive_failures: 3,
        }
    }
}

impl From<&SessionConfig> for RevalidatorSettings {
    fn from(config: &SessionConfig) -> Self {
        Self {
            interval: config.revalidation_interval(),
            min_spacing: config.min_revalidation_spacing(),
            max_consecutive_failures: config.max_consecutive_failures,
        }
    }
}

struct RevalidatorInner {
    validator: SessionValidator,
    clock: Arc<dyn Clock>,
    settings: RevalidatorSettings,
    failures: AtomicU32,
    last_attempt: Mutex<Option<DateTime<Utc>>>,
    /// Set when the loop forced a logout; the loop exits after that
    session_ended: AtomicBool,
}

/// Background loop that keeps validating the session and logs the user
/// out after repeated explicit rejections.
pub struct PeriodicRevalidator {
    inner: Arc<RevalidatorInner>,
    shutdown: ShutdownSignal,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PeriodicRevalidator {
    pub fn new(
        validator: SessionValidator,
        clock: Arc<dyn Clock>,
        shutdown: ShutdownSignal,
        settings: RevalidatorSettings,
    ) -> Self {
        Self {
            inner: Arc::new(RevalidatorInner {
                validator,
                clock,
                settings,
                failures: AtomicU32::new(0),
                last_attempt: Mutex::new(None),
                session_ended: AtomicBool::new(false),
            }),
            shutdown,
            task: Mutex::new(None),
        }
    }

    /// Start the loop; a no-op while it is already running
    pub fn start(&self) {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        if self.shutdown.is_triggered() {
            debug!("Not starting revalidation after shutdown");
            return;
        }

        self.inner.failures.store(0, Ordering::SeqCst);
        self.inner.session_ended.store(false, Ordering::SeqCst);

        let inner = self.inner.clone();
        let mut signal = self.shutdown.clone();
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.settings.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = signal.triggered() => break,
                }
                inner.tick().await;
                if inner.session_ended.load(Ordering::SeqCst) {
                    break;
                }
            }
            debug!("Periodic revalidation stopped");
        }));
        info!(
            interval_secs = self.inner.settings.interval.as_secs(),
            "Periodic revalidation started"
        );
    }

    pub fn stop(&self) {
        if let Some(handle) = self
            .task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
            debug!("Periodic revalidation aborted");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// One loop iteration. Returns None when skipped for spacing.
    pub async fn tick(&self) -> Option<ValidationOutcome> {
        self.inner.tick().await
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.failures.load(Ordering::SeqCst)
    }
}

impl Drop for PeriodicRevalidator {
    fn drop(&mut self) {
        self.stop();
    }
}

impl RevalidatorInner {
    async fn tick(&self) -> Option<ValidationOutcome> {
        let now = self.clock.now();
        {
            let mut last = self.last_attempt.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(previous) = *last {
                if now - previous < self.settings.min_spacing {
                    trace!("Skipping revalidation, last attempt too recent");
                    return None;
                }
            }
            *last = Some(now);
        }

        let outcome = self.validator.validate_detailed().await;

        if outcome.is_rejection() {
            let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
            warn!(
                failures,
                max = self.settings.max_consecutive_failures,
                outcome = ?outcome,
                "Session revalidation rejected"
            );
            if failures >= self.settings.max_consecutive_failures {
                self.failures.store(0, Ordering::SeqCst);
                self.session_ended.store(true, Ordering::SeqCst);
                self.validator
                    .force_logout(EventReason::MultipleConsecutiveFailures);
            }
        } else if outcome.is_authenticated() && !matches!(outcome, ValidationOutcome::Transient(_)) {
            self.failures.store(0, Ordering::SeqCst);
        }

        Some(outcome)
    }
}
