use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::common::Clock;
use crate::error::{AuthError, AuthResult};

/// Attempts allowed per key inside one window
pub const MAX_LOGIN_ATTEMPTS: usize = 5;
/// Length of the trailing window, in seconds
pub const LOGIN_WINDOW_SECS: i64 = 300;

/// Attempts recorded for one caller key
#[derive(Debug, Clone)]
pub struct RateLimitEntry {
    pub key: String,
    /// Timestamps of accepted attempts, oldest first
    pub attempts: VecDeque<DateTime<Utc>>,
    pub window_start: DateTime<Utc>,
}

impl RateLimitEntry {
    fn new(key: &str, now: DateTime<Utc>) -> Self {
        Self {
            key: key.to_string(),
            attempts: VecDeque::new(),
            window_start: now,
        }
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.len()
    }

    /// Drop attempts that fell out of the trailing window
    fn prune(&mut self, now: DateTime<Utc>, window: Duration) {
        while let Some(oldest) = self.attempts.front() {
            if now - *oldest >= window {
                self.attempts.pop_front();
            } else {
                break;
            }
        }
        self.window_start = self.attempts.front().copied().unwrap_or(now);
    }
}

/// Sliding-window limiter for login attempts, keyed by caller fingerprint
pub struct RateLimiter {
    entries: DashMap<String, RateLimitEntry>,
    max_attempts: usize,
    window: Duration,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(max_attempts: usize, window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            max_attempts,
            window,
            clock,
        }
    }

    /// Five attempts per five minutes
    pub fn with_defaults(clock: Arc<dyn Clock>) -> Self {
        Self::new(MAX_LOGIN_ATTEMPTS, Duration::seconds(LOGIN_WINDOW_SECS), clock)
    }

    /// Fingerprint a caller by user agent and calendar day
    pub fn caller_key(user_agent: &str, day: NaiveDate) -> String {
        format!("{}|{}", user_agent.trim(), day.format("%Y-%m-%d"))
    }

    /// Record an attempt for `key`, or fail if its budget is spent.
    /// Rejected attempts are not recorded.
    pub fn check(&self, key: &str) -> AuthResult<()> {
        let now = self.clock.now();
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| RateLimitEntry::new(key, now));
        entry.prune(now, self.window);

        if entry.attempts.len() >= self.max_attempts {
            let retry_after = (entry.window_start + self.window - now)
                .to_std()
                .unwrap_or_default();
            warn!(
                key,
                attempts = entry.attempts.len(),
                retry_after_secs = retry_after.as_secs(),
                "Login rate limit exceeded"
            );
            return Err(AuthError::RateLimitExceeded {
                key: key.to_string(),
                retry_after,
            });
        }

        entry.attempts.push_back(now);
        trace!(key, attempts = entry.attempts.len(), "Login attempt recorded");
        Ok(())
    }

    /// Attempts left for `key` in the current window
    pub fn remaining(&self, key: &str) -> usize {
        let now = self.clock.now();
        match self.entries.get_mut(key) {
            Some(mut entry) => {
                entry.prune(now, self.window);
                self.max_attempts.saturating_sub(entry.attempts.len())
            }
            None => self.max_attempts,
        }
    }

    pub fn reset(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Remove every entry whose window has elapsed; returns how many went
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            entry.prune(now, self.window);
            !entry.attempts.is_empty()
        });
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(removed, "Pruned expired rate limit entries");
        }
        removed
    }

    pub fn tracked_keys(&self) -> usize {
        self.entries.len()
    }

    /// Periodically sweep until the limiter is dropped or the task aborted
    pub fn spawn_sweeper(self: &Arc<Self>, every: std::time::Duration) -> JoinHandle<()> {
        let limiter: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match limiter.upgrade() {
                    Some(limiter) => {
                        limiter.sweep();
                    }
                    None => break,
                }
            }
        })
    }
}
