use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

/// How the delay grows between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// base * attempt
    Linear,
    /// base * 2^(attempt-1)
    Exponential,
}

/// Named retry policy shared by every retrying caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay unit in milliseconds
    pub base_delay_ms: u64,
    /// Retries after the first attempt
    pub max_retries: usize,
    pub strategy: BackoffStrategy,
    /// Upper bound on a single delay
    #[serde(default)]
    pub max_delay_ms: Option<u64>,
    /// Add up to 25% random jitter
    #[serde(default)]
    pub jitter: bool,
}

impl BackoffPolicy {
    pub fn linear(base_delay_ms: u64, max_retries: usize) -> Self {
        Self {
            base_delay_ms,
            max_retries,
            strategy: BackoffStrategy::Linear,
            max_delay_ms: None,
            jitter: false,
        }
    }

    pub fn exponential(base_delay_ms: u64, max_retries: usize, max_delay_ms: Option<u64>) -> Self {
        Self {
            base_delay_ms,
            max_retries,
            strategy: BackoffStrategy::Exponential,
            max_delay_ms,
            jitter: false,
        }
    }

    pub fn no_retry() -> Self {
        Self::linear(0, 0)
    }

    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    /// Delay to wait after the given failed attempt (1-based)
    pub fn delay_for(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let mut delay_ms = match self.strategy {
            BackoffStrategy::Linear => self.base_delay_ms.saturating_mul(attempt as u64),
            BackoffStrategy::Exponential => {
                let exp = (attempt - 1).min(32) as u32;
                self.base_delay_ms.saturating_mul(2u64.saturating_pow(exp))
            }
        };

        if let Some(max) = self.max_delay_ms {
            delay_ms = delay_ms.min(max);
        }

        if self.jitter {
            let jitter_ms = (delay_ms as f64 * fastrand::f64() * 0.25) as u64;
            delay_ms = delay_ms.saturating_add(jitter_ms);
        }

        Duration::from_millis(delay_ms)
    }
}

/// Run `operation` until it succeeds, the policy is exhausted, or
/// `should_retry` declines the error.
pub async fn with_backoff<T, E, F, Fut, R>(
    policy: &BackoffPolicy,
    log_context: &str,
    should_retry: R,
    operation: F,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    E: Display,
{
    let mut attempt = 0;

    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation = log_context, attempt, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => {
                if !should_retry(&err) || attempt > policy.max_retries {
                    if attempt > 1 {
                        error!(
                            operation = log_context,
                            attempt,
                            error = %err,
                            "Giving up after {} attempts",
                            attempt
                        );
                    }
                    return Err(err);
                }

                let delay = policy.delay_for(attempt);
                warn!(
                    operation = log_context,
                    attempt,
                    max_retries = policy.max_retries,
                    error = %err,
                    retry_after_ms = delay.as_millis() as u64,
                    "Operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
