use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Error categories for different retry strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Temporary network issues, timeouts, etc. - usually retryable
    Network,
    /// The authority rejected the credentials - terminal for the session
    Authentication,
    /// Rate limiting, either local or remote - retryable with backoff
    RateLimit,
    /// Remote service unavailable (5xx) - retryable with longer backoff
    ServiceUnavailable,
    /// Malformed data from the authority - treated like a network error
    Validation,
    /// Configuration errors - not retryable without reconfiguration
    Configuration,
    /// Internal errors in our code - generally not retryable
    Internal,
}

impl ErrorCategory {
    /// Returns true if errors in this category are generally retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network | Self::RateLimit | Self::ServiceUnavailable | Self::Validation => true,
            Self::Authentication | Self::Configuration | Self::Internal => false,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Network => "network",
            Self::Authentication => "authentication",
            Self::RateLimit => "rate_limit",
            Self::ServiceUnavailable => "service_unavailable",
            Self::Validation => "validation",
            Self::Configuration => "configuration",
            Self::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// Errors produced by the session manager and its collaborators
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AuthError {
    /// The authority answered 401/403
    #[error("Authorization rejected by the authority (HTTP {status})")]
    AuthorizationRejected { status: u16 },

    #[error("Token refresh failed: {reason}")]
    RefreshFailed { reason: String },

    /// No response, timeout, or a 5xx from the authority
    #[error("Transient network error: {reason}")]
    TransientNetwork { reason: String },

    /// The authority answered 429
    #[error("Authority is throttling requests")]
    RemoteThrottled { retry_after: Option<Duration> },

    /// Local login budget for a caller key is exhausted
    #[error("Too many login attempts for '{key}', retry in {}s", retry_after.as_secs())]
    RateLimitExceeded { key: String, retry_after: Duration },

    /// The authority answered with something we could not understand
    #[error("Malformed response from the authority: {reason}")]
    Validation { reason: String },

    #[error("Unexpected HTTP {status} from the authority: {message}")]
    UnexpectedStatus { status: u16, message: String },

    #[error("No active session")]
    NotAuthenticated,

    #[error("Operation cancelled by shutdown")]
    Cancelled,

    #[error("Token storage failure: {reason}")]
    Storage { reason: String },

    #[error("Invalid configuration: {reason}")]
    Config { reason: String },
}

impl AuthError {
    /// Classify an HTTP status returned by the authority.
    ///
    /// 404 is deliberately transient: a missing validation route must not
    /// log anybody out.
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            401 | 403 => Self::AuthorizationRejected { status },
            429 => Self::RemoteThrottled { retry_after: None },
            404 | 500..=599 => Self::TransientNetwork {
                reason: format!("HTTP {}: {}", status, truncate(body, 200)),
            },
            _ => Self::UnexpectedStatus {
                status,
                message: truncate(body, 200).to_string(),
            },
        }
    }

    /// The retry category for this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::AuthorizationRejected { .. } | Self::RefreshFailed { .. } => {
                ErrorCategory::Authentication
            }
            Self::NotAuthenticated => ErrorCategory::Authentication,
            Self::TransientNetwork { reason } if reason.starts_with("HTTP 5") => {
                ErrorCategory::ServiceUnavailable
            }
            Self::TransientNetwork { .. } | Self::Cancelled => ErrorCategory::Network,
            Self::RemoteThrottled { .. } | Self::RateLimitExceeded { .. } => {
                ErrorCategory::RateLimit
            }
            Self::Validation { .. } => ErrorCategory::Validation,
            Self::Config { .. } => ErrorCategory::Configuration,
            Self::UnexpectedStatus { .. } | Self::Storage { .. } => ErrorCategory::Internal,
        }
    }

    /// Terminal errors end the current session and clear stored tokens
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::AuthorizationRejected { .. } | Self::RefreshFailed { .. }
        )
    }

    /// Transient errors preserve session state and may be retried on the next call
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::TransientNetwork { .. } | Self::Validation { .. } | Self::RemoteThrottled { .. }
        )
    }
}

/// Result alias used throughout the crate
pub type AuthResult<T> = Result<T, AuthError>;

pub fn transient_network(reason: impl fmt::Display) -> AuthError {
    AuthError::TransientNetwork {
        reason: reason.to_string(),
    }
}

pub fn malformed_response(reason: impl fmt::Display) -> AuthError {
    AuthError::Validation {
        reason: reason.to_string(),
    }
}

pub fn refresh_failed(reason: impl fmt::Display) -> AuthError {
    AuthError::RefreshFailed {
        reason: reason.to_string(),
    }
}

pub fn config_invalid(key: &str, reason: impl fmt::Display) -> AuthError {
    AuthError::Config {
        reason: format!("{}: {}", key, reason),
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
