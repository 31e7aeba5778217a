use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Access/refresh credential set issued by the authority.
///
/// The refresh token is only readable inside the crate.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenPair {
    access_token: String,
    refresh_token: String,
    expires_at: DateTime<Utc>,
}

impl TokenPair {
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            expires_at,
        }
    }

    /// The bearer token used for API requests
    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub(crate) fn refresh_token(&self) -> &str {
        &self.refresh_token
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// True if the access token expires within `threshold` of `now`
    pub fn expires_within(&self, threshold: Duration, now: DateTime<Utc>) -> bool {
        self.expires_at - now < threshold
    }

    pub fn seconds_until_expiration(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_seconds()
    }
}

impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Read the `exp` claim out of a JWT without verifying it.
///
/// Returns None for anything that is not a three-part JWT with a numeric
/// `exp` claim.
pub fn jwt_expiry(token: &str) -> Option<DateTime<Utc>> {
    let mut parts = token.split('.');
    let (_header, payload, _sig) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }

    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: Value = serde_json::from_slice(&bytes).ok()?;
    let exp = claims.get("exp")?.as_i64()?;
    DateTime::from_timestamp(exp, 0)
}

/// Immutable projection of the authenticated identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSnapshot {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub email: String,
    #[serde(default, alias = "name")]
    pub display_name: Option<String>,
    #[serde(default = "default_role")]
    pub role: String,
}

fn default_role() -> String {
    "user".to_string()
}

// The dashboard backend serializes ORM primary keys as numbers
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number for id, got {}",
            other
        ))),
    }
}

/// Why an auth event was published
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventReason {
    LoginSuccess,
    TokenRefreshed,
    SessionValid,
    SessionExpired,
    RefreshFailed,
    MultipleConsecutiveFailures,
    Logout,
    RateLimited,
}

impl EventReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LoginSuccess => "login_success",
            Self::TokenRefreshed => "token_refreshed",
            Self::SessionValid => "session_valid",
            Self::SessionExpired => "session_expired",
            Self::RefreshFailed => "refresh_failed",
            Self::MultipleConsecutiveFailures => "multiple_consecutive_failures",
            Self::Logout => "logout",
            Self::RateLimited => "rate_limited",
        }
    }
}

impl fmt::Display for EventReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authentication state transition broadcast to observers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthEvent {
    pub is_authenticated: bool,
    pub user: Option<UserSnapshot>,
    pub reason: EventReason,
    pub timestamp: DateTime<Utc>,
}

impl AuthEvent {
    pub fn authenticated(reason: EventReason, user: Option<UserSnapshot>, at: DateTime<Utc>) -> Self {
        Self {
            is_authenticated: true,
            user,
            reason,
            timestamp: at,
        }
    }

    pub fn unauthenticated(reason: EventReason, at: DateTime<Utc>) -> Self {
        Self {
            is_authenticated: false,
            user: None,
            reason,
            timestamp: at,
        }
    }
}
