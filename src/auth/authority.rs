use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::auth::token::{jwt_expiry, TokenPair, UserSnapshot};
use crate::error::AuthResult;

/// Token material returned by the code exchange and refresh endpoints
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedTokens {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default)]
    pub user: Option<UserSnapshot>,
    /// Lifetime of the access token in seconds, when the authority says
    #[serde(default)]
    pub expires_in: Option<u64>,
}

impl fmt::Debug for IssuedTokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedTokens")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("user", &self.user)
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

impl IssuedTokens {
    /// `expires_in` if present, else the JWT `exp`, else `now + default_lifetime`.
    ///
    /// An `expires_in` too large to represent is ignored.
    pub fn expires_at(&self, now: DateTime<Utc>, default_lifetime: Duration) -> DateTime<Utc> {
        self.expires_in
            .and_then(|secs| i64::try_from(secs).ok())
            .and_then(Duration::try_seconds)
            .and_then(|lifetime| now.checked_add_signed(lifetime))
            .or_else(|| jwt_expiry(&self.access_token))
            .or_else(|| now.checked_add_signed(default_lifetime))
            .unwrap_or(now)
    }

    pub fn to_pair(&self, now: DateTime<Utc>, default_lifetime: Duration) -> TokenPair {
        TokenPair::new(
            self.access_token.clone(),
            self.refresh_token.clone(),
            self.expires_at(now, default_lifetime),
        )
    }
}

/// The remote authority the session manager talks to.
///
/// Implementations classify failures with the crate's error taxonomy:
/// 401/403 as `AuthorizationRejected`, 429 as `RemoteThrottled`, missing
/// responses and 5xx as `TransientNetwork`, unparseable bodies as
/// `Validation`.
#[async_trait]
pub trait AuthAuthority: Send + Sync {
    /// `POST /auth/google`
    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> AuthResult<IssuedTokens>;

    /// `POST /auth/refresh`
    async fn refresh(&self, refresh_token: &str) -> AuthResult<IssuedTokens>;

    /// `POST /auth/validate` with the bearer token
    async fn validate(&self, access_token: &str) -> AuthResult<UserSnapshot>;

    /// `POST /auth/logout`
    async fn logout(&self, refresh_token: &str) -> AuthResult<()>;
}
