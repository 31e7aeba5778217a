pub mod authority;
pub mod oauth;
pub mod rate_limiter;
pub mod refresh;
pub mod revalidator;
pub mod service;
pub mod storage;
pub mod token;
pub mod validator;

pub use authority::{AuthAuthority, IssuedTokens};
pub use oauth::{OAuthFlowController, OAuthSettings};
pub use rate_limiter::{RateLimitEntry, RateLimiter};
pub use refresh::TokenRefreshScheduler;
pub use revalidator::{PeriodicRevalidator, RevalidatorSettings};
pub use service::AuthService;
pub use storage::{AuthorizationHeader, FileStorage, MemoryStorage, Storage, TokenStore};
pub use token::{jwt_expiry, AuthEvent, EventReason, TokenPair, UserSnapshot};
pub use validator::{
    SessionValidator, ValidationCacheEntry, ValidationOutcome, ValidationState, ValidatorSettings,
};
