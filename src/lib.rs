//! Client-side authentication session manager for the benchmarking dashboard.
//!
//! [`AuthService`] drives the OAuth login, keeps the bearer token pair
//! fresh, validates the session against the dashboard backend and
//! broadcasts every state transition as an [`AuthEvent`].

// Export modules
pub mod adapters;
pub mod auth;
pub mod common;
pub mod config;
pub mod error;
pub mod event_bus;

#[cfg(test)]
mod tests;

pub use adapters::{HttpAuthority, HttpClient, ReqwestHttpClient};
pub use auth::{
    AuthAuthority, AuthEvent, AuthService, AuthorizationHeader, EventReason, FileStorage,
    MemoryStorage, Storage, TokenPair, UserSnapshot, ValidationOutcome,
};
pub use common::{BackoffPolicy, BackoffStrategy, Clock, ManualClock, SystemClock};
pub use config::{AuthConfig, ConfigManager};
pub use error::{AuthError, AuthResult, ErrorCategory};
pub use event_bus::{EventBus, EventBusStats, EventSink, Subscription};
