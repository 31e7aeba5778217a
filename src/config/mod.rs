use anyhow::Result;
use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::common::BackoffPolicy;
use crate::error::{config_invalid, AuthResult};

// Default configuration values
const DEFAULT_API_URL: &str = "http://localhost:8000/api";
const DEFAULT_AUTHORIZATION_ENDPOINT: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const DEFAULT_REDIRECT_URI: &str = "http://localhost:3000/auth/callback";
const DEFAULT_REQUEST_TIMEOUT_SECONDS: u64 = 30;
const DEFAULT_CONFIG_FILE: &str = "benchdash-session.json";
/// Upper bound for every configured duration: one year
const MAX_DURATION_SECONDS: u64 = 365 * 24 * 60 * 60;

/// Main configuration struct for the session manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Base URL of the dashboard backend, e.g. `https://bench.example.com/api`
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    /// OAuth provider settings
    #[serde(default)]
    pub oauth: OAuthConfig,
    /// Where tokens are persisted; in-memory only when unset
    #[serde(default = "default_token_store_path")]
    pub token_store_path: Option<PathBuf>,
    /// Per-request timeout for the authority
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Retry policy for a throttled code exchange
    #[serde(default = "default_login_backoff")]
    pub login_backoff: BackoffPolicy,
}

/// OAuth redirect settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthConfig {
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_authorization_endpoint")]
    pub authorization_endpoint: String,
    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,
    /// Used when a caller asks for no specific scopes
    #[serde(default = "default_scopes")]
    pub default_scopes: Vec<String>,
}

/// Validation, refresh and revalidation timings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_seconds: u64,
    #[serde(default = "default_debounce")]
    pub debounce_millis: u64,
    /// Refresh before validating when the token expires within this
    #[serde(default = "default_refresh_threshold")]
    pub refresh_threshold_seconds: u64,
    /// Assumed access token lifetime when the authority does not say
    #[serde(default = "default_token_lifetime")]
    pub default_token_lifetime_seconds: u64,
    /// Upper bound on how long the proactive refresher sleeps
    #[serde(default = "default_refresh_check")]
    pub proactive_refresh_check_seconds: u64,
    #[serde(default = "default_revalidation_interval")]
    pub revalidation_interval_seconds: u64,
    #[serde(default = "default_revalidation_spacing")]
    pub min_revalidation_spacing_seconds: u64,
    #[serde(default = "default_max_failures")]
    pub max_consecutive_failures: u32,
}

/// Login attempt limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    #[serde(default = "default_window")]
    pub window_seconds: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(default)
}

// Default functions
fn default_api_base_url() -> String {
    env_or("BENCHDASH_API_URL", DEFAULT_API_URL.to_string())
}

fn default_client_id() -> String {
    env_or("BENCHDASH_GOOGLE_CLIENT_ID", String::new())
}

fn default_authorization_endpoint() -> String {
    env_or(
        "BENCHDASH_AUTHORIZATION_ENDPOINT",
        DEFAULT_AUTHORIZATION_ENDPOINT.to_string(),
    )
}

fn default_redirect_uri() -> String {
    env_or("BENCHDASH_REDIRECT_URI", DEFAULT_REDIRECT_URI.to_string())
}

fn default_scopes() -> Vec<String> {
    vec!["openid".into(), "email".into(), "profile".into()]
}

fn default_token_store_path() -> Option<PathBuf> {
    std::env::var("BENCHDASH_TOKEN_STORE").ok().map(PathBuf::from)
}

fn default_request_timeout() -> u64 {
    env_or("BENCHDASH_REQUEST_TIMEOUT", DEFAULT_REQUEST_TIMEOUT_SECONDS)
}

fn default_cache_ttl() -> u64 {
    env_or("BENCHDASH_VALIDATION_CACHE_TTL", 15 * 60)
}

fn default_debounce() -> u64 {
    env_or("BENCHDASH_VALIDATION_DEBOUNCE_MS", 5_000)
}

fn default_refresh_threshold() -> u64 {
    env_or("BENCHDASH_REFRESH_THRESHOLD", 5 * 60)
}

fn default_token_lifetime() -> u64 {
    env_or("BENCHDASH_TOKEN_LIFETIME", 60 * 60)
}

fn default_refresh_check() -> u64 {
    5 * 60
}

fn default_revalidation_interval() -> u64 {
    env_or("BENCHDASH_REVALIDATION_INTERVAL", 60)
}

fn default_revalidation_spacing() -> u64 {
    30
}

fn default_max_failures() -> u32 {
    3
}

fn default_max_attempts() -> usize {
    env_or("BENCHDASH_LOGIN_MAX_ATTEMPTS", 5)
}

fn default_window() -> u64 {
    env_or("BENCHDASH_LOGIN_WINDOW", 5 * 60)
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_login_backoff() -> BackoffPolicy {
    BackoffPolicy::linear(1_000, 3)
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            oauth: OAuthConfig::default(),
            token_store_path: default_token_store_path(),
            request_timeout_seconds: default_request_timeout(),
            session: SessionConfig::default(),
            rate_limit: RateLimitConfig::default(),
            login_backoff: default_login_backoff(),
        }
    }
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            client_id: default_client_id(),
            authorization_endpoint: default_authorization_endpoint(),
            redirect_uri: default_redirect_uri(),
            default_scopes: default_scopes(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cache_ttl_seconds: default_cache_ttl(),
            debounce_millis: default_debounce(),
            refresh_threshold_seconds: default_refresh_threshold(),
            default_token_lifetime_seconds: default_token_lifetime(),
            proactive_refresh_check_seconds: default_refresh_check(),
            revalidation_interval_seconds: default_revalidation_interval(),
            min_revalidation_spacing_seconds: default_revalidation_spacing(),
            max_consecutive_failures: default_max_failures(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            window_seconds: default_window(),
            sweep_interval_seconds: default_sweep_interval(),
        }
    }
}

impl AuthConfig {
    /// Reject settings the manager cannot run with
    pub fn validate(&self) -> AuthResult<()> {
        reqwest::Url::parse(&self.api_base_url)
            .map_err(|e| config_invalid("api_base_url", e))?;
        reqwest::Url::parse(&self.oauth.authorization_endpoint)
            .map_err(|e| config_invalid("oauth.authorization_endpoint", e))?;

        if self.session.revalidation_interval_seconds == 0 {
            return Err(config_invalid(
                "session.revalidation_interval_seconds",
                "must be positive",
            ));
        }
        if self.session.max_consecutive_failures == 0 {
            return Err(config_invalid(
                "session.max_consecutive_failures",
                "must be positive",
            ));
        }
        if self.rate_limit.max_attempts == 0 || self.rate_limit.window_seconds == 0 {
            return Err(config_invalid("rate_limit", "attempts and window must be positive"));
        }

        let durations = [
            ("session.cache_ttl_seconds", self.session.cache_ttl_seconds),
            ("session.debounce_millis", self.session.debounce_millis / 1000),
            ("session.refresh_threshold_seconds", self.session.refresh_threshold_seconds),
            ("session.default_token_lifetime_seconds", self.session.default_token_lifetime_seconds),
            ("session.min_revalidation_spacing_seconds", self.session.min_revalidation_spacing_seconds),
            ("rate_limit.window_seconds", self.rate_limit.window_seconds),
        ];
        for (key, seconds) in durations {
            if seconds > MAX_DURATION_SECONDS {
                return Err(config_invalid(key, "must not exceed one year"));
            }
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

/// Seconds as a chrono duration, clamped to [`MAX_DURATION_SECONDS`]
fn bounded_seconds(seconds: u64) -> ChronoDuration {
    ChronoDuration::seconds(seconds.min(MAX_DURATION_SECONDS) as i64)
}

impl SessionConfig {
    pub fn cache_ttl(&self) -> ChronoDuration {
        bounded_seconds(self.cache_ttl_seconds)
    }

    pub fn debounce(&self) -> ChronoDuration {
        ChronoDuration::milliseconds(self.debounce_millis.min(MAX_DURATION_SECONDS * 1000) as i64)
    }

    pub fn refresh_threshold(&self) -> ChronoDuration {
        bounded_seconds(self.refresh_threshold_seconds)
    }

    pub fn default_token_lifetime(&self) -> ChronoDuration {
        bounded_seconds(self.default_token_lifetime_seconds)
    }

    pub fn proactive_refresh_check(&self) -> Duration {
        Duration::from_secs(self.proactive_refresh_check_seconds.max(1))
    }

    pub fn revalidation_interval(&self) -> Duration {
        Duration::from_secs(self.revalidation_interval_seconds.max(1))
    }

    pub fn min_revalidation_spacing(&self) -> ChronoDuration {
        bounded_seconds(self.min_revalidation_spacing_seconds)
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> ChronoDuration {
        bounded_seconds(self.window_seconds)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds.max(1))
    }
}

/// Manages configuration for the application
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config: Arc<RwLock<AuthConfig>>,
    config_path: PathBuf,
}

impl ConfigManager {
    /// Load from `BENCHDASH_CONFIG_PATH` (or the default file), creating it if missing
    pub async fn new() -> Result<Self> {
        Self::at(get_config_path()).await
    }

    pub async fn at(config_path: PathBuf) -> Result<Self> {
        let config = load_or_create_config(&config_path).await?;
        config.validate()?;

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path,
        })
    }

    /// Get a clone of the current configuration
    pub async fn get_config(&self) -> AuthConfig {
        self.config.read().await.clone()
    }

    /// Update the configuration
    pub async fn update_config(&self, new_config: AuthConfig) -> Result<()> {
        new_config.validate()?;
        *self.config.write().await = new_config.clone();
        save_config(&self.config_path, &new_config).await?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }
}

/// Get the path to the configuration file
fn get_config_path() -> PathBuf {
    std::env::var("BENCHDASH_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE))
}

/// Load configuration from file or create default
async fn load_or_create_config(path: &Path) -> Result<AuthConfig> {
    if !path.exists() {
        let default_config = AuthConfig::default();
        save_config(path, &default_config).await?;
        info!("Created default configuration at {}", path.display());
        return Ok(default_config);
    }

    let config_str = fs::read_to_string(path).await?;
    let config: AuthConfig = serde_json::from_str(&config_str)?;
    debug!("Loaded configuration from {}", path.display());

    Ok(config)
}

/// Save configuration to file
async fn save_config(path: &Path, config: &AuthConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }

    let config_str = serde_json::to_string_pretty(config)?;
    fs::write(path, config_str).await?;
    debug!("Saved configuration to {}", path.display());

    Ok(())
}
