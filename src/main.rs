use std::sync::Arc;

use anyhow::{Context, Result};
use benchdash_session::{
    AuthService, AuthorizationHeader, ConfigManager, EventBus, FileStorage, HttpAuthority,
    MemoryStorage, ReqwestHttpClient, Storage,
};
use chrono::Utc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_USER_AGENT: &str = "benchdash-session-cli";

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file if it exists
    let env_file_path = dotenvy::dotenv().ok();

    // Initialize the tracing subscriber for structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            if cfg!(debug_assertions) {
                "benchdash_session=debug,warn".into()
            } else {
                "benchdash_session=info,warn".into()
            }
        }))
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    info!("benchdash-session starting");

    match env_file_path {
        Some(path) => info!("Loaded environment variables from {}", path.display()),
        None => debug!("No .env file found. Using existing environment variables."),
    };

    let config_manager = ConfigManager::new().await?;
    let config = config_manager.get_config().await;
    info!(config_path = %config_manager.path().display(), api = %config.api_base_url, "Configuration loaded");

    let storage: Arc<dyn Storage> = match &config.token_store_path {
        Some(path) => Arc::new(FileStorage::open(path)),
        None => {
            warn!("BENCHDASH_TOKEN_STORE not set, tokens will not survive a restart");
            Arc::new(MemoryStorage::new())
        }
    };

    let header = AuthorizationHeader::new();
    let client = ReqwestHttpClient::with_timeout(config.request_timeout())
        .context("Failed to build HTTP client")?
        .with_default_auth(header.clone());
    let authority = Arc::new(HttpAuthority::new(Arc::new(client), config.api_base_url.clone()));

    let events = EventBus::new();
    let _logger = events.subscribe(|event| {
        info!(
            reason = %event.reason,
            authenticated = event.is_authenticated,
            user = event.user.as_ref().map(|u| u.email.as_str()).unwrap_or("-"),
            "Auth event"
        );
        Ok(())
    });

    let service = AuthService::new(config, authority, storage, header, events)?;

    if service.restore().await {
        info!(user = ?service.current_user(), "Restored existing session");
    } else {
        let url = service.authorization_url(&[], None)?;
        println!("Open this URL to sign in:\n{}", url);

        let code = std::env::args()
            .nth(1)
            .or_else(|| std::env::var("BENCHDASH_AUTH_CODE").ok());
        match code {
            Some(code) => {
                let user_agent = std::env::var("BENCHDASH_USER_AGENT")
                    .unwrap_or_else(|_| DEFAULT_USER_AGENT.to_string());
                let caller_key =
                    benchdash_session::auth::RateLimiter::caller_key(&user_agent, Utc::now().date_naive());

                match service.login(&code, None, &caller_key).await {
                    Ok(user) => info!(email = %user.email, role = %user.role, "Signed in"),
                    Err(e) => error!(error = %e, category = %e.category(), "Sign-in failed"),
                }
            }
            None => info!("Pass the authorization code as the first argument to sign in"),
        }
    }

    info!("Session manager running, press Ctrl+C to exit");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    service.shutdown();
    let stats = service.events().stats();
    info!(
        events = stats.events_published,
        handler_failures = stats.handler_failures,
        "benchdash-session stopped"
    );
    Ok(())
}
