use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::adapters::http_client::{HttpClient, SimpleHttpResponse};
use crate::auth::authority::{AuthAuthority, IssuedTokens};
use crate::auth::token::UserSnapshot;
use crate::error::{malformed_response, transient_network, AuthError, AuthResult};

const EXCHANGE_PATH: &str = "/auth/google";
const REFRESH_PATH: &str = "/auth/refresh";
const VALIDATE_PATH: &str = "/auth/validate";
const LOGOUT_PATH: &str = "/auth/logout";

/// The dashboard backend's auth endpoints over an [`HttpClient`]
pub struct HttpAuthority {
    client: Arc<dyn HttpClient>,
    base_url: String,
}

#[derive(Deserialize)]
struct UserEnvelope {
    user: UserSnapshot,
}

impl HttpAuthority {
    pub fn new(client: Arc<dyn HttpClient>, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post_json(
        &self,
        path: &str,
        bearer: Option<&str>,
        body: Value,
    ) -> AuthResult<SimpleHttpResponse> {
        let url = self.endpoint(path);
        let mut headers = HashMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        if let Some(token) = bearer {
            headers.insert("Authorization".to_string(), format!("Bearer {}", token));
        }

        let response = self
            .client
            .post(&url, headers, body.to_string())
            .await
            .map_err(|e| {
                warn!(url = %url, error = %e, "Authority request failed without a response");
                transient_network(e)
            })?;

        if response.is_success() {
            debug!(url = %url, status = response.status(), "Authority request succeeded");
            Ok(response)
        } else {
            let err = classify_failure(&response);
            debug!(url = %url, status = response.status(), error = %err, "Authority request failed");
            Err(err)
        }
    }
}

fn classify_failure(response: &SimpleHttpResponse) -> AuthError {
    if response.status() == 429 {
        let retry_after = response
            .header("retry-after")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        return AuthError::RemoteThrottled { retry_after };
    }
    AuthError::from_status(response.status(), response.body())
}

fn parse_tokens(response: &SimpleHttpResponse) -> AuthResult<IssuedTokens> {
    let tokens: IssuedTokens = response.json().map_err(malformed_response)?;
    if tokens.access_token.is_empty() || tokens.refresh_token.is_empty() {
        return Err(malformed_response("empty token in authority response"));
    }
    Ok(tokens)
}

#[async_trait]
impl AuthAuthority for HttpAuthority {
    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> AuthResult<IssuedTokens> {
        let response = self
            .post_json(
                EXCHANGE_PATH,
                None,
                json!({ "code": code, "redirectUri": redirect_uri }),
            )
            .await?;
        let tokens = parse_tokens(&response)?;
        if tokens.user.is_none() {
            return Err(malformed_response("code exchange response has no user"));
        }
        Ok(tokens)
    }

    async fn refresh(&self, refresh_token: &str) -> AuthResult<IssuedTokens> {
        let response = self
            .post_json(REFRESH_PATH, None, json!({ "refreshToken": refresh_token }))
            .await?;
        parse_tokens(&response)
    }

    async fn validate(&self, access_token: &str) -> AuthResult<UserSnapshot> {
        let response = self
            .post_json(VALIDATE_PATH, Some(access_token), json!({}))
            .await?;

        // Older deployments return the user object bare
        match response.json::<UserEnvelope>() {
            Ok(envelope) => Ok(envelope.user),
            Err(_) => response.json::<UserSnapshot>().map_err(malformed_response),
        }
    }

    async fn logout(&self, refresh_token: &str) -> AuthResult<()> {
        self.post_json(LOGOUT_PATH, None, json!({ "refreshToken": refresh_token }))
            .await
            .map(|_| ())
    }
}
