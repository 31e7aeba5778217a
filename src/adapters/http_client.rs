use anyhow::Result;
use std::collections::HashMap;
use std::time::Duration;

use crate::auth::storage::AuthorizationHeader;

/// HTTP method enum
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    GET,
    POST,
}

/// A very simple version that only holds response data
#[derive(Debug, Clone)]
pub struct SimpleHttpResponse {
    /// HTTP status code
    status_code: u16,
    /// Response body
    body: String,
    /// Response headers, lowercased names
    headers: HashMap<String, String>,
}

impl SimpleHttpResponse {
    /// Create a new response
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status_code: status,
            body: body.into(),
            headers: HashMap::new(),
        }
    }

    /// Add a header
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .insert(key.into().to_ascii_lowercase(), value.into());
        self
    }

    /// Get the status code
    pub fn status(&self) -> u16 {
        self.status_code
    }

    /// Get a reference to the response body
    pub fn body(&self) -> &str {
        &self.body
    }

    /// Look up a header by name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Parse body as JSON
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.body)?)
    }

    /// Check if successful (2xx status)
    pub fn is_success(&self) -> bool {
        self.status_code >= 200 && self.status_code < 300
    }
}

/// Trait for HTTP client operations, allowing for mocking
#[async_trait::async_trait]
pub trait HttpClient: Send + Sync {
    /// Perform HTTP GET request and return a SimpleHttpResponse
    async fn get(&self, url: &str, headers: HashMap<String, String>) -> Result<SimpleHttpResponse>;

    /// Perform HTTP POST request and return a SimpleHttpResponse
    async fn post(
        &self,
        url: &str,
        headers: HashMap<String, String>,
        body: String,
    ) -> Result<SimpleHttpResponse>;
}

/// Implementation of HttpClient using reqwest
pub struct ReqwestHttpClient {
    /// Internal reqwest client
    client: reqwest::Client,
    /// Sent as `Authorization` when a request does not set its own
    default_auth: Option<AuthorizationHeader>,
}

impl ReqwestHttpClient {
    /// Create a new ReqwestHttpClient
    pub fn new() -> Self {
        Self::with_client(reqwest::Client::new())
    }

    /// Client with a per-request timeout
    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client))
    }

    /// Create a new client with custom configuration
    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            default_auth: None,
        }
    }

    /// Attach the session's default authorization header
    pub fn with_default_auth(mut self, header: AuthorizationHeader) -> Self {
        self.default_auth = Some(header);
        self
    }

    fn apply_headers(
        &self,
        mut request: reqwest::RequestBuilder,
        headers: HashMap<String, String>,
    ) -> reqwest::RequestBuilder {
        let has_auth = headers
            .keys()
            .any(|k| k.eq_ignore_ascii_case("authorization"));
        if !has_auth {
            if let Some(value) = self.default_auth.as_ref().and_then(|h| h.value()) {
                request = request.header(reqwest::header::AUTHORIZATION, value);
            }
        }

        for (key, value) in headers {
            request = request.header(key, value);
        }
        request
    }

    async fn into_simple(response: reqwest::Response) -> Result<SimpleHttpResponse> {
        let status = response.status().as_u16();
        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
            .collect();
        let body = response.text().await?;

        Ok(headers
            .into_iter()
            .fold(SimpleHttpResponse::new(status, body), |resp, (k, v)| {
                resp.with_header(k, v)
            }))
    }
}

impl Default for ReqwestHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn get(&self, url: &str, headers: HashMap<String, String>) -> Result<SimpleHttpResponse> {
        let request = self.apply_headers(self.client.get(url), headers);
        let response = request.send().await?;
        Self::into_simple(response).await
    }

    async fn post(
        &self,
        url: &str,
        headers: HashMap<String, String>,
        body: String,
    ) -> Result<SimpleHttpResponse> {
        let request = self.apply_headers(self.client.post(url).body(body), headers);
        let response = request.send().await?;
        Self::into_simple(response).await
    }
}
