//! Outbound HTTP to identity providers
//!
//! [`ProviderTransport`] is the seam between the broker and the network: the
//! production implementation wraps `reqwest`, tests substitute a stub.
//! [`ProviderClient`] layers the retry policy on top. Only idempotent GETs
//! (userinfo, JWKS, discovery) are retried; the code exchange POST is sent once.

use crate::error::ConfigError;
use crate::settings::HttpSettings;
use async_trait::async_trait;
use log::{debug, warn};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

/// A request to a provider endpoint
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub form: Vec<(String, String)>,
    pub basic_auth: Option<(String, String)>,
}

impl ProviderRequest {
    #[must_use]
    pub fn get(url: &str) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.to_string(),
            headers: Vec::new(),
            form: Vec::new(),
            basic_auth: None,
        }
    }

    #[must_use]
    pub fn post_form(url: &str, form: Vec<(String, String)>) -> Self {
        Self {
            method: HttpMethod::Post,
            url: url.to_string(),
            headers: Vec::new(),
            form,
            basic_auth: None,
        }
    }

    #[must_use]
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    #[must_use]
    pub fn bearer(self, token: &str) -> Self {
        self.header("Authorization", &format!("Bearer {token}"))
    }

    #[must_use]
    pub fn basic_auth(mut self, username: &str, password: &str) -> Self {
        self.basic_auth = Some((username.to_string(), password.to_string()));
        self
    }

    /// Value of a form field, if present
    #[must_use]
    pub fn form_value(&self, name: &str) -> Option<&str> {
        self.form
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Status and raw body of a provider response
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub status: u16,
    pub body: String,
}

impl ProviderResponse {
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    fn is_retryable(&self) -> bool {
        self.status >= 500 || self.status == 429
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request failed: {0}")]
    Other(String),
}

impl TransportError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Connect(_))
    }
}

/// Failure of a JSON GET after retries
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("unexpected status {0}")]
    Status(u16),
    #[error("invalid JSON body: {0}")]
    Decode(String),
}

#[async_trait]
pub trait ProviderTransport: Send + Sync {
    async fn send(&self, request: ProviderRequest) -> Result<ProviderResponse, TransportError>;
}

/// `reqwest` (rustls) implementation of [`ProviderTransport`]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Build a client with connect and total timeouts from settings
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::HttpClient` if the TLS backend cannot be initialized
    pub fn new(http: &HttpSettings) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(http.timeout_seconds))
            .connect_timeout(Duration::from_secs(http.connect_timeout_seconds))
            .user_agent(http.user_agent.clone())
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ProviderTransport for ReqwestTransport {
    async fn send(&self, request: ProviderRequest) -> Result<ProviderResponse, TransportError> {
        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(&request.url),
            HttpMethod::Post => self.client.post(&request.url).form(&request.form),
        };

        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some((username, password)) = &request.basic_auth {
            builder = builder.basic_auth(username, Some(password));
        }

        let response = builder.send().await.map_err(classify_reqwest_error)?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(classify_reqwest_error)?;

        Ok(ProviderResponse { status, body })
    }
}

fn classify_reqwest_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else if e.is_connect() {
        TransportError::Connect(e.to_string())
    } else {
        TransportError::Other(e.to_string())
    }
}

/// Transport plus retry policy
#[derive(Clone)]
pub struct ProviderClient {
    transport: Arc<dyn ProviderTransport>,
    retries: u32,
    backoff: Duration,
}

impl ProviderClient {
    #[must_use]
    pub fn new(transport: Arc<dyn ProviderTransport>, http: &HttpSettings) -> Self {
        Self {
            transport,
            retries: http.idempotent_retries,
            backoff: Duration::from_millis(http.retry_backoff_ms),
        }
    }

    /// Send a request exactly once
    ///
    /// # Errors
    ///
    /// Returns the transport error unchanged
    pub async fn send_once(
        &self,
        request: ProviderRequest,
    ) -> Result<ProviderResponse, TransportError> {
        self.transport.send(request).await
    }

    /// GET a JSON document, retrying timeouts, connection failures, 429 and 5xx
    ///
    /// # Errors
    ///
    /// Returns a `FetchError` once retries are exhausted or on a non-retryable failure
    pub async fn get_json(&self, request: ProviderRequest) -> Result<Value, FetchError> {
        debug_assert_eq!(request.method, HttpMethod::Get);
        let mut attempt = 0u32;

        loop {
            let outcome = self.transport.send(request.clone()).await;
            let retryable = match &outcome {
                Ok(response) => response.is_retryable(),
                Err(e) => e.is_retryable(),
            };

            if retryable && attempt < self.retries {
                attempt += 1;
                warn!(
                    "GET {} failed (attempt {attempt}/{}), retrying",
                    request.url,
                    self.retries + 1
                );
                tokio::time::sleep(self.backoff * attempt).await;
                continue;
            }

            let response = outcome?;
            if !response.is_success() {
                return Err(FetchError::Status(response.status));
            }

            debug!("GET {} succeeded with status {}", request.url, response.status);
            return serde_json::from_str(&response.body)
                .map_err(|e| FetchError::Decode(e.to_string()));
        }
    }
}
