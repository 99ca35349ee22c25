//! Outbound HTTP to the third-party stats API.
//!
//! The rest of the crate only sees [`UpstreamTransport`], so tests and
//! embedders can swap in their own transport. [`HttpTransport`] is the
//! `reqwest` implementation used in production.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use serde_json::Value as JsonValue;

use crate::error::{CompanionError, Result};

/// Default OpenDota API root.
pub const DEFAULT_API_BASE_URL: &str = "https://api.opendota.com/api";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamRequest {
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
}

impl UpstreamRequest {
    pub fn get(url: impl Into<String>) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("Accept".to_string(), "application/json".to_string());
        Self {
            method: "GET".to_string(),
            url: url.into(),
            headers,
            body: None,
        }
    }

    pub fn is_read(&self) -> bool {
        self.method.eq_ignore_ascii_case("GET")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamResponse {
    pub status: u16,
    pub body: JsonValue,
}

impl UpstreamResponse {
    pub fn ok(body: JsonValue) -> Self {
        Self { status: 200, body }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Anything that can carry a request to the upstream API.
///
/// Implementations return `Err` only when no HTTP response was obtained
/// (connect failure, timeout). Any status code, including 404 and 5xx, is an
/// `Ok` response for the caller to interpret.
#[async_trait]
pub trait UpstreamTransport: Send + Sync {
    async fn fetch(&self, request: &UpstreamRequest) -> Result<UpstreamResponse>;
}

pub struct HttpTransport {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(4)
            .timeout(timeout)
            .build()
            .map_err(|e| CompanionError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, timeout })
    }
}

#[async_trait]
impl UpstreamTransport for HttpTransport {
    async fn fetch(&self, request: &UpstreamRequest) -> Result<UpstreamResponse> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes()).map_err(|e| {
            CompanionError::Validation(format!("invalid HTTP method '{}': {e}", request.method))
        })?;

        let mut builder = self
            .client
            .request(method, &request.url)
            .timeout(self.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        debug!("[upstream] {} {}", request.method, request.url);
        let response = builder.send().await?;
        let status = response.status().as_u16();
        let text = response.text().await?;

        let body = if text.trim().is_empty() {
            JsonValue::Null
        } else {
            serde_json::from_str(&text).unwrap_or(JsonValue::String(text))
        };

        Ok(UpstreamResponse { status, body })
    }
}
