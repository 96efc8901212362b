//! Transport boundary for replayed calls
//!
//! The backlog never talks to the network directly; it hands a prepared
//! [`TransportRequest`] to a [`Transport`] and awaits the response body.
//! [`HttpTransport`] is the reqwest-backed implementation; tests substitute
//! mocks.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::types::HttpMethod;

/// A fully prepared request descriptor: endpoint, verb, JSON payload.
///
/// Headers and auth are the caller's concern; the backlog only stamps the
/// payload.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportRequest {
    pub url: String,
    pub http_method: HttpMethod,
    pub payload: Value,
}

/// Performs a prepared call and yields the raw response body.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &TransportRequest) -> Result<String>;
}

/// Default [`Transport`] over reqwest.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;
        Ok(HttpTransport { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &TransportRequest) -> Result<String> {
        let builder = match request.http_method {
            HttpMethod::Get => self.client.get(&request.url),
            HttpMethod::Delete => self.client.delete(&request.url),
            HttpMethod::Post => self.client.post(&request.url).json(&request.payload),
            HttpMethod::Put => self.client.put(&request.url).json(&request.payload),
        };

        let response = builder
            .send()
            .await
            .map_err(|e| Error::Transport(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::Transport(format!("failed to read response body: {}", e)))?;

        if status.is_success() {
            Ok(body)
        } else {
            Err(Error::Transport(format!("API error ({}): {}", status, body)))
        }
    }
}
