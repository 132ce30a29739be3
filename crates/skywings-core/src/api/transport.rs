//! Wire-level transport behind the API client.
//!
//! `Transport` is the seam between the retry/refresh logic and the network.
//! `ReqwestTransport` is the production implementation; tests script their
//! own.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::{Client, Method};
use serde_json::Value;
use thiserror::Error;

/// A fully resolved request, ready to put on the wire.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<Value>,
    pub timeout: Duration,
    pub request_id: String,
}

/// Any HTTP response that made it back, successful or not.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Failures where no response was received.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("could not build request: {0}")]
    Setup(String),
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &PreparedRequest) -> Result<HttpResponse, TransportError>;
}

/// Transport over a pooled `reqwest::Client`.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new() -> anyhow::Result<Self> {
        let client = Client::builder().build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn classify(err: reqwest::Error, timeout: Duration) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout(timeout)
        } else if err.is_builder() {
            TransportError::Setup(err.to_string())
        } else {
            TransportError::Connection(err.to_string())
        }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: &PreparedRequest) -> Result<HttpResponse, TransportError> {
        let mut builder = self
            .client
            .request(request.method.clone(), &request.url)
            .headers(request.headers.clone())
            .timeout(request.timeout);
        if let Some(ref body) = request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Self::classify(e, request.timeout))?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| Self::classify(e, request.timeout))?;

        Ok(HttpResponse {
            status,
            headers,
            body: body.to_vec(),
        })
    }
}
