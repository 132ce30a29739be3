#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use reqwest::header::{HeaderValue, AUTHORIZATION, RETRY_AFTER};
use serde_json::json;
use skywings_core::api::{HttpResponse, PreparedRequest, Transport, TransportError};
use skywings_core::auth::{Credential, CredentialStore};
use skywings_core::storage::{KeyValueStore, MemoryStore};
use skywings_core::{ApiClient, ClientConfig};

type Handler = dyn Fn(&PreparedRequest) -> Result<HttpResponse, TransportError> + Send + Sync;

/// Transport answering from a closure and recording every request it saw.
pub struct ScriptedTransport {
    handler: Box<Handler>,
    requests: Mutex<Vec<PreparedRequest>>,
    delay: std::time::Duration,
}

impl ScriptedTransport {
    pub fn new<F>(handler: F) -> Arc<Self>
    where
        F: Fn(&PreparedRequest) -> Result<HttpResponse, TransportError> + Send + Sync + 'static,
    {
        Self::with_delay(std::time::Duration::ZERO, handler)
    }

    /// Every response is delayed, so concurrent callers overlap.
    pub fn with_delay<F>(delay: std::time::Duration, handler: F) -> Arc<Self>
    where
        F: Fn(&PreparedRequest) -> Result<HttpResponse, TransportError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            handler: Box::new(handler),
            requests: Mutex::new(Vec::new()),
            delay,
        })
    }

    pub fn requests(&self) -> Vec<PreparedRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    pub fn requests_to(&self, path: &str) -> Vec<PreparedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.url.ends_with(path))
            .collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: &PreparedRequest) -> Result<HttpResponse, TransportError> {
        self.requests.lock().expect("requests lock").push(request.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.handler)(request)
    }
}

pub fn json_response(status: u16, body: serde_json::Value) -> Result<HttpResponse, TransportError> {
    Ok(HttpResponse::new(status, body.to_string().into_bytes()))
}

pub fn rate_limited(retry_after: Option<&'static str>) -> Result<HttpResponse, TransportError> {
    let mut response = HttpResponse::new(429, b"{\"message\": \"slow down\"}".to_vec());
    if let Some(secs) = retry_after {
        response.headers.insert(RETRY_AFTER, HeaderValue::from_static(secs));
    }
    Ok(response)
}

pub fn grant(token: &str) -> Result<HttpResponse, TransportError> {
    json_response(
        200,
        json!({ "token": token, "refreshToken": "ref-2", "expiresIn": 3600, "user": { "id": 42 } }),
    )
}

pub fn bearer(request: &PreparedRequest) -> Option<String> {
    request
        .headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

pub fn test_config() -> ClientConfig {
    ClientConfig {
        base_url: "http://api.skywings.test".to_string(),
        ..ClientConfig::default()
    }
}

/// Seed a session whose access token expires `expires_in_secs` from now.
pub fn seed_session(store: &Arc<MemoryStore>, expires_in_secs: i64) {
    let store: Arc<dyn KeyValueStore> = store.clone();
    CredentialStore::new(store)
        .save(&Credential {
            access_token: "tok-1".to_string(),
            refresh_token: Some("ref-1".to_string()),
            expires_at: Some(Utc::now() + Duration::seconds(expires_in_secs)),
            user: Some(json!({ "id": 42 })),
        })
        .expect("seed session");
}

pub fn build_client(transport: Arc<ScriptedTransport>, store: Arc<MemoryStore>) -> ApiClient {
    ApiClient::with_transport(test_config(), store, transport)
}
