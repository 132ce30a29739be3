use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use serde::Serialize;
use serde_json::Value;

use super::ApiError;

/// Header carrying the per-call correlation id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Any URL containing this segment is an authentication endpoint: no bearer
/// token, no 401-refresh-retry.
const AUTH_PATH_MARKER: &str = "/auth/";

const REQUEST_ID_LEN: usize = 9;

/// One logical API call. Built with the method constructors and the chained
/// setters, then handed to `ApiClient::request`.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Option<Value>,
    /// Idempotent retry budget; `None` uses the client default.
    pub retries: Option<u32>,
    /// Per-call deadline; `None` uses the client default.
    pub timeout: Option<Duration>,
}

impl RequestDescriptor {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            body: None,
            retries: None,
            timeout: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    /// Attach a JSON body. Serialization failures surface as `RequestSetupError`.
    pub fn json<B: Serialize + ?Sized>(mut self, body: &B) -> Result<Self, ApiError> {
        let value = serde_json::to_value(body)
            .map_err(|e| ApiError::RequestSetupError(format!("Failed to serialize body: {}", e)))?;
        self.body = Some(value);
        Ok(self)
    }

    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// GET, HEAD and OPTIONS may be repeated after a 5xx or network failure.
    pub fn is_idempotent(&self) -> bool {
        matches!(self.method, Method::GET | Method::HEAD | Method::OPTIONS)
    }

    pub fn is_auth_endpoint(&self) -> bool {
        self.path.contains(AUTH_PATH_MARKER)
    }
}

/// `req_` followed by nine lowercase alphanumerics.
pub fn generate_request_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(REQUEST_ID_LEN)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect();
    format!("req_{}", suffix)
}
