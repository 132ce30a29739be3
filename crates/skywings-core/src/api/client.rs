//! API client for communicating with the SkyWings REST services.
//!
//! This module provides the `ApiClient` struct for making authenticated
//! API requests against the flight, booking, payment and notification
//! services.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::request::{generate_request_id, REQUEST_ID_HEADER};
use super::transport::{HttpResponse, PreparedRequest, ReqwestTransport, Transport};
use super::{ApiError, Backoff, RequestDescriptor};
use crate::auth::{AuthGrant, Credential, CredentialStore, TokenManager, TokenRefresher};
use crate::config::ClientConfig;
use crate::storage::KeyValueStore;

// ============================================================================
// Constants
// ============================================================================

const LOGIN_PATH: &str = "/auth/login";

const REFRESH_PATH: &str = "/auth/refresh-token";

/// Runs one logical call to completion: token attach, dispatch, 401 refresh,
/// rate-limit waits and idempotent retries.
#[derive(Clone)]
struct Dispatcher {
    transport: Arc<dyn Transport>,
    config: Arc<ClientConfig>,
    backoff: Backoff,
}

impl Dispatcher {
    async fn execute(
        &self,
        descriptor: &RequestDescriptor,
        tokens: Option<&Arc<TokenManager>>,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse, ApiError> {
        // Auth endpoints never carry a bearer and never trigger a refresh
        let tokens = if descriptor.is_auth_endpoint() { None } else { tokens };

        // Anonymous callers (no stored session) go out without a bearer
        let mut bearer = None;
        if let Some(tokens) = tokens {
            if tokens.has_session()? {
                bearer = Some(cancellable(cancel, tokens.get_valid_token()).await?);
            }
        }

        let url = self.config.resolve_url(&descriptor.path);
        let timeout = descriptor.timeout.unwrap_or_else(|| self.config.timeout());
        let request_id = descriptor
            .headers
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or_else(generate_request_id);
        let method = descriptor.method.as_str();

        let mut retries_left = descriptor.retries.unwrap_or(self.config.max_retries);
        let mut attempt: u32 = 0;
        let mut refreshed = false;

        loop {
            let request = self.prepare(descriptor, &url, &request_id, bearer.as_deref(), timeout)?;
            let started = Instant::now();
            let outcome = cancellable(cancel, async {
                Ok(self.transport.send(&request).await)
            })
            .await?;
            let duration_ms = started.elapsed().as_millis() as u64;

            let err = match outcome {
                Ok(response) if response.is_success() => {
                    debug!(method, url = %url, status = response.status, request_id = %request_id, duration_ms, "API request");
                    return Ok(response);
                }
                Ok(response) => {
                    debug!(method, url = %url, status = response.status, request_id = %request_id, duration_ms, "API request failed");
                    let err = ApiError::from_response(
                        response.status,
                        &response.headers,
                        &response.body,
                        self.config.default_retry_after(),
                    );
                    match (err, tokens, bearer.take()) {
                        (ApiError::Unauthorized { .. }, Some(tokens), Some(rejected)) => {
                            if refreshed {
                                warn!(url = %url, request_id = %request_id, "Token rejected after refresh, ending session");
                                tokens.clear();
                                return Err(ApiError::session_expired());
                            }
                            refreshed = true;
                            debug!(url = %url, request_id = %request_id, "Token rejected, refreshing and retrying");
                            bearer = Some(cancellable(cancel, tokens.refresh_rejected(&rejected)).await?);
                            continue;
                        }
                        (ApiError::RateLimited { retry_after }, _, previous) => {
                            bearer = previous;
                            warn!(url = %url, request_id = %request_id, retry_after_secs = retry_after.as_secs_f64(), "Rate limited, waiting");
                            sleep(cancel, retry_after).await?;
                            continue;
                        }
                        (err, _, previous) => {
                            bearer = previous;
                            err
                        }
                    }
                }
                Err(transport_err) => {
                    warn!(method, url = %url, request_id = %request_id, duration_ms, error = %transport_err, "API request got no response");
                    ApiError::from(transport_err)
                }
            };

            if err.is_retryable() && descriptor.is_idempotent() && retries_left > 0 {
                let delay = self.backoff.delay(attempt);
                warn!(
                    url = %url,
                    request_id = %request_id,
                    retries_left,
                    backoff_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retryable failure, backing off"
                );
                sleep(cancel, delay).await?;
                attempt += 1;
                retries_left -= 1;
                continue;
            }

            return Err(err);
        }
    }

    fn prepare(
        &self,
        descriptor: &RequestDescriptor,
        url: &str,
        request_id: &str,
        bearer: Option<&str>,
        timeout: Duration,
    ) -> Result<PreparedRequest, ApiError> {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(
            HeaderName::from_static(REQUEST_ID_HEADER),
            HeaderValue::from_str(request_id)
                .map_err(|e| ApiError::RequestSetupError(format!("Invalid request id: {}", e)))?,
        );
        for (name, value) in descriptor.headers.iter() {
            headers.insert(name.clone(), value.clone());
        }
        if let Some(token) = bearer {
            headers.insert(
                header::AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", token))
                    .map_err(|e| ApiError::RequestSetupError(format!("Invalid bearer token: {}", e)))?,
            );
        }

        Ok(PreparedRequest {
            method: descriptor.method.clone(),
            url: url.to_string(),
            headers,
            body: descriptor.body.clone(),
            timeout,
            request_id: request_id.to_string(),
        })
    }
}

async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, ApiError>
where
    F: Future<Output = Result<T, ApiError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ApiError::Cancelled),
        result = fut => result,
    }
}

async fn sleep(cancel: &CancellationToken, duration: Duration) -> Result<(), ApiError> {
    cancellable(cancel, async {
        tokio::time::sleep(duration).await;
        Ok(())
    })
    .await
}

fn decode<T: DeserializeOwned>(response: &HttpResponse, path: &str) -> Result<T, ApiError> {
    let body: &[u8] = if response.body.iter().all(u8::is_ascii_whitespace) {
        b"null"
    } else {
        &response.body
    };
    serde_json::from_slice(body).map_err(|e| {
        ApiError::InvalidResponse(format!("Failed to parse JSON response from {}: {}", path, e))
    })
}

/// Calls `POST /auth/refresh-token` through the same dispatch path as any
/// other auth endpoint.
struct RefreshEndpoint {
    dispatcher: Dispatcher,
}

#[async_trait]
impl TokenRefresher for RefreshEndpoint {
    async fn refresh(&self, refresh_token: &str) -> Result<AuthGrant, ApiError> {
        let descriptor = RequestDescriptor::post(REFRESH_PATH)
            .body(json!({ "refreshToken": refresh_token }));
        let response = self
            .dispatcher
            .execute(&descriptor, None, &CancellationToken::new())
            .await?;
        decode(&response, REFRESH_PATH)
    }
}

/// API client for the SkyWings services.
/// Clone is cheap and clones share the session and its refresh state.
#[derive(Clone)]
pub struct ApiClient {
    dispatcher: Dispatcher,
    tokens: Arc<TokenManager>,
}

impl ApiClient {
    /// Create a client over a pooled reqwest transport.
    pub fn new(config: ClientConfig, store: Arc<dyn KeyValueStore>) -> anyhow::Result<Self> {
        let transport = ReqwestTransport::new()?;
        Ok(Self::with_transport(config, store, Arc::new(transport)))
    }

    pub fn with_transport(
        config: ClientConfig,
        store: Arc<dyn KeyValueStore>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let backoff = Backoff::from_config(&config);
        let expiry_buffer = config.expiry_buffer();
        let dispatcher = Dispatcher {
            transport,
            config: Arc::new(config),
            backoff,
        };
        let refresher = Arc::new(RefreshEndpoint {
            dispatcher: dispatcher.clone(),
        });
        let tokens = Arc::new(TokenManager::new(
            CredentialStore::new(store),
            refresher,
            expiry_buffer,
        ));
        Self { dispatcher, tokens }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.dispatcher.config
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    /// Issue a call and decode its JSON body.
    pub async fn request<T: DeserializeOwned>(&self, descriptor: RequestDescriptor) -> Result<T, ApiError> {
        self.request_with_cancel(descriptor, &CancellationToken::new()).await
    }

    /// Like `request`, stopping with `ApiError::Cancelled` once `cancel` fires.
    pub async fn request_with_cancel<T: DeserializeOwned>(
        &self,
        descriptor: RequestDescriptor,
        cancel: &CancellationToken,
    ) -> Result<T, ApiError> {
        let response = self
            .dispatcher
            .execute(&descriptor, Some(&self.tokens), cancel)
            .await?;
        decode(&response, &descriptor.path)
    }

    // ===== HTTP helpers =====

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.request(RequestDescriptor::get(path)).await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.request(RequestDescriptor::post(path).json(body)?).await
    }

    pub async fn put<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.request(RequestDescriptor::put(path).json(body)?).await
    }

    pub async fn patch<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.request(RequestDescriptor::patch(path).json(body)?).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.request(RequestDescriptor::delete(path)).await
    }

    // ===== Session =====

    /// Sign in and persist the returned tokens.
    pub async fn login(&self, email: &str, password: &str) -> Result<Credential, ApiError> {
        let grant: AuthGrant = self
            .post(LOGIN_PATH, &json!({ "email": email, "password": password }))
            .await?;
        self.tokens.store_grant(grant)
    }

    /// Forget the session and reject anything waiting on a refresh.
    pub fn logout(&self) {
        self.tokens.clear();
    }

    pub async fn get_valid_token(&self) -> Result<String, ApiError> {
        self.tokens.get_valid_token().await
    }

    pub fn is_authenticated(&self) -> bool {
        self.tokens.is_authenticated()
    }

    pub fn current_user(&self) -> Option<Value> {
        self.tokens.current_user()
    }

    /// Start refreshing ahead of expiry in the background, checking every
    /// `refresh_interval_secs`. Cancel the returned token to stop.
    pub fn spawn_token_refresh(&self) -> CancellationToken {
        self.tokens
            .spawn_periodic_refresh(self.config().refresh_interval())
    }
}
