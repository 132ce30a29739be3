//! Bearer token lifecycle with single-flight refresh.
//!
//! At most one refresh runs per `TokenManager`. Callers arriving while it is
//! in flight join a FIFO queue and all receive the same outcome. The refresh
//! itself runs in a spawned task that resolves the queue, so a caller that
//! stops waiting never strands the others.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{AuthGrant, Credential, CredentialStore};
use crate::api::ApiError;

/// Exchanges a refresh token for a new grant.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<AuthGrant, ApiError>;
}

type Waiter = oneshot::Sender<Result<String, ApiError>>;

/// Shortest period accepted for the background refresh check.
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Default)]
struct RefreshState {
    in_flight: bool,
    waiters: VecDeque<Waiter>,
    /// Bumped by `clear` and `store_grant`; a refresh started under an older
    /// generation must not write its result.
    generation: u64,
}

pub struct TokenManager {
    credentials: CredentialStore,
    refresher: Arc<dyn TokenRefresher>,
    expiry_buffer: chrono::Duration,
    state: Mutex<RefreshState>,
}

fn storage_error(err: anyhow::Error) -> ApiError {
    ApiError::RequestSetupError(format!("Credential storage failed: {:#}", err))
}

impl TokenManager {
    pub fn new(
        credentials: CredentialStore,
        refresher: Arc<dyn TokenRefresher>,
        expiry_buffer: Duration,
    ) -> Self {
        Self {
            credentials,
            refresher,
            expiry_buffer: chrono::Duration::from_std(expiry_buffer)
                .unwrap_or_else(|_| chrono::Duration::seconds(300)),
            state: Mutex::new(RefreshState::default()),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, RefreshState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    /// Whether any credential is stored, valid or not.
    pub fn has_session(&self) -> Result<bool, ApiError> {
        Ok(self.credentials.load().map_err(storage_error)?.is_some())
    }

    /// A token exists and is outside the expiry buffer.
    pub fn is_authenticated(&self) -> bool {
        match self.credentials.load() {
            Ok(Some(credential)) => !credential.needs_refresh(self.expiry_buffer),
            _ => false,
        }
    }

    pub fn is_refreshing(&self) -> bool {
        self.lock_state().in_flight
    }

    pub fn current_user(&self) -> Option<Value> {
        self.credentials.load().ok().flatten().and_then(|c| c.user)
    }

    /// Persist a grant obtained outside the refresh flow (login). It replaces
    /// the session outright: a refresh still running for the previous session
    /// is discarded and its queued callers receive the new token.
    pub fn store_grant(&self, grant: AuthGrant) -> Result<Credential, ApiError> {
        let credential = Credential::from_grant(grant, None, Utc::now());
        let waiters = {
            let mut state = self.lock_state();
            self.credentials.save(&credential).map_err(storage_error)?;
            state.generation += 1;
            state.in_flight = false;
            std::mem::take(&mut state.waiters)
        };

        if !waiters.is_empty() {
            debug!(waiters = waiters.len(), "Handing new session token to queued waiters");
        }
        for waiter in waiters {
            let _ = waiter.send(Ok(credential.access_token.clone()));
        }
        Ok(credential)
    }

    /// Return a token safe to use right now, refreshing first if it is
    /// inside the expiry buffer or a refresh is already running.
    pub async fn get_valid_token(self: &Arc<Self>) -> Result<String, ApiError> {
        self.acquire(None).await
    }

    /// Replace a token the server rejected. If the stored token already
    /// differs from `rejected`, another caller refreshed it and it is reused.
    pub async fn refresh_rejected(self: &Arc<Self>, rejected: &str) -> Result<String, ApiError> {
        self.acquire(Some(rejected)).await
    }

    async fn acquire(self: &Arc<Self>, rejected: Option<&str>) -> Result<String, ApiError> {
        let receiver = {
            let mut state = self.lock_state();
            if !state.in_flight {
                let credential = self.credentials.load().map_err(storage_error)?;
                if let Some(ref credential) = credential {
                    let was_rejected = rejected == Some(credential.access_token.as_str());
                    if !was_rejected && !credential.needs_refresh(self.expiry_buffer) {
                        return Ok(credential.access_token.clone());
                    }
                }
                self.start_refresh(&mut state, credential.and_then(|c| c.refresh_token));
            } else {
                debug!(queued = state.waiters.len() + 1, "Waiting on in-flight token refresh");
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            rx
        };

        receiver.await.unwrap_or_else(|_| {
            Err(ApiError::RequestSetupError(
                "Token refresh was abandoned".to_string(),
            ))
        })
    }

    fn start_refresh(self: &Arc<Self>, state: &mut RefreshState, refresh_token: Option<String>) {
        state.in_flight = true;
        let generation = state.generation;
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = match refresh_token {
                Some(token) => {
                    debug!("Refreshing access token");
                    this.refresher.refresh(&token).await
                }
                None => Err(ApiError::Unauthorized {
                    message: "No refresh token available".to_string(),
                }),
            };
            this.finish_refresh(outcome, generation);
        });
    }

    fn finish_refresh(&self, outcome: Result<AuthGrant, ApiError>, generation: u64) {
        let (waiters, result) = {
            let mut state = self.lock_state();
            if state.generation != generation {
                // Signed out or in meanwhile; the queue was already answered.
                debug!("Discarding token refresh started for a previous session");
                return;
            }

            let result = outcome.and_then(|grant| {
                let previous = self.credentials.load().map_err(storage_error)?;
                let credential = Credential::from_grant(grant, previous.as_ref(), Utc::now());
                self.credentials.save(&credential).map_err(storage_error)?;
                Ok(credential.access_token)
            });

            match result {
                Ok(_) => info!(waiters = state.waiters.len(), "Access token refreshed"),
                Err(ref e) => {
                    error!(error = %e, waiters = state.waiters.len(), "Token refresh failed, clearing session");
                    if let Err(clear_err) = self.credentials.clear() {
                        warn!(error = %clear_err, "Failed to clear credentials after refresh failure");
                    }
                }
            }

            state.in_flight = false;
            (std::mem::take(&mut state.waiters), result)
        };

        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }

    /// Drop the session: remove stored credentials and reject queued waiters.
    pub fn clear(&self) {
        let waiters = {
            let mut state = self.lock_state();
            state.generation += 1;
            state.in_flight = false;
            if let Err(e) = self.credentials.clear() {
                warn!(error = %e, "Failed to clear stored credentials");
            }
            std::mem::take(&mut state.waiters)
        };

        if !waiters.is_empty() {
            debug!(waiters = waiters.len(), "Rejecting queued token waiters");
        }
        let rejection = ApiError::Unauthorized {
            message: "Authentication required".to_string(),
        };
        for waiter in waiters {
            let _ = waiter.send(Err(rejection.clone()));
        }
    }

    /// Check every `interval` and refresh ahead of expiry while a session
    /// exists. The first check runs immediately. Intervals shorter than
    /// `MIN_REFRESH_INTERVAL` are raised to it. Cancel the returned token to stop.
    pub fn spawn_periodic_refresh(self: &Arc<Self>, interval: Duration) -> CancellationToken {
        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        let this = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(MIN_REFRESH_INTERVAL));
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if !matches!(this.has_session(), Ok(true)) || this.is_authenticated() {
                    continue;
                }
                if let Err(e) = this.get_valid_token().await {
                    warn!(error = %e, "Background token refresh failed");
                }
            }
            debug!("Background token refresh stopped");
        });

        cancel
    }
}
