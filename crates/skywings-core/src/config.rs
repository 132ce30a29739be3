//! Client configuration management.
//!
//! This module handles loading and saving the client configuration: the API
//! base URL, request deadline, retry budget, backoff shape and token expiry
//! buffer.
//!
//! Configuration is stored at `~/.config/skywings/config.json`. The
//! `SKYWINGS_API_URL` environment variable overrides the stored base URL.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Application name used for config/data directory paths
pub const APP_NAME: &str = "skywings";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Environment variable overriding `base_url`
pub const API_URL_ENV: &str = "SKYWINGS_API_URL";

const DEFAULT_BASE_URL: &str = "http://localhost:8080/api";

/// HTTP request deadline in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Idempotent retry budget per call.
const DEFAULT_MAX_RETRIES: u32 = 2;

const DEFAULT_INITIAL_BACKOFF_MS: u64 = 300;
const DEFAULT_MAX_BACKOFF_MS: u64 = 10_000;
const DEFAULT_JITTER_MS: u64 = 100;

/// Tokens expiring within this window are refreshed before use (5 minutes).
const DEFAULT_EXPIRY_BUFFER_SECS: u64 = 300;

/// Wait applied to a 429 that carries no usable `Retry-After`.
const DEFAULT_RETRY_AFTER_SECS: u64 = 5;

/// Proactive refresh check interval (5 minutes).
const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 300;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub jitter_ms: u64,
    pub expiry_buffer_secs: u64,
    pub default_retry_after_secs: u64,
    pub refresh_interval_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
            initial_backoff_ms: DEFAULT_INITIAL_BACKOFF_MS,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
            jitter_ms: DEFAULT_JITTER_MS,
            expiry_buffer_secs: DEFAULT_EXPIRY_BUFFER_SECS,
            default_retry_after_secs: DEFAULT_RETRY_AFTER_SECS,
            refresh_interval_secs: DEFAULT_REFRESH_INTERVAL_SECS,
        }
    }
}

impl ClientConfig {
    /// Load the config file (defaults if absent), then apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents).context("Failed to parse config file")?
        } else {
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var(API_URL_ENV) {
            if !url.trim().is_empty() {
                self.base_url = url.trim().to_string();
            }
        }
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Directory for persistent client data (encrypted credentials, logs).
    pub fn data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn expiry_buffer(&self) -> Duration {
        Duration::from_secs(self.expiry_buffer_secs)
    }

    pub fn default_retry_after(&self) -> Duration {
        Duration::from_secs(self.default_retry_after_secs)
    }

    /// Never zero; a zero in the config file means "as often as allowed".
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(1))
    }

    /// Resolve a request path against `base_url`. Absolute URLs pass through.
    pub fn resolve_url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        let base = self.base_url.trim_end_matches('/');
        if path.starts_with('/') {
            format!("{}{}", base, path)
        } else {
            format!("{}/{}", base, path)
        }
    }
}
