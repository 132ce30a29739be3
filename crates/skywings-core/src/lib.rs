//! Core library for the SkyWings booking client.
//!
//! Every UI surface talks to the backend REST services through
//! [`api::ApiClient`], which owns the session's token lifecycle.

pub mod api;
pub mod auth;
pub mod config;
pub mod storage;

pub use api::{ApiClient, ApiError, RequestDescriptor};
pub use auth::{Credential, TokenManager};
pub use config::ClientConfig;
pub use tokio_util::sync::CancellationToken;
