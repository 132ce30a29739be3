//! Authentication module for managing user sessions and bearer tokens.
//!
//! This module provides:
//! - `Credential` / `AuthGrant`: the stored session and the login/refresh wire shape
//! - `CredentialStore`: maps a credential onto a `KeyValueStore`
//! - `TokenManager`: hands out valid tokens with single-flight refresh
//!
//! Tokens within 5 minutes of expiry are refreshed before use.

pub mod credentials;
pub mod session;
pub mod token_manager;

pub use credentials::CredentialStore;
pub use session::{AuthGrant, Credential};
pub use token_manager::{TokenManager, TokenRefresher};
