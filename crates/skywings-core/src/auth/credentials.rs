use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use tracing::warn;

use super::Credential;
use crate::storage::KeyValueStore;

const TOKEN_KEY: &str = "auth_token";
const REFRESH_TOKEN_KEY: &str = "refresh_token";
const TOKEN_EXPIRY_KEY: &str = "token_expiry";
const USER_KEY: &str = "user_data";

/// Maps a `Credential` onto individual keys of a `KeyValueStore`.
#[derive(Clone)]
pub struct CredentialStore {
    store: Arc<dyn KeyValueStore>,
}

impl CredentialStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Load the stored credential, `None` when no access token is stored.
    pub fn load(&self) -> Result<Option<Credential>> {
        let Some(access_token) = self.store.get(TOKEN_KEY)? else {
            return Ok(None);
        };

        let expires_at = match self.store.get(TOKEN_EXPIRY_KEY)? {
            Some(raw) => match raw.trim().parse::<i64>() {
                Ok(ms) => Utc.timestamp_millis_opt(ms).single(),
                Err(_) => {
                    warn!(value = %raw, "Ignoring unparseable token expiry");
                    None
                }
            },
            None => None,
        };

        let user = match self.store.get(USER_KEY)? {
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(user) => Some(user),
                Err(e) => {
                    warn!(error = %e, "Ignoring unparseable stored user profile");
                    None
                }
            },
            None => None,
        };

        Ok(Some(Credential {
            access_token,
            refresh_token: self.store.get(REFRESH_TOKEN_KEY)?,
            expires_at,
            user,
        }))
    }

    /// Store every field. The access token is removed first and written
    /// last, so a save that fails partway leaves no session rather than a
    /// mix of old and new fields.
    pub fn save(&self, credential: &Credential) -> Result<()> {
        self.store
            .remove(TOKEN_KEY)
            .context("Failed to replace access token")?;

        match credential.refresh_token {
            Some(ref token) => self.store.set(REFRESH_TOKEN_KEY, token)?,
            None => self.store.remove(REFRESH_TOKEN_KEY)?,
        }

        match credential.expires_at {
            Some(expiry) => self
                .store
                .set(TOKEN_EXPIRY_KEY, &expiry.timestamp_millis().to_string())?,
            None => self.store.remove(TOKEN_EXPIRY_KEY)?,
        }

        match credential.user {
            Some(ref user) => self.store.set(USER_KEY, &serde_json::to_string(user)?)?,
            None => self.store.remove(USER_KEY)?,
        }

        self.store
            .set(TOKEN_KEY, &credential.access_token)
            .context("Failed to store access token")
    }

    /// Remove every credential key. All removals are attempted even if one fails.
    pub fn clear(&self) -> Result<()> {
        let mut first_error = None;
        for key in [TOKEN_KEY, REFRESH_TOKEN_KEY, TOKEN_EXPIRY_KEY, USER_KEY] {
            if let Err(e) = self.store.remove(key) {
                warn!(key = key, error = %e, "Failed to remove stored credential");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e.context("Failed to clear stored credentials")),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use chrono::Duration;

    fn sample() -> Credential {
        Credential {
            access_token: "tok".to_string(),
            refresh_token: Some("ref".to_string()),
            // Millisecond precision survives the round trip through storage
            expires_at: Utc.timestamp_millis_opt(1_900_000_000_123).single(),
            user: Some(serde_json::json!({"name": "Ada", "tier": "gold"})),
        }
    }

    #[test]
    fn test_save_then_load() {
        let credentials = CredentialStore::new(Arc::new(MemoryStore::new()));
        assert_eq!(credentials.load().expect("load"), None);

        credentials.save(&sample()).expect("save");
        assert_eq!(credentials.load().expect("load"), Some(sample()));
    }

    #[test]
    fn test_expiry_stored_as_epoch_millis() {
        let backend = Arc::new(MemoryStore::new());
        let credentials = CredentialStore::new(backend.clone());
        credentials.save(&sample()).expect("save");
        assert_eq!(
            backend.get(TOKEN_EXPIRY_KEY).expect("get").as_deref(),
            Some("1900000000123")
        );
    }

    #[test]
    fn test_clear_removes_everything() {
        let backend = Arc::new(MemoryStore::new());
        let credentials = CredentialStore::new(backend.clone());
        credentials.save(&sample()).expect("save");
        credentials.clear().expect("clear");

        assert_eq!(credentials.load().expect("load"), None);
        assert_eq!(backend.keys().expect("keys"), Some(vec![]));
    }

    /// Delegates to a memory store but refuses writes to one key.
    struct RefusingStore {
        inner: MemoryStore,
        refused: &'static str,
    }

    impl KeyValueStore for RefusingStore {
        fn get(&self, key: &str) -> Result<Option<String>> {
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: &str) -> Result<()> {
            if key == self.refused {
                anyhow::bail!("write to {} refused", key);
            }
            self.inner.set(key, value)
        }

        fn remove(&self, key: &str) -> Result<()> {
            self.inner.remove(key)
        }
    }

    #[test]
    fn test_failed_save_leaves_no_mixed_session() {
        let backend = Arc::new(RefusingStore {
            inner: MemoryStore::new(),
            refused: USER_KEY,
        });
        let credentials = CredentialStore::new(backend.clone());
        // Seed an earlier session straight into the backend
        backend.inner.set(TOKEN_KEY, "previous").expect("seed");
        backend.inner.set(REFRESH_TOKEN_KEY, "previous-ref").expect("seed");

        assert!(credentials.save(&sample()).is_err());
        // The new refresh token landed but the old access token did not survive next to it
        assert_eq!(credentials.load().expect("load"), None);
    }

    #[test]
    fn test_garbage_expiry_counts_as_missing() {
        let backend = Arc::new(MemoryStore::new());
        backend.set(TOKEN_KEY, "tok").expect("set");
        backend.set(TOKEN_EXPIRY_KEY, "tomorrow").expect("set");

        let credential = CredentialStore::new(backend)
            .load()
            .expect("load")
            .expect("credential present");
        assert_eq!(credential.expires_at, None);
        assert!(credential.needs_refresh(Duration::seconds(0)));
    }
}
