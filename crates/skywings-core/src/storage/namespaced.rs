use std::sync::Arc;

use anyhow::Result;

use super::KeyValueStore;

/// Prefix applied to every key the client writes.
pub const DEFAULT_PREFIX: &str = "skywings_";

/// Prefixes every key so several applications can share one backend.
#[derive(Clone)]
pub struct NamespacedStore {
    inner: Arc<dyn KeyValueStore>,
    prefix: String,
}

impl NamespacedStore {
    pub fn new(inner: Arc<dyn KeyValueStore>) -> Self {
        Self::with_prefix(inner, DEFAULT_PREFIX)
    }

    pub fn with_prefix(inner: Arc<dyn KeyValueStore>, prefix: impl Into<String>) -> Self {
        Self {
            inner,
            prefix: prefix.into(),
        }
    }

    fn scoped(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// Remove every key under this namespace. Returns false when the backend
    /// cannot enumerate its keys.
    pub fn clear_namespace(&self) -> Result<bool> {
        let Some(keys) = self.inner.keys()? else {
            return Ok(false);
        };
        for key in keys.iter().filter(|k| k.starts_with(&self.prefix)) {
            self.inner.remove(key)?;
        }
        Ok(true)
    }
}

impl KeyValueStore for NamespacedStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        self.inner.get(&self.scoped(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.inner.set(&self.scoped(key), value)
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.inner.remove(&self.scoped(key))
    }

    fn keys(&self) -> Result<Option<Vec<String>>> {
        Ok(self.inner.keys()?.map(|keys| {
            keys.into_iter()
                .filter_map(|k| k.strip_prefix(&self.prefix).map(str::to_string))
                .collect()
        }))
    }
}
