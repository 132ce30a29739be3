//! Key-value storage capability used to persist credentials.
//!
//! This module provides the `KeyValueStore` trait and its backends:
//! - `MemoryStore`: in-process map, for tests and throwaway sessions
//! - `KeychainStore`: OS keychain via keyring
//! - `EncryptedFileStore`: passphrase-encrypted JSON file
//! - `NamespacedStore`: prefixes every key of another store

pub mod encrypted;
pub mod keychain;
pub mod memory;
pub mod namespaced;

use anyhow::Result;

pub use encrypted::EncryptedFileStore;
pub use keychain::KeychainStore;
pub use memory::MemoryStore;
pub use namespaced::NamespacedStore;

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;

    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<()>;

    /// Stored keys, or `None` when the backend cannot enumerate.
    fn keys(&self) -> Result<Option<Vec<String>>> {
        Ok(None)
    }
}
