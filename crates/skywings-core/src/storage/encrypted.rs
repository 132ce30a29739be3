//! Passphrase-encrypted key-value file.
//!
//! Each value is sealed with ChaCha20-Poly1305 under a key derived from the
//! passphrase with Argon2 and a per-file random salt. The file also carries
//! a sealed check value so a wrong passphrase is rejected when the store is
//! opened instead of on the first read.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, bail, Context, Result};
use argon2::Argon2;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::KeyValueStore;

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
const CHECK_PLAINTEXT: &[u8] = b"skywings-store-v1";

#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
    salt: String,
    check: String,
    #[serde(default)]
    entries: BTreeMap<String, String>,
}

pub struct EncryptedFileStore {
    path: PathBuf,
    cipher: ChaCha20Poly1305,
    file: Mutex<StoreFile>,
}

impl EncryptedFileStore {
    /// Open the store at `path`, creating it if missing.
    pub fn open(path: impl Into<PathBuf>, passphrase: &str) -> Result<Self> {
        let path = path.into();
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read credential file {}", path.display()))?;
            let file: StoreFile =
                serde_json::from_str(&contents).context("Failed to parse credential file")?;
            let salt = hex::decode(&file.salt).context("Corrupt salt in credential file")?;
            let cipher = derive_cipher(passphrase, &salt)?;
            open_sealed(&cipher, &file.check)
                .map_err(|_| anyhow!("Wrong passphrase for credential file {}", path.display()))?;
            debug!(path = %path.display(), entries = file.entries.len(), "Opened credential file");
            Ok(Self {
                path,
                cipher,
                file: Mutex::new(file),
            })
        } else {
            let mut salt = [0u8; SALT_LEN];
            rand::thread_rng().fill_bytes(&mut salt);
            let cipher = derive_cipher(passphrase, &salt)?;
            let file = StoreFile {
                salt: hex::encode(salt),
                check: seal(&cipher, CHECK_PLAINTEXT)?,
                entries: BTreeMap::new(),
            };
            let store = Self {
                path,
                cipher,
                file: Mutex::new(file),
            };
            {
                let file = store.lock()?;
                store.persist(&file)?;
            }
            Ok(store)
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, StoreFile>> {
        self.file
            .lock()
            .map_err(|_| anyhow!("Credential file lock poisoned"))
    }

    fn persist(&self, file: &StoreFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(file)?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, contents)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

impl KeyValueStore for EncryptedFileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let file = self.lock()?;
        match file.entries.get(key) {
            Some(sealed) => {
                let plaintext = open_sealed(&self.cipher, sealed)
                    .with_context(|| format!("Failed to decrypt value for {}", key))?;
                Ok(Some(
                    String::from_utf8(plaintext).context("Decrypted value is not UTF-8")?,
                ))
            }
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut file = self.lock()?;
        let sealed = seal(&self.cipher, value.as_bytes())?;
        file.entries.insert(key.to_string(), sealed);
        self.persist(&file)
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut file = self.lock()?;
        if file.entries.remove(key).is_some() {
            self.persist(&file)?;
        }
        Ok(())
    }

    fn keys(&self) -> Result<Option<Vec<String>>> {
        Ok(Some(self.lock()?.entries.keys().cloned().collect()))
    }
}

fn derive_cipher(passphrase: &str, salt: &[u8]) -> Result<ChaCha20Poly1305> {
    if passphrase.is_empty() {
        bail!("Credential file passphrase must not be empty");
    }
    let mut key = [0u8; KEY_LEN];
    Argon2::default()
        .hash_password_into(passphrase.as_bytes(), salt, &mut key)
        .map_err(|e| anyhow!("Key derivation failed: {}", e))?;
    Ok(ChaCha20Poly1305::new(Key::from_slice(&key)))
}

/// hex(nonce || ciphertext)
fn seal(cipher: &ChaCha20Poly1305, plaintext: &[u8]) -> Result<String> {
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| anyhow!("Encryption failed"))?;
    let mut out = nonce.to_vec();
    out.extend_from_slice(&ciphertext);
    Ok(hex::encode(out))
}

fn open_sealed(cipher: &ChaCha20Poly1305, sealed: &str) -> Result<Vec<u8>> {
    let raw = hex::decode(sealed).context("Sealed value is not hex")?;
    if raw.len() < NONCE_LEN {
        bail!("Sealed value too short");
    }
    let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| anyhow!("Decryption failed"))
}
