//! Passphrase-encrypted credential file for platforms without a keychain.
//!
//! The whole key/value map is sealed as one ChaCha20-Poly1305 message. The
//! key is derived from the passphrase with Argon2id and a per-file salt.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use argon2::Argon2;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::credentials::{DurableStore, StorageError, StorageKey, StorageResult};

const ENVELOPE_VERSION: u32 = 1;
const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;
const SALT_SIZE: usize = 16;

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    version: u32,
    salt: String,
    nonce: String,
    ciphertext: String,
}

pub struct EncryptedFileStore {
    path: PathBuf,
    salt: [u8; SALT_SIZE],
    key: [u8; KEY_SIZE],
    values: Mutex<HashMap<String, String>>,
}

impl EncryptedFileStore {
    /// Open (or prepare to create) the store at `path`.
    ///
    /// Fails if the file exists and cannot be decrypted with `passphrase`.
    pub fn open(path: impl Into<PathBuf>, passphrase: &str) -> StorageResult<Self> {
        let path = path.into();
        if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            let envelope: Envelope = serde_json::from_str(&contents)
                .map_err(|e| StorageError::Encoding(format!("Failed to parse credential file: {}", e)))?;
            if envelope.version != ENVELOPE_VERSION {
                return Err(StorageError::Encoding(format!(
                    "Unsupported credential file version {}",
                    envelope.version
                )));
            }

            let salt: [u8; SALT_SIZE] = decode_fixed(&envelope.salt, "salt")?;
            let nonce: [u8; NONCE_SIZE] = decode_fixed(&envelope.nonce, "nonce")?;
            let ciphertext = BASE64
                .decode(&envelope.ciphertext)
                .map_err(|e| StorageError::Encoding(e.to_string()))?;

            let key = derive_key(passphrase, &salt)?;
            let plaintext = ChaCha20Poly1305::new_from_slice(&key)
                .map_err(|e| StorageError::Crypto(e.to_string()))?
                .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
                .map_err(|_| StorageError::Crypto("Failed to decrypt credential file (wrong passphrase?)".to_string()))?;
            let values: HashMap<String, String> = serde_json::from_slice(&plaintext)
                .map_err(|e| StorageError::Encoding(e.to_string()))?;

            debug!(path = %path.display(), entries = values.len(), "Opened encrypted credential file");
            Ok(Self {
                path,
                salt,
                key,
                values: Mutex::new(values),
            })
        } else {
            let mut salt = [0u8; SALT_SIZE];
            rand::thread_rng().fill_bytes(&mut salt);
            let key = derive_key(passphrase, &salt)?;
            Ok(Self {
                path,
                salt,
                key,
                values: Mutex::new(HashMap::new()),
            })
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> StorageResult<std::sync::MutexGuard<'_, HashMap<String, String>>> {
        self.values
            .lock()
            .map_err(|_| StorageError::Platform("credential file lock poisoned".to_string()))
    }

    /// Seal and write the map. Written to a sibling temp file, then renamed over the target.
    fn persist(&self, values: &HashMap<String, String>) -> StorageResult<()> {
        let plaintext =
            serde_json::to_vec(values).map_err(|e| StorageError::Encoding(e.to_string()))?;

        let mut nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ciphertext = ChaCha20Poly1305::new_from_slice(&self.key)
            .map_err(|e| StorageError::Crypto(e.to_string()))?
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_ref())
            .map_err(|e| StorageError::Crypto(e.to_string()))?;

        let envelope = Envelope {
            version: ENVELOPE_VERSION,
            salt: BASE64.encode(self.salt),
            nonce: BASE64.encode(nonce),
            ciphertext: BASE64.encode(ciphertext),
        };
        let contents = serde_json::to_string_pretty(&envelope)
            .map_err(|e| StorageError::Encoding(e.to_string()))?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, contents)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl DurableStore for EncryptedFileStore {
    fn get(&self, key: StorageKey) -> StorageResult<Option<String>> {
        Ok(self.lock()?.get(key.as_str()).cloned())
    }

    fn set(&self, key: StorageKey, value: &str) -> StorageResult<()> {
        let mut values = self.lock()?;
        let mut next = values.clone();
        next.insert(key.as_str().to_string(), value.to_string());
        self.persist(&next)?;
        *values = next;
        Ok(())
    }

    fn delete(&self, key: StorageKey) -> StorageResult<()> {
        let mut values = self.lock()?;
        if !values.contains_key(key.as_str()) {
            return Ok(());
        }
        let mut next = values.clone();
        next.remove(key.as_str());
        self.persist(&next)?;
        *values = next;
        Ok(())
    }
}

fn derive_key(passphrase: &str, salt: &[u8]) -> StorageResult<[u8; KEY_SIZE]> {
    let mut key = [0u8; KEY_SIZE];
    Argon2::default()
        .hash_password_into(passphrase.as_bytes(), salt, &mut key)
        .map_err(|e| StorageError::Crypto(format!("Key derivation failed: {}", e)))?;
    Ok(key)
}

fn decode_fixed<const N: usize>(encoded: &str, field: &str) -> StorageResult<[u8; N]> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|e| StorageError::Encoding(format!("Invalid {}: {}", field, e)))?;
    bytes.try_into().map_err(|b: Vec<u8>| {
        StorageError::Encoding(format!("Invalid {} length: expected {}, got {}", field, N, b.len()))
    })
}
