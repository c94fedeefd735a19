use std::collections::HashMap;
use std::sync::Mutex;

use keyring::Entry;
use thiserror::Error;

/// Default keyring service name
pub const SERVICE_NAME: &str = "sessionward";

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Platform storage error: {0}")]
    Platform(String),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Fixed names under which the session is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKey {
    AccessToken,
    RefreshToken,
    /// Serialized principal JSON
    Principal,
}

impl StorageKey {
    pub const ALL: [StorageKey; 3] = [
        StorageKey::AccessToken,
        StorageKey::RefreshToken,
        StorageKey::Principal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StorageKey::AccessToken => "auth_access_token",
            StorageKey::RefreshToken => "auth_refresh_token",
            StorageKey::Principal => "auth_user",
        }
    }
}

/// Durable, platform-appropriate persistence for credential fields.
///
/// Implementations are synchronous; the session store never suspends on them.
pub trait DurableStore: Send + Sync {
    fn get(&self, key: StorageKey) -> StorageResult<Option<String>>;

    fn set(&self, key: StorageKey, value: &str) -> StorageResult<()>;

    /// Remove a value. Removing a missing key is not an error.
    fn delete(&self, key: StorageKey) -> StorageResult<()>;
}

/// OS keychain backed store.
pub struct KeyringStore {
    service: String,
}

impl KeyringStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, key: StorageKey) -> StorageResult<Entry> {
        Entry::new(&self.service, key.as_str())
            .map_err(|e| StorageError::Platform(format!("Failed to create keyring entry: {}", e)))
    }
}

impl Default for KeyringStore {
    fn default() -> Self {
        Self::new(SERVICE_NAME)
    }
}

impl DurableStore for KeyringStore {
    fn get(&self, key: StorageKey) -> StorageResult<Option<String>> {
        match self.entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(StorageError::Platform(format!(
                "Failed to read {} from keychain: {}",
                key.as_str(),
                e
            ))),
        }
    }

    fn set(&self, key: StorageKey, value: &str) -> StorageResult<()> {
        self.entry(key)?.set_password(value).map_err(|e| {
            StorageError::Platform(format!("Failed to store {} in keychain: {}", key.as_str(), e))
        })
    }

    fn delete(&self, key: StorageKey) -> StorageResult<()> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(StorageError::Platform(format!(
                "Failed to delete {} from keychain: {}",
                key.as_str(),
                e
            ))),
        }
    }
}

/// Process-local store. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<StorageKey, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently held.
    pub fn len(&self) -> usize {
        self.values.lock().map(|v| v.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> StorageResult<std::sync::MutexGuard<'_, HashMap<StorageKey, String>>> {
        self.values
            .lock()
            .map_err(|_| StorageError::Platform("memory store lock poisoned".to_string()))
    }
}

impl DurableStore for MemoryStore {
    fn get(&self, key: StorageKey) -> StorageResult<Option<String>> {
        Ok(self.lock()?.get(&key).cloned())
    }

    fn set(&self, key: StorageKey, value: &str) -> StorageResult<()> {
        self.lock()?.insert(key, value.to_string());
        Ok(())
    }

    fn delete(&self, key: StorageKey) -> StorageResult<()> {
        self.lock()?.remove(&key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_key_names_are_stable() {
        assert_eq!(StorageKey::AccessToken.as_str(), "auth_access_token");
        assert_eq!(StorageKey::RefreshToken.as_str(), "auth_refresh_token");
        assert_eq!(StorageKey::Principal.as_str(), "auth_user");
    }

    #[test]
    fn test_memory_store_set_get_delete() {
        let store = MemoryStore::new();
        assert!(store.is_empty());

        store.set(StorageKey::AccessToken, "a").unwrap();
        store.set(StorageKey::RefreshToken, "r").unwrap();
        assert_eq!(store.get(StorageKey::AccessToken).unwrap().as_deref(), Some("a"));
        assert_eq!(store.len(), 2);

        store.delete(StorageKey::AccessToken).unwrap();
        assert!(store.get(StorageKey::AccessToken).unwrap().is_none());

        // Deleting a missing key is fine
        store.delete(StorageKey::Principal).unwrap();
        assert_eq!(store.len(), 1);
    }
}
