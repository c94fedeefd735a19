//! Client configuration management.
//!
//! This module handles loading and saving the configuration that selects
//! the session variant, the durable store and the API server.
//!
//! Configuration is stored at `~/.config/sessionward/config.json`. Selected
//! fields can be overridden from the environment.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::auth::{DurableStore, EncryptedFileStore, KeyringStore, MemoryStore, StrategyKind};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "sessionward";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Encrypted credential file name
const CREDENTIALS_FILE: &str = "credentials.json";

pub const ENV_API_URL: &str = "SESSIONWARD_API_URL";
pub const ENV_STRATEGY: &str = "SESSIONWARD_STRATEGY";
pub const ENV_STORAGE: &str = "SESSIONWARD_STORAGE";
pub const ENV_DEV_BYPASS: &str = "SESSIONWARD_DEV_BYPASS";
pub const ENV_STORE_PASSPHRASE: &str = "SESSIONWARD_STORE_PASSPHRASE";

/// Where credentials are persisted between runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Keyring,
    EncryptedFile,
    Memory,
}

impl StorageBackend {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "keyring" => Some(StorageBackend::Keyring),
            "encrypted_file" | "file" => Some(StorageBackend::EncryptedFile),
            "memory" => Some(StorageBackend::Memory),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: String,
    pub strategy: StrategyKind,
    pub storage: StorageBackend,
    pub keyring_service: String,
    /// Overrides the default location of the encrypted credential file.
    pub credentials_file: Option<PathBuf>,
    pub sign_in_route: String,
    pub request_timeout_secs: u64,
    pub allow_dev_bypass: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8080".to_string(),
            strategy: StrategyKind::default(),
            storage: StorageBackend::default(),
            keyring_service: APP_NAME.to_string(),
            credentials_file: None,
            sign_in_route: "/login".to_string(),
            request_timeout_secs: 30,
            allow_dev_bypass: false,
        }
    }
}

impl Config {
    /// Load from the default location, then apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load from `path`; a missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config at {}", path.display()))
        } else {
            debug!(path = %path.display(), "No config file; using defaults");
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Apply overrides from an environment lookup. Unparseable values are ignored.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_API_URL).filter(|v| !v.trim().is_empty()) {
            self.api_base_url = url.trim().to_string();
        }
        if let Some(kind) = lookup(ENV_STRATEGY).as_deref().and_then(StrategyKind::parse) {
            self.strategy = kind;
        }
        if let Some(backend) = lookup(ENV_STORAGE).as_deref().and_then(StorageBackend::parse) {
            self.storage = backend;
        }
        if let Some(flag) = lookup(ENV_DEV_BYPASS) {
            self.allow_dev_bypass = matches!(flag.trim(), "1" | "true" | "yes");
        }
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    pub fn credentials_path(&self) -> Result<PathBuf> {
        if let Some(ref path) = self.credentials_file {
            return Ok(path.clone());
        }
        let data_dir = dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME).join(CREDENTIALS_FILE))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// HTTP client shared by the strategy, the identity exchange and the pipeline.
    pub fn http_client(&self) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .timeout(self.request_timeout())
            .build()
            .context("Failed to build HTTP client")
    }

    /// Open the configured durable store, reading the file passphrase from the environment.
    pub fn open_store(&self) -> Result<Arc<dyn DurableStore>> {
        self.open_store_with_passphrase(std::env::var(ENV_STORE_PASSPHRASE).ok())
    }

    pub fn open_store_with_passphrase(&self, passphrase: Option<String>) -> Result<Arc<dyn DurableStore>> {
        let store: Arc<dyn DurableStore> = match self.storage {
            StorageBackend::Keyring => Arc::new(KeyringStore::new(self.keyring_service.clone())),
            StorageBackend::EncryptedFile => {
                let passphrase = passphrase
                    .filter(|p| !p.is_empty())
                    .with_context(|| format!("{} must be set for the encrypted file store", ENV_STORE_PASSPHRASE))?;
                let path = self.credentials_path()?;
                let store = EncryptedFileStore::open(&path, &passphrase)
                    .with_context(|| format!("Failed to open credential file {}", path.display()))?;
                Arc::new(store)
            }
            StorageBackend::Memory => Arc::new(MemoryStore::new()),
        };
        Ok(store)
    }
}
