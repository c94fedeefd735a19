//! Session lifecycle: custody, persistence, refresh and bootstrap.
//!
//! This module provides:
//! - `SessionStore`: the process-wide session, mirrored to a `DurableStore`
//! - `RefreshCoordinator`: single-flight refresh over a `SessionStrategy`
//! - `SessionBootstrapper`: one-time restore of a prior session at startup
//! - `IdentityExchange`: turns a provider credential into issued credentials

pub mod bootstrap;
pub mod credentials;
pub mod exchange;
pub mod file_store;
pub mod refresh;
pub mod session;
pub mod store;
pub mod strategy;

pub use bootstrap::{BootstrapStatus, SessionBootstrapper};
pub use credentials::{DurableStore, KeyringStore, MemoryStore, StorageError, StorageKey, StorageResult};
pub use exchange::{HttpIdentityExchange, IdentityExchange, ProviderCredential};
pub use file_store::EncryptedFileStore;
pub use refresh::RefreshCoordinator;
pub use session::{IssuedCredentials, Principal, Session, SessionState};
pub use store::{SessionStore, StoredCredentials};
pub use strategy::{RotatingStrategy, SessionStrategy, StaticStrategy, StrategyKind};
