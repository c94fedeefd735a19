//! sessionward-core - client-side session lifecycle.
//!
//! Obtains, persists, refreshes and invalidates an access credential, and
//! re-authorizes outbound requests when that credential expires. Two session
//! variants share one contract: a rotating refresh-token client and a
//! static-session client.

pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod manager;
pub mod navigation;

pub use api::{ApiError, AuthenticatedClient};
pub use auth::{
    BootstrapStatus, DurableStore, IdentityExchange, IssuedCredentials, Principal,
    ProviderCredential, Session, SessionState, StrategyKind,
};
pub use config::{Config, StorageBackend};
pub use error::{SessionError, SessionResult};
pub use manager::{global, install_global, SessionManager};
pub use navigation::{GateDecision, RouteNavigator, SignInNavigator};
