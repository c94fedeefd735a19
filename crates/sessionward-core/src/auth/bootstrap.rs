use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{watch, OnceCell};
use tracing::{debug, info, warn};

use super::refresh::RefreshCoordinator;
use super::session::{IssuedCredentials, Session};
use super::store::SessionStore;
use super::strategy::StrategyKind;
use crate::error::SessionResult;
use crate::navigation::SignInNavigator;

/// What route gates need to know about startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
pub struct BootstrapStatus {
    pub is_initialized: bool,
    pub is_loading: bool,
}

impl BootstrapStatus {
    const PENDING: Self = Self {
        is_initialized: false,
        is_loading: true,
    };

    const DONE: Self = Self {
        is_initialized: true,
        is_loading: false,
    };
}

/// Establishes the initial session exactly once per process.
pub struct SessionBootstrapper {
    store: Arc<SessionStore>,
    coordinator: Arc<RefreshCoordinator>,
    navigator: Arc<dyn SignInNavigator>,
    once: OnceCell<()>,
    status_tx: watch::Sender<BootstrapStatus>,
}

impl SessionBootstrapper {
    pub fn new(
        store: Arc<SessionStore>,
        coordinator: Arc<RefreshCoordinator>,
        navigator: Arc<dyn SignInNavigator>,
    ) -> Self {
        let (status_tx, _) = watch::channel(BootstrapStatus::PENDING);
        Self {
            store,
            coordinator,
            navigator,
            once: OnceCell::new(),
            status_tx,
        }
    }

    pub fn status(&self) -> BootstrapStatus {
        *self.status_tx.borrow()
    }

    pub fn is_initialized(&self) -> bool {
        self.status().is_initialized
    }

    pub fn is_loading(&self) -> bool {
        self.status().is_loading
    }

    pub fn subscribe(&self) -> watch::Receiver<BootstrapStatus> {
        self.status_tx.subscribe()
    }

    /// Run the bootstrap. Repeated or concurrent calls await the first run.
    pub async fn run(&self) {
        self.once.get_or_init(|| self.bootstrap()).await;
    }

    async fn bootstrap(&self) {
        if self.navigator.is_on_sign_in_surface() {
            info!("On sign-in surface; skipping session restore");
            self.store.mark_unauthenticated();
            self.status_tx.send_replace(BootstrapStatus::DONE);
            return;
        }

        match self.restore().await {
            Ok(true) => info!("Session restored"),
            Ok(false) => debug!("No prior session to restore"),
            // Absence of a valid prior session is expected; never surfaced.
            Err(e) => warn!(error = %e, "Silent session restore failed"),
        }

        self.store.mark_unauthenticated();
        self.status_tx.send_replace(BootstrapStatus::DONE);
    }

    async fn restore(&self) -> SessionResult<bool> {
        let stored = self.store.load_persisted()?;

        match self.coordinator.strategy_kind() {
            StrategyKind::Rotating => {
                let Some(refresh_token) = stored.refresh_token else {
                    return Ok(false);
                };
                self.store
                    .stage(Session::awaiting_refresh(refresh_token, stored.principal))?;
                self.coordinator.refresh().await?;
                Ok(true)
            }
            StrategyKind::Static => {
                let Some(access_token) = stored.access_token else {
                    return Ok(false);
                };
                let mut issued = IssuedCredentials::new(access_token);
                issued.refresh_token = stored.refresh_token;
                issued.principal = stored.principal;
                // Already durable; only memory needs the session.
                self.store.stage(Session::authenticated(issued))?;
                Ok(true)
            }
        }
    }
}
