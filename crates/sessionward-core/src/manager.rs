//! The Session Manager: one handle over store, coordinator, pipeline and bootstrapper.

use std::sync::{Arc, OnceLock};

use anyhow::Result;
use reqwest::{Client, Request, Response};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::api::AuthenticatedClient;
use crate::auth::{
    BootstrapStatus, DurableStore, IdentityExchange, IssuedCredentials, Principal,
    ProviderCredential, RefreshCoordinator, RotatingStrategy, Session, SessionBootstrapper,
    SessionState, SessionStore, SessionStrategy, StaticStrategy, StrategyKind,
};
use crate::config::Config;
use crate::error::SessionResult;
use crate::navigation::{GateDecision, SignInNavigator};

static GLOBAL: OnceLock<Arc<SessionManager>> = OnceLock::new();

pub struct SessionManager {
    store: Arc<SessionStore>,
    strategy: Arc<dyn SessionStrategy>,
    coordinator: Arc<RefreshCoordinator>,
    bootstrapper: SessionBootstrapper,
    client: AuthenticatedClient,
    navigator: Arc<dyn SignInNavigator>,
}

impl SessionManager {
    /// Build the manager for the variant and store selected by `config`.
    pub fn new(config: &Config, navigator: Arc<dyn SignInNavigator>) -> Result<Self> {
        let durable = config.open_store()?;
        let http = config.http_client()?;
        let strategy: Arc<dyn SessionStrategy> = match config.strategy {
            StrategyKind::Rotating => Arc::new(RotatingStrategy::new(http.clone(), &config.api_base_url)),
            StrategyKind::Static => Arc::new(StaticStrategy),
        };
        Ok(Self::with_parts(durable, strategy, navigator, http, &config.api_base_url))
    }

    pub fn with_parts(
        durable: Arc<dyn DurableStore>,
        strategy: Arc<dyn SessionStrategy>,
        navigator: Arc<dyn SignInNavigator>,
        http: Client,
        api_base_url: &str,
    ) -> Self {
        let store = Arc::new(SessionStore::new(durable));
        let coordinator = Arc::new(RefreshCoordinator::new(store.clone(), strategy.clone()));
        let bootstrapper =
            SessionBootstrapper::new(store.clone(), coordinator.clone(), navigator.clone());
        let client = AuthenticatedClient::new(
            http,
            api_base_url,
            store.clone(),
            coordinator.clone(),
            navigator.clone(),
        );
        Self {
            store,
            strategy,
            coordinator,
            bootstrapper,
            client,
            navigator,
        }
    }

    pub async fn bootstrap(&self) {
        self.bootstrapper.run().await;
    }

    pub fn strategy_kind(&self) -> StrategyKind {
        self.strategy.kind()
    }

    pub fn session(&self) -> Session {
        self.store.get()
    }

    pub fn state(&self) -> SessionState {
        self.store.state()
    }

    pub fn is_authenticated(&self) -> bool {
        self.store.is_authenticated()
    }

    pub fn is_initialized(&self) -> bool {
        self.bootstrapper.is_initialized()
    }

    pub fn is_loading(&self) -> bool {
        self.bootstrapper.is_loading()
    }

    pub fn principal(&self) -> Option<Principal> {
        self.store.get().principal
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.store.subscribe()
    }

    pub fn subscribe_bootstrap(&self) -> watch::Receiver<BootstrapStatus> {
        self.bootstrapper.subscribe()
    }

    /// What a protected route should do given the current state.
    pub fn gate(&self) -> GateDecision {
        GateDecision::evaluate(self.bootstrapper.status(), self.store.state())
    }

    /// Install credentials obtained from a completed identity exchange.
    pub fn sign_in(&self, issued: IssuedCredentials) -> SessionResult<()> {
        let user = issued
            .principal
            .as_ref()
            .map(|p| p.display_name().to_string())
            .unwrap_or_default();
        self.store.set(Session::authenticated(issued))?;
        info!(user = %user, "Signed in");
        Ok(())
    }

    /// Exchange a provider credential and sign in with the result.
    ///
    /// A failed exchange leaves any existing session untouched.
    pub async fn sign_in_with(
        &self,
        exchange: &dyn IdentityExchange,
        credential: ProviderCredential,
    ) -> SessionResult<()> {
        let issued = exchange.exchange(credential).await?;
        self.sign_in(issued)
    }

    /// Revoke server-side (best-effort), then clear the local session.
    pub async fn sign_out(&self) -> SessionResult<()> {
        let session = self.store.get();
        if let Err(e) = self.strategy.revoke(&session).await {
            warn!(error = %e, "Server-side sign-out failed; clearing local session anyway");
        }
        self.store.clear()?;
        info!("Signed out");
        if !self.navigator.is_on_sign_in_surface() {
            self.navigator.redirect_to_sign_in();
        }
        Ok(())
    }

    /// Explicit refresh, sharing any refresh already in flight.
    pub async fn refresh(&self) -> SessionResult<String> {
        self.coordinator.refresh().await
    }

    pub async fn send(&self, request: Request) -> SessionResult<Response> {
        self.client.send(request).await
    }

    pub fn client(&self) -> &AuthenticatedClient {
        &self.client
    }
}

/// Install the process-wide manager. If one is already installed it is kept
/// and returned, and `manager` is dropped.
pub fn install_global(manager: SessionManager) -> Arc<SessionManager> {
    let manager = Arc::new(manager);
    let installed = GLOBAL.get_or_init(|| manager.clone());
    if !Arc::ptr_eq(installed, &manager) {
        warn!("Session manager already installed; keeping the existing one");
    }
    installed.clone()
}

pub fn global() -> Option<Arc<SessionManager>> {
    GLOBAL.get().cloned()
}
