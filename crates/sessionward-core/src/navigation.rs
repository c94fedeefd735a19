//! Where the user is, and where they go when the session ends.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use serde::Serialize;
use tracing::info;

use crate::auth::{BootstrapStatus, SessionState};

/// The hosting application's navigation, as seen by the session layer.
pub trait SignInNavigator: Send + Sync {
    /// Whether the current route is the sign-in surface (no session required).
    fn is_on_sign_in_surface(&self) -> bool;

    /// Send the user to the sign-in surface.
    fn redirect_to_sign_in(&self);
}

/// Route-string navigator. The sign-in surface is any route under `sign_in_route`.
#[derive(Debug)]
pub struct RouteNavigator {
    sign_in_route: String,
    current: RwLock<String>,
    redirects: AtomicUsize,
}

impl RouteNavigator {
    pub fn new(sign_in_route: impl Into<String>) -> Self {
        Self {
            sign_in_route: sign_in_route.into(),
            current: RwLock::new("/".to_string()),
            redirects: AtomicUsize::new(0),
        }
    }

    pub fn navigate(&self, route: impl Into<String>) {
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = route.into();
    }

    pub fn current_route(&self) -> String {
        self.current.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn sign_in_route(&self) -> &str {
        &self.sign_in_route
    }

    /// Number of redirects to sign-in issued so far.
    pub fn redirect_count(&self) -> usize {
        self.redirects.load(Ordering::SeqCst)
    }
}

impl SignInNavigator for RouteNavigator {
    fn is_on_sign_in_surface(&self) -> bool {
        self.current_route().starts_with(&self.sign_in_route)
    }

    fn redirect_to_sign_in(&self) {
        info!(from = %self.current_route(), to = %self.sign_in_route, "Redirecting to sign-in");
        self.navigate(self.sign_in_route.clone());
        self.redirects.fetch_add(1, Ordering::SeqCst);
    }
}

/// What a protected route should do right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
pub enum GateDecision {
    Loading,
    Render,
    RedirectToSignIn,
}

impl GateDecision {
    pub fn evaluate(bootstrap: BootstrapStatus, state: SessionState) -> Self {
        if !bootstrap.is_initialized {
            return GateDecision::Loading;
        }
        match state {
            SessionState::Authenticated => GateDecision::Render,
            // A refresh in progress after startup keeps the current screen up.
            SessionState::Refreshing => GateDecision::Loading,
            SessionState::Uninitialized | SessionState::Unauthenticated => {
                GateDecision::RedirectToSignIn
            }
        }
    }
}
