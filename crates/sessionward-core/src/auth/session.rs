use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{SessionError, SessionResult};

/// Lifecycle state of the process-wide session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
pub enum SessionState {
    #[default]
    Uninitialized,
    Refreshing,
    Authenticated,
    Unauthenticated,
}

/// Identity snapshot cached next to the credential so the UI need not re-fetch it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
pub struct Principal {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub picture: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
}

impl Principal {
    /// Name to show in the UI, falling back to the email address.
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .or(self.email.as_deref())
            .unwrap_or("Unknown user")
    }
}

/// Credentials issued by the server, either by an identity exchange or by a refresh.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedCredentials {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default, rename = "user")]
    pub principal: Option<Principal>,
}

impl IssuedCredentials {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            principal: None,
        }
    }

    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    pub fn with_principal(mut self, principal: Principal) -> Self {
        self.principal = Some(principal);
        self
    }
}

impl fmt::Debug for IssuedCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedCredentials")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("principal", &self.principal)
            .finish()
    }
}

/// The unit of truth for "am I authenticated".
///
/// `access_token` is present if and only if `state == Authenticated`.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Session {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub principal: Option<Principal>,
    pub state: SessionState,
    pub authenticated_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn unauthenticated() -> Self {
        Self {
            state: SessionState::Unauthenticated,
            ..Self::default()
        }
    }

    /// Build an authenticated session from freshly issued credentials.
    pub fn authenticated(issued: IssuedCredentials) -> Self {
        Self {
            access_token: Some(issued.access_token),
            refresh_token: issued.refresh_token,
            principal: issued.principal,
            state: SessionState::Authenticated,
            authenticated_at: Some(Utc::now()),
        }
    }

    /// A session that only holds a refresh credential and is waiting to be renewed.
    pub fn awaiting_refresh(refresh_token: String, principal: Option<Principal>) -> Self {
        Self {
            refresh_token: Some(refresh_token),
            principal,
            state: SessionState::Unauthenticated,
            ..Self::default()
        }
    }

    /// Apply a refresh result. A response without a user keeps the cached principal.
    pub fn renewed(&self, issued: IssuedCredentials) -> Self {
        let principal = issued.principal.or_else(|| self.principal.clone());
        Self {
            access_token: Some(issued.access_token),
            refresh_token: issued.refresh_token.or_else(|| self.refresh_token.clone()),
            principal,
            state: SessionState::Authenticated,
            authenticated_at: Some(Utc::now()),
        }
    }

    /// The in-memory view while a refresh is in flight: the old access token is withheld.
    pub(crate) fn refreshing(&self) -> Self {
        Self {
            access_token: None,
            state: SessionState::Refreshing,
            ..self.clone()
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == SessionState::Authenticated
    }

    pub fn access_token(&self) -> Option<&str> {
        self.access_token.as_deref()
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref()
    }

    /// Check the access-token/state invariant.
    pub fn validate(&self) -> SessionResult<()> {
        match (self.state, self.access_token.is_some()) {
            (SessionState::Authenticated, true) => Ok(()),
            (SessionState::Authenticated, false) => Err(SessionError::InvalidResponse(
                "authenticated session without an access token".to_string(),
            )),
            (state, true) => Err(SessionError::InvalidResponse(format!(
                "access token present in {:?} session",
                state
            ))),
            (_, false) => Ok(()),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state)
            .field("has_access_token", &self.access_token.is_some())
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("principal", &self.principal)
            .field("authenticated_at", &self.authenticated_at)
            .finish()
    }
}
