use thiserror::Error;

use crate::auth::StorageError;

/// Failure taxonomy for the session lifecycle.
///
/// `Clone` because a single settled refresh outcome is handed to every
/// caller that joined it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Refresh token rejected: {0}")]
    RefreshRejected(String),

    #[error("Refresh token reuse detected - session revoked")]
    RefreshTokenReuse,

    #[error("No refresh token available")]
    NoRefreshToken,

    #[error("Unauthorized - credential rejected after refresh")]
    Unauthorized,

    #[error("Identity exchange failed: {0}")]
    IdentityExchange(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Request body cannot be replayed after refresh")]
    RequestNotReplayable,
}

impl SessionError {
    /// Transient failures leave the session intact; the caller may retry later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SessionError::Network(_) | SessionError::ServerError(_) | SessionError::InvalidResponse(_)
        )
    }

    /// Terminal failures end the session: it is cleared and the user must sign in again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionError::RefreshRejected(_)
                | SessionError::RefreshTokenReuse
                | SessionError::NoRefreshToken
                | SessionError::Unauthorized
        )
    }
}

impl From<reqwest::Error> for SessionError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            SessionError::InvalidResponse(err.to_string())
        } else {
            SessionError::Network(err.to_string())
        }
    }
}

impl From<StorageError> for SessionError {
    fn from(err: StorageError) -> Self {
        SessionError::Storage(err.to_string())
    }
}

pub type SessionResult<T> = Result<T, SessionError>;
