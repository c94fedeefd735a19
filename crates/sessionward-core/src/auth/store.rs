use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::watch;
use tracing::{debug, warn};

use super::credentials::{DurableStore, StorageKey};
use super::session::{Principal, Session, SessionState};
use crate::error::{SessionError, SessionResult};

/// Credential fields as last persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredCredentials {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub principal: Option<Principal>,
}

/// Single source of truth for the session. Pure state custody: no network calls.
///
/// Durable storage is written before memory when a session is set, and
/// cleared before memory when a session is cleared, so a crash never
/// leaves a "ghost" authenticated session behind.
///
/// Every replacement made outside a refresh (sign-in, sign-out, restore)
/// bumps a generation counter. A refresh records the generation when it
/// begins and only settles if it is unchanged, so an explicit sign-in or
/// sign-out is never overwritten by a refresh that was already running.
pub struct SessionStore {
    current: RwLock<Session>,
    /// Held across every replacement so checks and writes are atomic.
    generation: Mutex<u64>,
    durable: Arc<dyn DurableStore>,
    state_tx: watch::Sender<SessionState>,
}

impl SessionStore {
    pub fn new(durable: Arc<dyn DurableStore>) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Uninitialized);
        Self {
            current: RwLock::new(Session::default()),
            generation: Mutex::new(0),
            durable,
            state_tx,
        }
    }

    /// Synchronous read of the in-memory session.
    pub fn get(&self) -> Session {
        self.read().clone()
    }

    pub fn state(&self) -> SessionState {
        self.read().state
    }

    pub fn is_authenticated(&self) -> bool {
        self.read().is_authenticated()
    }

    /// Observe state transitions.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Replace the session, persisting it first.
    ///
    /// A session that is not authenticated is handled as [`clear`](Self::clear).
    /// On a durable write failure the in-memory session is left untouched.
    pub fn set(&self, session: Session) -> SessionResult<()> {
        let mut generation = self.lock_generation();
        self.set_locked(session, &mut generation)
    }

    /// Remove all credential fields from durable storage, then from memory.
    ///
    /// Memory is always cleared, even when a durable delete fails; the first
    /// durable failure is returned afterwards.
    pub fn clear(&self) -> SessionResult<()> {
        let mut generation = self.lock_generation();
        self.clear_locked(&mut generation)
    }

    /// Read the persisted credential fields without touching memory.
    pub fn load_persisted(&self) -> SessionResult<StoredCredentials> {
        let access_token = self.durable.get(StorageKey::AccessToken)?;
        let refresh_token = self.durable.get(StorageKey::RefreshToken)?;
        let principal = match self.durable.get(StorageKey::Principal)? {
            Some(raw) => match serde_json::from_str::<Principal>(&raw) {
                Ok(principal) => Some(principal),
                Err(e) => {
                    warn!(error = %e, "Ignoring unreadable persisted principal");
                    None
                }
            },
            None => None,
        };
        Ok(StoredCredentials {
            access_token,
            refresh_token,
            principal,
        })
    }

    /// Memory-only transition for a session already reflected in durable storage.
    pub(crate) fn stage(&self, session: Session) -> SessionResult<()> {
        session.validate()?;
        let mut generation = self.lock_generation();
        *generation += 1;
        self.replace(session);
        Ok(())
    }

    /// Enter `Refreshing`, returning the session as it was before and the
    /// generation the refresh must settle against.
    pub(crate) fn begin_refresh(&self) -> (Session, u64) {
        let generation = self.lock_generation();
        let mut current = self.write();
        let previous = current.clone();
        *current = previous.refreshing();
        drop(current);
        self.state_tx.send_replace(SessionState::Refreshing);
        (previous, *generation)
    }

    /// Install the renewed session of a successful refresh.
    ///
    /// Returns `false` without touching anything when the session was replaced
    /// after `begin_refresh`. A durable write failure is logged and the new
    /// pair is kept in memory: the server has already rotated.
    pub(crate) fn complete_refresh(&self, next: Session, generation: u64) -> SessionResult<bool> {
        let current = self.lock_generation();
        if *current != generation {
            return Ok(false);
        }
        next.validate()?;
        if let Err(e) = self.persist(&next) {
            warn!(error = %e, "Failed to persist refreshed session");
        }
        self.replace(next);
        Ok(true)
    }

    /// Undo `begin_refresh` after a transient failure.
    ///
    /// A session that was never initialized settles as `Unauthenticated` but
    /// keeps its refresh token for a later attempt. Returns `false` when the
    /// session was replaced in the meantime.
    pub(crate) fn abort_refresh(&self, previous: Session, generation: u64) -> bool {
        let current = self.lock_generation();
        if *current != generation {
            return false;
        }
        let restored = if previous.state == SessionState::Uninitialized {
            Session {
                state: SessionState::Unauthenticated,
                ..previous
            }
        } else {
            previous
        };
        self.replace(restored);
        true
    }

    /// End the session after a terminal refresh failure, unless it was
    /// replaced after `begin_refresh`.
    pub(crate) fn clear_refreshed(&self, generation: u64) -> SessionResult<bool> {
        let mut current = self.lock_generation();
        if *current != generation {
            return Ok(false);
        }
        self.clear_locked(&mut current).map(|()| true)
    }

    /// Settle an uninitialized session as unauthenticated without touching storage.
    pub(crate) fn mark_unauthenticated(&self) {
        let mut current = self.write();
        if current.state == SessionState::Uninitialized {
            current.state = SessionState::Unauthenticated;
            drop(current);
            self.state_tx.send_replace(SessionState::Unauthenticated);
        }
    }

    fn set_locked(&self, session: Session, generation: &mut u64) -> SessionResult<()> {
        session.validate()?;
        if !session.is_authenticated() {
            return self.clear_locked(generation);
        }

        self.persist(&session)?;
        debug!(principal = ?session.principal.as_ref().and_then(|p| p.id.as_deref()), "Session stored");
        *generation += 1;
        self.replace(session);
        Ok(())
    }

    fn clear_locked(&self, generation: &mut u64) -> SessionResult<()> {
        let mut first_error = None;
        for key in StorageKey::ALL {
            if let Err(e) = self.durable.delete(key) {
                warn!(key = key.as_str(), error = %e, "Failed to remove persisted credential");
                first_error.get_or_insert(SessionError::from(e));
            }
        }

        *generation += 1;
        self.replace(Session::unauthenticated());
        debug!("Session cleared");
        first_error.map_or(Ok(()), Err)
    }

    /// Refresh token first and access token last: an interrupted write after
    /// a rotation must never leave the consumed refresh token persisted.
    fn persist(&self, session: &Session) -> SessionResult<()> {
        match session.refresh_token() {
            Some(token) => self.durable.set(StorageKey::RefreshToken, token)?,
            None => self.durable.delete(StorageKey::RefreshToken)?,
        }
        match &session.principal {
            Some(principal) => {
                let raw = serde_json::to_string(principal)
                    .map_err(|e| SessionError::Storage(e.to_string()))?;
                self.durable.set(StorageKey::Principal, &raw)?;
            }
            None => self.durable.delete(StorageKey::Principal)?,
        }
        if let Some(token) = session.access_token() {
            self.durable.set(StorageKey::AccessToken, token)?;
        }
        Ok(())
    }

    fn replace(&self, session: Session) {
        let state = session.state;
        *self.write() = session;
        self.state_tx.send_replace(state);
    }

    fn lock_generation(&self) -> MutexGuard<'_, u64> {
        self.generation.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn read(&self) -> RwLockReadGuard<'_, Session> {
        self.current.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Session> {
        self.current.write().unwrap_or_else(|e| e.into_inner())
    }
}
