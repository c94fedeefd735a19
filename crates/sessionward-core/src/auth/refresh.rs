//! Single-flight refresh coordination.
//!
//! Every trigger for a refresh (bootstrap, a 401 in the request pipeline,
//! an explicit user retry) goes through [`RefreshCoordinator::refresh`].
//! Calls made while an operation is pending join it and observe the same
//! outcome; the slot is emptied when the operation settles.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::{debug, info, warn};

use super::session::{IssuedCredentials, Session, SessionState};
use super::store::SessionStore;
use super::strategy::{SessionStrategy, StrategyKind};
use crate::error::{SessionError, SessionResult};

type RefreshFuture = Shared<BoxFuture<'static, SessionResult<String>>>;

struct InFlight {
    id: u64,
    future: RefreshFuture,
}

pub struct RefreshCoordinator {
    store: Arc<SessionStore>,
    strategy: Arc<dyn SessionStrategy>,
    in_flight: Mutex<Option<InFlight>>,
    next_id: AtomicU64,
    /// Last refresh token handed to the server. It must never be presented again.
    consumed: Mutex<Option<String>>,
}

impl RefreshCoordinator {
    pub fn new(store: Arc<SessionStore>, strategy: Arc<dyn SessionStrategy>) -> Self {
        Self {
            store,
            strategy,
            in_flight: Mutex::new(None),
            next_id: AtomicU64::new(1),
            consumed: Mutex::new(None),
        }
    }

    pub fn strategy_kind(&self) -> StrategyKind {
        self.strategy.kind()
    }

    /// Whether a refresh operation is currently pending.
    pub fn is_refreshing(&self) -> bool {
        lock(&self.in_flight).is_some()
    }

    /// Refresh the session, joining the pending operation if there is one.
    pub async fn refresh(self: &Arc<Self>) -> SessionResult<String> {
        let future = {
            let mut slot = lock(&self.in_flight);
            match slot.as_ref() {
                Some(pending) => {
                    debug!(refresh_id = pending.id, "Joining in-flight refresh");
                    pending.future.clone()
                }
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let this = Arc::clone(self);
                    let future = async move {
                        let result = this.run(id).await;
                        this.settle(id);
                        result
                    }
                    .boxed()
                    .shared();
                    *slot = Some(InFlight {
                        id,
                        future: future.clone(),
                    });
                    future
                }
            }
        };
        future.await
    }

    /// Refresh after `rejected` was refused by a resource server.
    ///
    /// If the session already moved on to a different access token (another
    /// caller refreshed in the meantime) that token is returned without a new
    /// network call.
    pub async fn renew_after_rejection(self: &Arc<Self>, rejected: Option<&str>) -> SessionResult<String> {
        let current = self.store.get();
        if current.state == SessionState::Authenticated {
            if let Some(token) = current.access_token() {
                if Some(token) != rejected {
                    debug!("Session already renewed by another caller");
                    return Ok(token.to_string());
                }
            }
        }
        self.refresh().await
    }

    /// The access token to attach to an outgoing request.
    ///
    /// While a refresh is pending the caller waits for its outcome, so no
    /// request issued after the refresh began goes out with the old token.
    pub async fn current_access_token(self: &Arc<Self>) -> SessionResult<Option<String>> {
        let session = self.store.get();
        if session.state == SessionState::Refreshing {
            return self.refresh().await.map(Some);
        }
        Ok(session.access_token)
    }

    async fn run(&self, id: u64) -> SessionResult<String> {
        let (previous, generation) = self.store.begin_refresh();
        let submitted = previous.refresh_token.clone();
        let rotating = self.strategy.kind() == StrategyKind::Rotating;

        if rotating && submitted.is_some() && *lock(&self.consumed) == submitted {
            warn!(refresh_id = id, "Refusing to present a consumed refresh token");
            return self.fail(id, previous, generation, SessionError::RefreshTokenReuse);
        }

        debug!(refresh_id = id, strategy = ?self.strategy.kind(), "Refreshing session");
        let issued = match self.strategy.refresh(&previous).await {
            Ok(issued) => issued,
            Err(e) => return self.fail(id, previous, generation, e),
        };

        if rotating {
            *lock(&self.consumed) = submitted.clone();
            if let Err(e) = check_rotation(submitted.as_deref(), &issued) {
                return self.fail(id, previous, generation, e);
            }
        }

        let next = previous.renewed(issued);
        let access_token = next.access_token.clone().unwrap_or_default();
        match self.store.complete_refresh(next, generation) {
            Ok(true) => {
                info!(refresh_id = id, "Session refreshed");
                Ok(access_token)
            }
            Ok(false) => self.superseded(id),
            Err(e) => self.fail(id, previous, generation, e),
        }
    }

    fn fail(&self, id: u64, previous: Session, generation: u64, error: SessionError) -> SessionResult<String> {
        let applied = if error.is_transient() {
            self.store.abort_refresh(previous, generation)
        } else {
            self.store.clear_refreshed(generation).unwrap_or_else(|e| {
                warn!(error = %e, "Failed to clear persisted session");
                true
            })
        };
        if !applied {
            return self.superseded(id);
        }

        if error.is_transient() {
            warn!(refresh_id = id, error = %error, "Refresh failed transiently; session preserved");
        } else {
            warn!(refresh_id = id, error = %error, "Refresh rejected; session cleared");
        }
        Err(error)
    }

    /// Outcome of a refresh whose session was signed in or out while it ran.
    /// The newer session wins; the refresh result is discarded.
    fn superseded(&self, id: u64) -> SessionResult<String> {
        let current = self.store.get();
        match current.access_token() {
            Some(token) if current.is_authenticated() => {
                debug!(refresh_id = id, "Session replaced during refresh; using the new one");
                Ok(token.to_string())
            }
            _ => {
                debug!(refresh_id = id, "Session ended during refresh");
                Err(SessionError::Unauthorized)
            }
        }
    }

    fn settle(&self, id: u64) {
        let mut slot = lock(&self.in_flight);
        if slot.as_ref().is_some_and(|pending| pending.id == id) {
            *slot = None;
        }
    }
}

/// A rotated pair must carry a new refresh token.
fn check_rotation(submitted: Option<&str>, issued: &IssuedCredentials) -> SessionResult<()> {
    match issued.refresh_token.as_deref() {
        None => {
            warn!("Refresh response did not rotate the refresh token");
            Err(SessionError::RefreshTokenReuse)
        }
        Some(new) if Some(new) == submitted => {
            warn!("Refresh response re-issued the consumed refresh token");
            Err(SessionError::RefreshTokenReuse)
        }
        Some(_) => Ok(()),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::*;
    use crate::auth::credentials::{DurableStore, MemoryStore, StorageKey};

    /// Strategy that blocks each refresh until released and counts calls.
    struct GatedStrategy {
        kind: StrategyKind,
        calls: AtomicUsize,
        gate: Notify,
        outcomes: Mutex<VecDeque<SessionResult<IssuedCredentials>>>,
    }

    impl GatedStrategy {
        fn new(kind: StrategyKind) -> Arc<Self> {
            Arc::new(Self {
                kind,
                calls: AtomicUsize::new(0),
                gate: Notify::new(),
                outcomes: Mutex::new(VecDeque::new()),
            })
        }

        fn push(&self, outcome: SessionResult<IssuedCredentials>) {
            lock(&self.outcomes).push_back(outcome);
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SessionStrategy for GatedStrategy {
        fn kind(&self) -> StrategyKind {
            self.kind
        }

        async fn refresh(&self, _session: &Session) -> SessionResult<IssuedCredentials> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.gate.notified().await;
            lock(&self.outcomes).pop_front().unwrap_or_else(|| {
                Ok(IssuedCredentials::new(format!("access-{n}")).with_refresh_token(format!("refresh-{n}")))
            })
        }

        async fn revoke(&self, _session: &Session) -> SessionResult<()> {
            Ok(())
        }
    }

    fn setup(
        kind: StrategyKind,
    ) -> (Arc<RefreshCoordinator>, Arc<GatedStrategy>, Arc<SessionStore>, Arc<MemoryStore>) {
        let durable = Arc::new(MemoryStore::new());
        let store = Arc::new(SessionStore::new(durable.clone()));
        store
            .set(Session::authenticated(
                IssuedCredentials::new("access-0").with_refresh_token("refresh-0"),
            ))
            .unwrap();
        let strategy = GatedStrategy::new(kind);
        let coordinator = Arc::new(RefreshCoordinator::new(store.clone(), strategy.clone()));
        (coordinator, strategy, store, durable)
    }

    async fn release(strategy: &GatedStrategy) {
        tokio::task::yield_now().await;
        strategy.gate.notify_one();
    }

    #[tokio::test]
    async fn test_concurrent_refreshes_share_one_call() {
        let (coordinator, strategy, store, _) = setup(StrategyKind::Rotating);

        let callers = (0..8).map(|_| coordinator.refresh());
        let (results, _) = tokio::join!(futures::future::join_all(callers), release(&strategy));

        assert_eq!(strategy.calls(), 1);
        for result in results {
            assert_eq!(result.unwrap(), "access-1");
        }
        assert_eq!(store.get().refresh_token(), Some("refresh-1"));
        assert!(!coordinator.is_refreshing());
    }

    #[tokio::test]
    async fn test_settled_refresh_starts_fresh_operation() {
        let (coordinator, strategy, _, _) = setup(StrategyKind::Rotating);

        strategy.gate.notify_one();
        assert_eq!(coordinator.refresh().await.unwrap(), "access-1");
        strategy.gate.notify_one();
        assert_eq!(coordinator.refresh().await.unwrap(), "access-2");

        assert_eq!(strategy.calls(), 2);
    }

    #[tokio::test]
    async fn test_success_persists_rotated_pair() {
        let (coordinator, strategy, store, durable) = setup(StrategyKind::Rotating);

        strategy.gate.notify_one();
        coordinator.refresh().await.unwrap();

        assert_eq!(store.state(), SessionState::Authenticated);
        assert_eq!(durable.get(StorageKey::AccessToken).unwrap().as_deref(), Some("access-1"));
        assert_eq!(durable.get(StorageKey::RefreshToken).unwrap().as_deref(), Some("refresh-1"));
    }

    #[tokio::test]
    async fn test_rejection_clears_session_for_all_waiters() {
        let (coordinator, strategy, store, durable) = setup(StrategyKind::Rotating);
        strategy.push(Err(SessionError::RefreshRejected("expired".into())));

        let callers = (0..3).map(|_| coordinator.refresh());
        let (results, _) = tokio::join!(futures::future::join_all(callers), release(&strategy));

        for result in results {
            assert!(matches!(result, Err(SessionError::RefreshRejected(_))));
        }
        assert_eq!(store.state(), SessionState::Unauthenticated);
        assert!(durable.is_empty());
    }

    #[tokio::test]
    async fn test_network_failure_preserves_session() {
        let (coordinator, strategy, store, durable) = setup(StrategyKind::Rotating);
        strategy.push(Err(SessionError::Network("connection reset".into())));

        strategy.gate.notify_one();
        let result = coordinator.refresh().await;

        assert!(matches!(result, Err(SessionError::Network(_))));
        assert_eq!(store.state(), SessionState::Authenticated);
        assert_eq!(store.get().access_token(), Some("access-0"));
        assert_eq!(durable.get(StorageKey::RefreshToken).unwrap().as_deref(), Some("refresh-0"));
    }

    #[tokio::test]
    async fn test_unrotated_refresh_token_is_hard_logout() {
        let (coordinator, strategy, store, _) = setup(StrategyKind::Rotating);
        strategy.push(Ok(IssuedCredentials::new("access-1").with_refresh_token("refresh-0")));

        strategy.gate.notify_one();
        let result = coordinator.refresh().await;

        assert_eq!(result.unwrap_err(), SessionError::RefreshTokenReuse);
        assert_eq!(store.state(), SessionState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_consumed_refresh_token_never_presented_again() {
        let (coordinator, strategy, store, _) = setup(StrategyKind::Rotating);

        strategy.gate.notify_one();
        coordinator.refresh().await.unwrap();

        // Something puts the consumed token back (e.g. a stale copy restored)
        store
            .set(Session::authenticated(
                IssuedCredentials::new("access-x").with_refresh_token("refresh-0"),
            ))
            .unwrap();
        let result = coordinator.refresh().await;

        assert_eq!(result.unwrap_err(), SessionError::RefreshTokenReuse);
        assert_eq!(strategy.calls(), 1);
        assert_eq!(store.state(), SessionState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_requests_during_refresh_wait_for_new_token() {
        let (coordinator, strategy, _, _) = setup(StrategyKind::Rotating);

        let refresh = coordinator.refresh();
        let token = async {
            tokio::task::yield_now().await;
            coordinator.current_access_token().await
        };
        let (refreshed, token, _) = tokio::join!(refresh, token, async {
            tokio::task::yield_now().await;
            tokio::task::yield_now().await;
            strategy.gate.notify_one();
        });

        assert_eq!(refreshed.unwrap(), "access-1");
        assert_eq!(token.unwrap().as_deref(), Some("access-1"));
        assert_eq!(strategy.calls(), 1);
    }

    #[tokio::test]
    async fn test_renew_after_rejection_reuses_newer_token() {
        let (coordinator, strategy, _, _) = setup(StrategyKind::Rotating);

        strategy.gate.notify_one();
        coordinator.refresh().await.unwrap();

        let token = coordinator.renew_after_rejection(Some("access-0")).await.unwrap();
        assert_eq!(token, "access-1");
        assert_eq!(strategy.calls(), 1);
    }

    #[tokio::test]
    async fn test_static_strategy_skips_rotation_checks() {
        let (coordinator, strategy, store, _) = setup(StrategyKind::Static);
        strategy.push(Ok(IssuedCredentials::new("access-1")));

        strategy.gate.notify_one();
        assert_eq!(coordinator.refresh().await.unwrap(), "access-1");
        assert_eq!(store.get().refresh_token(), Some("refresh-0"));
    }
}
