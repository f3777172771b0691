//! Single-flight session refresh
//!
//! The first request to observe an authentication failure performs the refresh
//! call. Requests failing while that call is outstanding subscribe to its
//! outcome instead of issuing their own, so N concurrent failures cost exactly
//! one refresh (none when there is no session).

use super::store::{SessionError, SessionStore};
use crate::models::Session;
use crate::observability::SyncMetrics;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Exchanges a refresh token for a new session
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<Session, SessionError>;
}

/// Invoked once per failed refresh, after the session has been cleared
pub type SessionExpiredCallback = Arc<dyn Fn() + Send + Sync>;

enum RefreshState {
    Idle,
    Refreshing(Vec<oneshot::Sender<Option<String>>>),
}

/// Coordinates token refresh across concurrent requests
pub struct RefreshCoordinator {
    store: Arc<dyn SessionStore>,
    refresher: Arc<dyn TokenRefresher>,
    state: Mutex<RefreshState>,
    on_expired: RwLock<Option<SessionExpiredCallback>>,
    metrics: SyncMetrics,
}

impl RefreshCoordinator {
    pub fn new(store: Arc<dyn SessionStore>, refresher: Arc<dyn TokenRefresher>) -> Self {
        Self {
            store,
            refresher,
            state: Mutex::new(RefreshState::Idle),
            on_expired: RwLock::new(None),
            metrics: SyncMetrics::new(),
        }
    }

    /// Register the callback run when the session cannot be refreshed
    pub fn on_session_expired(&self, callback: SessionExpiredCallback) {
        *self
            .on_expired
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Current access token, if signed in
    pub async fn access_token(&self) -> Option<String> {
        self.store.get().await.map(|s| s.access_token)
    }

    /// Whether a refresh call is outstanding
    pub fn is_refreshing(&self) -> bool {
        matches!(*self.lock_state(), RefreshState::Refreshing(_))
    }

    /// Obtain a fresh access token after `failed_token` was rejected.
    ///
    /// Returns `None` when there is no session or the refresh failed; in the
    /// latter case the session has been cleared.
    pub async fn refresh_after_auth_failure(&self, failed_token: Option<&str>) -> Option<String> {
        let subscription = {
            let mut state = self.lock_state();
            match &mut *state {
                RefreshState::Refreshing(waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Some(rx)
                }
                RefreshState::Idle => {
                    *state = RefreshState::Refreshing(Vec::new());
                    None
                }
            }
        };

        if let Some(rx) = subscription {
            debug!("Refresh already in flight, waiting for its outcome");
            return rx.await.ok().flatten();
        }

        let mut flight = InFlight {
            state: &self.state,
            outcome: None,
        };
        let outcome = self.run_refresh(failed_token).await;
        flight.outcome = outcome.clone();
        outcome
    }

    async fn run_refresh(&self, failed_token: Option<&str>) -> Option<String> {
        let session = match self.store.get().await {
            Some(session) => session,
            None => {
                debug!("No session to refresh");
                return None;
            }
        };

        // Another request already rotated the token after ours was issued
        if let Some(failed) = failed_token {
            if session.access_token != failed {
                debug!("Session already refreshed, reusing current token");
                return Some(session.access_token);
            }
        }

        self.metrics.inc_refresh_calls();

        match self.refresher.refresh(&session.refresh_token).await {
            Ok(new_session) => {
                let token = new_session.access_token.clone();
                if let Err(e) = self.store.set(new_session).await {
                    warn!(error = %e, "Failed to persist refreshed session, keeping it in flight only");
                }
                info!(event = "session_refreshed", "Session refreshed");
                Some(token)
            }
            Err(e) => {
                warn!(event = "session_expired", error = %e, "Session refresh failed, signing out");
                self.metrics.inc_session_expired();
                if let Err(clear_err) = self.store.clear().await {
                    warn!(error = %clear_err, "Failed to clear expired session");
                }
                let callback = self
                    .on_expired
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                if let Some(callback) = callback {
                    callback();
                }
                None
            }
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, RefreshState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Returns the coordinator to idle and answers every subscriber, also when the
/// refreshing future is dropped before completing.
struct InFlight<'a> {
    state: &'a Mutex<RefreshState>,
    outcome: Option<String>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let previous = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *state, RefreshState::Idle)
        };

        if let RefreshState::Refreshing(waiters) = previous {
            for waiter in waiters {
                let _ = waiter.send(self.outcome.clone());
            }
        }
    }
}
