//! Session manager: lifecycle of the time-bounded session handle required
//! to submit queries.
//!
//! States move `NoSession -> Creating -> Active -> (Expired | cleared)`.
//! Expiry here is advisory: the watcher clears a session whose estimated
//! deadline has passed, but only the gateway's 401 handling logs the user
//! out.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::Api;
use crate::auth::AuthState;
use crate::clock::Clock;
use crate::gateway::{Gateway, GatewayError};
use crate::storage::{KeyValueStore, keys};
use crate::types::Session;

/// How often the expiry watcher compares the clock to the deadline.
pub const EXPIRY_CHECK_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone, Debug, PartialEq)]
pub enum SessionState {
    NoSession,
    Creating,
    Active(Session),
    Expired,
}

pub struct SessionManager {
    api: Api,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    state: watch::Sender<SessionState>,
}

impl SessionManager {
    /// Restores a persisted session that is still inside its deadline;
    /// anything stale is discarded without a network call.
    pub fn new(
        gateway: Arc<Gateway>,
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let initial = match load_session(store.as_ref()) {
            Some(session) if session.expires_at > clock.now_unix() => {
                debug!(session_id = %session.id, "restored persisted session");
                SessionState::Active(session)
            }
            Some(_) => {
                let _ = store.remove(keys::SESSION);
                SessionState::NoSession
            }
            None => SessionState::NoSession,
        };
        let (state, _) = watch::channel(initial);
        Self {
            api: Api::new(gateway),
            store,
            clock,
            state,
        }
    }

    pub fn current(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Returns the active session, if any.
    pub fn session(&self) -> Option<Session> {
        match self.current() {
            SessionState::Active(session) => Some(session),
            _ => None,
        }
    }

    pub async fn create_session(&self, user_id: &str) -> Result<Session, GatewayError> {
        self.state.send_replace(SessionState::Creating);
        match self.api.create_session(user_id).await {
            Ok(response) => {
                let session = Session {
                    id: response.session_id,
                    expires_at: self.clock.now_unix() + response.expires_in_seconds,
                };
                self.persist(&session);
                info!(session_id = %session.id, "session created");
                self.state.send_replace(SessionState::Active(session.clone()));
                Ok(session)
            }
            Err(err) => {
                self.state.send_replace(SessionState::NoSession);
                Err(err)
            }
        }
    }

    /// Creates a session only when none is live. At most one live session
    /// per user.
    pub async fn ensure_session(&self, user_id: &str) -> Result<Session, GatewayError> {
        if let SessionState::Active(session) = self.current() {
            return Ok(session);
        }
        self.create_session(user_id).await
    }

    /// Re-runs creation for the persisted user.
    pub async fn refresh_session(&self) -> Result<Session, GatewayError> {
        let user_id = self
            .store
            .get(keys::USER_PROFILE)
            .and_then(|raw| serde_json::from_str::<crate::types::User>(&raw).ok())
            .map(|user| user.id);
        match user_id {
            Some(user_id) => self.create_session(&user_id).await,
            None => Err(GatewayError::Unauthorized),
        }
    }

    pub fn clear_session(&self) {
        if let Err(err) = self.store.remove(keys::SESSION) {
            warn!(error = %err, "failed to clear persisted session");
        }
        self.state.send_replace(SessionState::NoSession);
    }

    /// Recurring expiry check. Compares the clock against the estimated
    /// deadline every [`EXPIRY_CHECK_INTERVAL`]; once passed, the session is
    /// cleared locally. The user stays logged in.
    pub fn spawn_expiry_watch(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(EXPIRY_CHECK_INTERVAL);
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                if let SessionState::Active(session) = manager.current() {
                    if manager.clock.now_unix() >= session.expires_at {
                        info!(session_id = %session.id, "session deadline passed");
                        if let Err(err) = manager.store.remove(keys::SESSION) {
                            warn!(error = %err, "failed to clear persisted session");
                        }
                        manager.state.send_replace(SessionState::Expired);
                    }
                }
            }
        })
    }

    /// Follows the auth manager's state: an authenticated user with no live
    /// session gets one created automatically; logout drops the session.
    pub fn spawn_auth_watch(
        self: &Arc<Self>,
        mut auth: watch::Receiver<AuthState>,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let observed = auth.borrow_and_update().clone();
                match observed {
                    AuthState::LoggedIn(user) => {
                        if let Err(err) = manager.ensure_session(&user.id).await {
                            warn!(error = %err, "automatic session creation failed");
                        }
                    }
                    AuthState::LoggedOut => {
                        if !matches!(manager.current(), SessionState::NoSession) {
                            manager.clear_session();
                        }
                    }
                    AuthState::Authenticating => {}
                }
                if auth.changed().await.is_err() {
                    break;
                }
            }
        })
    }

    fn persist(&self, session: &Session) {
        match serde_json::to_string(session) {
            Ok(encoded) => {
                if let Err(err) = self.store.set(keys::SESSION, &encoded) {
                    warn!(error = %err, "failed to persist session");
                }
            }
            Err(err) => warn!(error = %err, "failed to encode session"),
        }
    }
}

fn load_session(store: &dyn KeyValueStore) -> Option<Session> {
    let raw = store.get(keys::SESSION)?;
    serde_json::from_str(&raw).ok()
}
