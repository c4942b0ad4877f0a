//! Auth state manager: owns the credential and the authenticated user.
//!
//! States move `LoggedOut -> Authenticating -> LoggedIn`. Login and signup
//! persist the credential and profile; `restore` re-verifies a persisted
//! credential at startup; `logout` is synchronous and never calls the
//! backend.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::api::Api;
use crate::gateway::{Gateway, GatewayError};
use crate::storage::{KeyValueStore, keys};
use crate::types::User;

#[derive(Clone, Debug, PartialEq)]
pub enum AuthState {
    LoggedOut,
    Authenticating,
    LoggedIn(User),
}

pub struct AuthManager {
    api: Api,
    store: Arc<dyn KeyValueStore>,
    state: watch::Sender<AuthState>,
}

impl AuthManager {
    pub fn new(gateway: Arc<Gateway>, store: Arc<dyn KeyValueStore>) -> Self {
        let (state, _) = watch::channel(AuthState::LoggedOut);
        Self {
            api: Api::new(gateway),
            store,
            state,
        }
    }

    pub fn current(&self) -> AuthState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.state.subscribe()
    }

    /// Returns the logged-in user, if any.
    pub fn user(&self) -> Option<User> {
        match self.current() {
            AuthState::LoggedIn(user) => Some(user),
            _ => None,
        }
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<User, GatewayError> {
        self.state.send_replace(AuthState::Authenticating);
        match self.api.login(username, password).await {
            Ok(response) => Ok(self.establish(response)),
            Err(err) => {
                self.state.send_replace(AuthState::LoggedOut);
                Err(err)
            }
        }
    }

    pub async fn signup(&self, username: &str, password: &str) -> Result<User, GatewayError> {
        self.state.send_replace(AuthState::Authenticating);
        match self.api.signup(username, password).await {
            Ok(response) => Ok(self.establish(response)),
            Err(err) => {
                self.state.send_replace(AuthState::LoggedOut);
                Err(err)
            }
        }
    }

    /// Startup path: if a credential survived the last run, verify it and
    /// restore the user; otherwise stay logged out. A rejected credential
    /// clears all persisted identity state.
    pub async fn restore(&self) {
        let Some(token) = self.store.get(keys::AUTH_TOKEN) else {
            return;
        };
        self.api.gateway().credentials().set(&token);
        self.state.send_replace(AuthState::Authenticating);

        match self.api.whoami().await {
            Ok(claims) => {
                let user = User {
                    id: claims.user_id,
                    username: claims.username,
                    role: claims.role,
                };
                self.persist_user(&user);
                info!(username = %user.username, "restored authenticated user");
                self.state.send_replace(AuthState::LoggedIn(user));
            }
            Err(err) => {
                warn!(error = %err, "stored credential rejected, logging out");
                self.logout();
            }
        }
    }

    /// Synchronous logout: clears persisted identity and session state, the
    /// shared credential, and all cached responses. No backend call.
    pub fn logout(&self) {
        self.api.gateway().credentials().clear();
        self.api.gateway().clear_cache();
        for key in [keys::AUTH_TOKEN, keys::USER_PROFILE, keys::SESSION] {
            if let Err(err) = self.store.remove(key) {
                warn!(key, error = %err, "failed to clear persisted state");
            }
        }
        self.state.send_replace(AuthState::LoggedOut);
    }

    fn establish(&self, response: crate::types::AuthResponse) -> User {
        let user = User {
            id: response.user_id,
            username: response.username,
            role: response.role,
        };
        self.api.gateway().credentials().set(&response.token);
        if let Err(err) = self.store.set(keys::AUTH_TOKEN, &response.token) {
            warn!(error = %err, "failed to persist credential");
        }
        self.persist_user(&user);
        info!(username = %user.username, "logged in");
        self.state.send_replace(AuthState::LoggedIn(user.clone()));
        user
    }

    fn persist_user(&self, user: &User) {
        match serde_json::to_string(user) {
            Ok(encoded) => {
                if let Err(err) = self.store.set(keys::USER_PROFILE, &encoded) {
                    warn!(error = %err, "failed to persist user profile");
                }
            }
            Err(err) => warn!(error = %err, "failed to encode user profile"),
        }
    }
}
