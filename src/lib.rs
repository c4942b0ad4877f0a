//! Nightjar client core: request lifecycle and state orchestration for a
//! question-answering study assistant.
//!
//! The crate is wired by explicit construction, not globals: build a
//! [`gateway::Gateway`] over a transport and a [`storage::KeyValueStore`],
//! hand it to the [`auth::AuthManager`], [`session::SessionManager`] and
//! [`chat::ChatService`], and observe state through their watch channels.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use nightjar::auth::AuthManager;
//! use nightjar::chat::ChatService;
//! use nightjar::clock::SystemClock;
//! use nightjar::gateway::{Gateway, ReqwestBackend};
//! use nightjar::session::SessionManager;
//! use nightjar::storage::FileStore;
//!
//! # async fn example() {
//! let store = Arc::new(FileStore::default_location());
//! let backend = Arc::new(ReqwestBackend::new("https://api.nightjar.app"));
//! let clock = Arc::new(SystemClock);
//! let gateway = Arc::new(Gateway::new(backend, store.clone()));
//!
//! let auth = Arc::new(AuthManager::new(gateway.clone(), store.clone()));
//! let session = Arc::new(SessionManager::new(gateway.clone(), store.clone(), clock.clone()));
//! let chat = ChatService::new(gateway, auth.clone(), session.clone(), store, clock);
//!
//! let _watchers = (
//!     session.spawn_auth_watch(auth.subscribe()),
//!     session.spawn_expiry_watch(),
//! );
//! auth.restore().await;
//! chat.send_message("Summarize my uploaded documents").await;
//! # }
//! ```

pub mod api;
pub mod auth;
pub mod cache;
pub mod chat;
pub mod clock;
pub mod gateway;
pub mod session;
pub mod storage;
pub mod types;

pub use auth::{AuthManager, AuthState};
pub use chat::{ChatEvent, ChatService, ChatState, reduce};
pub use gateway::{Gateway, GatewayError, Notice, ReqwestBackend};
pub use session::{SessionManager, SessionState};
pub use types::{ChatPreferences, Message, PreferencesPatch, Role, Session, User};
