//! Conversation state machine: the single source of truth for visible
//! conversation state.
//!
//! All mutation goes through one pure transition function, [`reduce`],
//! applied event-by-event to the whole state snapshot; observers subscribe
//! to snapshots through a watch channel instead of coupling to a rendering
//! framework. Optimistic updates (the user message, a fresh upload, a new
//! source) are rolled back or resolved by a single follow-up event, so no
//! intermediate inconsistent state is ever published.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::api::Api;
use crate::auth::AuthManager;
use crate::clock::Clock;
use crate::gateway::Gateway;
use crate::session::SessionManager;
use crate::storage::{KeyValueStore, keys};
use crate::types::{
    ChatPreferences, ChatRequest, FileStatus, Message, PreferencesPatch, Role, SourceKind,
    UploadedFile,
};

/// Shown in place of an answer when a send fails. Matches the backend's own
/// fallback wording so the transcript reads consistently.
pub const SEND_FAILURE_TEXT: &str =
    "Sorry, something went wrong while processing your request. Please try again.";

// ============================================
// State and events
// ============================================

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChatState {
    pub messages: Vec<Message>,
    pub current_query: String,
    pub is_loading: bool,
    pub preferences: ChatPreferences,
    pub files: Vec<UploadedFile>,
    pub web_sources: Vec<String>,
    pub youtube_sources: Vec<String>,
}

#[derive(Clone, Debug)]
pub enum UploadOutcome {
    /// Server accepted the upload; the temp entry is replaced wholesale.
    Confirmed(UploadedFile),
    /// Upload failed; the temp entry is kept but marked `error`.
    Failed,
}

#[derive(Clone, Debug)]
pub enum ChatEvent {
    QueryChanged(String),
    /// The optimistic half of a send: clears the draft, raises the loading
    /// flag and appends the user message before any network activity.
    SendStarted { message: Message },
    AssistantArrived { message: Message },
    /// Send settled in failure: the synthetic assistant message still lands,
    /// so the transcript grows by two either way.
    SendFailed { message: Message },
    FileAdded { file: UploadedFile },
    /// Resolves an optimistic upload in one atomic step.
    FileResolved { temp_id: String, outcome: UploadOutcome },
    SourceAdded { kind: SourceKind, url: String },
    SourceRegistrationFailed { kind: SourceKind, url: String },
    PreferencesUpdated(PreferencesPatch),
    PreferencesRestored(ChatPreferences),
    HistoryRestored(Vec<Message>),
    HistoryCleared,
}

/// Pure transition function. Everything observable about the conversation
/// is the fold of these events over the empty state.
pub fn reduce(state: &ChatState, event: ChatEvent) -> ChatState {
    let mut next = state.clone();
    match event {
        ChatEvent::QueryChanged(query) => {
            next.current_query = query;
        }
        ChatEvent::SendStarted { message } => {
            next.current_query.clear();
            next.is_loading = true;
            next.messages.push(message);
        }
        ChatEvent::AssistantArrived { message } | ChatEvent::SendFailed { message } => {
            next.messages.push(message);
            next.is_loading = false;
        }
        ChatEvent::FileAdded { file } => {
            next.files.push(file);
        }
        ChatEvent::FileResolved { temp_id, outcome } => {
            if let Some(index) = next.files.iter().position(|f| f.id == temp_id) {
                match outcome {
                    UploadOutcome::Confirmed(file) => next.files[index] = file,
                    UploadOutcome::Failed => next.files[index].status = FileStatus::Error,
                }
            }
        }
        ChatEvent::SourceAdded { kind, url } => {
            let list = source_list_mut(&mut next, kind);
            if !list.contains(&url) {
                list.push(url);
            }
        }
        ChatEvent::SourceRegistrationFailed { kind, url } => {
            source_list_mut(&mut next, kind).retain(|existing| existing != &url);
        }
        ChatEvent::PreferencesUpdated(patch) => {
            next.preferences = next.preferences.merged(&patch);
        }
        ChatEvent::PreferencesRestored(preferences) => {
            next.preferences = preferences;
        }
        ChatEvent::HistoryRestored(messages) => {
            next.messages = messages;
        }
        ChatEvent::HistoryCleared => {
            next.messages.clear();
        }
    }
    next
}

fn source_list_mut(state: &mut ChatState, kind: SourceKind) -> &mut Vec<String> {
    match kind {
        SourceKind::Web => &mut state.web_sources,
        SourceKind::Youtube => &mut state.youtube_sources,
    }
}

// ============================================
// Service
// ============================================

pub struct ChatService {
    api: Api,
    auth: Arc<AuthManager>,
    session: Arc<SessionManager>,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    state: watch::Sender<ChatState>,
    next_message_id: AtomicU64,
    next_temp_id: AtomicU64,
}

impl ChatService {
    pub fn new(
        gateway: Arc<Gateway>,
        auth: Arc<AuthManager>,
        session: Arc<SessionManager>,
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (state, _) = watch::channel(ChatState::default());
        let service = Self {
            api: Api::new(gateway),
            auth,
            session,
            store,
            clock,
            state,
            next_message_id: AtomicU64::new(1),
            next_temp_id: AtomicU64::new(1),
        };
        service.restore();
        service
    }

    pub fn snapshot(&self) -> ChatState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ChatState> {
        self.state.subscribe()
    }

    pub fn set_query(&self, query: &str) {
        self.apply(ChatEvent::QueryChanged(query.to_string()));
    }

    /// Submits a query. Requires a non-empty query, a logged-in user and an
    /// active session; anything else is a local no-op, not an error.
    ///
    /// The user message is visible before the network call starts, and
    /// exactly one assistant message (real or synthetic) follows once the
    /// call settles, so every send grows the transcript by two.
    pub async fn send_message(&self, query: &str) {
        let query = query.trim();
        if query.is_empty() {
            return;
        }
        let Some(user) = self.auth.user() else {
            debug!("send_message ignored: not logged in");
            return;
        };
        let Some(session) = self.session.session() else {
            debug!("send_message ignored: no active session");
            return;
        };

        let snapshot = self.snapshot();
        let history: Vec<String> = snapshot
            .messages
            .iter()
            .filter(|m| m.role == Role::Assistant)
            .map(|m| m.content.clone())
            .collect();
        let preferences = snapshot.preferences.clone();

        let user_message = self.build_message(Role::User, query.to_string(), None);
        self.apply(ChatEvent::SendStarted {
            message: user_message,
        });
        self.persist_messages();

        let request = ChatRequest {
            query: query.to_string(),
            user_id: user.id,
            session_id: session.id,
            allow_agentic: preferences.allow_agentic,
            model_name: preferences.model_name.clone(),
            preferences,
            conversation_history: history,
        };

        let event = match self.api.chat_query(&request).await {
            Ok(response) => {
                let content = response.answer.clone();
                let metadata = response.into_metadata();
                ChatEvent::AssistantArrived {
                    message: self.build_message(Role::Assistant, content, Some(metadata)),
                }
            }
            Err(err) => {
                warn!(error = %err, "chat query failed");
                ChatEvent::SendFailed {
                    message: self.build_message(
                        Role::Assistant,
                        SEND_FAILURE_TEXT.to_string(),
                        None,
                    ),
                }
            }
        };
        self.apply(event);
        self.persist_messages();
    }

    /// Registers a selected file. The entry appears immediately with a
    /// temporary id and `uploading` status and is resolved by one atomic
    /// event: replaced with the server-assigned id on success, marked
    /// `error` on failure. Never left `uploading` forever.
    pub async fn add_file(&self, name: &str, bytes: Vec<u8>) {
        let Some(user) = self.auth.user() else {
            debug!("add_file ignored: not logged in");
            return;
        };

        let temp_id = format!("tmp-{}", self.next_temp_id.fetch_add(1, Ordering::Relaxed));
        let size = bytes.len() as u64;
        self.apply(ChatEvent::FileAdded {
            file: UploadedFile {
                id: temp_id.clone(),
                name: name.to_string(),
                size,
                status: FileStatus::Uploading,
            },
        });

        let outcome = match self.api.ingest_file(name, bytes, &user.id).await {
            Ok(response) => UploadOutcome::Confirmed(UploadedFile {
                id: response.document_id,
                name: name.to_string(),
                size,
                status: FileStatus::Complete,
            }),
            Err(err) => {
                warn!(name, error = %err, "file upload failed");
                UploadOutcome::Failed
            }
        };
        self.apply(ChatEvent::FileResolved { temp_id, outcome });
    }

    pub async fn add_web_source(&self, url: &str) {
        self.add_source(SourceKind::Web, url).await;
    }

    pub async fn add_youtube_source(&self, url: &str) {
        self.add_source(SourceKind::Youtube, url).await;
    }

    /// Optimistically inserts the url (exact-string dedup), then registers
    /// it in the background; a failed registration rolls the entry back out.
    async fn add_source(&self, kind: SourceKind, url: &str) {
        let Some(user) = self.auth.user() else {
            debug!("add_source ignored: not logged in");
            return;
        };
        let already_present = match kind {
            SourceKind::Web => self.snapshot().web_sources.contains(&url.to_string()),
            SourceKind::Youtube => self.snapshot().youtube_sources.contains(&url.to_string()),
        };
        if already_present {
            return;
        }

        self.apply(ChatEvent::SourceAdded {
            kind,
            url: url.to_string(),
        });

        if let Err(err) = self.api.ingest_url(url, kind, &user.id).await {
            warn!(url, error = %err, "source registration failed, rolling back");
            self.apply(ChatEvent::SourceRegistrationFailed {
                kind,
                url: url.to_string(),
            });
        }
    }

    /// Merges a partial update into the preferences and persists the result
    /// immediately. No server round-trip.
    pub fn update_preferences(&self, patch: PreferencesPatch) {
        self.apply(ChatEvent::PreferencesUpdated(patch));
        let preferences = self.snapshot().preferences;
        match serde_json::to_string(&preferences) {
            Ok(encoded) => {
                if let Err(err) = self.store.set(keys::PREFERENCES, &encoded) {
                    warn!(error = %err, "failed to persist preferences");
                }
            }
            Err(err) => warn!(error = %err, "failed to encode preferences"),
        }
    }

    /// Empties the transcript. The cleared messages are snapshotted into the
    /// conversation archive first; sessions and preferences are untouched.
    pub fn clear_history(&self) {
        let messages = self.snapshot().messages;
        if !messages.is_empty() {
            self.archive(messages);
        }
        self.apply(ChatEvent::HistoryCleared);
        if let Err(err) = self.store.remove(keys::MESSAGE_HISTORY) {
            warn!(error = %err, "failed to clear persisted history");
        }
    }

    fn archive(&self, messages: Vec<Message>) {
        let mut archive: Vec<Vec<Message>> = self
            .store
            .get(keys::CONVERSATION_ARCHIVE)
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        archive.push(messages);
        match serde_json::to_string(&archive) {
            Ok(encoded) => {
                if let Err(err) = self.store.set(keys::CONVERSATION_ARCHIVE, &encoded) {
                    warn!(error = %err, "failed to archive conversation");
                }
            }
            Err(err) => warn!(error = %err, "failed to encode archive"),
        }
    }

    /// Startup path: reload preferences and transcript from the store.
    fn restore(&self) {
        if let Some(raw) = self.store.get(keys::PREFERENCES) {
            match serde_json::from_str::<ChatPreferences>(&raw) {
                Ok(preferences) => self.apply(ChatEvent::PreferencesRestored(preferences)),
                Err(err) => warn!(error = %err, "discarding unreadable preferences"),
            }
        }
        if let Some(raw) = self.store.get(keys::MESSAGE_HISTORY) {
            match serde_json::from_str::<Vec<Message>>(&raw) {
                Ok(messages) => {
                    let max_id = messages.iter().map(|m| m.id).max().unwrap_or(0);
                    self.next_message_id.store(max_id + 1, Ordering::Relaxed);
                    self.apply(ChatEvent::HistoryRestored(messages));
                }
                Err(err) => warn!(error = %err, "discarding unreadable message history"),
            }
        }
    }

    fn build_message(
        &self,
        role: Role,
        content: String,
        metadata: Option<crate::types::AnswerMetadata>,
    ) -> Message {
        Message {
            id: self.next_message_id.fetch_add(1, Ordering::Relaxed),
            role,
            content,
            timestamp: self.clock.now_unix(),
            metadata,
        }
    }

    /// Single mutator: every event lands atomically on the whole snapshot.
    fn apply(&self, event: ChatEvent) {
        self.state.send_modify(|state| *state = reduce(state, event));
    }

    fn persist_messages(&self) {
        let messages = self.snapshot().messages;
        match serde_json::to_string(&messages) {
            Ok(encoded) => {
                if let Err(err) = self.store.set(keys::MESSAGE_HISTORY, &encoded) {
                    warn!(error = %err, "failed to persist message history");
                }
            }
            Err(err) => warn!(error = %err, "failed to encode message history"),
        }
    }
}
