use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================
// Conversation types
// ============================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: u64,
    pub role: Role,
    pub content: String,
    /// Unix seconds at the moment the message was appended locally.
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<AnswerMetadata>,
}

/// Provenance attached to assistant messages, carried verbatim from the
/// backend. `retrieval_trace`, `query_understanding` and `metrics` are
/// opaque pass-through payloads and are never interpreted client side.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AnswerMetadata {
    pub confidence: f64,
    pub citations: Vec<String>,
    pub used_chunk_ids: Vec<String>,
    #[serde(default)]
    pub retrieval_trace: Value,
    pub trace_id: String,
    pub latency_ms: u64,
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub query_understanding: Value,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metrics: Value,
}

// ============================================
// Identity and session
// ============================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    pub role: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    /// Unix seconds. Client-estimated and advisory only; the backend is the
    /// authority and answers 401 on an actually-expired session.
    pub expires_at: u64,
}

// ============================================
// Knowledge sources
// ============================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Uploading,
    Complete,
    Error,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UploadedFile {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub status: FileStatus,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Web,
    Youtube,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::Web => "web",
            SourceKind::Youtube => "youtube",
        }
    }
}

// ============================================
// Preferences
// ============================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatPreferences {
    pub response_style: String,
    pub max_length: u32,
    pub domain: String,
    pub model_name: Option<String>,
    pub allow_agentic: bool,
}

impl Default for ChatPreferences {
    fn default() -> Self {
        Self {
            response_style: "balanced".to_string(),
            max_length: 500,
            domain: "general".to_string(),
            model_name: None,
            allow_agentic: false,
        }
    }
}

/// Field-wise partial update for [`ChatPreferences`]. `None` leaves the
/// current value untouched.
#[derive(Clone, Debug, Default)]
pub struct PreferencesPatch {
    pub response_style: Option<String>,
    pub max_length: Option<u32>,
    pub domain: Option<String>,
    pub model_name: Option<String>,
    pub allow_agentic: Option<bool>,
}

impl ChatPreferences {
    pub fn merged(&self, patch: &PreferencesPatch) -> ChatPreferences {
        ChatPreferences {
            response_style: patch
                .response_style
                .clone()
                .unwrap_or_else(|| self.response_style.clone()),
            max_length: patch.max_length.unwrap_or(self.max_length),
            domain: patch.domain.clone().unwrap_or_else(|| self.domain.clone()),
            model_name: patch.model_name.clone().or_else(|| self.model_name.clone()),
            allow_agentic: patch.allow_agentic.unwrap_or(self.allow_agentic),
        }
    }
}

// ============================================
// Wire types (backend contract)
// ============================================

#[derive(Clone, Debug, Deserialize)]
pub struct AuthResponse {
    pub user_id: String,
    pub username: String,
    pub token: String,
    pub role: String,
}

/// Decoded token claims returned by `GET /auth/me`.
#[derive(Clone, Debug, Deserialize)]
pub struct UserClaims {
    pub user_id: String,
    pub username: String,
    #[serde(default)]
    pub role: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SessionResponse {
    pub session_id: String,
    pub user_id: String,
    pub expires_in_seconds: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct ChatRequest {
    pub query: String,
    pub user_id: String,
    pub session_id: String,
    pub preferences: ChatPreferences,
    /// Assistant-only subset of prior message contents.
    pub conversation_history: Vec<String>,
    pub allow_agentic: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ChatResponse {
    pub answer: String,
    pub confidence: f64,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub citations: Vec<String>,
    #[serde(default)]
    pub used_chunk_ids: Vec<String>,
    #[serde(default)]
    pub retrieval_trace: Value,
    #[serde(default)]
    pub query_understanding: Value,
    pub trace_id: String,
    pub latency_ms: u64,
    #[serde(default)]
    pub raw_model_output: Option<String>,
    #[serde(default)]
    pub metrics: Value,
}

impl ChatResponse {
    pub fn into_metadata(self) -> AnswerMetadata {
        AnswerMetadata {
            confidence: self.confidence,
            citations: self.citations,
            used_chunk_ids: self.used_chunk_ids,
            retrieval_trace: self.retrieval_trace,
            trace_id: self.trace_id,
            latency_ms: self.latency_ms,
            warnings: self.warnings,
            query_understanding: self.query_understanding,
            metrics: self.metrics,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct IngestResponse {
    pub status: String,
    pub message: String,
    pub document_id: String,
    pub chunks_count: u64,
}
