//! HTTP gateway client: the single choke point for backend traffic.
//!
//! Every outbound call goes through [`Gateway::request`], which attaches the
//! current credential, classifies failures, serves cacheable reads from the
//! response cache, and runs the 401 refresh-and-retry protocol. Concurrent
//! 401s share one in-flight verification call (single-flight); when the
//! refresh fails the gateway clears all persisted identity state and
//! broadcasts [`Notice::SessionExpired`]; no other component is allowed to
//! force a logout.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, instrument, warn};

use crate::api::paths;
use crate::cache::{ResponseCache, cache_key};
use crate::storage::{KeyValueStore, keys};

// ============================================
// Error types
// ============================================

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("authentication required")]
    Unauthorized,

    #[error("permission denied")]
    Forbidden,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("server error (status {0})")]
    Server(u16),

    #[error("connection failed: {0}")]
    Network(String),

    #[error("unexpected response shape: {0}")]
    Decode(String),
}

/// Transport-level failure: no HTTP response was received at all.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct TransportError(pub String);

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        TransportError(err.to_string())
    }
}

/// User-visible notices emitted by the gateway's failure classification.
/// `SessionExpired` doubles as the forced-navigation-to-login signal.
#[derive(Clone, Debug, PartialEq)]
pub enum Notice {
    SessionExpired,
    PermissionDenied,
    InvalidRequest(String),
    ServerError,
    ConnectionFailed,
}

// ============================================
// Transport seam
// ============================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Delete,
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Delete => "DELETE",
        };
        write!(f, "{name}")
    }
}

#[derive(Clone, Debug)]
pub struct MultipartForm {
    pub file_field: String,
    pub file_name: String,
    pub bytes: Vec<u8>,
    pub fields: Vec<(String, String)>,
}

#[derive(Clone, Debug)]
pub enum RequestBody {
    Empty,
    Json(Value),
    Multipart(MultipartForm),
}

#[derive(Clone, Debug)]
pub struct BackendRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub bearer: Option<String>,
    pub body: RequestBody,
}

#[derive(Clone, Debug)]
pub struct BackendResponse {
    pub status: u16,
    pub body: Value,
}

impl BackendResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// The wire itself. Implemented over reqwest in production and by scripted
/// fakes in tests, so the retry/cache protocol is testable without a
/// network.
#[async_trait]
pub trait HttpBackend: Send + Sync {
    async fn execute(&self, request: BackendRequest) -> Result<BackendResponse, TransportError>;
}

pub struct ReqwestBackend {
    client: reqwest::Client,
    base_url: String,
}

impl ReqwestBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    /// Reads the backend base URL from `NIGHTJAR_API_URL`.
    pub fn from_env() -> anyhow::Result<Self> {
        let base_url =
            std::env::var("NIGHTJAR_API_URL").context("NIGHTJAR_API_URL is not set")?;
        Ok(Self::new(base_url))
    }
}

#[async_trait]
impl HttpBackend for ReqwestBackend {
    async fn execute(&self, request: BackendRequest) -> Result<BackendResponse, TransportError> {
        let url = format!("{}{}", self.base_url, request.path);
        let mut builder = match request.method {
            Method::Get => self.client.get(&url),
            Method::Post => self.client.post(&url),
            Method::Delete => self.client.delete(&url),
        };
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(token) = &request.bearer {
            builder = builder.bearer_auth(token);
        }
        builder = match request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(body) => builder.json(&body),
            RequestBody::Multipart(form) => {
                let part = reqwest::multipart::Part::bytes(form.bytes)
                    .file_name(form.file_name);
                let mut multipart =
                    reqwest::multipart::Form::new().part(form.file_field, part);
                for (name, value) in form.fields {
                    multipart = multipart.text(name, value);
                }
                builder.multipart(multipart)
            }
        };

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let text = response.text().await?;
        let body = if text.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };
        Ok(BackendResponse { status, body })
    }
}

// ============================================
// Shared credential cell
// ============================================

/// The bearer token, shared between the auth manager (writer) and the
/// gateway (reader). Auth publishes here on login; the gateway clears it on
/// an unrecoverable 401.
#[derive(Clone, Default)]
pub struct CredentialCell {
    token: Arc<RwLock<Option<String>>>,
}

impl CredentialCell {
    pub fn get(&self) -> Option<String> {
        self.token.read().expect("credential cell poisoned").clone()
    }

    pub fn set(&self, token: impl Into<String>) {
        *self.token.write().expect("credential cell poisoned") = Some(token.into());
    }

    pub fn clear(&self) {
        *self.token.write().expect("credential cell poisoned") = None;
    }
}

// ============================================
// Gateway
// ============================================

pub struct Gateway {
    backend: Arc<dyn HttpBackend>,
    cache: ResponseCache,
    store: Arc<dyn KeyValueStore>,
    credentials: CredentialCell,
    notices: broadcast::Sender<Notice>,
    refresh_gate: tokio::sync::Mutex<()>,
    refresh_epoch: AtomicU64,
}

impl Gateway {
    pub fn new(backend: Arc<dyn HttpBackend>, store: Arc<dyn KeyValueStore>) -> Self {
        let (notices, _) = broadcast::channel(32);
        Self {
            backend,
            cache: ResponseCache::new(),
            store,
            credentials: CredentialCell::default(),
            notices,
            refresh_gate: tokio::sync::Mutex::new(()),
            refresh_epoch: AtomicU64::new(0),
        }
    }

    pub fn credentials(&self) -> CredentialCell {
        self.credentials.clone()
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    /// Drops every cached response. Used on logout.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(String, String)],
        cacheable: bool,
    ) -> Result<T, GatewayError> {
        let body = self
            .request(Method::Get, path, query.to_vec(), RequestBody::Empty, cacheable)
            .await?;
        decode(body)
    }

    pub async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &impl Serialize,
    ) -> Result<T, GatewayError> {
        let json = serde_json::to_value(body)
            .map_err(|err| GatewayError::Decode(err.to_string()))?;
        let body = self
            .request(Method::Post, path, Vec::new(), RequestBody::Json(json), false)
            .await?;
        decode(body)
    }

    pub async fn upload<T: DeserializeOwned>(
        &self,
        path: &str,
        form: MultipartForm,
    ) -> Result<T, GatewayError> {
        let body = self
            .request(Method::Post, path, Vec::new(), RequestBody::Multipart(form), false)
            .await?;
        decode(body)
    }

    /// Core request lifecycle: cache consult, credential attachment, failure
    /// classification, refresh-and-retry-once on 401.
    #[instrument(level = "debug", skip(self, body))]
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        query: Vec<(String, String)>,
        body: RequestBody,
        cacheable: bool,
    ) -> Result<Value, GatewayError> {
        let key = cache_key(path, &query);
        if cacheable && method == Method::Get {
            if let Some(hit) = self.cache.get(&key) {
                debug!(%method, path, "served from response cache");
                return Ok(hit);
            }
        }

        let template = BackendRequest {
            method,
            path: path.to_string(),
            query,
            bearer: None,
            body,
        };
        debug!(%method, path, body = ?template.body, "issuing request");

        let response = self.execute_with_credentials(&template).await?;
        debug!(%method, path, status = response.status, "response received");

        if response.status == 401 && path != paths::AUTH_ME {
            return self.recover_unauthorized(template, cacheable, &key).await;
        }

        self.settle(response, method, path, cacheable, &key)
    }

    /// Classifies a settled response. Success stores cacheable bodies and
    /// applies the one fixed invalidation rule: a POST to the chat-query
    /// endpoint drops that endpoint's own cache key.
    fn settle(
        &self,
        response: BackendResponse,
        method: Method,
        path: &str,
        cacheable: bool,
        key: &str,
    ) -> Result<Value, GatewayError> {
        if response.is_success() {
            if cacheable && method == Method::Get {
                self.cache.set(key, response.body.clone());
            }
            if method == Method::Post && path == paths::CHAT_QUERY {
                self.cache.delete(key);
            }
            return Ok(response.body);
        }

        match response.status {
            401 => Err(GatewayError::Unauthorized),
            403 => {
                self.notify(Notice::PermissionDenied);
                Err(GatewayError::Forbidden)
            }
            400 => {
                let message = server_message(&response.body)
                    .unwrap_or_else(|| "The request was rejected.".to_string());
                self.notify(Notice::InvalidRequest(message.clone()));
                Err(GatewayError::InvalidRequest(message))
            }
            status => {
                self.notify(Notice::ServerError);
                Err(GatewayError::Server(status))
            }
        }
    }

    async fn execute_with_credentials(
        &self,
        template: &BackendRequest,
    ) -> Result<BackendResponse, GatewayError> {
        let mut request = template.clone();
        request.bearer = self.credentials.get();
        self.backend.execute(request).await.map_err(|err| {
            warn!(path = %template.path, error = %err, "request failed without a response");
            self.notify(Notice::ConnectionFailed);
            GatewayError::Network(err.0)
        })
    }

    /// 401 path: refresh the credential once (single-flight across callers),
    /// then retry the original request exactly once. A failed refresh, or a
    /// second 401 on the retry, abandons the call and forces logout.
    async fn recover_unauthorized(
        &self,
        template: BackendRequest,
        cacheable: bool,
        key: &str,
    ) -> Result<Value, GatewayError> {
        if !self.refresh_credentials().await {
            self.force_logout();
            return Err(GatewayError::Unauthorized);
        }

        let retry = self.execute_with_credentials(&template).await?;
        debug!(
            path = %template.path,
            status = retry.status,
            "retry after credential refresh"
        );
        if retry.status == 401 {
            self.force_logout();
            return Err(GatewayError::Unauthorized);
        }
        self.settle(retry, template.method, &template.path, cacheable, key)
    }

    /// Verifies the stored credential against `GET /auth/me`. Concurrent
    /// callers queue on one gate; whoever enters after a successful refresh
    /// observes the bumped epoch and skips its own verification call.
    async fn refresh_credentials(&self) -> bool {
        let observed = self.refresh_epoch.load(Ordering::Acquire);
        let _gate = self.refresh_gate.lock().await;
        if self.refresh_epoch.load(Ordering::Acquire) != observed {
            return true;
        }

        let Some(token) = self.credentials.get() else {
            return false;
        };
        let verification = BackendRequest {
            method: Method::Get,
            path: paths::AUTH_ME.to_string(),
            query: Vec::new(),
            bearer: Some(token),
            body: RequestBody::Empty,
        };
        match self.backend.execute(verification).await {
            Ok(response) if response.is_success() => {
                self.refresh_epoch.fetch_add(1, Ordering::AcqRel);
                debug!("credential verification succeeded");
                true
            }
            Ok(response) => {
                warn!(status = response.status, "credential verification rejected");
                false
            }
            Err(err) => {
                warn!(error = %err, "credential verification unreachable");
                false
            }
        }
    }

    /// Clears every trace of the authenticated identity and signals the
    /// shell to navigate to the login entry point.
    fn force_logout(&self) {
        warn!("unrecoverable 401, clearing identity state");
        self.credentials.clear();
        self.cache.clear();
        for key in [keys::AUTH_TOKEN, keys::USER_PROFILE, keys::SESSION] {
            if let Err(err) = self.store.remove(key) {
                warn!(key, error = %err, "failed to clear persisted state");
            }
        }
        self.notify(Notice::SessionExpired);
    }

    fn notify(&self, notice: Notice) {
        // send only fails when nobody is subscribed, which is fine
        let _ = self.notices.send(notice);
    }
}

fn decode<T: DeserializeOwned>(body: Value) -> Result<T, GatewayError> {
    serde_json::from_value(body).map_err(|err| GatewayError::Decode(err.to_string()))
}

/// Pulls the server-supplied message field out of an error body, if any.
/// The backend uses `detail` (FastAPI style); `message` is accepted too.
fn server_message(body: &Value) -> Option<String> {
    body.get("detail")
        .or_else(|| body.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string)
}
