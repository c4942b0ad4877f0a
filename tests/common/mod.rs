//! Shared test harness: a scripted transport standing in for the backend,
//! plus a fully wired service stack over in-memory storage.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use nightjar::auth::AuthManager;
use nightjar::chat::ChatService;
use nightjar::clock::ManualClock;
use nightjar::gateway::{
    BackendRequest, BackendResponse, Gateway, HttpBackend, RequestBody, TransportError,
};
use nightjar::session::SessionManager;
use nightjar::storage::MemoryStore;

pub const START_TIME: u64 = 1_000_000;

#[derive(Clone, Debug)]
pub enum Stub {
    Status(u16, Value),
    /// Simulates no response received at all.
    Fail,
}

/// Scripted [`HttpBackend`]. Routes are keyed `"METHOD /path"`; each stubbed
/// response is consumed in order and the last one repeats. Calls, request
/// bodies and bearer tokens are recorded for assertions.
#[derive(Default)]
pub struct MockBackend {
    scripts: Mutex<HashMap<String, VecDeque<Stub>>>,
    delays: Mutex<HashMap<String, Duration>>,
    calls: Mutex<Vec<String>>,
    bodies: Mutex<HashMap<String, Value>>,
    bearers: Mutex<HashMap<String, Option<String>>>,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn stub(&self, route: &str, status: u16, body: Value) {
        self.scripts
            .lock()
            .unwrap()
            .entry(route.to_string())
            .or_default()
            .push_back(Stub::Status(status, body));
    }

    pub fn stub_fail(&self, route: &str) {
        self.scripts
            .lock()
            .unwrap()
            .entry(route.to_string())
            .or_default()
            .push_back(Stub::Fail);
    }

    /// Adds latency to a route so tests can force overlapping in-flight
    /// requests.
    pub fn delay(&self, route: &str, duration: Duration) {
        self.delays
            .lock()
            .unwrap()
            .insert(route.to_string(), duration);
    }

    pub fn calls_to(&self, route: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|entry| entry.as_str() == route)
            .count()
    }

    /// The JSON body of the most recent request on a route.
    pub fn last_body(&self, route: &str) -> Option<Value> {
        self.bodies.lock().unwrap().get(route).cloned()
    }

    /// The bearer token of the most recent request on a route.
    pub fn last_bearer(&self, route: &str) -> Option<String> {
        self.bearers
            .lock()
            .unwrap()
            .get(route)
            .cloned()
            .flatten()
    }
}

#[async_trait]
impl HttpBackend for MockBackend {
    async fn execute(&self, request: BackendRequest) -> Result<BackendResponse, TransportError> {
        let route = format!("{} {}", request.method, request.path);
        self.calls.lock().unwrap().push(route.clone());
        self.bearers
            .lock()
            .unwrap()
            .insert(route.clone(), request.bearer.clone());
        let recorded = match &request.body {
            RequestBody::Json(body) => body.clone(),
            RequestBody::Multipart(form) => json!({
                "file_name": form.file_name,
                "size": form.bytes.len(),
                "fields": form.fields.iter().cloned().collect::<HashMap<_, _>>(),
            }),
            RequestBody::Empty => Value::Null,
        };
        self.bodies.lock().unwrap().insert(route.clone(), recorded);

        let delay = self.delays.lock().unwrap().get(&route).copied();
        if let Some(duration) = delay {
            tokio::time::sleep(duration).await;
        }

        let stub = {
            let mut scripts = self.scripts.lock().unwrap();
            let queue = scripts
                .get_mut(&route)
                .unwrap_or_else(|| panic!("no stub registered for {route}"));
            if queue.len() > 1 {
                queue.pop_front().unwrap()
            } else {
                queue.front().cloned().unwrap_or_else(|| panic!("stub queue empty for {route}"))
            }
        };
        match stub {
            Stub::Status(status, body) => Ok(BackendResponse { status, body }),
            Stub::Fail => Err(TransportError("connection refused".to_string())),
        }
    }
}

// ============================================
// Wired stack
// ============================================

pub struct Harness {
    pub backend: Arc<MockBackend>,
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
    pub gateway: Arc<Gateway>,
    pub auth: Arc<AuthManager>,
    pub session: Arc<SessionManager>,
    pub chat: ChatService,
}

pub fn harness() -> Harness {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let backend = MockBackend::new();
    let store = Arc::new(MemoryStore::new());
    let clock = ManualClock::new(START_TIME);
    let gateway = Arc::new(Gateway::new(backend.clone(), store.clone()));
    let auth = Arc::new(AuthManager::new(gateway.clone(), store.clone()));
    let session = Arc::new(SessionManager::new(
        gateway.clone(),
        store.clone(),
        clock.clone(),
    ));
    let chat = ChatService::new(
        gateway.clone(),
        auth.clone(),
        session.clone(),
        store.clone(),
        clock.clone(),
    );
    Harness {
        backend,
        store,
        clock,
        gateway,
        auth,
        session,
        chat,
    }
}

/// Stubs the auth and session endpoints and drives the harness into a
/// logged-in state with an active session.
pub async fn authenticate(h: &Harness) {
    h.backend.stub(
        "POST /auth/login",
        200,
        json!({
            "user_id": "user-1",
            "username": "sam",
            "token": "tok-1",
            "role": "user"
        }),
    );
    h.backend.stub(
        "POST /session/create",
        200,
        json!({
            "session_id": "sess-123",
            "user_id": "user-1",
            "expires_in_seconds": 86400
        }),
    );
    let user = h.auth.login("sam", "hunter2").await.expect("login failed");
    h.session
        .create_session(&user.id)
        .await
        .expect("session creation failed");
}

pub fn chat_response(answer: &str, confidence: f64, latency_ms: u64) -> Value {
    json!({
        "answer": answer,
        "confidence": confidence,
        "warnings": [],
        "citations": ["doc-1"],
        "used_chunk_ids": ["chunk-1", "chunk-2"],
        "retrieval_trace": {"hops": 2},
        "query_understanding": {"intent": "summary"},
        "trace_id": "trace-1",
        "latency_ms": latency_ms,
        "raw_model_output": null,
        "metrics": {}
    })
}
