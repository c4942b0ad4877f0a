//! Typed wrappers over the gateway, one per consumed backend endpoint.

use std::sync::Arc;

use serde_json::{Value, json};

use crate::gateway::{Gateway, GatewayError, MultipartForm};
use crate::types::{
    AuthResponse, ChatRequest, ChatResponse, IngestResponse, SessionResponse, SourceKind,
    UserClaims,
};

/// Backend endpoint paths.
pub mod paths {
    pub const AUTH_LOGIN: &str = "/auth/login";
    pub const AUTH_SIGNUP: &str = "/auth/signup";
    pub const AUTH_ME: &str = "/auth/me";
    pub const SESSION_CREATE: &str = "/session/create";
    pub const CHAT_QUERY: &str = "/v1/chat/query";
    pub const INGEST_FILE: &str = "/ingest/file";
    pub const INGEST_URL: &str = "/ingest/url";
    pub const ADMIN_STATS: &str = "/admin/stats";
    pub const ADMIN_DOCUMENTS: &str = "/admin/documents";
}

#[derive(Clone)]
pub struct Api {
    gateway: Arc<Gateway>,
}

impl Api {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    pub async fn login(
        &self,
        username: &str,
        password: &str,
    ) -> Result<AuthResponse, GatewayError> {
        self.gateway
            .post(
                paths::AUTH_LOGIN,
                &json!({ "username": username, "password": password }),
            )
            .await
    }

    pub async fn signup(
        &self,
        username: &str,
        password: &str,
    ) -> Result<AuthResponse, GatewayError> {
        self.gateway
            .post(
                paths::AUTH_SIGNUP,
                &json!({ "username": username, "password": password }),
            )
            .await
    }

    /// Verifies the current credential and returns its decoded claims.
    pub async fn whoami(&self) -> Result<UserClaims, GatewayError> {
        self.gateway.get(paths::AUTH_ME, &[], false).await
    }

    pub async fn create_session(&self, user_id: &str) -> Result<SessionResponse, GatewayError> {
        self.gateway
            .post(paths::SESSION_CREATE, &json!({ "user_id": user_id }))
            .await
    }

    pub async fn chat_query(&self, request: &ChatRequest) -> Result<ChatResponse, GatewayError> {
        self.gateway.post(paths::CHAT_QUERY, request).await
    }

    pub async fn ingest_file(
        &self,
        file_name: &str,
        bytes: Vec<u8>,
        user_id: &str,
    ) -> Result<IngestResponse, GatewayError> {
        let form = MultipartForm {
            file_field: "file".to_string(),
            file_name: file_name.to_string(),
            bytes,
            fields: vec![("user_id".to_string(), user_id.to_string())],
        };
        self.gateway.upload(paths::INGEST_FILE, form).await
    }

    pub async fn ingest_url(
        &self,
        url: &str,
        kind: SourceKind,
        user_id: &str,
    ) -> Result<IngestResponse, GatewayError> {
        self.gateway
            .post(
                paths::INGEST_URL,
                &json!({ "url": url, "type": kind.as_str(), "user_id": user_id }),
            )
            .await
    }

    /// Corpus-wide statistics for the admin screens. Cached until logout.
    pub async fn admin_stats(&self) -> Result<Value, GatewayError> {
        self.gateway.get(paths::ADMIN_STATS, &[], true).await
    }

    /// Document inventory for the admin screens. Cached per page until
    /// logout.
    pub async fn admin_documents(
        &self,
        query: &[(String, String)],
    ) -> Result<Value, GatewayError> {
        self.gateway.get(paths::ADMIN_DOCUMENTS, query, true).await
    }
}
