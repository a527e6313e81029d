//! reqwest-backed snapshot API.

use super::{ApiError, SnapshotApi, StartConversationRequest, StartedConversation};
use async_trait::async_trait;
use huddle_sync_types::{Conversation, ConversationId, ConversationKind, Message};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;

/// Snapshot API over HTTP.
#[derive(Clone)]
pub struct HttpSnapshotApi {
    client: Client,
    base_url: String,
    token: String,
}

impl HttpSnapshotApi {
    /// Create a client for `base_url` (e.g. `https://chat.example/api`).
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url, token)
    }

    /// Create a client reusing an existing `reqwest::Client`.
    pub fn with_client(
        client: Client,
        base_url: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            client,
            base_url,
            token: token.into(),
        }
    }

    /// Base URL without trailing slash.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn conversation_path(kind: ConversationKind, id: &ConversationId) -> String {
        format!("/conversations/{}/{}", kind.as_str(), id)
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        what: &str,
        request: RequestBuilder,
    ) -> Result<T, ApiError> {
        let response = request.bearer_auth(&self.token).send().await?;
        let response = check_status(what, response).await?;
        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| ApiError::InvalidResponse(e.to_string()))
    }
}

async fn check_status(what: &str, response: Response) -> Result<Response, ApiError> {
    let status = response.status();
    debug!(%status, request = what, "snapshot response");
    if status.is_success() {
        return Ok(response);
    }
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ApiError::Unauthorized),
        StatusCode::NOT_FOUND => Err(ApiError::NotFound(what.to_string())),
        _ => Err(ApiError::Status {
            status: status.as_u16(),
            message: response.text().await.unwrap_or_default(),
        }),
    }
}

impl std::fmt::Debug for HttpSnapshotApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSnapshotApi")
            .field("base_url", &self.base_url)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

#[async_trait]
impl SnapshotApi for HttpSnapshotApi {
    async fn list_conversations(&self) -> Result<Vec<Conversation>, ApiError> {
        let request = self.client.get(self.url("/conversations"));
        self.execute("conversations", request).await
    }

    async fn get_conversation(
        &self,
        kind: ConversationKind,
        id: &ConversationId,
    ) -> Result<Conversation, ApiError> {
        let path = Self::conversation_path(kind, id);
        let request = self.client.get(self.url(&path));
        self.execute(&path, request).await
    }

    async fn list_messages(
        &self,
        kind: ConversationKind,
        id: &ConversationId,
    ) -> Result<Vec<Message>, ApiError> {
        let path = format!("{}/messages", Self::conversation_path(kind, id));
        let request = self.client.get(self.url(&path));
        self.execute(&path, request).await
    }

    async fn start_conversation(
        &self,
        body: &StartConversationRequest,
    ) -> Result<StartedConversation, ApiError> {
        let request = self.client.post(self.url("/conversations")).json(body);
        self.execute("start conversation", request).await
    }
}
