//! REST snapshot API.
//!
//! Snapshots give the authoritative state of the conversation list and of
//! one conversation's messages. Every request carries the bearer token.
//!
//! | Operation             | Request                                   |
//! |-----------------------|-------------------------------------------|
//! | `list_conversations`  | `GET /conversations`                      |
//! | `get_conversation`    | `GET /conversations/{kind}/{id}`          |
//! | `list_messages`       | `GET /conversations/{kind}/{id}/messages` |
//! | `start_conversation`  | `POST /conversations`                     |

mod http;
mod mock;

pub use http::HttpSnapshotApi;
pub use mock::MockSnapshotApi;

use async_trait::async_trait;
use huddle_sync_types::{Conversation, ConversationId, ConversationKind, Message, UserId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// REST errors.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The request could not be sent or its body could not be read.
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The token was rejected.
    #[error("unauthorized")]
    Unauthorized,

    /// The resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Any other non-success status.
    #[error("server returned {status}: {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, if any.
        message: String,
    },

    /// The body did not match the expected shape.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Body of `POST /conversations`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartConversationRequest {
    /// User to message.
    pub recipient_id: UserId,
    /// First message.
    pub initial_message: String,
}

/// Response of `POST /conversations`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartedConversation {
    /// The created (or existing) direct conversation.
    pub conversation: Conversation,
    /// The persisted initial message.
    pub message: Message,
}

/// Source of REST snapshots.
#[async_trait]
pub trait SnapshotApi: Send + Sync {
    /// Fetch every conversation of the local user.
    async fn list_conversations(&self) -> Result<Vec<Conversation>, ApiError>;

    /// Fetch one conversation summary.
    async fn get_conversation(
        &self,
        kind: ConversationKind,
        id: &ConversationId,
    ) -> Result<Conversation, ApiError>;

    /// Fetch a conversation's messages, oldest first.
    async fn list_messages(
        &self,
        kind: ConversationKind,
        id: &ConversationId,
    ) -> Result<Vec<Message>, ApiError>;

    /// Create a direct conversation by sending its first message.
    async fn start_conversation(
        &self,
        request: &StartConversationRequest,
    ) -> Result<StartedConversation, ApiError>;
}
