//! Conversation and message records shared by the REST snapshots and the
//! event channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ClientMessageId, ConversationId, MessageId, TeamId, UserId};

/// Whether a conversation is one-to-one or scoped to a team.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    /// Direct message between two users.
    Direct,
    /// Team-wide channel.
    Team,
}

impl ConversationKind {
    /// Path segment / wire name for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Team => "team",
        }
    }
}

impl std::fmt::Display for ConversationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ConversationKind {
    type Err = crate::SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "direct" | "dm" => Ok(Self::Direct),
            "team" => Ok(Self::Team),
            other => Err(crate::SyncError::InvalidData(format!(
                "unknown conversation kind: {other}"
            ))),
        }
    }
}

/// Who is on the other side of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Counterpart {
    /// The other participant of a direct conversation.
    User {
        /// User id.
        id: UserId,
        /// Display name.
        username: String,
    },
    /// The team owning a team conversation.
    Team {
        /// Team id.
        id: TeamId,
        /// Team name.
        name: String,
    },
}

impl Counterpart {
    /// Human-readable label.
    pub fn display_name(&self) -> &str {
        match self {
            Self::User { username, .. } => username,
            Self::Team { name, .. } => name,
        }
    }

    /// Whether both refer to the same user or team, ignoring display names.
    pub fn is_same_party(&self, other: &Counterpart) -> bool {
        match (self, other) {
            (Self::User { id: a, .. }, Self::User { id: b, .. }) => a == b,
            (Self::Team { id: a, .. }, Self::Team { id: b, .. }) => a == b,
            _ => false,
        }
    }
}

/// Summary of a conversation as shown in the conversation list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    /// Conversation id.
    pub id: ConversationId,
    /// Direct or team.
    pub kind: ConversationKind,
    /// The other party.
    pub counterpart: Counterpart,
    /// Content of the most recent message, if any.
    #[serde(default)]
    pub last_message_preview: Option<String>,
    /// Recency key used for ordering.
    pub updated_at: DateTime<Utc>,
    /// Messages not yet seen by the local user.
    #[serde(default)]
    pub unread_count: u32,
    /// Local placeholder that has no persisted message yet.
    #[serde(default)]
    pub is_virtual: bool,
}

impl Conversation {
    /// Create a local placeholder for a conversation that does not exist
    /// on the server yet.
    pub fn virtual_placeholder(
        id: ConversationId,
        kind: ConversationKind,
        counterpart: Counterpart,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            kind,
            counterpart,
            last_message_preview: None,
            updated_at: now,
            unread_count: 0,
            is_virtual: true,
        }
    }
}

/// A chat message.
///
/// `content` is raw text; it may encode a system event (see the core crate's
/// system message parser).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Temporary id while optimistic, server id afterwards.
    pub id: MessageId,
    /// Owning conversation.
    pub conversation_id: ConversationId,
    /// Author.
    pub sender_id: UserId,
    /// Author display name, when the server includes it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    /// Raw text.
    pub content: String,
    /// Server (or local, for optimistic entries) creation time.
    pub created_at: DateTime<Utc>,
    /// When the recipient read it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
    /// Idempotency key echoed back by the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<ClientMessageId>,
    /// Locally inserted, awaiting acknowledgment.
    #[serde(default, skip_serializing)]
    pub is_optimistic: bool,
    /// The send was rejected; the caller decides whether to retry or abandon.
    #[serde(default, skip_serializing)]
    pub failed: bool,
}

impl Message {
    /// Build the optimistic entry for an outgoing message.
    pub fn optimistic(
        client_id: ClientMessageId,
        conversation_id: ConversationId,
        sender_id: UserId,
        content: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: MessageId::temporary(&client_id),
            conversation_id,
            sender_id,
            sender_name: None,
            content: content.into(),
            created_at: now,
            read_at: None,
            client_id: Some(client_id),
            is_optimistic: true,
            failed: false,
        }
    }
}
