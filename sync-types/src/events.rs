//! Event channel frames.
//!
//! Every frame on the duplex connection is a JSON object
//! `{"event": "<name>", "data": <payload>}`. Client→server and server→client
//! events are separate enums so neither side can emit the other's events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ClientMessageId, ConversationId, ConversationKind, Message, SyncError, UserId};

/// Raw frame before the payload is interpreted.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Frame {
    event: String,
    #[serde(default)]
    data: Value,
}

fn encode(event: &str, data: Value) -> Result<String, SyncError> {
    serde_json::to_string(&Frame {
        event: event.to_string(),
        data,
    })
    .map_err(SyncError::Serialization)
}

fn payload<T: Serialize>(value: &T) -> Result<Value, SyncError> {
    serde_json::to_value(value).map_err(SyncError::Serialization)
}

fn decode_payload<T: for<'de> Deserialize<'de>>(data: Value) -> Result<T, SyncError> {
    serde_json::from_value(data).map_err(SyncError::Deserialization)
}

/// Reference to a conversation room.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRef {
    /// Conversation id.
    pub conversation_id: ConversationId,
    /// Conversation kind.
    pub kind: ConversationKind,
}

impl RoomRef {
    /// Build a room reference.
    pub fn new(conversation_id: ConversationId, kind: ConversationKind) -> Self {
        Self {
            conversation_id,
            kind,
        }
    }
}

/// Payload of `message:new`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    /// Target conversation.
    pub conversation_id: ConversationId,
    /// Raw text.
    pub content: String,
    /// Target conversation kind.
    pub kind: ConversationKind,
    /// Idempotency key echoed back in the acknowledgment.
    pub client_id: ClientMessageId,
}

/// Events sent by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// `conversation:join`
    Join(RoomRef),
    /// `conversation:leave`
    Leave(RoomRef),
    /// `message:new`
    NewMessage(NewMessage),
    /// `typing:start`
    TypingStart(RoomRef),
    /// `typing:stop`
    TypingStop(RoomRef),
    /// `message:read`
    Read(RoomRef),
}

impl ClientEvent {
    /// Wire name of this event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Join(_) => "conversation:join",
            Self::Leave(_) => "conversation:leave",
            Self::NewMessage(_) => "message:new",
            Self::TypingStart(_) => "typing:start",
            Self::TypingStop(_) => "typing:stop",
            Self::Read(_) => "message:read",
        }
    }

    /// Encode as a JSON frame.
    pub fn to_json(&self) -> Result<String, SyncError> {
        let data = match self {
            Self::Join(room)
            | Self::Leave(room)
            | Self::TypingStart(room)
            | Self::TypingStop(room)
            | Self::Read(room) => payload(room)?,
            Self::NewMessage(msg) => payload(msg)?,
        };
        encode(self.name(), data)
    }

    /// Decode a JSON frame.
    pub fn from_json(text: &str) -> Result<Self, SyncError> {
        let frame: Frame = serde_json::from_str(text).map_err(SyncError::Deserialization)?;
        match frame.event.as_str() {
            "conversation:join" => Ok(Self::Join(decode_payload(frame.data)?)),
            "conversation:leave" => Ok(Self::Leave(decode_payload(frame.data)?)),
            "message:new" => Ok(Self::NewMessage(decode_payload(frame.data)?)),
            "typing:start" => Ok(Self::TypingStart(decode_payload(frame.data)?)),
            "typing:stop" => Ok(Self::TypingStop(decode_payload(frame.data)?)),
            "message:read" => Ok(Self::Read(decode_payload(frame.data)?)),
            _ => Err(SyncError::UnknownEvent(frame.event)),
        }
    }
}

/// Payload of `typing:update`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingUpdate {
    /// Conversation the user is typing in.
    pub conversation_id: ConversationId,
    /// Typing user.
    pub user_id: UserId,
    /// Display name of the typing user.
    pub username: String,
    /// Started (true) or stopped (false).
    pub is_typing: bool,
}

/// Payload of `message:status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageStatus {
    /// Conversation whose messages were read.
    pub conversation_id: ConversationId,
    /// Read timestamp.
    pub read_at: DateTime<Utc>,
}

/// Payload of `conversation:updated`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationUpdate {
    /// Conversation id.
    pub id: ConversationId,
    /// New preview text.
    #[serde(default)]
    pub last_message: Option<String>,
    /// New recency key.
    pub updated_at: DateTime<Utc>,
}

/// Events pushed by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// `users:online`: full replacement of the online set.
    UsersOnline(Vec<UserId>),
    /// `message:received`
    MessageReceived(Message),
    /// `typing:update`
    TypingUpdate(TypingUpdate),
    /// `message:status`
    MessageStatus(MessageStatus),
    /// `conversation:updated`
    ConversationUpdated(ConversationUpdate),
    /// `notification:new`: payload is opaque to the engine.
    NotificationNew(Value),
}

impl ServerEvent {
    /// The subscription key for this event.
    pub fn event_type(&self) -> EventType {
        match self {
            Self::UsersOnline(_) => EventType::UsersOnline,
            Self::MessageReceived(_) => EventType::MessageReceived,
            Self::TypingUpdate(_) => EventType::TypingUpdate,
            Self::MessageStatus(_) => EventType::MessageStatus,
            Self::ConversationUpdated(_) => EventType::ConversationUpdated,
            Self::NotificationNew(_) => EventType::NotificationNew,
        }
    }

    /// Encode as a JSON frame.
    pub fn to_json(&self) -> Result<String, SyncError> {
        let data = match self {
            Self::UsersOnline(ids) => payload(ids)?,
            Self::MessageReceived(msg) => payload(msg)?,
            Self::TypingUpdate(update) => payload(update)?,
            Self::MessageStatus(status) => payload(status)?,
            Self::ConversationUpdated(update) => payload(update)?,
            Self::NotificationNew(value) => value.clone(),
        };
        encode(self.event_type().name(), data)
    }

    /// Decode a JSON frame.
    pub fn from_json(text: &str) -> Result<Self, SyncError> {
        let frame: Frame = serde_json::from_str(text).map_err(SyncError::Deserialization)?;
        let event_type = EventType::from_name(&frame.event)
            .ok_or_else(|| SyncError::UnknownEvent(frame.event.clone()))?;
        let data = frame.data;
        Ok(match event_type {
            EventType::UsersOnline => Self::UsersOnline(decode_payload(data)?),
            EventType::MessageReceived => Self::MessageReceived(decode_payload(data)?),
            EventType::TypingUpdate => Self::TypingUpdate(decode_payload(data)?),
            EventType::MessageStatus => Self::MessageStatus(decode_payload(data)?),
            EventType::ConversationUpdated => Self::ConversationUpdated(decode_payload(data)?),
            EventType::NotificationNew => Self::NotificationNew(data),
        })
    }
}

/// Server event kinds, used as subscription keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// `users:online`
    UsersOnline,
    /// `message:received`
    MessageReceived,
    /// `typing:update`
    TypingUpdate,
    /// `message:status`
    MessageStatus,
    /// `conversation:updated`
    ConversationUpdated,
    /// `notification:new`
    NotificationNew,
}

impl EventType {
    /// All server event kinds.
    pub const ALL: [EventType; 6] = [
        EventType::UsersOnline,
        EventType::MessageReceived,
        EventType::TypingUpdate,
        EventType::MessageStatus,
        EventType::ConversationUpdated,
        EventType::NotificationNew,
    ];

    /// Wire name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::UsersOnline => "users:online",
            Self::MessageReceived => "message:received",
            Self::TypingUpdate => "typing:update",
            Self::MessageStatus => "message:status",
            Self::ConversationUpdated => "conversation:updated",
            Self::NotificationNew => "notification:new",
        }
    }

    /// Look up a kind by wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.name() == name)
    }
}
