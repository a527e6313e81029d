//! # sync-types
//!
//! Wire format types for the Huddle conversation sync engine.
//!
//! This crate provides the foundational types used across all Huddle sync crates:
//! - [`UserId`], [`TeamId`], [`ConversationId`], [`MessageId`], [`ClientMessageId`] - Identity types
//! - [`Conversation`], [`Message`] - Records shared by REST snapshots and push events
//! - [`ClientEvent`], [`ServerEvent`] - Event channel frames
//! - [`SyncError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod events;
mod ids;
mod model;

pub use error::SyncError;
pub use events::{
    ClientEvent, ConversationUpdate, EventType, MessageStatus, NewMessage, RoomRef, ServerEvent,
    TypingUpdate,
};
pub use ids::{ClientMessageId, ConversationId, MessageId, TeamId, UserId};
pub use model::{Conversation, ConversationKind, Counterpart, Message};
