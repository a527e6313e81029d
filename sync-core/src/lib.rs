//! # sync-core
//!
//! Pure logic for Huddle conversation sync (no I/O, instant tests).
//!
//! This crate implements the stores, trackers and state machines that keep a
//! client's view of its conversations consistent, without any network or
//! timer I/O.
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - they take input and produce output
//! without side effects. This enables:
//! - Instant unit tests (no mocks, no async)
//! - Deterministic behavior (same input → same output)
//! - Easy reasoning about state transitions
//!
//! Time enters as an argument (`now`) and timers leave as instructions
//! ([`TypingInstruction`], [`Action::StartReconnectTimer`]). The actual I/O is
//! performed by `sync-client`, which interprets the actions produced here.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod buffer;
pub mod controller;
pub mod conversation_store;
pub mod grouping;
pub mod message_store;
pub mod presence;
pub mod state;
pub mod system_message;
pub mod typing;

pub use buffer::{BufferError, PendingBuffer, DEFAULT_BUFFER_CAPACITY};
pub use controller::{
    ControllerAction, ControllerEvent, ControllerState, RequestId, SyncController,
};
pub use conversation_store::ConversationStore;
pub use grouping::{group_messages, MessageGroup, MAX_GROUP_SIZE};
pub use message_store::{MessageStore, Reconciled};
pub use presence::PresenceTracker;
pub use state::{calculate_backoff, Action, ChannelEvent, ConnectionState, Event};
pub use system_message::SystemEvent;
pub use typing::{TypingEntry, TypingInstruction, TypingTracker, DEFAULT_TYPING_TIMEOUT};
