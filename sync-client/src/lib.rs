//! # sync-client
//!
//! Client library for the Huddle conversation sync engine.
//!
//! This is the library applications use to keep a conversation list and an
//! open conversation in sync with the server.
//!
//! ## Features
//!
//! - **Event Channel**: WebSocket duplex with reconnect and room tracking
//! - **Snapshots**: REST fetches of conversations and messages
//! - **Race-Free Activation**: pushes during a snapshot load are buffered and merged
//! - **Optimistic Sends**: reconciled by idempotency key
//! - **Pure State Machines**: uses sync-core for side-effect-free logic
//!
//! ## Example
//!
//! ```ignore
//! use huddle_sync_client::{HttpSnapshotApi, SyncConfig, SyncEngine, WebSocketTransport};
//!
//! let config = SyncConfig::new(api_url, socket_url, token, me);
//! let api = HttpSnapshotApi::new(&config.api_url, &config.token);
//! let engine = SyncEngine::new(config, WebSocketTransport::new(), api);
//!
//! engine.connect().await?;
//! engine.refresh_conversations().await?;
//!
//! let mut events = engine.subscribe();
//! while let Ok(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod api;
pub mod channel;
pub mod config;
pub mod engine;
pub mod timers;
pub mod transport;

pub use api::{
    ApiError, HttpSnapshotApi, MockSnapshotApi, SnapshotApi, StartConversationRequest,
    StartedConversation,
};
pub use channel::{EventChannel, Subscription};
pub use config::{SyncConfig, DEFAULT_HIGHLIGHT_TIMEOUT, DEFAULT_NOTIFICATION_TIMEOUT};
pub use engine::{ClientError, EngineEvent, Notification, SyncEngine};
pub use timers::TimerRegistry;
pub use transport::{MockTransport, Transport, TransportError, WebSocketTransport};
