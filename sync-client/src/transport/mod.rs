//! Transport abstraction for the Huddle event channel.
//!
//! This module provides a pluggable transport layer that abstracts
//! the underlying duplex connection (WebSocket, mock for testing).
//!
//! # Design
//!
//! The transport trait is async and connection-oriented, and carries text
//! frames (one JSON `{"event", "data"}` object per frame):
//! - `connect()` establishes a connection, authenticating with a bearer token
//! - `send()` transmits one frame
//! - `recv()` waits for the next frame
//! - `close()` gracefully terminates
//!
//! `send()` and `recv()` must be callable concurrently: the channel keeps one
//! task parked in `recv()` while callers send.
//!
//! # Example
//!
//! ```ignore
//! let transport = MockTransport::new();
//! transport.connect("wss://chat.example/socket", "token").await?;
//! transport.send(r#"{"event":"conversation:join","data":{...}}"#).await?;
//! let frame = transport.recv().await?;
//! ```

mod mock;
mod websocket;

pub use mock::MockTransport;
pub use websocket::WebSocketTransport;

use async_trait::async_trait;
use huddle_sync_types::SyncError;
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Not connected.
    #[error("not connected")]
    NotConnected,

    /// Connection closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Send failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Receive failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// A frame could not be encoded.
    #[error("invalid frame: {0}")]
    InvalidFrame(#[from] SyncError),
}

/// Transport trait for the event channel's duplex connection.
///
/// Implementations handle the underlying connection mechanism
/// (WebSocket, mock, etc).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to the given URL, authenticating with `token`.
    async fn connect(&self, url: &str, token: &str) -> Result<(), TransportError>;

    /// Send one text frame.
    async fn send(&self, frame: &str) -> Result<(), TransportError>;

    /// Receive the next text frame.
    ///
    /// Blocks until a frame is available or the connection closes.
    async fn recv(&self) -> Result<String, TransportError>;

    /// Check if currently connected.
    fn is_connected(&self) -> bool;

    /// Close the connection gracefully.
    async fn close(&self) -> Result<(), TransportError>;
}
