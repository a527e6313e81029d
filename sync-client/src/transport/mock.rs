//! Mock transport for testing.
//!
//! Allows injecting server frames and connection drops, and capturing sent
//! frames for verification.

use super::{Transport, TransportError};
use async_trait::async_trait;
use huddle_sync_types::{ClientEvent, ServerEvent};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Debug)]
enum Incoming {
    Frame(String),
    Drop(String),
}

/// Mock transport for testing.
///
/// Clones share state, so a test can keep one handle while the channel owns
/// another.
#[derive(Debug, Clone)]
pub struct MockTransport {
    inner: Arc<Mutex<MockTransportInner>>,
    incoming_tx: mpsc::UnboundedSender<Incoming>,
    incoming_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Incoming>>>,
}

#[derive(Debug, Default)]
struct MockTransportInner {
    connected: bool,
    connect_count: u32,
    connected_url: Option<String>,
    last_token: Option<String>,
    sent_frames: Vec<String>,
    failing_connects: Vec<String>,
    fail_next_send: Option<String>,
    fail_next_recv: Option<String>,
}

impl MockTransport {
    /// Create a new mock transport.
    pub fn new() -> Self {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Mutex::new(MockTransportInner::default())),
            incoming_tx,
            incoming_rx: Arc::new(tokio::sync::Mutex::new(incoming_rx)),
        }
    }

    /// Queue a raw frame to be returned by `recv()`.
    pub fn push_frame(&self, frame: impl Into<String>) {
        let _ = self.incoming_tx.send(Incoming::Frame(frame.into()));
    }

    /// Queue a server event to be returned by `recv()`.
    pub fn push_event(&self, event: &ServerEvent) {
        let frame = event.to_json().expect("server event encodes");
        self.push_frame(frame);
    }

    /// Make the pending (or next) `recv()` fail as if the connection dropped.
    pub fn drop_connection(&self, reason: &str) {
        let _ = self.incoming_tx.send(Incoming::Drop(reason.to_string()));
    }

    /// Get all frames that were sent.
    pub fn sent_frames(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner.sent_frames.clone()
    }

    /// Get all sent frames decoded as client events.
    pub fn sent_events(&self) -> Vec<ClientEvent> {
        self.sent_frames()
            .iter()
            .map(|frame| ClientEvent::from_json(frame).expect("sent frame decodes"))
            .collect()
    }

    /// Get the last frame that was sent.
    pub fn last_sent(&self) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner.sent_frames.last().cloned()
    }

    /// Forget sent frames.
    pub fn clear_sent(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.sent_frames.clear();
    }

    /// Get the URL that was connected to.
    pub fn connected_url(&self) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner.connected_url.clone()
    }

    /// Get the token presented on the last connect.
    pub fn last_token(&self) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner.last_token.clone()
    }

    /// Number of successful connects.
    pub fn connect_count(&self) -> u32 {
        let inner = self.inner.lock().unwrap();
        inner.connect_count
    }

    /// Cause the next connect() to fail with the given error.
    pub fn fail_next_connect(&self, error: &str) {
        self.fail_connects(1, error);
    }

    /// Cause the next `count` connect() calls to fail with the given error.
    pub fn fail_connects(&self, count: usize, error: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .failing_connects
            .extend(std::iter::repeat(error.to_string()).take(count));
    }

    /// Cause the next send() to fail with the given error.
    pub fn fail_next_send(&self, error: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_next_send = Some(error.to_string());
    }

    /// Cause the next recv() to fail with the given error.
    pub fn fail_next_recv(&self, error: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_next_recv = Some(error.to_string());
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, url: &str, token: &str) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();

        // Check for forced failure
        if !inner.failing_connects.is_empty() {
            let error = inner.failing_connects.remove(0);
            return Err(TransportError::ConnectionFailed(error));
        }

        inner.connected = true;
        inner.connect_count += 1;
        inner.connected_url = Some(url.to_string());
        inner.last_token = Some(token.to_string());
        Ok(())
    }

    async fn send(&self, frame: &str) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();

        if !inner.connected {
            return Err(TransportError::NotConnected);
        }

        // Check for forced failure
        if let Some(error) = inner.fail_next_send.take() {
            return Err(TransportError::SendFailed(error));
        }

        inner.sent_frames.push(frame.to_string());
        Ok(())
    }

    async fn recv(&self) -> Result<String, TransportError> {
        {
            let mut inner = self.inner.lock().unwrap();

            if !inner.connected {
                return Err(TransportError::NotConnected);
            }

            // Check for forced failure
            if let Some(error) = inner.fail_next_recv.take() {
                return Err(TransportError::ReceiveFailed(error));
            }
        }

        let mut incoming = self.incoming_rx.lock().await;
        match incoming.recv().await {
            Some(Incoming::Frame(frame)) => Ok(frame),
            Some(Incoming::Drop(reason)) => {
                self.inner.lock().unwrap().connected = false;
                Err(TransportError::ReceiveFailed(reason))
            }
            None => Err(TransportError::ConnectionClosed),
        }
    }

    fn is_connected(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.connected
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.connected = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_sync_types::{ConversationId, ConversationKind, RoomRef, UserId};

    // ===========================================
    // MockTransport Basic Tests
    // ===========================================

    #[tokio::test]
    async fn mock_transport_connects() {
        let transport = MockTransport::new();
        assert!(!transport.is_connected());

        transport.connect("ws://test/socket", "secret").await.unwrap();

        assert!(transport.is_connected());
        assert_eq!(
            transport.connected_url(),
            Some("ws://test/socket".to_string())
        );
        assert_eq!(transport.last_token(), Some("secret".to_string()));
        assert_eq!(transport.connect_count(), 1);
    }

    #[tokio::test]
    async fn mock_transport_records_sent_events() {
        let transport = MockTransport::new();
        transport.connect("ws://test", "t").await.unwrap();

        let join = ClientEvent::Join(RoomRef::new(
            ConversationId::new("c1"),
            ConversationKind::Team,
        ));
        transport.send(&join.to_json().unwrap()).await.unwrap();

        assert_eq!(transport.sent_events(), vec![join]);
    }

    #[tokio::test]
    async fn mock_transport_receives_pushed_events() {
        let transport = MockTransport::new();
        transport.connect("ws://test", "t").await.unwrap();

        let online = ServerEvent::UsersOnline(vec![UserId::new("u1")]);
        transport.push_event(&online);

        let frame = transport.recv().await.unwrap();
        assert_eq!(ServerEvent::from_json(&frame).unwrap(), online);
    }

    #[tokio::test]
    async fn drop_fails_recv_and_disconnects() {
        let transport = MockTransport::new();
        transport.connect("ws://test", "t").await.unwrap();

        transport.drop_connection("reset by peer");

        let result = transport.recv().await;
        assert!(matches!(result, Err(TransportError::ReceiveFailed(r)) if r == "reset by peer"));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn mock_transport_closes() {
        let transport = MockTransport::new();
        transport.connect("ws://test", "t").await.unwrap();
        assert!(transport.is_connected());

        transport.close().await.unwrap();
        assert!(!transport.is_connected());
    }

    // ===========================================
    // Error Condition Tests
    // ===========================================

    #[tokio::test]
    async fn send_without_connect_fails() {
        let transport = MockTransport::new();

        let result = transport.send("{}").await;
        assert!(matches!(result, Err(TransportError::NotConnected)));
    }

    #[tokio::test]
    async fn recv_without_connect_fails() {
        let transport = MockTransport::new();

        let result = transport.recv().await;
        assert!(matches!(result, Err(TransportError::NotConnected)));
    }

    #[tokio::test]
    async fn forced_connect_failures_are_consumed_in_order() {
        let transport = MockTransport::new();
        transport.fail_connects(2, "network unreachable");

        assert!(transport.connect("ws://test", "t").await.is_err());
        assert!(transport.connect("ws://test", "t").await.is_err());
        assert!(!transport.is_connected());

        transport.connect("ws://test", "t").await.unwrap();
        assert_eq!(transport.connect_count(), 1);
    }

    #[tokio::test]
    async fn forced_send_failure() {
        let transport = MockTransport::new();
        transport.connect("ws://test", "t").await.unwrap();
        transport.fail_next_send("buffer full");

        let result = transport.send("{}").await;
        assert!(matches!(result, Err(TransportError::SendFailed(_))));

        // Next send should work
        transport.send("{}").await.unwrap();
        assert_eq!(transport.sent_frames().len(), 1);
    }

    // ===========================================
    // Clone and Shared State Tests
    // ===========================================

    #[tokio::test]
    async fn mock_transport_clone_shares_state() {
        let transport1 = MockTransport::new();
        let transport2 = transport1.clone();

        transport1.connect("ws://test", "t").await.unwrap();
        assert!(transport2.is_connected());

        transport2.push_frame("hello");
        assert_eq!(transport1.recv().await.unwrap(), "hello");
    }
}
