//! EventChannel - the authenticated duplex connection to the chat server.
//!
//! The channel owns a [`Transport`] and drives it with the pure
//! [`ConnectionState`] machine from sync-core:
//!
//! ```text
//! caller ──▶ EventChannel ──▶ Transport ──▶ server
//!                │  ▲
//!                ▼  │ actions
//!          ConnectionState (pure)
//! ```
//!
//! While connected, one background task waits in `Transport::recv()`,
//! decodes each frame and hands it to the handlers subscribed to its event
//! type. When `recv()` fails the drop is fed to the state machine, which
//! schedules reconnect attempts with exponential backoff.
//!
//! Room membership does not survive a drop. It is cleared, and after
//! [`ChannelEvent::Reconnected`] the caller decides which rooms to re-join.

use futures_util::future::BoxFuture;
use huddle_sync_core::{Action, ChannelEvent, ConnectionState, Event};
use huddle_sync_types::{
    ClientEvent, ConversationId, ConversationKind, EventType, NewMessage, RoomRef, ServerEvent,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, Weak};
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::transport::{Transport, TransportError};

/// Capacity of the connection event broadcast.
const CONNECTION_EVENT_CAPACITY: usize = 64;

type Handler = Arc<dyn Fn(&ServerEvent) + Send + Sync>;

/// Handlers keyed by event type.
#[derive(Default)]
struct HandlerRegistry {
    next_id: AtomicU64,
    handlers: std::sync::Mutex<HashMap<EventType, Vec<(u64, Handler)>>>,
}

impl HandlerRegistry {
    fn add(&self, event_type: EventType, handler: Handler) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(event_type)
            .or_default()
            .push((id, handler));
        id
    }

    fn remove(&self, event_type: EventType, id: u64) {
        let mut handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(list) = handlers.get_mut(&event_type) {
            list.retain(|(handler_id, _)| *handler_id != id);
        }
    }

    fn clear(&self) {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn dispatch(&self, event: &ServerEvent) -> usize {
        // Call outside the lock so handlers may subscribe or unsubscribe.
        let handlers: Vec<Handler> = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event.event_type())
            .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();
        for handler in &handlers {
            handler(event);
        }
        handlers.len()
    }
}

/// Registration returned by [`EventChannel::subscribe`].
///
/// The handler stays registered until this is dropped or disposed.
#[must_use = "dropping a Subscription unregisters its handler"]
pub struct Subscription {
    registry: Weak<HandlerRegistry>,
    event_type: EventType,
    id: u64,
}

impl Subscription {
    /// Event type this subscription listens to.
    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    /// Unregister the handler.
    pub fn dispose(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.event_type, self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("event_type", &self.event_type)
            .field("id", &self.id)
            .finish()
    }
}

struct ChannelInner<T: Transport> {
    transport: T,
    url: String,
    token: std::sync::Mutex<Option<String>>,
    state: Mutex<ConnectionState>,
    rooms: std::sync::Mutex<HashMap<ConversationId, ConversationKind>>,
    handlers: Arc<HandlerRegistry>,
    connection_tx: broadcast::Sender<ChannelEvent>,
    shutdown: CancellationToken,
    session: std::sync::Mutex<Option<CancellationToken>>,
    reconnect: std::sync::Mutex<Option<CancellationToken>>,
}

impl<T: Transport + 'static> ChannelInner<T> {
    async fn transition(&self, event: Event) -> Vec<Action> {
        let mut state = self.state.lock().await;
        let (new_state, actions) = state.clone().on_event(event);
        *state = new_state;
        actions
    }

    fn token(&self) -> String {
        self.token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_default()
    }

    fn clear_rooms(&self) {
        self.rooms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn emit(&self, event: ChannelEvent) {
        match &event {
            ChannelEvent::Connected => info!(url = %self.url, "event channel connected"),
            ChannelEvent::Reconnected => info!(url = %self.url, "event channel reconnected"),
            ChannelEvent::ConnectionFailed { error } => {
                warn!(url = %self.url, %error, "event channel connect failed")
            }
            ChannelEvent::Disconnected { reason } => {
                info!(url = %self.url, %reason, "event channel disconnected")
            }
            ChannelEvent::Reconnecting { attempt, delay } => {
                info!(attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnect")
            }
            ChannelEvent::ReconnectFailed { attempt, error } => {
                warn!(attempt, %error, "reconnect attempt failed")
            }
        }
        // No receivers is fine.
        let _ = self.connection_tx.send(event);
    }
}

/// Store `next` in `slot`, cancelling whatever was there.
fn replace_token(slot: &std::sync::Mutex<Option<CancellationToken>>, next: Option<CancellationToken>) {
    let previous = std::mem::replace(
        &mut *slot.lock().unwrap_or_else(PoisonError::into_inner),
        next,
    );
    if let Some(previous) = previous {
        previous.cancel();
    }
}

/// Execute state machine actions until none remain.
///
/// Returns the error of a failed initial connect, if one happened.
fn drive<T: Transport + 'static>(
    inner: Arc<ChannelInner<T>>,
    actions: Vec<Action>,
) -> BoxFuture<'static, Result<(), TransportError>> {
    Box::pin(async move {
        let mut queue: VecDeque<Action> = actions.into();
        let mut result = Ok(());

        while let Some(action) = queue.pop_front() {
            match action {
                Action::Connect => {
                    let token = inner.token();
                    match inner.transport.connect(&inner.url, &token).await {
                        Ok(()) => {
                            queue.extend(inner.transition(Event::ConnectSucceeded).await);
                            if inner.state.lock().await.is_connected() {
                                let session = inner.shutdown.child_token();
                                replace_token(&inner.session, Some(session.clone()));
                                tokio::spawn(receive_loop(Arc::clone(&inner), session));
                            } else {
                                // Disconnect was requested while connecting.
                                let _ = inner.transport.close().await;
                            }
                        }
                        Err(e) => {
                            let event = Event::ConnectFailed {
                                error: e.to_string(),
                            };
                            queue.extend(inner.transition(event).await);
                        }
                    }
                }
                Action::Disconnect => {
                    replace_token(&inner.session, None);
                    if let Err(e) = inner.transport.close().await {
                        debug!(error = %e, "transport close failed");
                    }
                }
                Action::ClearRooms => inner.clear_rooms(),
                Action::StartReconnectTimer { delay } => {
                    let timer = inner.shutdown.child_token();
                    replace_token(&inner.reconnect, Some(timer.clone()));
                    let inner = Arc::clone(&inner);
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = timer.cancelled() => {}
                            _ = tokio::time::sleep(delay) => {
                                let actions = inner.transition(Event::ReconnectTimer).await;
                                let _ = drive(inner, actions).await;
                            }
                        }
                    });
                }
                Action::CancelReconnect => replace_token(&inner.reconnect, None),
                Action::EmitEvent(event) => {
                    if let ChannelEvent::ConnectionFailed { error } = &event {
                        result = Err(TransportError::ConnectionFailed(error.clone()));
                    }
                    inner.emit(event);
                }
            }
        }
        result
    })
}

async fn receive_loop<T: Transport + 'static>(inner: Arc<ChannelInner<T>>, session: CancellationToken) {
    loop {
        let frame = tokio::select! {
            _ = session.cancelled() => return,
            frame = inner.transport.recv() => frame,
        };
        match frame {
            Ok(text) => match ServerEvent::from_json(&text) {
                Ok(event) => {
                    let delivered = inner.handlers.dispatch(&event);
                    debug!(event = event.event_type().name(), delivered, "server event");
                }
                Err(e) => warn!(error = %e, "ignoring undecodable frame"),
            },
            Err(e) => {
                if session.is_cancelled() {
                    return;
                }
                warn!(error = %e, "event channel dropped");
                let actions = inner
                    .transition(Event::Dropped {
                        reason: e.to_string(),
                    })
                    .await;
                let _ = drive(inner, actions).await;
                return;
            }
        }
    }
}

/// The event channel.
///
/// Dropping the channel stops its background tasks.
pub struct EventChannel<T: Transport + 'static> {
    inner: Arc<ChannelInner<T>>,
}

impl<T: Transport + 'static> EventChannel<T> {
    /// Create a channel that will connect to `url` over `transport`.
    pub fn new(transport: T, url: impl Into<String>) -> Self {
        let (connection_tx, _) = broadcast::channel(CONNECTION_EVENT_CAPACITY);
        Self {
            inner: Arc::new(ChannelInner {
                transport,
                url: url.into(),
                token: std::sync::Mutex::new(None),
                state: Mutex::new(ConnectionState::new()),
                rooms: std::sync::Mutex::new(HashMap::new()),
                handlers: Arc::new(HandlerRegistry::default()),
                connection_tx,
                shutdown: CancellationToken::new(),
                session: std::sync::Mutex::new(None),
                reconnect: std::sync::Mutex::new(None),
            }),
        }
    }

    /// Access the underlying transport.
    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    /// Connect, authenticating with `token`.
    ///
    /// A failed initial connect is returned, not retried. Once connected,
    /// drops are retried in the background with backoff. Connecting while
    /// already connected is a no-op.
    pub async fn connect(&self, token: &str) -> Result<(), TransportError> {
        *self
            .inner
            .token
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(token.to_string());
        let actions = self.inner.transition(Event::ConnectRequested).await;
        drive(Arc::clone(&self.inner), actions).await
    }

    /// Disconnect and stop reconnecting.
    pub async fn disconnect(&self) -> Result<(), TransportError> {
        let actions = self.inner.transition(Event::DisconnectRequested).await;
        drive(Arc::clone(&self.inner), actions).await
    }

    /// Current connection state.
    pub async fn state(&self) -> ConnectionState {
        self.inner.state.lock().await.clone()
    }

    /// Check if connected.
    pub async fn is_connected(&self) -> bool {
        self.inner.state.lock().await.is_connected()
    }

    /// Lifecycle notifications (connected, dropped, reconnecting, ...).
    pub fn connection_events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.inner.connection_tx.subscribe()
    }

    /// Register `handler` for every server event of `event_type`.
    ///
    /// Handlers run on the channel's receive task and must not block.
    pub fn subscribe<F>(&self, event_type: EventType, handler: F) -> Subscription
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        let id = self.inner.handlers.add(event_type, Arc::new(handler));
        Subscription {
            registry: Arc::downgrade(&self.inner.handlers),
            event_type,
            id,
        }
    }

    /// Join a conversation room. Joining a joined room sends nothing.
    pub async fn join_conversation(
        &self,
        conversation_id: &ConversationId,
        kind: ConversationKind,
    ) -> Result<(), TransportError> {
        if self.is_joined(conversation_id) {
            return Ok(());
        }
        self.emit(&ClientEvent::Join(RoomRef::new(conversation_id.clone(), kind)))
            .await?;
        self.inner
            .rooms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(conversation_id.clone(), kind);
        debug!(conversation = %conversation_id, "joined room");
        Ok(())
    }

    /// Leave a conversation room. Leaving a room not joined sends nothing.
    pub async fn leave_conversation(
        &self,
        conversation_id: &ConversationId,
        kind: ConversationKind,
    ) -> Result<(), TransportError> {
        if !self.is_joined(conversation_id) {
            return Ok(());
        }
        self.emit(&ClientEvent::Leave(RoomRef::new(conversation_id.clone(), kind)))
            .await?;
        self.inner
            .rooms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(conversation_id);
        debug!(conversation = %conversation_id, "left room");
        Ok(())
    }

    /// Whether the room is currently joined.
    pub fn is_joined(&self, conversation_id: &ConversationId) -> bool {
        self.inner
            .rooms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(conversation_id)
    }

    /// Rooms currently joined.
    pub fn joined_rooms(&self) -> Vec<RoomRef> {
        self.inner
            .rooms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, kind)| RoomRef::new(id.clone(), *kind))
            .collect()
    }

    /// Send a message. Not retried on failure.
    pub async fn send_message(&self, message: NewMessage) -> Result<(), TransportError> {
        self.emit(&ClientEvent::NewMessage(message)).await
    }

    /// Announce that the local user started or stopped typing.
    pub async fn set_typing(
        &self,
        conversation_id: &ConversationId,
        kind: ConversationKind,
        is_typing: bool,
    ) -> Result<(), TransportError> {
        let room = RoomRef::new(conversation_id.clone(), kind);
        let event = if is_typing {
            ClientEvent::TypingStart(room)
        } else {
            ClientEvent::TypingStop(room)
        };
        self.emit(&event).await
    }

    /// Mark a conversation read.
    pub async fn mark_read(
        &self,
        conversation_id: &ConversationId,
        kind: ConversationKind,
    ) -> Result<(), TransportError> {
        self.emit(&ClientEvent::Read(RoomRef::new(conversation_id.clone(), kind)))
            .await
    }

    /// Tear the channel down: stop the receive task and any reconnect,
    /// close the transport and drop all handlers.
    pub async fn dispose(&self) {
        self.inner.shutdown.cancel();
        *self.inner.state.lock().await = ConnectionState::Disconnected;
        if let Err(e) = self.inner.transport.close().await {
            debug!(error = %e, "transport close failed");
        }
        self.inner.clear_rooms();
        self.inner.handlers.clear();
    }

    async fn emit(&self, event: &ClientEvent) -> Result<(), TransportError> {
        if !self.is_connected().await {
            return Err(TransportError::NotConnected);
        }
        let frame = event.to_json()?;
        self.inner.transport.send(&frame).await.map_err(|e| {
            warn!(event = event.name(), error = %e, "send failed");
            e
        })
    }
}

impl<T: Transport + 'static> Drop for EventChannel<T> {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

impl<T: Transport + 'static> std::fmt::Debug for EventChannel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventChannel")
            .field("url", &self.inner.url)
            .field("token", &"[REDACTED]")
            .finish()
    }
}
