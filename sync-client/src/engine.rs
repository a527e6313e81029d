//! SyncEngine - the client-facing conversation sync engine.
//!
//! The engine owns one [`EventChannel`], one [`SnapshotApi`] and every store
//! from sync-core. All state sits behind a single async mutex, so pushed
//! events, snapshot completions and caller operations are applied one at a
//! time.
//!
//! ```text
//! caller ──▶ SyncEngine ──▶ SnapshotApi (REST)
//!               │   ▲
//!               │   └── mpsc ◀── EventChannel handlers ◀── server
//!               ▼
//!      SyncController (pure) + stores
//! ```
//!
//! Controller actions that only touch state are applied under the lock in
//! the same step that produced them. Fetches and room operations run with
//! the lock released and feed their outcome back as a new controller event.
//!
//! # Example
//!
//! ```ignore
//! use huddle_sync_client::{HttpSnapshotApi, SyncConfig, SyncEngine, WebSocketTransport};
//!
//! let config = SyncConfig::new(api_url, socket_url, token, local_user);
//! let api = HttpSnapshotApi::new(&config.api_url, &config.token);
//! let engine = SyncEngine::new(config, WebSocketTransport::new(), api);
//!
//! engine.connect().await?;
//! engine.refresh_conversations().await?;
//! engine.select_conversation(conversation_id, ConversationKind::Team).await?;
//! engine.send_message("hello").await?;
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, PoisonError, Weak};

use chrono::{DateTime, Utc};
use huddle_sync_core::{
    group_messages, ChannelEvent, ConnectionState, ControllerAction, ControllerEvent,
    ControllerState, ConversationStore, MessageGroup, MessageStore, PresenceTracker, Reconciled,
    SyncController, TypingInstruction, TypingTracker,
};
use huddle_sync_types::{
    ClientMessageId, Conversation, ConversationId, ConversationKind, ConversationUpdate,
    Counterpart, EventType, Message, MessageId, MessageStatus, NewMessage, ServerEvent,
    TypingUpdate, UserId,
};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::{ApiError, SnapshotApi, StartConversationRequest};
use crate::channel::{EventChannel, Subscription};
use crate::config::SyncConfig;
use crate::timers::TimerRegistry;
use crate::transport::{Transport, TransportError};

/// Capacity of the engine event broadcast.
const ENGINE_EVENT_CAPACITY: usize = 256;

/// Engine errors.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Event channel error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// REST error.
    #[error("api error: {0}")]
    Api(#[from] ApiError),

    /// The operation needs a selected conversation.
    #[error("no active conversation")]
    NoActiveConversation,

    /// A virtual conversation has no user to start it with.
    #[error("conversation {0} has no direct recipient")]
    NoRecipient(ConversationId),

    /// Refusing to send blank text.
    #[error("message is empty")]
    EmptyMessage,
}

/// A `notification:new` payload, held until dismissed.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// Local id, increasing.
    pub id: u64,
    /// Payload as received.
    pub payload: serde_json::Value,
    /// Local receive time.
    pub received_at: DateTime<Utc>,
}

/// Change notifications broadcast to the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Event channel lifecycle.
    Connection(ChannelEvent),
    /// The conversation list changed (order, previews, unread counts).
    ConversationsChanged,
    /// A conversation's message list changed.
    MessagesChanged {
        /// Conversation.
        conversation_id: ConversationId,
    },
    /// A server message was added or acknowledged.
    MessageReceived {
        /// Conversation.
        conversation_id: ConversationId,
        /// Server id.
        message_id: MessageId,
    },
    /// Someone started or stopped typing.
    TypingChanged {
        /// Conversation.
        conversation_id: ConversationId,
    },
    /// The online set was replaced with a different one.
    PresenceChanged,
    /// The activation state machine moved.
    ControllerChanged(ControllerState),
    /// The highlighted message changed.
    HighlightChanged(Option<MessageId>),
    /// A notification arrived.
    NotificationAdded(Notification),
    /// A notification was dismissed or expired.
    NotificationDismissed {
        /// Notification id.
        id: u64,
    },
    /// An outgoing message was rejected. Its entry stays flagged as failed
    /// until abandoned.
    SendFailed {
        /// Idempotency key of the rejected message.
        client_id: ClientMessageId,
        /// Failure description.
        error: String,
    },
}

/// Pushed message ids remembered per conversation for duplicate detection.
const SEEN_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum EngineTimer {
    Typing(ConversationId, UserId),
    Highlight,
    Notification(u64),
}

struct EngineState {
    controller: SyncController,
    conversations: ConversationStore,
    messages: MessageStore,
    presence: PresenceTracker,
    typing: TypingTracker,
    highlighted: Option<MessageId>,
    notifications: Vec<Notification>,
    next_notification: u64,
    seen: HashMap<ConversationId, VecDeque<MessageId>>,
}

impl EngineState {
    fn new(config: &SyncConfig) -> Self {
        Self {
            controller: SyncController::new(config.buffer_capacity, config.rejoin_on_reconnect),
            conversations: ConversationStore::new(config.local_user.clone()),
            messages: MessageStore::new(config.local_user.clone()),
            presence: PresenceTracker::new(),
            typing: TypingTracker::with_timeout(config.local_user.clone(), config.typing_timeout),
            highlighted: None,
            notifications: Vec::new(),
            next_notification: 0,
            seen: HashMap::new(),
        }
    }

    /// Whether this push is the first delivery of `message`. Redelivered ids
    /// must not touch conversation metadata a second time.
    fn first_delivery(&mut self, message: &Message) -> bool {
        if self.messages.contains(&message.conversation_id, &message.id) {
            return false;
        }
        let seen = self.seen.entry(message.conversation_id.clone()).or_default();
        if seen.contains(&message.id) {
            return false;
        }
        if seen.len() >= SEEN_CAPACITY {
            seen.pop_front();
        }
        seen.push_back(message.id.clone());
        true
    }

    /// The selected conversation and its kind.
    fn target(&self) -> Result<(ConversationId, ConversationKind), ClientError> {
        let controller = self.controller.state();
        match (controller.conversation(), controller.kind()) {
            (Some(conversation), Some(kind)) => Ok((conversation.clone(), kind)),
            _ => Err(ClientError::NoActiveConversation),
        }
    }

    fn is_virtual(&self, conversation: &ConversationId) -> bool {
        self.conversations
            .get(conversation)
            .is_some_and(|c| c.is_virtual)
    }
}

struct EngineInner<T: Transport + 'static, A: SnapshotApi + 'static> {
    config: SyncConfig,
    channel: EventChannel<T>,
    api: A,
    state: Mutex<EngineState>,
    timers: TimerRegistry<EngineTimer>,
    events: broadcast::Sender<EngineEvent>,
    _subscriptions: Vec<Subscription>,
    inbound: std::sync::Mutex<Option<mpsc::UnboundedReceiver<ServerEvent>>>,
    pump: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<T: Transport + 'static, A: SnapshotApi + 'static> Drop for EngineInner<T, A> {
    fn drop(&mut self) {
        let pump = self.pump.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(pump) = pump.take() {
            pump.abort();
        }
    }
}

/// The conversation sync engine.
///
/// Clones share one engine. Dropping the last clone stops the event pump,
/// every timer and the event channel.
pub struct SyncEngine<T: Transport + 'static, A: SnapshotApi + 'static> {
    inner: Arc<EngineInner<T, A>>,
}

impl<T: Transport + 'static, A: SnapshotApi + 'static> Clone for SyncEngine<T, A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport + 'static, A: SnapshotApi + 'static> SyncEngine<T, A> {
    /// Create an engine. Nothing is sent until [`connect`](Self::connect).
    pub fn new(config: SyncConfig, transport: T, api: A) -> Self {
        let channel = EventChannel::new(transport, config.socket_url.clone());

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let subscriptions = EventType::ALL
            .iter()
            .map(|&event_type| {
                let tx = inbound_tx.clone();
                channel.subscribe(event_type, move |event| {
                    // Closed only once the engine is gone.
                    let _ = tx.send(event.clone());
                })
            })
            .collect();

        let (events, _) = broadcast::channel(ENGINE_EVENT_CAPACITY);
        Self {
            inner: Arc::new(EngineInner {
                state: Mutex::new(EngineState::new(&config)),
                config,
                channel,
                api,
                timers: TimerRegistry::new(),
                events,
                _subscriptions: subscriptions,
                inbound: std::sync::Mutex::new(Some(inbound_rx)),
                pump: std::sync::Mutex::new(None),
            }),
        }
    }

    fn upgrade(inner: &Weak<EngineInner<T, A>>) -> Option<Self> {
        inner.upgrade().map(|inner| Self { inner })
    }

    // ===========================================
    // Connection
    // ===========================================

    /// Start applying server events and connect the event channel.
    ///
    /// A failed initial connect is returned; drops after that are retried
    /// by the channel.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.start_pump();
        self.inner.channel.connect(&self.inner.config.token).await?;
        info!(user = %self.inner.config.local_user, "sync engine connected");
        Ok(())
    }

    /// Disconnect, cancel every timer and clear typing indicators.
    ///
    /// Notifications already shown stay until dismissed.
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        self.inner.timers.cancel_all();
        {
            let mut state = self.inner.state.lock().await;
            for conversation_id in state.typing.clear() {
                self.emit(EngineEvent::TypingChanged { conversation_id });
            }
            if state.highlighted.take().is_some() {
                self.emit(EngineEvent::HighlightChanged(None));
            }
        }
        self.inner.channel.disconnect().await?;
        info!("sync engine disconnected");
        Ok(())
    }

    fn start_pump(&self) {
        let mut pump = self.inner.pump.lock().unwrap_or_else(PoisonError::into_inner);
        if pump.is_some() {
            return;
        }
        let inbound = self
            .inner
            .inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(inbound) = inbound else {
            return;
        };
        let connection = self.inner.channel.connection_events();
        *pump = Some(tokio::spawn(run_pump(
            Arc::downgrade(&self.inner),
            inbound,
            connection,
        )));
    }

    async fn on_connection_event(&self, event: ChannelEvent) {
        match &event {
            ChannelEvent::Reconnected => {
                let engine = self.clone();
                tokio::spawn(async move {
                    let io = {
                        let mut state = engine.inner.state.lock().await;
                        engine.control(&mut state, ControllerEvent::Reconnected)
                    };
                    if let Err(e) = engine.execute(io).await {
                        warn!(error = %e, "resync after reconnect failed");
                    }
                });
            }
            ChannelEvent::Disconnected { .. } => self.clear_typing().await,
            _ => {}
        }
        self.emit(EngineEvent::Connection(event));
    }

    // ===========================================
    // Conversations
    // ===========================================

    /// Replace the conversation list with a fresh REST snapshot.
    pub async fn refresh_conversations(&self) -> Result<(), ClientError> {
        let snapshot = self.inner.api.list_conversations().await?;
        debug!(count = snapshot.len(), "conversation list fetched");
        let mut state = self.inner.state.lock().await;
        state.conversations.upsert_from_snapshot(snapshot);
        self.emit(EngineEvent::ConversationsChanged);
        Ok(())
    }

    /// Open a conversation: fetch its snapshot, merge pushes that arrived
    /// meanwhile, join its room and mark it read.
    ///
    /// Selecting the conversation that is already open does nothing unless
    /// it is in the error state. If the user switches again before the
    /// snapshot arrives, the late snapshot is discarded.
    pub async fn select_conversation(
        &self,
        conversation: ConversationId,
        kind: ConversationKind,
    ) -> Result<(), ClientError> {
        info!(conversation = %conversation, %kind, "selecting conversation");
        let io = {
            let mut state = self.inner.state.lock().await;
            self.control(&mut state, ControllerEvent::Select { conversation, kind })
        };
        self.execute(io).await
    }

    /// Close the open conversation and leave its room.
    pub async fn deselect(&self) -> Result<(), ClientError> {
        let io = {
            let mut state = self.inner.state.lock().await;
            self.control(&mut state, ControllerEvent::Deselect)
        };
        self.execute(io).await
    }

    /// Retry opening a conversation that failed to load or join.
    pub async fn retry(&self) -> Result<(), ClientError> {
        let io = {
            let mut state = self.inner.state.lock().await;
            self.control(&mut state, ControllerEvent::Retry)
        };
        self.execute(io).await
    }

    /// Refetch the open conversation's snapshot and re-join its room.
    pub async fn resync_active(&self) -> Result<(), ClientError> {
        let io = {
            let mut state = self.inner.state.lock().await;
            self.control(&mut state, ControllerEvent::Resync)
        };
        self.execute(io).await
    }

    /// Create a direct conversation with `recipient` by sending its first
    /// message.
    pub async fn start_conversation(
        &self,
        recipient: UserId,
        initial_message: impl Into<String>,
    ) -> Result<Conversation, ClientError> {
        let request = StartConversationRequest {
            recipient_id: recipient,
            initial_message: initial_message.into(),
        };
        let started = self.inner.api.start_conversation(&request).await?;
        info!(conversation = %started.conversation.id, "direct conversation started");

        let mut state = self.inner.state.lock().await;
        state.conversations.upsert(started.conversation.clone());
        if state.messages.is_loaded(&started.conversation.id) {
            self.reconcile_push(&mut state, started.message);
        }
        self.emit(EngineEvent::ConversationsChanged);
        Ok(started.conversation)
    }

    /// Open a direct conversation with `recipient`, creating a local
    /// placeholder if none exists yet.
    ///
    /// The placeholder has no server side: nothing is fetched or joined
    /// until the first message is sent.
    pub async fn open_direct(
        &self,
        recipient: UserId,
        username: impl Into<String>,
    ) -> Result<ConversationId, ClientError> {
        let (id, kind) = {
            let mut state = self.inner.state.lock().await;
            let counterpart = Counterpart::User {
                id: recipient.clone(),
                username: username.into(),
            };
            let id = state.conversations.ensure_virtual(
                ConversationId::new(recipient.as_str()),
                ConversationKind::Direct,
                counterpart,
                Utc::now(),
            );
            let kind = state
                .conversations
                .get(&id)
                .map_or(ConversationKind::Direct, |c| c.kind);
            self.emit(EngineEvent::ConversationsChanged);
            (id, kind)
        };
        self.select_conversation(id.clone(), kind).await?;
        Ok(id)
    }

    // ===========================================
    // Messages
    // ===========================================

    /// Send `content` to the open conversation.
    ///
    /// The message shows up at once as an optimistic entry and is replaced
    /// when the server acknowledges it. If the send is rejected, the entry
    /// is flagged failed, [`EngineEvent::SendFailed`] is broadcast and the
    /// error returned. Nothing is resent automatically.
    ///
    /// Sending into a virtual conversation starts it over REST and then
    /// opens the real conversation.
    pub async fn send_message(
        &self,
        content: impl Into<String>,
    ) -> Result<ClientMessageId, ClientError> {
        let content = content.into();
        if content.trim().is_empty() {
            return Err(ClientError::EmptyMessage);
        }

        let client_id = ClientMessageId::new();
        let (conversation, kind, placeholder_recipient) = {
            let mut state = self.inner.state.lock().await;
            let (conversation, kind) = state.target()?;
            let placeholder_recipient = state
                .conversations
                .get(&conversation)
                .filter(|c| c.is_virtual)
                .map(|c| match &c.counterpart {
                    Counterpart::User { id, .. } => Some(id.clone()),
                    Counterpart::Team { .. } => None,
                });

            let message = Message::optimistic(
                client_id,
                conversation.clone(),
                self.inner.config.local_user.clone(),
                content.clone(),
                Utc::now(),
            );
            state.messages.append_optimistic(message.id.clone(), message);
            self.emit(EngineEvent::MessagesChanged {
                conversation_id: conversation.clone(),
            });
            (conversation, kind, placeholder_recipient)
        };

        let sent = match placeholder_recipient {
            Some(recipient) => {
                self.start_from_placeholder(&conversation, recipient, client_id, content)
                    .await
            }
            None => {
                let message = NewMessage {
                    conversation_id: conversation.clone(),
                    content,
                    kind,
                    client_id,
                };
                self.inner
                    .channel
                    .send_message(message)
                    .await
                    .map_err(ClientError::from)
            }
        };

        if let Err(e) = &sent {
            warn!(conversation = %conversation, %client_id, error = %e, "send failed");
            let mut state = self.inner.state.lock().await;
            state.messages.mark_failed(&conversation, &client_id);
            self.emit(EngineEvent::MessagesChanged {
                conversation_id: conversation.clone(),
            });
            self.emit(EngineEvent::SendFailed {
                client_id,
                error: e.to_string(),
            });
        }
        sent.map(|()| client_id)
    }

    async fn start_from_placeholder(
        &self,
        placeholder: &ConversationId,
        recipient: Option<UserId>,
        client_id: ClientMessageId,
        content: String,
    ) -> Result<(), ClientError> {
        let recipient = recipient.ok_or_else(|| ClientError::NoRecipient(placeholder.clone()))?;
        let request = StartConversationRequest {
            recipient_id: recipient,
            initial_message: content,
        };
        let started = self.inner.api.start_conversation(&request).await?;
        let (id, kind) = (started.conversation.id.clone(), started.conversation.kind);
        info!(placeholder = %placeholder, conversation = %id, "virtual conversation started");

        {
            let mut state = self.inner.state.lock().await;
            state.messages.abandon(placeholder, &client_id);
            state.messages.clear(placeholder);
            state.conversations.upsert(started.conversation);
            self.emit(EngineEvent::MessagesChanged {
                conversation_id: placeholder.clone(),
            });
            self.emit(EngineEvent::ConversationsChanged);
        }

        self.select_conversation(id, kind).await?;

        let mut state = self.inner.state.lock().await;
        if state.messages.is_loaded(&started.message.conversation_id) {
            self.reconcile_push(&mut state, started.message);
        }
        Ok(())
    }

    /// Drop a failed (or still pending) message from the open conversation.
    pub async fn abandon_message(&self, client_id: &ClientMessageId) -> Option<Message> {
        let mut state = self.inner.state.lock().await;
        let (conversation, _) = state.target().ok()?;
        let abandoned = state.messages.abandon(&conversation, client_id)?;
        debug!(conversation = %conversation, %client_id, "message abandoned");
        self.emit(EngineEvent::MessagesChanged {
            conversation_id: conversation,
        });
        Some(abandoned)
    }

    /// Announce that the local user started or stopped typing in the open
    /// conversation. Ignored for virtual conversations.
    pub async fn set_typing(&self, is_typing: bool) -> Result<(), ClientError> {
        let (conversation, kind) = {
            let state = self.inner.state.lock().await;
            let (conversation, kind) = state.target()?;
            if state.is_virtual(&conversation) {
                return Ok(());
            }
            (conversation, kind)
        };
        self.inner
            .channel
            .set_typing(&conversation, kind, is_typing)
            .await?;
        Ok(())
    }

    // ===========================================
    // Controller plumbing
    // ===========================================

    /// Feed the controller and apply the state-only actions it returns.
    /// The actions that need I/O are handed back.
    fn control(&self, state: &mut EngineState, event: ControllerEvent) -> Vec<ControllerAction> {
        let before = state.controller.state().clone();
        let (controller, actions) = std::mem::take(&mut state.controller).on_event(event);
        state.controller = controller;

        let io = actions
            .into_iter()
            .filter_map(|action| self.apply_action(state, action))
            .collect();

        let after = state.controller.state();
        if *after != before {
            debug!(from = before.name(), to = after.name(), "controller transition");
            self.emit(EngineEvent::ControllerChanged(after.clone()));
        }
        io
    }

    /// Apply a state-only action. Actions that need I/O are returned as is.
    fn apply_action(
        &self,
        state: &mut EngineState,
        action: ControllerAction,
    ) -> Option<ControllerAction> {
        match action {
            ControllerAction::SetActive(Some(conversation)) => {
                state.conversations.select_conversation(&conversation);
                self.set_highlight(state, None);
                self.emit(EngineEvent::ConversationsChanged);
            }
            ControllerAction::SetActive(None) => {
                state.conversations.clear_active();
                self.set_highlight(state, None);
                self.emit(EngineEvent::ConversationsChanged);
            }
            ControllerAction::LoadSnapshot {
                conversation,
                messages,
            } => {
                debug!(conversation = %conversation, count = messages.len(), "snapshot loaded");
                state.messages.load_snapshot(conversation.clone(), messages);
                self.emit(EngineEvent::MessagesChanged {
                    conversation_id: conversation,
                });
            }
            ControllerAction::FlushBuffered {
                conversation,
                messages,
            } => {
                if !messages.is_empty() {
                    debug!(conversation = %conversation, count = messages.len(), "merging buffered pushes");
                }
                for message in messages {
                    self.reconcile_push(state, message);
                }
            }
            ControllerAction::Reconcile(message) => {
                // Logs never fetched are built from their snapshot later.
                if state.messages.is_loaded(&message.conversation_id) {
                    self.reconcile_push(state, message);
                }
            }
            ControllerAction::BufferOverflow {
                conversation,
                capacity,
            } => {
                warn!(conversation = %conversation, capacity, "push buffer full, refetching after load");
            }
            ControllerAction::Failed {
                conversation,
                error,
            } => {
                warn!(conversation = %conversation, %error, "conversation failed to open");
            }
            io => return Some(io),
        }
        None
    }

    /// Run I/O actions, feeding each outcome back to the controller, until
    /// none remain. Returns the first failure of the open conversation.
    async fn execute(&self, actions: Vec<ControllerAction>) -> Result<(), ClientError> {
        let mut queue: VecDeque<ControllerAction> = actions.into();
        let mut result = Ok(());

        while let Some(action) = queue.pop_front() {
            let next = match action {
                ControllerAction::LeaveRoom { conversation, kind } => {
                    if let Err(e) = self.inner.channel.leave_conversation(&conversation, kind).await {
                        debug!(conversation = %conversation, error = %e, "leave not sent");
                    }
                    Vec::new()
                }
                ControllerAction::FetchSnapshot {
                    conversation,
                    kind,
                    request,
                } => {
                    let fetched = self.fetch_snapshot(&conversation, kind).await;
                    let mut state = self.inner.state.lock().await;
                    match fetched {
                        Ok(messages) => self.control(
                            &mut state,
                            ControllerEvent::SnapshotLoaded { request, messages },
                        ),
                        Err(e) => {
                            let error = e.to_string();
                            let next = self.control(
                                &mut state,
                                ControllerEvent::SnapshotFailed { request, error },
                            );
                            if result.is_ok() && failed_on(state.controller.state(), &conversation)
                            {
                                result = Err(e.into());
                            }
                            next
                        }
                    }
                }
                ControllerAction::JoinRoom { conversation, kind } => {
                    let is_virtual = self.inner.state.lock().await.is_virtual(&conversation);
                    let joined = if is_virtual {
                        Ok(())
                    } else {
                        self.inner.channel.join_conversation(&conversation, kind).await
                    };
                    let mut state = self.inner.state.lock().await;
                    match joined {
                        Ok(()) => self.control(&mut state, ControllerEvent::Joined { conversation }),
                        Err(e) => {
                            let event = ControllerEvent::JoinFailed {
                                conversation: conversation.clone(),
                                error: e.to_string(),
                            };
                            let next = self.control(&mut state, event);
                            if result.is_ok() && failed_on(state.controller.state(), &conversation)
                            {
                                result = Err(e.into());
                            }
                            next
                        }
                    }
                }
                ControllerAction::MarkRead { conversation, kind } => {
                    let is_virtual = self.inner.state.lock().await.is_virtual(&conversation);
                    if !is_virtual {
                        if let Err(e) = self.inner.channel.mark_read(&conversation, kind).await {
                            warn!(conversation = %conversation, error = %e, "mark read failed");
                        }
                    }
                    Vec::new()
                }
                other => {
                    let mut state = self.inner.state.lock().await;
                    self.apply_action(&mut state, other).into_iter().collect()
                }
            };
            queue.extend(next);
        }
        result
    }

    async fn fetch_snapshot(
        &self,
        conversation: &ConversationId,
        kind: ConversationKind,
    ) -> Result<Vec<Message>, ApiError> {
        let (known, is_virtual) = {
            let state = self.inner.state.lock().await;
            match state.conversations.get(conversation) {
                Some(summary) => (true, summary.is_virtual),
                None => (false, false),
            }
        };
        if is_virtual {
            return Ok(Vec::new());
        }

        if !known {
            match self.inner.api.get_conversation(kind, conversation).await {
                Ok(summary) => {
                    let mut state = self.inner.state.lock().await;
                    state.conversations.upsert(summary);
                    self.emit(EngineEvent::ConversationsChanged);
                }
                Err(e) => {
                    warn!(conversation = %conversation, error = %e, "conversation summary unavailable")
                }
            }
        }

        self.inner.api.list_messages(kind, conversation).await
    }

    // ===========================================
    // Server events
    // ===========================================

    async fn apply_server_event(&self, event: ServerEvent) {
        let mut state = self.inner.state.lock().await;
        match event {
            ServerEvent::UsersOnline(users) => {
                if state.presence.replace(users) {
                    debug!(online = state.presence.len(), "presence replaced");
                    self.emit(EngineEvent::PresenceChanged);
                }
            }
            ServerEvent::MessageReceived(message) => {
                if !state.first_delivery(&message) {
                    debug!(id = %message.id, "duplicate message push");
                } else if state.conversations.apply_incoming_message(&message) {
                    self.emit(EngineEvent::ConversationsChanged);
                } else {
                    debug!(conversation = %message.conversation_id, "message for unknown conversation");
                    self.spawn_refresh();
                }
                let io = self.control(&mut state, ControllerEvent::PushReceived(message));
                drop(state);
                if let Err(e) = self.execute(io).await {
                    warn!(error = %e, "applying pushed message failed");
                }
            }
            ServerEvent::TypingUpdate(update) => self.apply_typing(&mut state, update),
            ServerEvent::MessageStatus(MessageStatus {
                conversation_id,
                read_at,
            }) => {
                if state.messages.apply_read_status(&conversation_id, read_at) > 0 {
                    self.emit(EngineEvent::MessagesChanged { conversation_id });
                }
            }
            ServerEvent::ConversationUpdated(ConversationUpdate {
                id,
                last_message,
                updated_at,
            }) => {
                if state.conversations.apply_update(&id, last_message, updated_at) {
                    self.emit(EngineEvent::ConversationsChanged);
                } else {
                    self.spawn_refresh();
                }
            }
            ServerEvent::NotificationNew(payload) => self.add_notification(&mut state, payload),
        }
    }

    fn spawn_refresh(&self) {
        let engine = self.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.refresh_conversations().await {
                warn!(error = %e, "conversation list refresh failed");
            }
        });
    }

    fn reconcile_push(&self, state: &mut EngineState, message: Message) {
        let conversation_id = message.conversation_id.clone();
        let message_id = message.id.clone();
        let from_peer = message.sender_id != self.inner.config.local_user;

        let outcome = state.messages.reconcile(message);
        if !outcome.changed() {
            debug!(message = %message_id, "duplicate message ignored");
            return;
        }
        if let Reconciled::ReplacedOptimistic { temp_id } = &outcome {
            debug!(temp = %temp_id, message = %message_id, "send acknowledged");
        }
        self.emit(EngineEvent::MessagesChanged {
            conversation_id: conversation_id.clone(),
        });
        self.emit(EngineEvent::MessageReceived {
            conversation_id: conversation_id.clone(),
            message_id: message_id.clone(),
        });

        let is_active = state.conversations.active() == Some(&conversation_id);
        if from_peer && is_active && outcome == Reconciled::Appended {
            self.set_highlight(state, Some(message_id));
        }
    }

    fn apply_typing(&self, state: &mut EngineState, update: TypingUpdate) {
        let TypingUpdate {
            conversation_id,
            user_id,
            username,
            is_typing,
        } = update;
        let now = tokio::time::Instant::now().into_std();
        let instruction =
            state
                .typing
                .set_typing(conversation_id.clone(), user_id, username, is_typing, now);

        match instruction {
            TypingInstruction::ScheduleExpiry {
                conversation_id,
                user_id,
                generation,
                after,
            } => {
                let key = EngineTimer::Typing(conversation_id.clone(), user_id.clone());
                let weak = Arc::downgrade(&self.inner);
                self.inner.timers.schedule(key, after, async move {
                    if let Some(engine) = Self::upgrade(&weak) {
                        engine.expire_typing(conversation_id, user_id, generation).await;
                    }
                });
            }
            TypingInstruction::CancelExpiry {
                conversation_id,
                user_id,
            } => {
                self.inner
                    .timers
                    .cancel(&EngineTimer::Typing(conversation_id, user_id));
            }
        }
        self.emit(EngineEvent::TypingChanged { conversation_id });
    }

    async fn expire_typing(&self, conversation_id: ConversationId, user_id: UserId, generation: u64) {
        let mut state = self.inner.state.lock().await;
        if state.typing.expire(&conversation_id, &user_id, generation) {
            debug!(conversation = %conversation_id, user = %user_id, "typing expired");
            self.emit(EngineEvent::TypingChanged { conversation_id });
        }
    }

    async fn clear_typing(&self) {
        self.inner
            .timers
            .cancel_matching(|key| matches!(key, EngineTimer::Typing(..)));
        let mut state = self.inner.state.lock().await;
        for conversation_id in state.typing.clear() {
            self.emit(EngineEvent::TypingChanged { conversation_id });
        }
    }

    fn set_highlight(&self, state: &mut EngineState, message_id: Option<MessageId>) {
        if state.highlighted == message_id {
            return;
        }
        state.highlighted = message_id.clone();
        match &message_id {
            Some(id) => {
                let id = id.clone();
                let weak = Arc::downgrade(&self.inner);
                let delay = self.inner.config.highlight_timeout;
                self.inner
                    .timers
                    .schedule(EngineTimer::Highlight, delay, async move {
                        if let Some(engine) = Self::upgrade(&weak) {
                            engine.expire_highlight(&id).await;
                        }
                    });
            }
            None => {
                self.inner.timers.cancel(&EngineTimer::Highlight);
            }
        }
        self.emit(EngineEvent::HighlightChanged(message_id));
    }

    async fn expire_highlight(&self, id: &MessageId) {
        let mut state = self.inner.state.lock().await;
        if state.highlighted.as_ref() == Some(id) {
            state.highlighted = None;
            self.emit(EngineEvent::HighlightChanged(None));
        }
    }

    fn add_notification(&self, state: &mut EngineState, payload: serde_json::Value) {
        state.next_notification += 1;
        let notification = Notification {
            id: state.next_notification,
            payload,
            received_at: Utc::now(),
        };
        state.notifications.push(notification.clone());

        let id = notification.id;
        let weak = Arc::downgrade(&self.inner);
        self.inner.timers.schedule(
            EngineTimer::Notification(id),
            self.inner.config.notification_timeout,
            async move {
                if let Some(engine) = Self::upgrade(&weak) {
                    engine.remove_notification(id).await;
                }
            },
        );
        self.emit(EngineEvent::NotificationAdded(notification));
    }

    async fn remove_notification(&self, id: u64) -> bool {
        let mut state = self.inner.state.lock().await;
        let before = state.notifications.len();
        state.notifications.retain(|n| n.id != id);
        let removed = state.notifications.len() != before;
        if removed {
            self.emit(EngineEvent::NotificationDismissed { id });
        }
        removed
    }

    /// Dismiss a notification before it expires.
    pub async fn dismiss_notification(&self, id: u64) -> bool {
        self.inner.timers.cancel(&EngineTimer::Notification(id));
        self.remove_notification(id).await
    }

    fn emit(&self, event: EngineEvent) {
        // No receivers is fine.
        let _ = self.inner.events.send(event);
    }

    // ===========================================
    // Accessors
    // ===========================================

    /// Subscribe to change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    /// The signed-in user.
    pub fn local_user(&self) -> &UserId {
        &self.inner.config.local_user
    }

    /// The underlying event channel.
    pub fn channel(&self) -> &EventChannel<T> {
        &self.inner.channel
    }

    /// Conversations, most recent first.
    pub async fn conversations(&self) -> Vec<Conversation> {
        let state = self.inner.state.lock().await;
        state.conversations.iter().cloned().collect()
    }

    /// One conversation summary.
    pub async fn conversation(&self, id: &ConversationId) -> Option<Conversation> {
        self.inner.state.lock().await.conversations.get(id).cloned()
    }

    /// Sum of unread counts.
    pub async fn total_unread(&self) -> u32 {
        self.inner.state.lock().await.conversations.total_unread()
    }

    /// A conversation's messages in display order.
    pub async fn messages(&self, conversation: &ConversationId) -> Vec<Message> {
        self.inner
            .state
            .lock()
            .await
            .messages
            .messages(conversation)
            .to_vec()
    }

    /// A conversation's messages plus their display groups.
    pub async fn messages_grouped(
        &self,
        conversation: &ConversationId,
    ) -> (Vec<Message>, Vec<MessageGroup>) {
        let state = self.inner.state.lock().await;
        let messages = state.messages.messages(conversation);
        (messages.to_vec(), group_messages(messages))
    }

    /// Users typing in a conversation, excluding the local user.
    pub async fn active_typers(&self, conversation: &ConversationId) -> Vec<(UserId, String)> {
        self.inner
            .state
            .lock()
            .await
            .typing
            .active_typers(conversation)
    }

    /// Online users, sorted.
    pub async fn online_users(&self) -> Vec<UserId> {
        let state = self.inner.state.lock().await;
        let mut users: Vec<UserId> = state.presence.iter().cloned().collect();
        users.sort();
        users
    }

    /// Check if a user is online.
    pub async fn is_online(&self, user: &UserId) -> bool {
        self.inner.state.lock().await.presence.is_online(user)
    }

    /// Activation state of the open conversation.
    pub async fn controller_state(&self) -> ControllerState {
        self.inner.state.lock().await.controller.state().clone()
    }

    /// Event channel state.
    pub async fn connection_state(&self) -> ConnectionState {
        self.inner.channel.state().await
    }

    /// The newest incoming message of the open conversation, for a short
    /// while after it arrived.
    pub async fn highlighted(&self) -> Option<MessageId> {
        self.inner.state.lock().await.highlighted.clone()
    }

    /// Notifications not yet dismissed, oldest first.
    pub async fn notifications(&self) -> Vec<Notification> {
        self.inner.state.lock().await.notifications.clone()
    }
}

impl<T: Transport + 'static, A: SnapshotApi + 'static> std::fmt::Debug for SyncEngine<T, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("config", &self.inner.config)
            .field("channel", &self.inner.channel)
            .finish()
    }
}

/// Whether `state` is the error state of `conversation`.
fn failed_on(state: &ControllerState, conversation: &ConversationId) -> bool {
    matches!(state, ControllerState::Error { conversation: failed, .. } if failed == conversation)
}

/// Apply server events and connection events, in arrival order, until the
/// engine is dropped.
async fn run_pump<T: Transport + 'static, A: SnapshotApi + 'static>(
    inner: Weak<EngineInner<T, A>>,
    mut inbound: mpsc::UnboundedReceiver<ServerEvent>,
    mut connection: broadcast::Receiver<ChannelEvent>,
) {
    loop {
        tokio::select! {
            event = inbound.recv() => {
                let Some(event) = event else { break };
                let Some(engine) = SyncEngine::upgrade(&inner) else { break };
                engine.apply_server_event(event).await;
            }
            event = connection.recv() => match event {
                Ok(event) => {
                    let Some(engine) = SyncEngine::upgrade(&inner) else { break };
                    engine.on_connection_event(event).await;
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "connection events lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    debug!("event pump stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{MockSnapshotApi, StartedConversation};
    use crate::transport::MockTransport;
    use chrono::TimeZone;
    use huddle_sync_types::{ClientEvent, RoomRef, TeamId};
    use std::time::Duration;

    type TestEngine = SyncEngine<MockTransport, MockSnapshotApi>;

    struct Harness {
        engine: TestEngine,
        transport: MockTransport,
        api: MockSnapshotApi,
        events: broadcast::Receiver<EngineEvent>,
        barriers: u32,
    }

    impl Harness {
        /// Drop every event received so far.
        fn fresh_events(&mut self) {
            self.events = self.engine.subscribe();
        }

        /// Push a presence frame and wait for it to be applied. Every frame
        /// queued before it has been applied too.
        async fn settle(&mut self) {
            self.barriers += 1;
            let marker = UserId::new(format!("barrier-{}", self.barriers));
            self.transport
                .push_event(&ServerEvent::UsersOnline(vec![marker]));
            wait_for(&mut self.events, |e| *e == EngineEvent::PresenceChanged).await;
        }

        fn push(&self, event: ServerEvent) {
            self.transport.push_event(&event);
        }
    }

    fn me() -> UserId {
        UserId::new("me")
    }

    fn c1() -> ConversationId {
        ConversationId::new("c1")
    }

    fn c2() -> ConversationId {
        ConversationId::new("c2")
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn team_conversation(id: &str, updated: i64) -> Conversation {
        Conversation {
            id: ConversationId::new(id),
            kind: ConversationKind::Team,
            counterpart: Counterpart::Team {
                id: TeamId::new(format!("team-{id}")),
                name: format!("Team {id}"),
            },
            last_message_preview: None,
            updated_at: at(updated),
            unread_count: 0,
            is_virtual: false,
        }
    }

    fn message(id: &str, conversation: &str, sender: &str, content: &str, secs: i64) -> Message {
        Message {
            id: MessageId::new(id),
            conversation_id: ConversationId::new(conversation),
            sender_id: UserId::new(sender),
            sender_name: None,
            content: content.to_string(),
            created_at: at(secs),
            read_at: None,
            client_id: None,
            is_optimistic: false,
            failed: false,
        }
    }

    fn ids(messages: &[Message]) -> Vec<&str> {
        messages.iter().map(|m| m.id.as_str()).collect()
    }

    fn team_room(id: ConversationId) -> RoomRef {
        RoomRef::new(id, ConversationKind::Team)
    }

    async fn harness_with(configure: impl FnOnce(SyncConfig) -> SyncConfig) -> Harness {
        let transport = MockTransport::new();
        let api = MockSnapshotApi::new();
        api.set_conversations(vec![team_conversation("c1", 10), team_conversation("c2", 5)]);

        let config = configure(SyncConfig::new(
            "http://api.test",
            "ws://socket.test",
            "token-1",
            me(),
        ));
        let engine = SyncEngine::new(config, transport.clone(), api.clone());
        let events = engine.subscribe();
        engine.connect().await.unwrap();
        engine.refresh_conversations().await.unwrap();

        Harness {
            engine,
            transport,
            api,
            events,
            barriers: 0,
        }
    }

    async fn harness() -> Harness {
        harness_with(|config| config).await
    }

    /// Wait for the next engine event matching `pred`.
    async fn wait_for(
        events: &mut broadcast::Receiver<EngineEvent>,
        pred: impl Fn(&EngineEvent) -> bool,
    ) -> EngineEvent {
        tokio::time::timeout(Duration::from_secs(60), async {
            loop {
                match events.recv().await {
                    Ok(event) if pred(&event) => return event,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => panic!("engine events closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for engine event")
    }

    // ===========================================
    // Connection Tests
    // ===========================================

    #[tokio::test]
    async fn connect_uses_socket_url_and_token() {
        let h = harness().await;

        assert!(h.engine.connection_state().await.is_connected());
        assert_eq!(h.transport.connected_url(), Some("ws://socket.test".to_string()));
        assert_eq!(h.transport.last_token(), Some("token-1".to_string()));
        assert_eq!(h.engine.conversations().await.len(), 2);
    }

    #[tokio::test]
    async fn initial_connect_failure_is_returned() {
        let transport = MockTransport::new();
        transport.fail_next_connect("refused");
        let config = SyncConfig::new("http://api.test", "ws://socket.test", "t", me());
        let engine = SyncEngine::new(config, transport, MockSnapshotApi::new());

        let result = engine.connect().await;

        assert!(matches!(result, Err(ClientError::Transport(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_does_not_rejoin_by_default() {
        let mut h = harness().await;
        h.engine.select_conversation(c1(), ConversationKind::Team).await.unwrap();
        h.transport.clear_sent();
        h.fresh_events();

        h.transport.drop_connection("server restart");
        wait_for(&mut h.events, |e| {
            *e == EngineEvent::Connection(ChannelEvent::Reconnected)
        })
        .await;
        h.settle().await;

        assert!(h.transport.sent_events().is_empty());
        assert!(!h.engine.channel().is_joined(&c1()));
        assert_eq!(h.api.message_requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_resyncs_and_rejoins_when_configured() {
        let mut h = harness_with(|c| c.with_rejoin_on_reconnect(true)).await;
        h.engine.select_conversation(c1(), ConversationKind::Team).await.unwrap();
        h.transport.clear_sent();
        h.fresh_events();

        h.transport.drop_connection("server restart");
        wait_for(&mut h.events, |e| {
            *e == EngineEvent::Connection(ChannelEvent::Reconnected)
        })
        .await;
        wait_for(&mut h.events, |e| {
            matches!(e, EngineEvent::ControllerChanged(ControllerState::Active { .. }))
        })
        .await;

        assert_eq!(h.api.message_requests(), vec![c1(), c1()]);
        assert_eq!(
            h.transport.sent_events(),
            vec![
                ClientEvent::Join(team_room(c1())),
                ClientEvent::Read(team_room(c1())),
            ]
        );
    }

    #[tokio::test]
    async fn disconnect_clears_typing() {
        let mut h = harness().await;
        h.push(ServerEvent::TypingUpdate(TypingUpdate {
            conversation_id: c1(),
            user_id: UserId::new("bob"),
            username: "Bob".into(),
            is_typing: true,
        }));
        h.settle().await;
        assert_eq!(h.engine.active_typers(&c1()).await.len(), 1);

        h.engine.disconnect().await.unwrap();

        assert!(h.engine.active_typers(&c1()).await.is_empty());
        assert_eq!(
            h.engine.connection_state().await,
            ConnectionState::Disconnected
        );
    }

    // ===========================================
    // Activation Tests
    // ===========================================

    #[tokio::test]
    async fn select_loads_joins_and_marks_read() {
        let h = harness().await;
        h.api.set_messages(c1(), vec![message("m1", "c1", "bob", "hi", 1)]);

        h.engine.select_conversation(c1(), ConversationKind::Team).await.unwrap();

        assert_eq!(
            h.engine.controller_state().await,
            ControllerState::Active {
                conversation: c1(),
                kind: ConversationKind::Team,
            }
        );
        assert_eq!(ids(&h.engine.messages(&c1()).await), vec!["m1"]);
        assert_eq!(
            h.transport.sent_events(),
            vec![
                ClientEvent::Join(team_room(c1())),
                ClientEvent::Read(team_room(c1())),
            ]
        );
    }

    #[tokio::test]
    async fn push_during_snapshot_load_lands_after_snapshot_once() {
        let mut h = harness().await;
        h.api.set_messages(
            c1(),
            vec![
                message("m1", "c1", "bob", "one", 1),
                message("m2", "c1", "me", "two", 2),
            ],
        );
        let gate = h.api.hold_messages(c1());

        let select = tokio::spawn({
            let engine = h.engine.clone();
            async move { engine.select_conversation(c1(), ConversationKind::Team).await }
        });
        while h.api.message_requests().is_empty() {
            tokio::task::yield_now().await;
        }

        let pushed = message("m3", "c1", "bob", "three", 3);
        h.push(ServerEvent::MessageReceived(pushed.clone()));
        h.push(ServerEvent::MessageReceived(pushed));
        h.settle().await;
        assert!(h.engine.messages(&c1()).await.is_empty());

        gate.notify_one();
        select.await.unwrap().unwrap();

        assert_eq!(ids(&h.engine.messages(&c1()).await), vec!["m1", "m2", "m3"]);
        assert!(h.engine.controller_state().await.is_active());
    }

    #[tokio::test]
    async fn switching_away_discards_late_snapshot() {
        let h = harness().await;
        h.api.set_messages(c1(), vec![message("m1", "c1", "bob", "old", 1)]);
        h.api.set_messages(c2(), vec![message("m9", "c2", "bob", "new", 1)]);
        let gate = h.api.hold_messages(c1());

        let first = tokio::spawn({
            let engine = h.engine.clone();
            async move { engine.select_conversation(c1(), ConversationKind::Team).await }
        });
        while h.api.message_requests().is_empty() {
            tokio::task::yield_now().await;
        }

        h.engine.select_conversation(c2(), ConversationKind::Team).await.unwrap();
        gate.notify_one();
        first.await.unwrap().unwrap();

        assert!(h.engine.messages(&c1()).await.is_empty());
        assert_eq!(ids(&h.engine.messages(&c2()).await), vec!["m9"]);
        assert_eq!(
            h.engine.controller_state().await.conversation(),
            Some(&c2())
        );
        assert!(!h
            .transport
            .sent_events()
            .contains(&ClientEvent::Join(team_room(c1()))));
    }

    #[tokio::test]
    async fn snapshot_failure_enters_error_and_retry_recovers() {
        let h = harness().await;
        h.api.fail_next("boom");

        let result = h.engine.select_conversation(c1(), ConversationKind::Team).await;

        assert!(matches!(
            result,
            Err(ClientError::Api(ApiError::Status { status: 500, .. }))
        ));
        assert!(matches!(
            h.engine.controller_state().await,
            ControllerState::Error { .. }
        ));

        h.api.set_messages(c1(), vec![message("m1", "c1", "bob", "hi", 1)]);
        h.engine.retry().await.unwrap();

        assert!(h.engine.controller_state().await.is_active());
        assert_eq!(ids(&h.engine.messages(&c1()).await), vec!["m1"]);
    }

    #[tokio::test]
    async fn deselect_leaves_room_and_unread_counts_again() {
        let mut h = harness().await;
        h.engine.select_conversation(c1(), ConversationKind::Team).await.unwrap();
        h.transport.clear_sent();

        h.engine.deselect().await.unwrap();

        assert_eq!(h.engine.controller_state().await, ControllerState::Idle);
        assert_eq!(
            h.transport.sent_events(),
            vec![ClientEvent::Leave(team_room(c1()))]
        );

        h.push(ServerEvent::MessageReceived(message("m5", "c1", "bob", "yo", 50)));
        h.settle().await;
        assert_eq!(h.engine.conversation(&c1()).await.unwrap().unread_count, 1);
    }

    #[tokio::test]
    async fn duplicate_push_counts_unread_once() {
        let mut h = harness().await;
        h.engine.select_conversation(c1(), ConversationKind::Team).await.unwrap();
        h.engine.deselect().await.unwrap();

        h.push(ServerEvent::MessageReceived(message("m5", "c1", "bob", "yo", 50)));
        h.push(ServerEvent::MessageReceived(message("m5", "c1", "bob", "yo", 50)));
        h.settle().await;
        assert_eq!(h.engine.conversation(&c1()).await.unwrap().unread_count, 1);

        h.push(ServerEvent::MessageReceived(message("m6", "c2", "bob", "hey", 60)));
        h.push(ServerEvent::MessageReceived(message("m6", "c2", "bob", "hey", 60)));
        h.settle().await;
        assert_eq!(h.engine.conversation(&c2()).await.unwrap().unread_count, 1);
    }

    #[tokio::test]
    async fn resync_refetches_active_conversation() {
        let h = harness().await;
        h.engine.select_conversation(c1(), ConversationKind::Team).await.unwrap();
        h.api.set_messages(c1(), vec![message("m1", "c1", "bob", "late", 1)]);

        h.engine.resync_active().await.unwrap();

        assert_eq!(h.api.message_requests(), vec![c1(), c1()]);
        assert_eq!(ids(&h.engine.messages(&c1()).await), vec!["m1"]);
    }

    // ===========================================
    // Send Tests
    // ===========================================

    #[tokio::test]
    async fn send_is_optimistic_until_acknowledged() {
        let mut h = harness().await;
        h.api.set_messages(c1(), vec![message("m1", "c1", "bob", "hi", 1)]);
        h.engine.select_conversation(c1(), ConversationKind::Team).await.unwrap();

        let client_id = h.engine.send_message("hello").await.unwrap();

        let messages = h.engine.messages(&c1()).await;
        assert_eq!(messages.len(), 2);
        assert!(messages[1].is_optimistic);
        assert!(messages[1].id.is_temporary());
        assert_eq!(
            h.transport.sent_events().last(),
            Some(&ClientEvent::NewMessage(NewMessage {
                conversation_id: c1(),
                content: "hello".into(),
                kind: ConversationKind::Team,
                client_id,
            }))
        );

        let mut ack = message("srv-1", "c1", "me", "hello", 5);
        ack.client_id = Some(client_id);
        h.push(ServerEvent::MessageReceived(ack));
        h.settle().await;

        let messages = h.engine.messages(&c1()).await;
        assert_eq!(ids(&messages), vec!["m1", "srv-1"]);
        assert!(!messages[1].is_optimistic);
        assert_eq!(h.engine.highlighted().await, None);
    }

    #[tokio::test]
    async fn ack_without_key_matches_by_content() {
        let mut h = harness().await;
        h.engine.select_conversation(c1(), ConversationKind::Team).await.unwrap();
        h.engine.send_message("first").await.unwrap();
        h.engine.send_message("second").await.unwrap();

        h.push(ServerEvent::MessageReceived(message("srv-2", "c1", "me", "second", 5)));
        h.settle().await;

        let messages = h.engine.messages(&c1()).await;
        assert_eq!(messages.len(), 2);
        assert!(messages[0].is_optimistic);
        assert_eq!(messages[0].content, "first");
        assert_eq!(messages[1].id.as_str(), "srv-2");
    }

    #[tokio::test]
    async fn failed_send_is_flagged_then_abandoned() {
        let mut h = harness().await;
        h.engine.select_conversation(c1(), ConversationKind::Team).await.unwrap();
        h.transport.fail_next_send("socket closed");
        h.fresh_events();

        let result = h.engine.send_message("lost").await;
        assert!(matches!(result, Err(ClientError::Transport(_))));

        let event = wait_for(&mut h.events, |e| matches!(e, EngineEvent::SendFailed { .. })).await;
        let EngineEvent::SendFailed { client_id, .. } = event else {
            unreachable!()
        };
        let messages = h.engine.messages(&c1()).await;
        assert!(messages[0].failed);

        let abandoned = h.engine.abandon_message(&client_id).await.unwrap();
        assert_eq!(abandoned.content, "lost");
        assert!(h.engine.messages(&c1()).await.is_empty());
        assert!(h.engine.abandon_message(&client_id).await.is_none());
    }

    #[tokio::test]
    async fn send_requires_active_conversation_and_text() {
        let h = harness().await;

        assert!(matches!(
            h.engine.send_message("   ").await,
            Err(ClientError::EmptyMessage)
        ));
        assert!(matches!(
            h.engine.send_message("hi").await,
            Err(ClientError::NoActiveConversation)
        ));
        assert!(matches!(
            h.engine.set_typing(true).await,
            Err(ClientError::NoActiveConversation)
        ));
    }

    #[tokio::test]
    async fn set_typing_sends_start_and_stop() {
        let h = harness().await;
        h.engine.select_conversation(c1(), ConversationKind::Team).await.unwrap();
        h.transport.clear_sent();

        h.engine.set_typing(true).await.unwrap();
        h.engine.set_typing(false).await.unwrap();

        assert_eq!(
            h.transport.sent_events(),
            vec![
                ClientEvent::TypingStart(team_room(c1())),
                ClientEvent::TypingStop(team_room(c1())),
            ]
        );
    }

    // ===========================================
    // Virtual Conversation Tests
    // ===========================================

    #[tokio::test]
    async fn open_direct_creates_placeholder_without_fetching() {
        let h = harness().await;
        let bob = UserId::new("bob");

        let id = h.engine.open_direct(bob.clone(), "Bob").await.unwrap();

        assert_eq!(id, ConversationId::new("bob"));
        assert!(h.engine.conversation(&id).await.unwrap().is_virtual);
        assert!(h.engine.controller_state().await.is_active());
        assert!(h.api.message_requests().is_empty());
        assert!(h.transport.sent_events().is_empty());

        // Typing into a placeholder goes nowhere.
        h.engine.set_typing(true).await.unwrap();
        assert!(h.transport.sent_events().is_empty());
    }

    #[tokio::test]
    async fn first_message_to_placeholder_starts_conversation() {
        let h = harness().await;
        let bob = UserId::new("bob");
        let d1 = ConversationId::new("d1");
        let first = message("srv-d1", "d1", "me", "hi bob", 50);
        let conversation = Conversation {
            id: d1.clone(),
            kind: ConversationKind::Direct,
            counterpart: Counterpart::User {
                id: bob.clone(),
                username: "bob".into(),
            },
            last_message_preview: Some("hi bob".into()),
            updated_at: at(50),
            unread_count: 0,
            is_virtual: false,
        };
        h.api.set_start_response(StartedConversation {
            conversation,
            message: first.clone(),
        });
        h.api.set_messages(d1.clone(), vec![first]);
        let placeholder = h.engine.open_direct(bob.clone(), "Bob").await.unwrap();

        h.engine.send_message("hi bob").await.unwrap();

        assert_eq!(
            h.api.start_requests(),
            vec![StartConversationRequest {
                recipient_id: bob,
                initial_message: "hi bob".into(),
            }]
        );
        assert!(h.engine.conversation(&placeholder).await.is_none());
        assert!(h.engine.messages(&placeholder).await.is_empty());
        assert!(!h.engine.conversation(&d1).await.unwrap().is_virtual);
        assert_eq!(
            h.engine.controller_state().await,
            ControllerState::Active {
                conversation: d1.clone(),
                kind: ConversationKind::Direct,
            }
        );
        assert_eq!(ids(&h.engine.messages(&d1).await), vec!["srv-d1"]);
        assert!(h
            .transport
            .sent_events()
            .contains(&ClientEvent::Join(RoomRef::new(d1, ConversationKind::Direct))));
    }

    #[tokio::test]
    async fn open_direct_reuses_existing_conversation() {
        let h = harness().await;
        let bob = UserId::new("bob");

        let first = h.engine.open_direct(bob.clone(), "Bob").await.unwrap();
        let second = h.engine.open_direct(bob, "Bobby").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(h.engine.conversations().await.len(), 3);
    }

    // ===========================================
    // Server Event Tests
    // ===========================================

    #[tokio::test]
    async fn unread_counts_only_for_other_conversations_and_peers() {
        let mut h = harness().await;
        h.engine.select_conversation(c1(), ConversationKind::Team).await.unwrap();

        h.push(ServerEvent::MessageReceived(message("a", "c2", "bob", "x", 100)));
        h.push(ServerEvent::MessageReceived(message("b", "c1", "bob", "y", 101)));
        h.push(ServerEvent::MessageReceived(message("c", "c2", "me", "z", 102)));
        h.settle().await;

        let conversations = h.engine.conversations().await;
        assert_eq!(conversations[0].id, c2());
        assert_eq!(conversations[0].unread_count, 1);
        assert_eq!(conversations[0].last_message_preview.as_deref(), Some("z"));
        assert_eq!(conversations[1].unread_count, 0);
        assert_eq!(h.engine.total_unread().await, 1);
        assert_eq!(ids(&h.engine.messages(&c1()).await), vec!["b"]);
    }

    #[tokio::test]
    async fn message_for_unknown_conversation_refreshes_list() {
        let mut h = harness().await;
        h.api.set_conversations(vec![
            team_conversation("c1", 10),
            team_conversation("c2", 5),
            team_conversation("c3", 200),
        ]);
        h.fresh_events();

        h.push(ServerEvent::MessageReceived(message("m1", "c3", "bob", "new", 200)));
        wait_for(&mut h.events, |e| *e == EngineEvent::ConversationsChanged).await;

        assert_eq!(h.engine.conversations().await[0].id, ConversationId::new("c3"));
    }

    #[tokio::test]
    async fn conversation_update_reorders_list() {
        let mut h = harness().await;

        h.push(ServerEvent::ConversationUpdated(ConversationUpdate {
            id: c2(),
            last_message: Some("fresh".into()),
            updated_at: at(100),
        }));
        h.settle().await;

        let conversations = h.engine.conversations().await;
        assert_eq!(conversations[0].id, c2());
        assert_eq!(conversations[0].last_message_preview.as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn read_status_marks_local_messages() {
        let mut h = harness().await;
        h.api.set_messages(
            c1(),
            vec![
                message("m1", "c1", "me", "mine", 1),
                message("m2", "c1", "bob", "theirs", 2),
            ],
        );
        h.engine.select_conversation(c1(), ConversationKind::Team).await.unwrap();

        h.push(ServerEvent::MessageStatus(MessageStatus {
            conversation_id: c1(),
            read_at: at(60),
        }));
        h.settle().await;

        let messages = h.engine.messages(&c1()).await;
        assert_eq!(messages[0].read_at, Some(at(60)));
        assert_eq!(messages[1].read_at, None);
    }

    #[tokio::test]
    async fn presence_is_replaced_wholesale() {
        let mut h = harness().await;
        let (alice, bob) = (UserId::new("alice"), UserId::new("bob"));

        h.push(ServerEvent::UsersOnline(vec![bob.clone(), alice.clone()]));
        wait_for(&mut h.events, |e| *e == EngineEvent::PresenceChanged).await;
        assert_eq!(h.engine.online_users().await, vec![alice.clone(), bob.clone()]);
        assert!(h.engine.is_online(&bob).await);

        h.push(ServerEvent::UsersOnline(vec![]));
        wait_for(&mut h.events, |e| *e == EngineEvent::PresenceChanged).await;
        assert!(h.engine.online_users().await.is_empty());
        assert!(!h.engine.is_online(&alice).await);
    }

    #[tokio::test]
    async fn messages_grouped_follows_message_list() {
        let h = harness().await;
        h.api.set_messages(
            c1(),
            vec![
                message("m1", "c1", "bob", "a", 1),
                message("m2", "c1", "bob", "b", 2),
                message("m3", "c1", "me", "c", 3),
            ],
        );
        h.engine.select_conversation(c1(), ConversationKind::Team).await.unwrap();

        let (messages, groups) = h.engine.messages_grouped(&c1()).await;

        assert_eq!(messages.len(), 3);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].range, 0..2);
        assert_eq!(groups[1].sender_id, me());
    }

    // ===========================================
    // Timer Tests
    // ===========================================

    #[tokio::test(start_paused = true)]
    async fn highlight_clears_after_timeout() {
        let mut h = harness().await;
        h.engine.select_conversation(c1(), ConversationKind::Team).await.unwrap();
        let start = tokio::time::Instant::now();

        h.push(ServerEvent::MessageReceived(message("m5", "c1", "bob", "look", 5)));
        wait_for(&mut h.events, |e| {
            *e == EngineEvent::HighlightChanged(Some(MessageId::new("m5")))
        })
        .await;
        assert_eq!(h.engine.highlighted().await, Some(MessageId::new("m5")));

        wait_for(&mut h.events, |e| *e == EngineEvent::HighlightChanged(None)).await;
        assert!(start.elapsed() >= Duration::from_secs(3));
        assert_eq!(h.engine.highlighted().await, None);
    }

    #[tokio::test]
    async fn own_and_background_messages_are_not_highlighted() {
        let mut h = harness().await;
        h.engine.select_conversation(c1(), ConversationKind::Team).await.unwrap();

        h.push(ServerEvent::MessageReceived(message("m1", "c1", "me", "mine", 5)));
        h.push(ServerEvent::MessageReceived(message("m2", "c2", "bob", "elsewhere", 6)));
        h.settle().await;

        assert_eq!(h.engine.highlighted().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn typing_expires_unless_refreshed() {
        let mut h = harness().await;
        let bob = UserId::new("bob");
        let typing = |is_typing| {
            ServerEvent::TypingUpdate(TypingUpdate {
                conversation_id: c1(),
                user_id: UserId::new("bob"),
                username: "Bob".into(),
                is_typing,
            })
        };
        let start = tokio::time::Instant::now();

        h.push(typing(true));
        wait_for(&mut h.events, |e| matches!(e, EngineEvent::TypingChanged { .. })).await;
        assert_eq!(h.engine.active_typers(&c1()).await, vec![(bob.clone(), "Bob".to_string())]);

        tokio::time::sleep(Duration::from_secs(2)).await;
        h.push(typing(true));
        wait_for(&mut h.events, |e| matches!(e, EngineEvent::TypingChanged { .. })).await;

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(h.engine.active_typers(&c1()).await.len(), 1);

        wait_for(&mut h.events, |e| matches!(e, EngineEvent::TypingChanged { .. })).await;
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert!(h.engine.active_typers(&c1()).await.is_empty());
    }

    #[tokio::test]
    async fn typing_stop_removes_immediately() {
        let mut h = harness().await;
        for is_typing in [true, false] {
            h.push(ServerEvent::TypingUpdate(TypingUpdate {
                conversation_id: c1(),
                user_id: UserId::new("bob"),
                username: "Bob".into(),
                is_typing,
            }));
        }
        h.settle().await;

        assert!(h.engine.active_typers(&c1()).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn notification_is_dismissed_after_timeout() {
        let mut h = harness().await;
        let start = tokio::time::Instant::now();

        h.push(ServerEvent::NotificationNew(serde_json::json!({"title": "Invite"})));
        let added = wait_for(&mut h.events, |e| matches!(e, EngineEvent::NotificationAdded(_))).await;
        let EngineEvent::NotificationAdded(notification) = added else {
            unreachable!()
        };
        assert_eq!(notification.payload["title"], "Invite");
        assert_eq!(h.engine.notifications().await.len(), 1);

        wait_for(&mut h.events, |e| {
            *e == EngineEvent::NotificationDismissed {
                id: notification.id,
            }
        })
        .await;
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert!(h.engine.notifications().await.is_empty());
    }

    #[tokio::test]
    async fn notification_can_be_dismissed_early() {
        let mut h = harness().await;

        h.push(ServerEvent::NotificationNew(serde_json::json!({"title": "Hi"})));
        let added = wait_for(&mut h.events, |e| matches!(e, EngineEvent::NotificationAdded(_))).await;
        let EngineEvent::NotificationAdded(notification) = added else {
            unreachable!()
        };

        assert!(h.engine.dismiss_notification(notification.id).await);
        assert!(!h.engine.dismiss_notification(notification.id).await);
        assert!(h.engine.notifications().await.is_empty());
    }
}
