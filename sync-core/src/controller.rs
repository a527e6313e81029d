//! Conversation activation state machine.
//!
//! Activating a conversation means: fetch its REST snapshot, load it, merge
//! any pushes that arrived meanwhile, join its room, mark it read. This
//! module sequences those steps without doing any of them. Like
//! [`ConnectionState`](crate::ConnectionState), it consumes an event and
//! returns itself plus the actions the client must perform.
//!
//! ```text
//! Idle ──Select──▶ Loading ──SnapshotLoaded──▶ Subscribed ──Joined──▶ Active
//!                     │                            │
//!                     └──SnapshotFailed──▶ Error ◀─┘ JoinFailed
//! ```
//!
//! Each fetch carries a monotonic request id. A completion for any other
//! request is stale (the user switched away) and is ignored.

use crate::buffer::{BufferError, PendingBuffer};
use huddle_sync_types::{ConversationId, ConversationKind, Message};

/// Identifies one snapshot fetch.
pub type RequestId = u64;

/// Where the active conversation is in its activation sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerState {
    /// No conversation selected.
    Idle,
    /// Snapshot fetch in flight; pushes for the conversation are buffered.
    Loading {
        /// Conversation being loaded.
        conversation: ConversationId,
        /// Its kind.
        kind: ConversationKind,
        /// Fetch in flight.
        request: RequestId,
    },
    /// Snapshot loaded, room join requested.
    Subscribed {
        /// Loaded conversation.
        conversation: ConversationId,
        /// Its kind.
        kind: ConversationKind,
    },
    /// Loaded, joined and marked read.
    Active {
        /// Active conversation.
        conversation: ConversationId,
        /// Its kind.
        kind: ConversationKind,
    },
    /// Loading or joining failed. Previously loaded messages are kept.
    Error {
        /// Conversation that failed.
        conversation: ConversationId,
        /// Its kind.
        kind: ConversationKind,
        /// Failure description.
        error: String,
    },
}

impl ControllerState {
    /// Selected conversation, if any.
    pub fn conversation(&self) -> Option<&ConversationId> {
        match self {
            Self::Idle => None,
            Self::Loading { conversation, .. }
            | Self::Subscribed { conversation, .. }
            | Self::Active { conversation, .. }
            | Self::Error { conversation, .. } => Some(conversation),
        }
    }

    /// Selected conversation's kind, if any.
    pub fn kind(&self) -> Option<ConversationKind> {
        match self {
            Self::Idle => None,
            Self::Loading { kind, .. }
            | Self::Subscribed { kind, .. }
            | Self::Active { kind, .. }
            | Self::Error { kind, .. } => Some(*kind),
        }
    }

    /// Whether the room has been joined.
    pub fn is_joined(&self) -> bool {
        matches!(self, Self::Subscribed { .. } | Self::Active { .. })
    }

    /// Check if fully active.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active { .. })
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Loading { .. } => "loading",
            Self::Subscribed { .. } => "subscribed",
            Self::Active { .. } => "active",
            Self::Error { .. } => "error",
        }
    }
}

/// Inputs to the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerEvent {
    /// The user opened a conversation.
    Select {
        /// Conversation to open.
        conversation: ConversationId,
        /// Its kind.
        kind: ConversationKind,
    },
    /// The user closed the conversation view.
    Deselect,
    /// A snapshot fetch completed.
    SnapshotLoaded {
        /// Fetch that completed.
        request: RequestId,
        /// Messages it returned.
        messages: Vec<Message>,
    },
    /// A snapshot fetch failed.
    SnapshotFailed {
        /// Fetch that failed.
        request: RequestId,
        /// Failure description.
        error: String,
    },
    /// The room join was sent.
    Joined {
        /// Joined conversation.
        conversation: ConversationId,
    },
    /// The room join could not be sent.
    JoinFailed {
        /// Conversation whose join failed.
        conversation: ConversationId,
        /// Failure description.
        error: String,
    },
    /// A pushed message arrived.
    PushReceived(Message),
    /// Retry after an error.
    Retry,
    /// Refetch the active conversation.
    Resync,
    /// The event channel came back after a drop.
    Reconnected,
}

/// Instructions for the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerAction {
    /// Leave a previously joined room.
    LeaveRoom {
        /// Room to leave.
        conversation: ConversationId,
        /// Its kind.
        kind: ConversationKind,
    },
    /// Mark a conversation as the one on screen (`None` for none).
    SetActive(Option<ConversationId>),
    /// Fetch the message snapshot.
    FetchSnapshot {
        /// Conversation to fetch.
        conversation: ConversationId,
        /// Its kind.
        kind: ConversationKind,
        /// Id to report back with the result.
        request: RequestId,
    },
    /// Replace the conversation's messages with the snapshot.
    LoadSnapshot {
        /// Conversation.
        conversation: ConversationId,
        /// Snapshot messages.
        messages: Vec<Message>,
    },
    /// Reconcile pushes held during the load, in arrival order.
    FlushBuffered {
        /// Conversation.
        conversation: ConversationId,
        /// Held pushes.
        messages: Vec<Message>,
    },
    /// Join the conversation's room.
    JoinRoom {
        /// Conversation.
        conversation: ConversationId,
        /// Its kind.
        kind: ConversationKind,
    },
    /// Tell the server the conversation has been read.
    MarkRead {
        /// Conversation.
        conversation: ConversationId,
        /// Its kind.
        kind: ConversationKind,
    },
    /// Reconcile a push into the message store now.
    Reconcile(Message),
    /// The push buffer is full; pushes are being dropped and a refetch
    /// will follow the current load.
    BufferOverflow {
        /// Conversation being loaded.
        conversation: ConversationId,
        /// Buffer capacity.
        capacity: usize,
    },
    /// Activation failed.
    Failed {
        /// Conversation.
        conversation: ConversationId,
        /// Failure description.
        error: String,
    },
}

/// The activation state machine plus its push buffer.
#[derive(Debug)]
pub struct SyncController {
    state: ControllerState,
    next_request: RequestId,
    buffer: PendingBuffer,
    rejoin_on_reconnect: bool,
}

impl SyncController {
    /// Create an idle controller.
    pub fn new(buffer_capacity: usize, rejoin_on_reconnect: bool) -> Self {
        Self {
            state: ControllerState::Idle,
            next_request: 0,
            buffer: PendingBuffer::new(buffer_capacity),
            rejoin_on_reconnect,
        }
    }

    /// Current state.
    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    /// Number of pushes held for the loading conversation.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Process an event and return the new controller plus actions to execute.
    pub fn on_event(mut self, event: ControllerEvent) -> (Self, Vec<ControllerAction>) {
        let actions = match event {
            ControllerEvent::Select { conversation, kind } => self.select(conversation, kind),
            ControllerEvent::Deselect => self.deselect(),
            ControllerEvent::SnapshotLoaded { request, messages } => {
                self.snapshot_loaded(request, messages)
            }
            ControllerEvent::SnapshotFailed { request, error } => {
                self.snapshot_failed(request, error)
            }
            ControllerEvent::Joined { conversation } => self.joined(conversation),
            ControllerEvent::JoinFailed {
                conversation,
                error,
            } => self.join_failed(conversation, error),
            ControllerEvent::PushReceived(message) => self.push_received(message),
            ControllerEvent::Retry => match &self.state {
                ControllerState::Error {
                    conversation, kind, ..
                } => {
                    let (conversation, kind) = (conversation.clone(), *kind);
                    vec![self.start_load(conversation, kind)]
                }
                _ => vec![],
            },
            ControllerEvent::Resync => self.refetch(),
            ControllerEvent::Reconnected if self.rejoin_on_reconnect => self.refetch(),
            ControllerEvent::Reconnected => vec![],
        };
        (self, actions)
    }

    fn select(
        &mut self,
        conversation: ConversationId,
        kind: ConversationKind,
    ) -> Vec<ControllerAction> {
        let same = self.state.conversation() == Some(&conversation);
        if same && !matches!(self.state, ControllerState::Error { .. }) {
            return vec![];
        }

        let mut actions = Vec::new();
        if let Some(leave) = self.leave_current() {
            actions.push(leave);
        }
        actions.push(ControllerAction::SetActive(Some(conversation.clone())));
        actions.push(self.start_load(conversation, kind));
        actions
    }

    fn deselect(&mut self) -> Vec<ControllerAction> {
        if matches!(self.state, ControllerState::Idle) {
            return vec![];
        }
        let mut actions = Vec::new();
        if let Some(leave) = self.leave_current() {
            actions.push(leave);
        }
        self.buffer.disarm();
        self.state = ControllerState::Idle;
        actions.push(ControllerAction::SetActive(None));
        actions
    }

    fn snapshot_loaded(
        &mut self,
        request: RequestId,
        messages: Vec<Message>,
    ) -> Vec<ControllerAction> {
        let ControllerState::Loading {
            conversation,
            kind,
            request: current,
        } = &self.state
        else {
            return vec![];
        };
        if *current != request {
            return vec![];
        }
        let (conversation, kind) = (conversation.clone(), *kind);

        let overflowed = self.buffer.overflowed();
        let buffered = self.buffer.drain();
        let mut actions = vec![
            ControllerAction::LoadSnapshot {
                conversation: conversation.clone(),
                messages,
            },
            ControllerAction::FlushBuffered {
                conversation: conversation.clone(),
                messages: buffered,
            },
        ];

        if overflowed {
            // Dropped pushes predate the next fetch, so it will contain them.
            actions.push(self.start_load(conversation, kind));
        } else {
            self.state = ControllerState::Subscribed {
                conversation: conversation.clone(),
                kind,
            };
            actions.push(ControllerAction::JoinRoom { conversation, kind });
        }
        actions
    }

    fn snapshot_failed(&mut self, request: RequestId, error: String) -> Vec<ControllerAction> {
        let ControllerState::Loading {
            conversation,
            kind,
            request: current,
        } = &self.state
        else {
            return vec![];
        };
        if *current != request {
            return vec![];
        }
        let (conversation, kind) = (conversation.clone(), *kind);
        self.buffer.disarm();
        self.fail(conversation, kind, error)
    }

    fn joined(&mut self, joined: ConversationId) -> Vec<ControllerAction> {
        match &self.state {
            ControllerState::Subscribed { conversation, kind } if *conversation == joined => {
                let (conversation, kind) = (conversation.clone(), *kind);
                self.state = ControllerState::Active {
                    conversation: conversation.clone(),
                    kind,
                };
                vec![ControllerAction::MarkRead { conversation, kind }]
            }
            _ => vec![],
        }
    }

    fn join_failed(&mut self, failed: ConversationId, error: String) -> Vec<ControllerAction> {
        match &self.state {
            ControllerState::Subscribed { conversation, kind } if *conversation == failed => {
                let (conversation, kind) = (conversation.clone(), *kind);
                self.fail(conversation, kind, error)
            }
            _ => vec![],
        }
    }

    fn push_received(&mut self, message: Message) -> Vec<ControllerAction> {
        if !self.buffer.is_armed_for(&message.conversation_id) {
            return vec![ControllerAction::Reconcile(message)];
        }
        let conversation = message.conversation_id.clone();
        let first_overflow = !self.buffer.overflowed();
        match self.buffer.push(message) {
            Ok(_) => vec![],
            Err(BufferError::Full { capacity }) if first_overflow => {
                vec![ControllerAction::BufferOverflow {
                    conversation,
                    capacity,
                }]
            }
            Err(_) => vec![],
        }
    }

    fn refetch(&mut self) -> Vec<ControllerAction> {
        match &self.state {
            ControllerState::Subscribed { conversation, kind }
            | ControllerState::Active { conversation, kind } => {
                let (conversation, kind) = (conversation.clone(), *kind);
                vec![self.start_load(conversation, kind)]
            }
            _ => vec![],
        }
    }

    fn start_load(&mut self, conversation: ConversationId, kind: ConversationKind) -> ControllerAction {
        self.next_request += 1;
        let request = self.next_request;
        self.buffer.arm(conversation.clone());
        self.state = ControllerState::Loading {
            conversation: conversation.clone(),
            kind,
            request,
        };
        ControllerAction::FetchSnapshot {
            conversation,
            kind,
            request,
        }
    }

    fn leave_current(&self) -> Option<ControllerAction> {
        match &self.state {
            ControllerState::Subscribed { conversation, kind }
            | ControllerState::Active { conversation, kind } => Some(ControllerAction::LeaveRoom {
                conversation: conversation.clone(),
                kind: *kind,
            }),
            _ => None,
        }
    }

    fn fail(
        &mut self,
        conversation: ConversationId,
        kind: ConversationKind,
        error: String,
    ) -> Vec<ControllerAction> {
        self.state = ControllerState::Error {
            conversation: conversation.clone(),
            kind,
            error: error.clone(),
        };
        vec![ControllerAction::Failed {
            conversation,
            error,
        }]
    }
}

impl Default for SyncController {
    fn default() -> Self {
        Self::new(crate::buffer::DEFAULT_BUFFER_CAPACITY, false)
    }
}
