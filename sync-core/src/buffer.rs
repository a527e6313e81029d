//! Pending-push buffer for the conversation being loaded.
//!
//! While a conversation's REST snapshot is in flight, pushed messages for
//! that conversation cannot be reconciled yet: the snapshot load replaces the
//! message list and would wipe them. They are held here instead and merged
//! after the snapshot lands, so the final list contains the snapshot followed
//! by the pushes in arrival order.
//!
//! The buffer has:
//! - FIFO ordering
//! - Id-based dedup (a push delivered twice is held once)
//! - A max size to prevent unbounded memory growth

use huddle_sync_types::{ConversationId, Message, MessageId};
use std::collections::{HashSet, VecDeque};
use thiserror::Error;

/// Default number of pushes held per load.
pub const DEFAULT_BUFFER_CAPACITY: usize = 256;

/// Error type for buffer operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BufferError {
    /// Buffer is at capacity.
    #[error("buffer full (capacity: {capacity})")]
    Full {
        /// Current buffer capacity.
        capacity: usize,
    },
    /// The message belongs to a conversation that is not being loaded.
    #[error("buffer is not armed for conversation {0}")]
    NotArmed(ConversationId),
}

/// Holds pushes for one conversation until its snapshot is loaded.
#[derive(Debug)]
pub struct PendingBuffer {
    max_size: usize,
    conversation: Option<ConversationId>,
    queue: VecDeque<Message>,
    seen: HashSet<MessageId>,
    overflowed: bool,
}

impl PendingBuffer {
    /// Create a new buffer with the given maximum size.
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            conversation: None,
            queue: VecDeque::new(),
            seen: HashSet::new(),
            overflowed: false,
        }
    }

    /// Start buffering for `conversation`, discarding anything held for a
    /// previous one.
    pub fn arm(&mut self, conversation: ConversationId) {
        self.clear();
        self.conversation = Some(conversation);
    }

    /// Stop buffering and drop everything held.
    pub fn disarm(&mut self) {
        self.clear();
    }

    /// Conversation currently being buffered for.
    pub fn armed_for(&self) -> Option<&ConversationId> {
        self.conversation.as_ref()
    }

    /// Whether pushes for `conversation` should be held.
    pub fn is_armed_for(&self, conversation: &ConversationId) -> bool {
        self.conversation.as_ref() == Some(conversation)
    }

    /// Hold a pushed message.
    ///
    /// Returns `Ok(false)` if a message with the same id is already held.
    pub fn push(&mut self, message: Message) -> Result<bool, BufferError> {
        if !self.is_armed_for(&message.conversation_id) {
            return Err(BufferError::NotArmed(message.conversation_id));
        }
        if self.seen.contains(&message.id) {
            return Ok(false);
        }
        if self.queue.len() >= self.max_size {
            self.overflowed = true;
            return Err(BufferError::Full {
                capacity: self.max_size,
            });
        }
        self.seen.insert(message.id.clone());
        self.queue.push_back(message);
        Ok(true)
    }

    /// Take every held message in arrival order and disarm.
    pub fn drain(&mut self) -> Vec<Message> {
        let drained = self.queue.drain(..).collect();
        self.clear();
        drained
    }

    /// Whether a push was rejected for capacity since the buffer was armed.
    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    /// Number of held messages.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Check if nothing is held.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Maximum number of held messages.
    pub fn capacity(&self) -> usize {
        self.max_size
    }

    fn clear(&mut self) {
        self.conversation = None;
        self.queue.clear();
        self.seen.clear();
        self.overflowed = false;
    }
}

impl Default for PendingBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use huddle_sync_types::UserId;

    fn make_push(conversation: &str, id: &str) -> Message {
        Message {
            id: MessageId::new(id),
            conversation_id: ConversationId::new(conversation),
            sender_id: UserId::new("u2"),
            sender_name: None,
            content: format!("content of {id}"),
            created_at: Utc::now(),
            read_at: None,
            client_id: None,
            is_optimistic: false,
            failed: false,
        }
    }

    #[test]
    fn unarmed_buffer_rejects() {
        let mut buffer = PendingBuffer::new(10);
        let result = buffer.push(make_push("c1", "m1"));
        assert!(matches!(result, Err(BufferError::NotArmed(_))));
    }

    #[test]
    fn holds_pushes_in_arrival_order() {
        let mut buffer = PendingBuffer::new(10);
        buffer.arm(ConversationId::new("c1"));

        buffer.push(make_push("c1", "m2")).unwrap();
        buffer.push(make_push("c1", "m1")).unwrap();

        let drained = buffer.drain();
        let ids: Vec<_> = drained.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m2", "m1"]);
    }

    #[test]
    fn rejects_other_conversations() {
        let mut buffer = PendingBuffer::new(10);
        buffer.arm(ConversationId::new("c1"));
        assert!(buffer.push(make_push("c2", "m1")).is_err());
        assert!(buffer.is_empty());
    }

    #[test]
    fn duplicate_push_is_held_once() {
        let mut buffer = PendingBuffer::new(10);
        buffer.arm(ConversationId::new("c1"));

        assert!(buffer.push(make_push("c1", "m1")).unwrap());
        assert!(!buffer.push(make_push("c1", "m1")).unwrap());
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn respects_max_size() {
        let mut buffer = PendingBuffer::new(2);
        buffer.arm(ConversationId::new("c1"));

        buffer.push(make_push("c1", "m1")).unwrap();
        buffer.push(make_push("c1", "m2")).unwrap();
        let overflow = buffer.push(make_push("c1", "m3"));

        assert_eq!(overflow, Err(BufferError::Full { capacity: 2 }));
        assert!(buffer.overflowed());
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn drain_disarms() {
        let mut buffer = PendingBuffer::new(10);
        buffer.arm(ConversationId::new("c1"));
        buffer.push(make_push("c1", "m1")).unwrap();

        buffer.drain();

        assert!(buffer.armed_for().is_none());
        assert!(buffer.is_empty());
    }

    #[test]
    fn rearming_discards_previous_conversation() {
        let mut buffer = PendingBuffer::new(10);
        buffer.arm(ConversationId::new("c1"));
        buffer.push(make_push("c1", "m1")).unwrap();

        buffer.arm(ConversationId::new("c2"));

        assert!(buffer.is_empty());
        assert!(buffer.is_armed_for(&ConversationId::new("c2")));
    }

    #[test]
    fn full_error_display() {
        assert_eq!(
            BufferError::Full { capacity: 4 }.to_string(),
            "buffer full (capacity: 4)"
        );
    }
}
