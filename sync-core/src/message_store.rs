//! Per-conversation message lists with optimistic-send reconciliation.
//!
//! Messages are kept in arrival/reconciliation order, not re-sorted by
//! `created_at`. A push that overtakes an earlier one on the network is
//! shown after it.
//!
//! Reconciliation of a server message, in order:
//! 1. Its id is already present: duplicate delivery, no-op.
//! 2. It carries a `client_id` matching an optimistic entry: that entry is
//!    replaced in place.
//! 3. It carries no `client_id`, was sent by the local user, and an
//!    optimistic entry exists: the oldest optimistic entry with the same
//!    content (else the oldest one) is replaced in place.
//! 4. Otherwise it is appended.

use chrono::{DateTime, Utc};
use huddle_sync_types::{ClientMessageId, ConversationId, Message, MessageId, UserId};
use std::collections::{HashMap, HashSet};

/// What `reconcile` did with a server message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciled {
    /// Already present; nothing changed.
    Duplicate,
    /// Replaced the optimistic entry that had the given temporary id.
    ReplacedOptimistic {
        /// Temporary id of the replaced entry.
        temp_id: MessageId,
    },
    /// Appended at the tail.
    Appended,
}

impl Reconciled {
    /// Whether the store changed.
    pub fn changed(&self) -> bool {
        !matches!(self, Self::Duplicate)
    }
}

/// Ordered message lists keyed by conversation.
#[derive(Debug, Clone)]
pub struct MessageStore {
    local_user: UserId,
    logs: HashMap<ConversationId, Vec<Message>>,
}

impl MessageStore {
    /// Create an empty store for the given local user.
    pub fn new(local_user: UserId) -> Self {
        Self {
            local_user,
            logs: HashMap::new(),
        }
    }

    /// The user whose sends are optimistic.
    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    /// Replace a conversation's messages with a snapshot.
    ///
    /// Duplicate ids inside the snapshot are dropped (first wins). Optimistic
    /// entries still awaiting acknowledgment are carried over at the tail
    /// unless the snapshot already contains their `client_id`.
    pub fn load_snapshot(&mut self, conversation_id: ConversationId, messages: Vec<Message>) {
        let pending: Vec<Message> = self
            .logs
            .remove(&conversation_id)
            .unwrap_or_default()
            .into_iter()
            .filter(|m| m.is_optimistic)
            .collect();

        let mut seen_ids = HashSet::new();
        let mut seen_keys = HashSet::new();
        let mut log = Vec::with_capacity(messages.len() + pending.len());
        for mut message in messages {
            if message.conversation_id != conversation_id || !seen_ids.insert(message.id.clone())
            {
                continue;
            }
            if let Some(key) = message.client_id {
                seen_keys.insert(key);
            }
            message.is_optimistic = false;
            message.failed = false;
            log.push(message);
        }
        log.extend(
            pending
                .into_iter()
                .filter(|m| m.client_id.map_or(true, |key| !seen_keys.contains(&key))),
        );

        self.logs.insert(conversation_id, log);
    }

    /// Append a locally sent message at the tail, flagged optimistic.
    pub fn append_optimistic(&mut self, temp_id: MessageId, mut message: Message) {
        message.id = temp_id;
        message.is_optimistic = true;
        message.failed = false;
        self.logs
            .entry(message.conversation_id.clone())
            .or_default()
            .push(message);
    }

    /// Merge a server message. See the module docs for the rules.
    pub fn reconcile(&mut self, mut message: Message) -> Reconciled {
        message.is_optimistic = false;
        message.failed = false;
        let is_local = message.sender_id == self.local_user;
        let log = self
            .logs
            .entry(message.conversation_id.clone())
            .or_default();

        if log.iter().any(|m| m.id == message.id) {
            // A snapshot may have persisted the message while its optimistic
            // twin was carried over; drop the twin.
            if let Some(key) = message.client_id {
                log.retain(|m| !(m.is_optimistic && m.client_id == Some(key)));
            }
            return Reconciled::Duplicate;
        }

        let position = match message.client_id {
            Some(key) => log
                .iter()
                .position(|m| m.is_optimistic && m.client_id == Some(key)),
            None if is_local => log
                .iter()
                .position(|m| m.is_optimistic && m.content == message.content)
                .or_else(|| log.iter().position(|m| m.is_optimistic)),
            None => None,
        };

        match position {
            Some(index) => {
                let temp_id = std::mem::replace(&mut log[index], message).id;
                Reconciled::ReplacedOptimistic { temp_id }
            }
            None => {
                log.push(message);
                Reconciled::Appended
            }
        }
    }

    /// Flag an optimistic entry whose send was rejected. The entry stays
    /// visible until the caller retries or abandons it.
    pub fn mark_failed(
        &mut self,
        conversation_id: &ConversationId,
        client_id: &ClientMessageId,
    ) -> bool {
        match self.find_optimistic_mut(conversation_id, client_id) {
            Some(message) => {
                message.failed = true;
                true
            }
            None => false,
        }
    }

    /// Remove an optimistic entry the caller decided not to retry.
    pub fn abandon(
        &mut self,
        conversation_id: &ConversationId,
        client_id: &ClientMessageId,
    ) -> Option<Message> {
        let log = self.logs.get_mut(conversation_id)?;
        let index = log
            .iter()
            .position(|m| m.is_optimistic && m.client_id.as_ref() == Some(client_id))?;
        Some(log.remove(index))
    }

    /// Record that the counterpart read the conversation: every persisted
    /// local message without a read time gets `read_at`.
    ///
    /// Returns how many messages changed.
    pub fn apply_read_status(
        &mut self,
        conversation_id: &ConversationId,
        read_at: DateTime<Utc>,
    ) -> usize {
        let Some(log) = self.logs.get_mut(conversation_id) else {
            return 0;
        };
        let mut changed = 0;
        for message in log.iter_mut().filter(|m| {
            m.sender_id == self.local_user && !m.is_optimistic && m.read_at.is_none()
        }) {
            message.read_at = Some(read_at);
            changed += 1;
        }
        changed
    }

    /// Messages of a conversation in display order.
    pub fn messages(&self, conversation_id: &ConversationId) -> &[Message] {
        self.logs
            .get(conversation_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Look up a message by id.
    pub fn get(&self, conversation_id: &ConversationId, id: &MessageId) -> Option<&Message> {
        self.messages(conversation_id).iter().find(|m| &m.id == id)
    }

    /// Whether a message id is present.
    pub fn contains(&self, conversation_id: &ConversationId, id: &MessageId) -> bool {
        self.get(conversation_id, id).is_some()
    }

    /// Optimistic entries still awaiting acknowledgment.
    pub fn pending(&self, conversation_id: &ConversationId) -> impl Iterator<Item = &Message> {
        self.messages(conversation_id)
            .iter()
            .filter(|m| m.is_optimistic)
    }

    /// Whether a snapshot or any message has been stored for the conversation.
    pub fn is_loaded(&self, conversation_id: &ConversationId) -> bool {
        self.logs.contains_key(conversation_id)
    }

    /// Drop a conversation's messages.
    pub fn clear(&mut self, conversation_id: &ConversationId) {
        self.logs.remove(conversation_id);
    }

    fn find_optimistic_mut(
        &mut self,
        conversation_id: &ConversationId,
        client_id: &ClientMessageId,
    ) -> Option<&mut Message> {
        self.logs
            .get_mut(conversation_id)?
            .iter_mut()
            .find(|m| m.is_optimistic && m.client_id.as_ref() == Some(client_id))
    }
}
