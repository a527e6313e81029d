//! Recency-sorted conversation summaries.
//!
//! Iteration order is always non-increasing by `updated_at`. Ties keep their
//! previous relative order.

use chrono::{DateTime, Utc};
use huddle_sync_types::{Conversation, ConversationId, ConversationKind, Counterpart, Message, UserId};

/// The conversation list plus which conversation is on screen.
#[derive(Debug, Clone)]
pub struct ConversationStore {
    local_user: UserId,
    conversations: Vec<Conversation>,
    active: Option<ConversationId>,
}

impl ConversationStore {
    /// Create an empty store for the given local user.
    pub fn new(local_user: UserId) -> Self {
        Self {
            local_user,
            conversations: Vec::new(),
            active: None,
        }
    }

    /// Replace the collection with a freshly fetched list.
    ///
    /// Virtual entries absent from the list survive. A virtual entry whose
    /// counterpart now has a real conversation is dropped in its favour.
    pub fn upsert_from_snapshot(&mut self, snapshot: Vec<Conversation>) {
        let mut next: Vec<Conversation> = Vec::with_capacity(snapshot.len());
        for conversation in snapshot {
            if next.iter().all(|c| c.id != conversation.id) {
                next.push(conversation);
            }
        }

        let survivors: Vec<Conversation> = self
            .conversations
            .drain(..)
            .filter(|c| {
                c.is_virtual
                    && next
                        .iter()
                        .all(|n| n.id != c.id && !n.counterpart.is_same_party(&c.counterpart))
            })
            .collect();
        next.extend(survivors);

        self.conversations = next;
        self.zero_active_unread();
        self.sort();
    }

    /// Insert or replace a single conversation.
    ///
    /// A virtual placeholder for the same counterpart is replaced, and the
    /// active selection follows it.
    pub fn upsert(&mut self, conversation: Conversation) {
        let placeholder = self
            .conversations
            .iter()
            .position(|c| {
                c.is_virtual
                    && c.id != conversation.id
                    && c.counterpart.is_same_party(&conversation.counterpart)
            })
            .map(|index| self.conversations.remove(index));
        if let Some(placeholder) = placeholder {
            if self.active.as_ref() == Some(&placeholder.id) {
                self.active = Some(conversation.id.clone());
            }
        }

        match self.position(&conversation.id) {
            Some(index) => self.conversations[index] = conversation,
            None => self.conversations.push(conversation),
        }
        self.zero_active_unread();
        self.sort();
    }

    /// Fold a new message into its conversation's summary.
    ///
    /// Returns `false` when the conversation is unknown; the caller should
    /// refresh the list.
    pub fn apply_incoming_message(&mut self, message: &Message) -> bool {
        let Some(index) = self.position(&message.conversation_id) else {
            return false;
        };
        let is_active = self.active.as_ref() == Some(&message.conversation_id);
        let from_peer = message.sender_id != self.local_user;

        let conversation = &mut self.conversations[index];
        conversation.last_message_preview = Some(message.content.clone());
        conversation.updated_at = conversation.updated_at.max(message.created_at);
        if !is_active && from_peer {
            conversation.unread_count = conversation.unread_count.saturating_add(1);
        }
        conversation.is_virtual = false;

        self.sort();
        true
    }

    /// Apply a `conversation:updated` push.
    pub fn apply_update(
        &mut self,
        id: &ConversationId,
        last_message: Option<String>,
        updated_at: DateTime<Utc>,
    ) -> bool {
        let Some(index) = self.position(id) else {
            return false;
        };
        let conversation = &mut self.conversations[index];
        if last_message.is_some() {
            conversation.last_message_preview = last_message;
        }
        conversation.updated_at = updated_at;
        self.sort();
        true
    }

    /// Mark `id` as active and zero its unread count.
    pub fn select_conversation(&mut self, id: &ConversationId) {
        self.active = Some(id.clone());
        self.zero_active_unread();
    }

    /// No conversation on screen.
    pub fn clear_active(&mut self) {
        self.active = None;
    }

    /// The conversation on screen, if any.
    pub fn active(&self) -> Option<&ConversationId> {
        self.active.as_ref()
    }

    /// Materialize a local placeholder unless a conversation with this id or
    /// counterpart already exists. Returns the id of the entry to open.
    pub fn ensure_virtual(
        &mut self,
        id: ConversationId,
        kind: ConversationKind,
        counterpart: Counterpart,
        now: DateTime<Utc>,
    ) -> ConversationId {
        if let Some(existing) = self
            .conversations
            .iter()
            .find(|c| {
                c.id == id || (c.kind == kind && c.counterpart.is_same_party(&counterpart))
            })
        {
            return existing.id.clone();
        }
        self.conversations.push(Conversation::virtual_placeholder(
            id.clone(),
            kind,
            counterpart,
            now,
        ));
        self.sort();
        id
    }

    /// Clear the virtual flag. Returns `true` if it was set.
    pub fn promote(&mut self, id: &ConversationId) -> bool {
        match self.conversations.iter_mut().find(|c| &c.id == id) {
            Some(conversation) if conversation.is_virtual => {
                conversation.is_virtual = false;
                true
            }
            _ => false,
        }
    }

    /// Look up a conversation.
    pub fn get(&self, id: &ConversationId) -> Option<&Conversation> {
        self.conversations.iter().find(|c| &c.id == id)
    }

    /// Conversations, most recent first.
    pub fn iter(&self) -> impl Iterator<Item = &Conversation> {
        self.conversations.iter()
    }

    /// Number of conversations.
    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    /// Check if the list is empty.
    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    /// Sum of unread counts.
    pub fn total_unread(&self) -> u32 {
        self.conversations
            .iter()
            .fold(0u32, |acc, c| acc.saturating_add(c.unread_count))
    }

    fn position(&self, id: &ConversationId) -> Option<usize> {
        self.conversations.iter().position(|c| &c.id == id)
    }

    fn zero_active_unread(&mut self) {
        if let Some(active) = &self.active {
            if let Some(conversation) = self.conversations.iter_mut().find(|c| &c.id == active) {
                conversation.unread_count = 0;
            }
        }
    }

    fn sort(&mut self) {
        // sort_by is stable: equal timestamps keep their order
        self.conversations
            .sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    }
}
