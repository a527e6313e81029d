//! Per-conversation typing indicators with expiry.
//!
//! The tracker does not own timers. Every `set_typing(true)` bumps the
//! entry's generation and tells the caller to schedule an expiry for that
//! generation; an expiry carrying an older generation is ignored, so a timer
//! that fires late cannot remove a refreshed entry.

use huddle_sync_types::{ConversationId, UserId};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

/// How long an indicator survives without a refresh.
pub const DEFAULT_TYPING_TIMEOUT: Duration = Duration::from_secs(3);

/// One user typing in one conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingEntry {
    /// Display name.
    pub username: String,
    /// Last `typing:start` seen.
    pub updated_at: Instant,
    generation: u64,
}

/// What the caller must do with its expiry timers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypingInstruction {
    /// Cancel any timer for this user and start one that calls
    /// [`TypingTracker::expire`] with `generation` after `after`.
    ScheduleExpiry {
        /// Conversation.
        conversation_id: ConversationId,
        /// Typing user.
        user_id: UserId,
        /// Generation to pass back.
        generation: u64,
        /// Delay.
        after: Duration,
    },
    /// Cancel any timer for this user.
    CancelExpiry {
        /// Conversation.
        conversation_id: ConversationId,
        /// User that stopped typing.
        user_id: UserId,
    },
}

/// Who is typing where.
#[derive(Debug, Clone)]
pub struct TypingTracker {
    local_user: UserId,
    timeout: Duration,
    next_generation: u64,
    entries: HashMap<ConversationId, BTreeMap<UserId, TypingEntry>>,
}

impl TypingTracker {
    /// Create a tracker with the default timeout.
    pub fn new(local_user: UserId) -> Self {
        Self::with_timeout(local_user, DEFAULT_TYPING_TIMEOUT)
    }

    /// Create a tracker with a custom timeout.
    pub fn with_timeout(local_user: UserId, timeout: Duration) -> Self {
        Self {
            local_user,
            timeout,
            next_generation: 0,
            entries: HashMap::new(),
        }
    }

    /// Expiry timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Apply a typing update.
    pub fn set_typing(
        &mut self,
        conversation_id: ConversationId,
        user_id: UserId,
        username: impl Into<String>,
        is_typing: bool,
        now: Instant,
    ) -> TypingInstruction {
        if !is_typing {
            self.remove(&conversation_id, &user_id);
            return TypingInstruction::CancelExpiry {
                conversation_id,
                user_id,
            };
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        self.entries
            .entry(conversation_id.clone())
            .or_default()
            .insert(
                user_id.clone(),
                TypingEntry {
                    username: username.into(),
                    updated_at: now,
                    generation,
                },
            );

        TypingInstruction::ScheduleExpiry {
            conversation_id,
            user_id,
            generation,
            after: self.timeout,
        }
    }

    /// Remove the entry if its generation still matches.
    ///
    /// Returns `true` if an entry was removed.
    pub fn expire(
        &mut self,
        conversation_id: &ConversationId,
        user_id: &UserId,
        generation: u64,
    ) -> bool {
        let current = self
            .entries
            .get(conversation_id)
            .and_then(|users| users.get(user_id))
            .map(|entry| entry.generation);
        if current != Some(generation) {
            return false;
        }
        self.remove(conversation_id, user_id)
    }

    /// Remove every entry older than the timeout. Returns how many went.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let timeout = self.timeout;
        let mut removed = 0;
        for users in self.entries.values_mut() {
            let before = users.len();
            users.retain(|_, entry| now.saturating_duration_since(entry.updated_at) < timeout);
            removed += before - users.len();
        }
        self.entries.retain(|_, users| !users.is_empty());
        removed
    }

    /// Drop every entry for a conversation, returning the users that had one.
    pub fn clear_conversation(&mut self, conversation_id: &ConversationId) -> Vec<UserId> {
        self.entries
            .remove(conversation_id)
            .map(|users| users.into_keys().collect())
            .unwrap_or_default()
    }

    /// Drop every entry, returning the conversations that had any.
    pub fn clear(&mut self) -> Vec<ConversationId> {
        self.entries.drain().map(|(id, _)| id).collect()
    }

    /// Users typing in a conversation, excluding the local user, ordered by
    /// user id.
    pub fn active_typers(&self, conversation_id: &ConversationId) -> Vec<(UserId, String)> {
        self.entries
            .get(conversation_id)
            .map(|users| {
                users
                    .iter()
                    .filter(|(id, _)| **id != self.local_user)
                    .map(|(id, entry)| (id.clone(), entry.username.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Look up one entry.
    pub fn get(&self, conversation_id: &ConversationId, user_id: &UserId) -> Option<&TypingEntry> {
        self.entries.get(conversation_id)?.get(user_id)
    }

    fn remove(&mut self, conversation_id: &ConversationId, user_id: &UserId) -> bool {
        let Some(users) = self.entries.get_mut(conversation_id) else {
            return false;
        };
        let removed = users.remove(user_id).is_some();
        if users.is_empty() {
            self.entries.remove(conversation_id);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conv() -> ConversationId {
        ConversationId::new("c1")
    }

    fn generation_of(instruction: &TypingInstruction) -> u64 {
        match instruction {
            TypingInstruction::ScheduleExpiry { generation, .. } => *generation,
            other => panic!("expected ScheduleExpiry, got {other:?}"),
        }
    }

    #[test]
    fn start_schedules_expiry() {
        let mut typing = TypingTracker::new(UserId::new("me"));
        let instruction =
            typing.set_typing(conv(), UserId::new("bob"), "Bob", true, Instant::now());

        assert!(matches!(
            instruction,
            TypingInstruction::ScheduleExpiry { after, .. } if after == DEFAULT_TYPING_TIMEOUT
        ));
        assert_eq!(
            typing.active_typers(&conv()),
            vec![(UserId::new("bob"), "Bob".to_string())]
        );
    }

    #[test]
    fn stop_removes_immediately() {
        let mut typing = TypingTracker::new(UserId::new("me"));
        typing.set_typing(conv(), UserId::new("bob"), "Bob", true, Instant::now());

        let instruction =
            typing.set_typing(conv(), UserId::new("bob"), "Bob", false, Instant::now());

        assert!(matches!(instruction, TypingInstruction::CancelExpiry { .. }));
        assert!(typing.active_typers(&conv()).is_empty());
    }

    #[test]
    fn expiry_removes_matching_generation() {
        let mut typing = TypingTracker::new(UserId::new("me"));
        let generation = generation_of(&typing.set_typing(
            conv(),
            UserId::new("bob"),
            "Bob",
            true,
            Instant::now(),
        ));

        assert!(typing.expire(&conv(), &UserId::new("bob"), generation));
        assert!(typing.active_typers(&conv()).is_empty());
    }

    #[test]
    fn stale_expiry_is_ignored_after_refresh() {
        let mut typing = TypingTracker::new(UserId::new("me"));
        let bob = UserId::new("bob");
        let first = generation_of(&typing.set_typing(conv(), bob.clone(), "Bob", true, Instant::now()));
        let second =
            generation_of(&typing.set_typing(conv(), bob.clone(), "Bob", true, Instant::now()));

        assert!(!typing.expire(&conv(), &bob, first));
        assert_eq!(typing.active_typers(&conv()).len(), 1);
        assert!(typing.expire(&conv(), &bob, second));
    }

    #[test]
    fn local_user_is_excluded() {
        let mut typing = TypingTracker::new(UserId::new("me"));
        typing.set_typing(conv(), UserId::new("me"), "Me", true, Instant::now());
        assert!(typing.active_typers(&conv()).is_empty());
        assert!(typing.get(&conv(), &UserId::new("me")).is_some());
    }

    #[test]
    fn sweep_drops_overdue_entries() {
        let mut typing = TypingTracker::with_timeout(UserId::new("me"), Duration::from_secs(3));
        let start = Instant::now();
        typing.set_typing(conv(), UserId::new("bob"), "Bob", true, start);
        typing.set_typing(
            conv(),
            UserId::new("carol"),
            "Carol",
            true,
            start + Duration::from_secs(2),
        );

        assert_eq!(typing.sweep(start + Duration::from_secs(4)), 1);
        assert_eq!(
            typing.active_typers(&conv()),
            vec![(UserId::new("carol"), "Carol".to_string())]
        );
    }

    #[test]
    fn clear_conversation_returns_users() {
        let mut typing = TypingTracker::new(UserId::new("me"));
        typing.set_typing(conv(), UserId::new("bob"), "Bob", true, Instant::now());
        typing.set_typing(
            ConversationId::new("c2"),
            UserId::new("carol"),
            "Carol",
            true,
            Instant::now(),
        );

        assert_eq!(typing.clear_conversation(&conv()), vec![UserId::new("bob")]);
        assert!(typing.active_typers(&conv()).is_empty());
        assert_eq!(typing.active_typers(&ConversationId::new("c2")).len(), 1);
    }

    #[test]
    fn clear_drops_everything() {
        let mut typing = TypingTracker::new(UserId::new("me"));
        typing.set_typing(conv(), UserId::new("bob"), "Bob", true, Instant::now());

        assert_eq!(typing.clear(), vec![conv()]);
        assert!(typing.active_typers(&conv()).is_empty());
        assert!(typing.clear().is_empty());
    }
}
