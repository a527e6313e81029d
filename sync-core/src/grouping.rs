//! Visual grouping of consecutive messages by sender.

use crate::system_message;
use huddle_sync_types::{Message, UserId};
use std::ops::Range;

/// Maximum messages in one run.
pub const MAX_GROUP_SIZE: usize = 3;

/// A run of messages rendered under one header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageGroup {
    /// Sender shared by the run.
    pub sender_id: UserId,
    /// Indices into the grouped slice.
    pub range: Range<usize>,
    /// The run is a single system event.
    pub is_system: bool,
}

impl MessageGroup {
    /// Number of messages in the run.
    pub fn len(&self) -> usize {
        self.range.len()
    }

    /// Check if the run is empty. Never true for produced groups.
    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }
}

/// Split messages (in display order) into runs.
///
/// A run shares one sender and holds at most [`MAX_GROUP_SIZE`] messages.
/// System events always stand alone.
pub fn group_messages(messages: &[Message]) -> Vec<MessageGroup> {
    let mut groups: Vec<MessageGroup> = Vec::new();
    for (index, message) in messages.iter().enumerate() {
        let is_system = system_message::is_system_message(&message.content);
        if let Some(last) = groups.last_mut() {
            if !is_system
                && !last.is_system
                && last.sender_id == message.sender_id
                && last.len() < MAX_GROUP_SIZE
            {
                last.range.end = index + 1;
                continue;
            }
        }
        groups.push(MessageGroup {
            sender_id: message.sender_id.clone(),
            range: index..index + 1,
            is_system,
        });
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use huddle_sync_types::{ConversationId, MessageId};

    fn msg(sender: &str, content: &str) -> Message {
        Message {
            id: MessageId::new(format!("{sender}-{content}")),
            conversation_id: ConversationId::new("c1"),
            sender_id: UserId::new(sender),
            sender_name: None,
            content: content.to_string(),
            created_at: Utc::now(),
            read_at: None,
            client_id: None,
            is_optimistic: false,
            failed: false,
        }
    }

    fn sizes(groups: &[MessageGroup]) -> Vec<usize> {
        groups.iter().map(MessageGroup::len).collect()
    }

    #[test]
    fn empty_input() {
        assert!(group_messages(&[]).is_empty());
    }

    #[test]
    fn runs_by_sender() {
        let messages = vec![msg("a", "1"), msg("a", "2"), msg("b", "3"), msg("a", "4")];
        let groups = group_messages(&messages);
        assert_eq!(sizes(&groups), vec![2, 1, 1]);
        assert_eq!(groups[1].sender_id, UserId::new("b"));
    }

    #[test]
    fn runs_are_capped() {
        let messages: Vec<_> = (0..7).map(|i| msg("a", &i.to_string())).collect();
        assert_eq!(sizes(&group_messages(&messages)), vec![3, 3, 1]);
    }

    #[test]
    fn system_events_stand_alone() {
        let messages = vec![
            msg("a", "hi"),
            msg("a", "👋 Alice joined the team!"),
            msg("a", "hello"),
            msg("a", "again"),
        ];
        let groups = group_messages(&messages);
        assert_eq!(sizes(&groups), vec![1, 1, 2]);
        assert!(groups[1].is_system);
        assert!(!groups[2].is_system);
    }

    #[test]
    fn consecutive_system_events_do_not_merge() {
        let messages = vec![
            msg("a", "🚪 Bob has left the team."),
            msg("a", "🚪 Carol has left the team."),
        ];
        assert_eq!(sizes(&group_messages(&messages)), vec![1, 1]);
    }
}
