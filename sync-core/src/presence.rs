//! Online-user set, replaced wholesale by each `users:online` push.

use huddle_sync_types::UserId;
use std::collections::HashSet;

/// Set of currently online users.
#[derive(Debug, Clone, Default)]
pub struct PresenceTracker {
    online: HashSet<UserId>,
}

impl PresenceTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole set. Returns `true` if membership changed.
    pub fn replace(&mut self, ids: impl IntoIterator<Item = UserId>) -> bool {
        let next: HashSet<UserId> = ids.into_iter().collect();
        let changed = next != self.online;
        self.online = next;
        changed
    }

    /// Check if a user is online.
    pub fn is_online(&self, user: &UserId) -> bool {
        self.online.contains(user)
    }

    /// Number of online users.
    pub fn len(&self) -> usize {
        self.online.len()
    }

    /// Check if nobody is online.
    pub fn is_empty(&self) -> bool {
        self.online.is_empty()
    }

    /// Online users, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &UserId> {
        self.online.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: &[&str]) -> Vec<UserId> {
        raw.iter().map(|s| UserId::new(*s)).collect()
    }

    #[test]
    fn replace_sets_membership() {
        let mut presence = PresenceTracker::new();
        assert!(presence.replace(ids(&["a", "b"])));
        assert!(presence.is_online(&UserId::new("a")));
        assert!(!presence.is_online(&UserId::new("c")));
        assert_eq!(presence.len(), 2);
    }

    #[test]
    fn replace_is_not_a_merge() {
        let mut presence = PresenceTracker::new();
        presence.replace(ids(&["a", "b"]));
        presence.replace(ids(&["c"]));
        assert!(!presence.is_online(&UserId::new("a")));
        assert!(presence.is_online(&UserId::new("c")));
    }

    #[test]
    fn empty_replace_clears() {
        let mut presence = PresenceTracker::new();
        presence.replace(ids(&["a"]));
        assert!(presence.replace(Vec::new()));
        assert!(presence.is_empty());
    }

    #[test]
    fn same_set_reports_unchanged() {
        let mut presence = PresenceTracker::new();
        presence.replace(ids(&["a", "b"]));
        assert!(!presence.replace(ids(&["b", "a", "a"])));
    }
}
