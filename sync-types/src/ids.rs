//! Identity types for Huddle conversations.
//!
//! Server-assigned identifiers are opaque strings. The only identifier the
//! client mints itself is [`ClientMessageId`], the idempotency key attached to
//! an outgoing message and echoed back in its acknowledgment.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Prefix for message ids that have not been acknowledged by the server.
const TEMPORARY_PREFIX: &str = "temp-";

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap a raw identifier.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Borrow the raw identifier.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// A user account identifier.
    UserId
);

string_id!(
    /// A team identifier.
    TeamId
);

string_id!(
    /// A conversation identifier (direct or team scoped).
    ConversationId
);

string_id!(
    /// A message identifier.
    ///
    /// Temporary (`temp-<uuid>`) until the server acknowledges the message,
    /// then the server-assigned id.
    MessageId
);

impl MessageId {
    /// Build the temporary id used for an optimistic message.
    pub fn temporary(client_id: &ClientMessageId) -> Self {
        Self(format!("{TEMPORARY_PREFIX}{}", client_id.0))
    }

    /// Whether this id was minted locally and is still awaiting acknowledgment.
    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(TEMPORARY_PREFIX)
    }
}

/// Client-generated idempotency key for an outgoing message.
///
/// UUID v4, sent with `message:new` and round-tripped in `message:received`
/// so the acknowledgment can be matched to exactly one optimistic entry.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientMessageId(uuid::Uuid);

impl ClientMessageId {
    /// Create a new random key.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Get the inner UUID.
    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl Default for ClientMessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientMessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for ClientMessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientMessageId({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_message_id_is_uuid_v4() {
        let id = ClientMessageId::new();
        assert_eq!(id.as_uuid().get_version_num(), 4);
    }

    #[test]
    fn client_message_ids_are_unique() {
        assert_ne!(ClientMessageId::new(), ClientMessageId::new());
    }

    #[test]
    fn temporary_message_id_is_flagged() {
        let client_id = ClientMessageId::new();
        let temp = MessageId::temporary(&client_id);
        assert!(temp.is_temporary());
        assert!(temp.as_str().ends_with(&client_id.to_string()));
        assert!(!MessageId::new("64f1c2").is_temporary());
    }

    #[test]
    fn string_ids_serialize_transparently() {
        let id = ConversationId::new("conv-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"conv-1\"");
        let back: ConversationId = serde_json::from_str("\"conv-1\"").unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn debug_shows_type_name() {
        assert_eq!(format!("{:?}", UserId::new("u1")), "UserId(u1)");
    }
}
