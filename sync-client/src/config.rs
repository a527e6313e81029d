//! Engine configuration.

use huddle_sync_core::{DEFAULT_BUFFER_CAPACITY, DEFAULT_TYPING_TIMEOUT};
use huddle_sync_types::UserId;
use std::time::Duration;

/// How long a new incoming message stays highlighted.
pub const DEFAULT_HIGHLIGHT_TIMEOUT: Duration = Duration::from_secs(3);

/// How long a notification stays before it is dismissed.
pub const DEFAULT_NOTIFICATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for [`SyncEngine`](crate::SyncEngine).
#[derive(Clone)]
pub struct SyncConfig {
    /// REST base URL.
    pub api_url: String,
    /// Event channel URL.
    pub socket_url: String,
    /// Bearer token for both.
    pub token: String,
    /// The signed-in user.
    pub local_user: UserId,
    /// Typing indicator expiry.
    pub typing_timeout: Duration,
    /// Highlight auto-clear delay.
    pub highlight_timeout: Duration,
    /// Notification auto-dismiss delay.
    pub notification_timeout: Duration,
    /// Pushes held while a conversation loads.
    pub buffer_capacity: usize,
    /// Re-fetch and re-join the active conversation after a reconnect.
    pub rejoin_on_reconnect: bool,
}

impl SyncConfig {
    /// Create a configuration with default timeouts.
    pub fn new(
        api_url: impl Into<String>,
        socket_url: impl Into<String>,
        token: impl Into<String>,
        local_user: UserId,
    ) -> Self {
        Self {
            api_url: api_url.into(),
            socket_url: socket_url.into(),
            token: token.into(),
            local_user,
            typing_timeout: DEFAULT_TYPING_TIMEOUT,
            highlight_timeout: DEFAULT_HIGHLIGHT_TIMEOUT,
            notification_timeout: DEFAULT_NOTIFICATION_TIMEOUT,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            rejoin_on_reconnect: false,
        }
    }

    /// Set the typing indicator expiry.
    pub fn with_typing_timeout(mut self, timeout: Duration) -> Self {
        self.typing_timeout = timeout;
        self
    }

    /// Set the highlight auto-clear delay.
    pub fn with_highlight_timeout(mut self, timeout: Duration) -> Self {
        self.highlight_timeout = timeout;
        self
    }

    /// Set the notification auto-dismiss delay.
    pub fn with_notification_timeout(mut self, timeout: Duration) -> Self {
        self.notification_timeout = timeout;
        self
    }

    /// Set the push buffer capacity.
    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    /// Re-fetch and re-join the active conversation after a reconnect.
    pub fn with_rejoin_on_reconnect(mut self, rejoin: bool) -> Self {
        self.rejoin_on_reconnect = rejoin;
        self
    }
}

impl std::fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncConfig")
            .field("api_url", &self.api_url)
            .field("socket_url", &self.socket_url)
            .field("token", &"[REDACTED]")
            .field("local_user", &self.local_user)
            .field("typing_timeout", &self.typing_timeout)
            .field("highlight_timeout", &self.highlight_timeout)
            .field("notification_timeout", &self.notification_timeout)
            .field("buffer_capacity", &self.buffer_capacity)
            .field("rejoin_on_reconnect", &self.rejoin_on_reconnect)
            .finish()
    }
}
