//! Connection state machine for the event channel.
//!
//! This module provides a pure, side-effect-free state machine for managing
//! the duplex connection lifecycle. The state machine takes events as input
//! and produces a new state plus a list of actions to execute.
//!
//! The actual I/O (connecting, reading frames) is performed by sync-client,
//! not by this module. This enables instant unit testing without network mocks.

use std::time::Duration;

/// Upper bound on the exponential part of the reconnect delay.
const MAX_BACKOFF_SECS: u64 = 30;

/// Upper bound on the random jitter added to each reconnect delay.
const MAX_JITTER_MS: u64 = 1000;

/// Connection state machine - NO I/O, just state transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected and not trying to.
    Disconnected,
    /// Connection attempt in progress. `attempt` is 0 for the initial
    /// connect and the reconnect attempt number otherwise.
    Connecting {
        /// Which attempt this is.
        attempt: u32,
    },
    /// Connected and receiving events.
    Connected,
    /// Dropped, waiting for the backoff timer before the next attempt.
    Reconnecting {
        /// Number of reconnection attempts so far.
        attempt: u32,
    },
}

impl ConnectionState {
    /// Create a new state machine in the Disconnected state.
    pub fn new() -> Self {
        Self::Disconnected
    }

    /// Process an event and return the new state plus actions to execute.
    ///
    /// This is a pure function - no side effects. The caller (sync-client)
    /// is responsible for executing the returned actions.
    pub fn on_event(self, event: Event) -> (Self, Vec<Action>) {
        match (self, event) {
            // From Disconnected
            (Self::Disconnected, Event::ConnectRequested) => {
                (Self::Connecting { attempt: 0 }, vec![Action::Connect])
            }

            // From Connecting
            (Self::Connecting { attempt: 0 }, Event::ConnectSucceeded) => (
                Self::Connected,
                vec![Action::EmitEvent(ChannelEvent::Connected)],
            ),
            (Self::Connecting { .. }, Event::ConnectSucceeded) => (
                Self::Connected,
                vec![Action::EmitEvent(ChannelEvent::Reconnected)],
            ),
            // The initial connect reports straight back to the caller.
            (Self::Connecting { attempt: 0 }, Event::ConnectFailed { error }) => (
                Self::Disconnected,
                vec![Action::EmitEvent(ChannelEvent::ConnectionFailed { error })],
            ),
            (Self::Connecting { attempt }, Event::ConnectFailed { error }) => {
                let next_attempt = attempt.saturating_add(1);
                let delay = calculate_backoff(next_attempt);
                (
                    Self::Reconnecting {
                        attempt: next_attempt,
                    },
                    vec![
                        Action::EmitEvent(ChannelEvent::ReconnectFailed { attempt, error }),
                        Action::EmitEvent(ChannelEvent::Reconnecting {
                            attempt: next_attempt,
                            delay,
                        }),
                        Action::StartReconnectTimer { delay },
                    ],
                )
            }
            (Self::Connecting { .. }, Event::DisconnectRequested) => {
                (Self::Disconnected, vec![Action::Disconnect])
            }

            // From Connected
            (Self::Connected, Event::Dropped { reason }) => {
                let delay = calculate_backoff(1);
                (
                    Self::Reconnecting { attempt: 1 },
                    vec![
                        Action::ClearRooms,
                        Action::EmitEvent(ChannelEvent::Disconnected { reason }),
                        Action::EmitEvent(ChannelEvent::Reconnecting { attempt: 1, delay }),
                        Action::StartReconnectTimer { delay },
                    ],
                )
            }
            (Self::Connected, Event::DisconnectRequested) => (
                Self::Disconnected,
                vec![
                    Action::Disconnect,
                    Action::ClearRooms,
                    Action::EmitEvent(ChannelEvent::Disconnected {
                        reason: "user requested".into(),
                    }),
                ],
            ),

            // From Reconnecting
            (Self::Reconnecting { attempt }, Event::ReconnectTimer) => {
                (Self::Connecting { attempt }, vec![Action::Connect])
            }
            (Self::Reconnecting { .. }, Event::DisconnectRequested) => {
                (Self::Disconnected, vec![Action::CancelReconnect])
            }

            // Invalid transitions - stay in current state
            (state, _) => (state, vec![]),
        }
    }

    /// Check if currently connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if currently trying to connect.
    pub fn is_connecting(&self) -> bool {
        matches!(self, Self::Connecting { .. } | Self::Reconnecting { .. })
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

/// Events that can occur in the connection lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Caller requested connection.
    ConnectRequested,
    /// Transport connection succeeded.
    ConnectSucceeded,
    /// Transport connection failed.
    ConnectFailed {
        /// Error message describing the failure.
        error: String,
    },
    /// An established connection was lost.
    Dropped {
        /// Reason for the drop.
        reason: String,
    },
    /// Caller requested disconnect.
    DisconnectRequested,
    /// Reconnect timer fired.
    ReconnectTimer,
}

/// Actions to be executed by the sync-client.
///
/// These are instructions, not side effects. The sync-client interprets
/// these and performs the actual I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Open the transport.
    Connect,
    /// Close the transport.
    Disconnect,
    /// Forget room membership; the server dropped it with the connection.
    ClearRooms,
    /// Start a timer for reconnection.
    StartReconnectTimer {
        /// Delay before attempting reconnection.
        delay: Duration,
    },
    /// Cancel any pending reconnect timer.
    CancelReconnect,
    /// Emit an event to the application.
    EmitEvent(ChannelEvent),
}

/// Connection lifecycle events emitted to the application layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Initial connection established.
    Connected,
    /// Connection re-established after a drop. Rooms must be re-joined.
    Reconnected,
    /// Initial connection failed.
    ConnectionFailed {
        /// Error message describing the failure.
        error: String,
    },
    /// Connection lost or closed.
    Disconnected {
        /// Reason for disconnection.
        reason: String,
    },
    /// A reconnect is scheduled.
    Reconnecting {
        /// Attempt number about to run.
        attempt: u32,
        /// Delay before it runs.
        delay: Duration,
    },
    /// Reconnection attempt failed.
    ReconnectFailed {
        /// Which reconnection attempt this was.
        attempt: u32,
        /// Error message describing the failure.
        error: String,
    },
}

/// Calculate reconnection backoff with jitter.
///
/// Formula: min(30s, 2^attempt seconds) + random(0..=1000ms)
pub fn calculate_backoff(attempt: u32) -> Duration {
    let base_secs = 2u64.pow(attempt.min(5)).min(MAX_BACKOFF_SECS);
    Duration::from_secs(base_secs) + Duration::from_millis(random_jitter_ms())
}

/// Random jitter in 0..=MAX_JITTER_MS. Falls back to no jitter if the OS
/// RNG is unavailable.
fn random_jitter_ms() -> u64 {
    let mut bytes = [0u8; 8];
    match getrandom::getrandom(&mut bytes) {
        Ok(()) => u64::from_le_bytes(bytes) % (MAX_JITTER_MS + 1),
        Err(_) => 0,
    }
}
