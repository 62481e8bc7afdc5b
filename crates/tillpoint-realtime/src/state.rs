//! Observable connection state of the manager.

use serde::Serialize;
use tokio::time::Instant;

/// Phase of the shared channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPhase {
    /// No channel. Either nothing is subscribed, the network is down, or
    /// retries ran out.
    Disconnected,
    /// First connect in progress.
    Connecting,
    /// Channel acknowledged by the server.
    Connected,
    /// A retry is scheduled or in progress after a failure.
    Reconnecting,
}

/// Snapshot of the manager's connection state.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionState {
    pub phase: ConnectionPhase,
    /// Consecutive failed attempts since the last success.
    pub reconnect_attempts: u32,
    pub last_error: Option<String>,
    pub last_connected_at: Option<Instant>,
    /// Whether the last failure reported server resource exhaustion.
    pub resource_constrained: bool,
    /// Live logical subscriptions.
    pub subscriptions: usize,
    /// Set once the attempt budget is spent. Cleared by a new subscription or
    /// by the network coming back.
    pub retries_exhausted: bool,
    pub online: bool,
}

impl ConnectionState {
    pub(crate) fn new(online: bool) -> Self {
        Self {
            phase: ConnectionPhase::Disconnected,
            reconnect_attempts: 0,
            last_error: None,
            last_connected_at: None,
            resource_constrained: false,
            subscriptions: 0,
            retries_exhausted: false,
            online,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.phase == ConnectionPhase::Connected
    }
}
