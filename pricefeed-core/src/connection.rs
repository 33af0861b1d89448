//! Connection state of the push channel
//!
//! This is the only failure signal UI consumers ever see: the poll fallback
//! is an implementation detail and is not surfaced as a separate state.

use serde::{Deserialize, Serialize};

/// Connection state for the streaming price connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Not connected, no attempt in progress
    Disconnected,
    /// First connection attempt in progress
    Connecting,
    /// Connected and receiving data
    Connected,
    /// Connection lost or attempt failed, retry scheduled
    Reconnecting,
    /// Retries exhausted, waiting for an explicit connect
    Failed,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Connecting or reconnecting
    pub fn is_transitioning(&self) -> bool {
        matches!(self, Self::Connecting | Self::Reconnecting)
    }

    /// Whether a `connect()` call should start a new attempt chain
    pub fn accepts_connect(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed)
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Disconnected
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Reconnecting => write!(f, "Reconnecting"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}
