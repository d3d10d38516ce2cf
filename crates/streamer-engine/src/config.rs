//! Session settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default connect timeout in milliseconds.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Tunables for a [`SessionManager`](crate::SessionManager).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long a connection may stay in `Initialized` before it is
    /// failed with `ConnectionFail`. Zero disables the timeout.
    pub connect_timeout_ms: u64,

    /// Capacity of the event channel created by
    /// [`SessionManager::with_event_channel`](crate::SessionManager::with_event_channel).
    pub event_channel_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            event_channel_capacity: streamer_ipc::EVENT_CHANNEL_CAPACITY,
        }
    }
}

impl SessionConfig {
    pub fn connect_timeout(&self) -> Option<Duration> {
        (self.connect_timeout_ms > 0).then(|| Duration::from_millis(self.connect_timeout_ms))
    }
}
