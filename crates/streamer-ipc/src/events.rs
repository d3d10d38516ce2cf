//! Events sent from the engine to its consumer.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::state::{ConnectionState, ConnectionStatus, RecordState};
use crate::types::{ConnectionId, ConnectionInfo};

/// Notifications the engine delivers, in order, to a single consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StreamerEvent {
    /// A connection changed state.
    ConnectionStateChanged {
        connection_id: ConnectionId,
        state: ConnectionState,
        status: ConnectionStatus,
        info: ConnectionInfo,
    },

    /// A recording changed state.
    RecordStateChanged {
        state: RecordState,

        /// Destination for `Started`, last attempted target for `Stopped`
        /// and `Failed`, absent for `Initialized`.
        url: Option<Url>,
    },
}

impl StreamerEvent {
    /// The connection this event belongs to, for connection events.
    pub fn connection_id(&self) -> Option<ConnectionId> {
        match self {
            Self::ConnectionStateChanged { connection_id, .. } => Some(*connection_id),
            Self::RecordStateChanged { .. } => None,
        }
    }

    /// Returns true if this event ends a connection.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            Self::ConnectionStateChanged {
                state: ConnectionState::Disconnected,
                ..
            }
        )
    }
}
