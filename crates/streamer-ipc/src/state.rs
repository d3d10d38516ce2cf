//! Connection and record lifecycle types.

use serde::{Deserialize, Serialize};

/// Lifecycle state of one connection.
///
/// States only ever move forward, in declaration order. `Disconnected`
/// is terminal for a connection id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Created, transport handshake not confirmed yet.
    #[default]
    Initialized,

    /// Transport link is up.
    Connected,

    /// Protocol session setup is complete.
    Setup,

    /// Media is flowing through the transport.
    Record,

    /// Connection is gone.
    Disconnected,
}

impl ConnectionState {
    /// Returns the next state in the forward sequence, if any.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Initialized => Some(Self::Connected),
            Self::Connected => Some(Self::Setup),
            Self::Setup => Some(Self::Record),
            Self::Record => Some(Self::Disconnected),
            Self::Disconnected => None,
        }
    }

    /// Returns true once the connection can no longer change state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected)
    }

    /// Returns true if the transport link has been confirmed.
    pub fn is_established(self) -> bool {
        matches!(self, Self::Connected | Self::Setup | Self::Record)
    }

    /// Returns true if a recording may be started in this state.
    pub fn is_recordable(self) -> bool {
        matches!(self, Self::Record)
    }

    /// Returns a simple string representation of the state.
    pub fn name(self) -> &'static str {
        match self {
            Self::Initialized => "Initialized",
            Self::Connected => "Connected",
            Self::Setup => "Setup",
            Self::Record => "Record",
            Self::Disconnected => "Disconnected",
        }
    }
}

/// Outcome attached to a state change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionStatus {
    #[default]
    Success,

    /// Network-level failure: unreachable, refused, reset, timed out.
    ConnectionFail,

    /// Credentials, passphrase or stream id rejected by the peer.
    AuthFail,

    /// Failure that could not be classified from the transport event.
    UnknownFail,
}

impl ConnectionStatus {
    /// Returns true for the failure kinds.
    pub fn is_failure(self) -> bool {
        !matches!(self, Self::Success)
    }

    /// Returns true if reconnecting with the same configuration may help.
    ///
    /// Auth failures never qualify: the peer will reject the same
    /// credentials again.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::ConnectionFail)
    }

    /// Returns a display message for this status.
    pub fn message(self) -> &'static str {
        match self {
            Self::Success => "Success",
            Self::ConnectionFail => {
                "Could not connect to server. Check the stream URL and network connection"
            }
            Self::AuthFail => "Authentication error. Check the stream credentials",
            Self::UnknownFail => "Unknown connection error",
        }
    }
}

/// State of one recording attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordState {
    #[default]
    Initialized,
    Started,
    Stopped,
    Failed,
}

impl RecordState {
    /// Returns true if the recording attempt is over.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    /// Returns true while media is being written.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Started)
    }
}
