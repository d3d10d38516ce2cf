//! Error types for session operations.

use thiserror::Error;

use streamer_ipc::ConnectionId;
use streamer_transport::TransportError;

/// Errors returned synchronously by the session manager.
///
/// Asynchronous failures never show up here; they are reported through
/// the delegate as state changes.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Configuration or driver failure while opening a connection.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The id was never issued by this session.
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    /// The id was issued but the connection has reached `Disconnected`.
    #[error("Connection {0} is terminated")]
    ConnectionTerminated(ConnectionId),

    /// The connection is not in `Record` or a recording is already running.
    #[error("Connection is not recordable")]
    NotRecordable,

    /// No recording is running on the connection.
    #[error("Connection is not recording")]
    NotRecording,

    /// A background thread could not be started.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// Returns true if the error means the id can no longer be used.
    pub fn is_stale_id(&self) -> bool {
        matches!(self, Self::UnknownConnection(_) | Self::ConnectionTerminated(_))
    }
}
