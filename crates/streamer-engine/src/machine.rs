//! Per-connection lifecycle state machine.
//!
//! The machine is pure: it folds raw transport events into state changes
//! and leaves threading and delivery to the worker that owns it.

use std::io;

use tracing::{debug, warn};

use streamer_ipc::{info_keys, ConnectionId, ConnectionInfo, ConnectionState, ConnectionStatus};
use streamer_transport::RawEvent;

/// A state change to report to the delegate.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub state: ConnectionState,
    pub status: ConnectionStatus,
    pub info: ConnectionInfo,
}

/// Lifecycle of one connection.
///
/// Moves strictly forward through `Initialized → Connected → Setup →
/// Record` and may jump to `Disconnected` from any of them. Once
/// `Disconnected` is reached every further input is ignored.
#[derive(Debug)]
pub struct ConnectionStateMachine {
    id: ConnectionId,
    state: ConnectionState,
    status: ConnectionStatus,
}

impl ConnectionStateMachine {
    pub fn new(id: ConnectionId) -> Self {
        Self {
            id,
            state: ConnectionState::Initialized,
            status: ConnectionStatus::Success,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Status attached to the most recent transition.
    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Apply one raw event. Returns the transition to report, if any.
    pub fn on_raw_event(&mut self, event: &RawEvent) -> Option<Transition> {
        if self.is_terminal() {
            debug!(connection_id = %self.id, ?event, "Ignoring event after disconnect");
            return None;
        }

        match event {
            RawEvent::LinkUp { peer_address } => {
                let mut info = ConnectionInfo::new();
                if let Some(peer) = peer_address {
                    info.insert(info_keys::PEER_ADDRESS, peer.as_str());
                }
                self.advance_from(ConnectionState::Initialized, info)
            }
            RawEvent::HandshakeComplete => self.advance_from(ConnectionState::Connected, ConnectionInfo::new()),
            RawEvent::DataFlowing => self.advance_from(ConnectionState::Setup, ConnectionInfo::new()),
            RawEvent::AuthRejected { reason } => Some(self.fail(
                ConnectionStatus::AuthFail,
                ConnectionInfo::new().with(info_keys::REASON, reason.as_str()),
            )),
            RawEvent::LinkDown { reason } => Some(self.fail(
                ConnectionStatus::ConnectionFail,
                ConnectionInfo::new().with(info_keys::REASON, reason.as_str()),
            )),
            RawEvent::Timeout => Some(self.fail(
                ConnectionStatus::ConnectionFail,
                ConnectionInfo::new().with(info_keys::REASON, "timed out"),
            )),
            RawEvent::SocketError {
                os_code,
                protocol_code,
                message,
            } => {
                let status = self.failure_before_link(classify_socket_error(*os_code));
                let mut info = ConnectionInfo::new().with(info_keys::REASON, message.as_str());
                if let Some(code) = os_code {
                    info.insert(info_keys::ERROR_CODE, *code);
                }
                if let Some(code) = protocol_code {
                    info.insert(info_keys::PROTOCOL_ERROR_CODE, *code);
                }
                Some(self.fail(status, info))
            }
            RawEvent::ProtocolError { message } => {
                let status = self.failure_before_link(ConnectionStatus::UnknownFail);
                Some(self.fail(
                    status,
                    ConnectionInfo::new().with(info_keys::REASON, message.as_str()),
                ))
            }
        }
    }

    /// Local disconnect request. Ends the connection with `Success` unless
    /// it is already over.
    pub fn on_disconnect_requested(&mut self) -> Option<Transition> {
        if self.is_terminal() {
            return None;
        }
        Some(self.transition(
            ConnectionState::Disconnected,
            ConnectionStatus::Success,
            ConnectionInfo::new(),
        ))
    }

    /// Move to the next state if the machine is currently in `expected`.
    ///
    /// Progress events that arrive out of order are dropped; states are
    /// never skipped.
    fn advance_from(&mut self, expected: ConnectionState, info: ConnectionInfo) -> Option<Transition> {
        if self.state != expected {
            warn!(
                connection_id = %self.id,
                state = self.state.name(),
                expected = expected.name(),
                "Ignoring out of order transport event"
            );
            return None;
        }
        let next = expected.next()?;
        Some(self.transition(next, ConnectionStatus::Success, info))
    }

    /// Any failure before the link is confirmed means the peer was never
    /// reached.
    fn failure_before_link(&self, established: ConnectionStatus) -> ConnectionStatus {
        if self.state.is_established() {
            established
        } else {
            ConnectionStatus::ConnectionFail
        }
    }

    fn fail(&mut self, status: ConnectionStatus, info: ConnectionInfo) -> Transition {
        self.transition(ConnectionState::Disconnected, status, info)
    }

    fn transition(&mut self, state: ConnectionState, status: ConnectionStatus, info: ConnectionInfo) -> Transition {
        debug!(
            connection_id = %self.id,
            from = self.state.name(),
            to = state.name(),
            ?status,
            "Connection state transition"
        );
        self.state = state;
        self.status = status;
        Transition { state, status, info }
    }
}

/// Map the OS error number of a socket failure on an established link to a
/// status.
///
/// Codes that name a network-level problem count as `ConnectionFail`;
/// anything else, including a missing code, is `UnknownFail`.
pub fn classify_socket_error(os_code: Option<i32>) -> ConnectionStatus {
    let Some(code) = os_code.filter(|code| *code >= 0) else {
        return ConnectionStatus::UnknownFail;
    };
    match io::Error::from_raw_os_error(code).kind() {
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::TimedOut
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::AddrNotAvailable
        | io::ErrorKind::HostUnreachable
        | io::ErrorKind::NetworkUnreachable
        | io::ErrorKind::NetworkDown => ConnectionStatus::ConnectionFail,
        _ => ConnectionStatus::UnknownFail,
    }
}
