//! Connection engine for the streamer core.
//!
//! This crate turns raw transport events into per-connection lifecycles,
//! tracks recordings, and delivers ordered notifications to a single
//! delegate through the [`SessionManager`].

mod config;
mod delegate;
mod error;
mod machine;
mod record;
mod session;
mod worker;

pub use config::{SessionConfig, DEFAULT_CONNECT_TIMEOUT_MS};
pub use delegate::{ChannelDelegate, StreamerDelegate};
pub use error::SessionError;
pub use machine::{classify_socket_error, ConnectionStateMachine, Transition};
pub use record::{FileRecorder, RecordChange, RecordTracker, Recorder};
pub use session::{SessionManager, SessionManagerBuilder};

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;
