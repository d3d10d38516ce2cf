//! Transport layer for the streamer core.
//!
//! This crate provides the protocol configurations (SRT, RIST, RTMP) and
//! the driver adapters that turn them into live transport connections
//! reporting raw events.

mod auth;
mod config;
mod connection;
mod driver;
mod error;
mod link;
mod rtmp;

pub use config::{
    ConnectionMode, Protocol, RetransmitAlgo, RistConfig, RistConfigBuilder, RistProfile,
    RtmpAuthMode, RtmpConfig, SrtConfig, SrtConfigBuilder, SrtConnectMode, TransportConfig,
};
pub use connection::ReconnectPolicy;
pub use driver::{
    check_config, DriverHandle, DriverRegistry, MediaPacket, RawEvent, RawEventSink,
    ShutdownSignal, TransportDriver,
};
pub use error::TransportError;
pub use link::{
    LinkAdapter, LinkBackend, LinkContext, LinkEndpoint, LinkRequest, OptionValue, SocketOption,
};
pub use rtmp::RtmpDriver;

/// Channel capacity for outgoing packets.
pub const PACKET_CHANNEL_CAPACITY: usize = 30;

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Maximum reconnection attempts.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 3;

/// Base reconnect delay in milliseconds.
pub const BASE_RECONNECT_DELAY_MS: u64 = 1000;
