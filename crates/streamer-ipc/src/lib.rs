//! Typed notifications for the streamer core.
//!
//! This crate defines the value types shared between the transport
//! adapters, the connection engine and whoever consumes its notifications.

mod events;
mod state;
mod types;

pub use events::StreamerEvent;
pub use state::{ConnectionState, ConnectionStatus, RecordState};
pub use types::{info_keys, ConnectionId, ConnectionInfo};

use crossbeam_channel::{Receiver, Sender};

/// Channel capacity for events (engine → consumer).
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Creates a bounded event channel.
pub fn event_channel() -> (Sender<StreamerEvent>, Receiver<StreamerEvent>) {
    event_channel_with_capacity(EVENT_CHANNEL_CAPACITY)
}

/// Creates a bounded event channel with an explicit capacity.
pub fn event_channel_with_capacity(
    capacity: usize,
) -> (Sender<StreamerEvent>, Receiver<StreamerEvent>) {
    crossbeam_channel::bounded(capacity.max(1))
}
