//! Delegate notifications.
//!
//! All notifications of a session go through one queue drained by one
//! thread, so the delegate sees them in the order they were produced and
//! never concurrently.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, error, info, warn};
use url::Url;

use streamer_ipc::{
    ConnectionId, ConnectionInfo, ConnectionState, ConnectionStatus, RecordState, StreamerEvent,
};

/// Consumer of connection and record notifications.
pub trait StreamerDelegate: Send + Sync {
    fn connection_state_did_change(
        &self,
        connection_id: ConnectionId,
        state: ConnectionState,
        status: ConnectionStatus,
        info: &ConnectionInfo,
    );

    fn record_state_did_change(&self, _state: RecordState, _url: Option<&Url>) {}
}

/// Forwards notifications into a channel as [`StreamerEvent`]s.
///
/// A full bounded channel blocks the notifier thread until the consumer
/// catches up; nothing is dropped.
#[derive(Debug, Clone)]
pub struct ChannelDelegate {
    event_tx: Sender<StreamerEvent>,
}

impl ChannelDelegate {
    pub fn new(event_tx: Sender<StreamerEvent>) -> Self {
        Self { event_tx }
    }

    fn send(&self, event: StreamerEvent) {
        if self.event_tx.send(event).is_err() {
            warn!("Event receiver dropped, notification discarded");
        }
    }
}

impl StreamerDelegate for ChannelDelegate {
    fn connection_state_did_change(
        &self,
        connection_id: ConnectionId,
        state: ConnectionState,
        status: ConnectionStatus,
        info: &ConnectionInfo,
    ) {
        self.send(StreamerEvent::ConnectionStateChanged {
            connection_id,
            state,
            status,
            info: info.clone(),
        });
    }

    fn record_state_did_change(&self, state: RecordState, url: Option<&Url>) {
        self.send(StreamerEvent::RecordStateChanged {
            state,
            url: url.cloned(),
        });
    }
}

#[derive(Debug)]
pub(crate) enum Notification {
    Connection {
        connection_id: ConnectionId,
        state: ConnectionState,
        status: ConnectionStatus,
        info: ConnectionInfo,
    },
    Record {
        state: RecordState,
        url: Option<Url>,
    },
    /// Everything queued for the connection has been delivered.
    Retire(ConnectionId),
}

/// Cloneable producer side of the notifier queue.
#[derive(Debug, Clone)]
pub(crate) struct NotifierHandle {
    tx: Sender<Notification>,
}

impl NotifierHandle {
    pub fn connection(
        &self,
        connection_id: ConnectionId,
        state: ConnectionState,
        status: ConnectionStatus,
        info: ConnectionInfo,
    ) {
        self.push(Notification::Connection {
            connection_id,
            state,
            status,
            info,
        });
    }

    pub fn record(&self, state: RecordState, url: Option<Url>) {
        self.push(Notification::Record { state, url });
    }

    pub fn retire(&self, connection_id: ConnectionId) {
        self.push(Notification::Retire(connection_id));
    }

    fn push(&self, notification: Notification) {
        if self.tx.send(notification).is_err() {
            warn!("Notifier stopped, notification discarded");
        }
    }
}

/// Owns the delivery thread.
pub(crate) struct Notifier {
    handle: Option<NotifierHandle>,
    thread: Option<JoinHandle<()>>,
}

impl Notifier {
    /// Start the delivery thread.
    ///
    /// `on_retire` runs on the delivery thread once a connection's last
    /// notification has been handed to the delegate.
    pub fn spawn<F>(delegate: Arc<dyn StreamerDelegate>, on_retire: F) -> std::io::Result<Self>
    where
        F: Fn(ConnectionId) + Send + 'static,
    {
        let (tx, rx) = crossbeam_channel::unbounded();
        let thread = thread::Builder::new()
            .name("streamer-notifier".to_string())
            .spawn(move || deliver_loop(rx, delegate, on_retire))?;

        Ok(Self {
            handle: Some(NotifierHandle { tx }),
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> Option<NotifierHandle> {
        self.handle.clone()
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        // The thread drains the queue once every producer is gone.
        self.handle.take();
        if let Some(thread) = self.thread.take() {
            if thread.thread().id() == thread::current().id() {
                return;
            }
            if thread.join().is_err() {
                error!("Notifier thread panicked");
            }
        }
    }
}

fn deliver_loop<F>(rx: Receiver<Notification>, delegate: Arc<dyn StreamerDelegate>, on_retire: F)
where
    F: Fn(ConnectionId),
{
    info!("Notifier started");

    for notification in rx.iter() {
        match notification {
            Notification::Connection {
                connection_id,
                state,
                status,
                info,
            } => {
                debug!(%connection_id, state = state.name(), ?status, "Delivering connection state");
                guard("connection_state_did_change", || {
                    delegate.connection_state_did_change(connection_id, state, status, &info)
                });
            }
            Notification::Record { state, url } => {
                debug!(?state, "Delivering record state");
                guard("record_state_did_change", || {
                    delegate.record_state_did_change(state, url.as_ref())
                });
            }
            Notification::Retire(connection_id) => on_retire(connection_id),
        }
    }

    info!("Notifier stopped");
}

/// A panicking delegate must not take the notifier down with it.
fn guard(callback: &str, f: impl FnOnce()) {
    if panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!(callback, "Delegate panicked");
    }
}
