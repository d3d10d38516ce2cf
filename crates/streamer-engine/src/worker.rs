//! Per-connection event loop.
//!
//! Every input for a connection, whether a raw transport event or a
//! caller request, goes through one queue so the state machine and the
//! record tracker see a single serialized history.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::RwLock;
use tracing::{debug, info, info_span, warn};
use url::Url;

use streamer_ipc::{ConnectionId, ConnectionState, ConnectionStatus};
use streamer_transport::{DriverHandle, RawEvent, RawEventSink, TransportDriver};

use crate::delegate::NotifierHandle;
use crate::error::SessionError;
use crate::machine::{ConnectionStateMachine, Transition};
use crate::record::{RecordChange, RecordTracker, Recorder};
use crate::SessionResult;

/// Input to a connection worker.
#[derive(Debug)]
pub(crate) enum ConnectionEvent {
    Transport(RawEvent),
    Close,
    StartRecording {
        url: Url,
        reply: Sender<SessionResult<()>>,
    },
    StopRecording {
        reply: Sender<SessionResult<()>>,
    },
    RecordFailed {
        reason: String,
    },
}

/// Feeds driver events into a worker queue.
pub(crate) struct QueueSink {
    queue: Sender<ConnectionEvent>,
}

impl QueueSink {
    pub fn new(queue: Sender<ConnectionEvent>) -> Self {
        Self { queue }
    }
}

impl RawEventSink for QueueSink {
    fn emit(&self, event: RawEvent) {
        // The queue is unbounded; a send only fails once the worker is gone.
        if self.queue.send(ConnectionEvent::Transport(event)).is_err() {
            debug!("Raw event after worker exit discarded");
        }
    }
}

/// State mirror readable without going through the queue.
#[derive(Debug, Default)]
pub(crate) struct ConnectionShared {
    current: RwLock<(ConnectionState, ConnectionStatus)>,
}

impl ConnectionShared {
    pub fn state(&self) -> ConnectionState {
        self.current.read().0
    }

    pub fn snapshot(&self) -> (ConnectionState, ConnectionStatus) {
        *self.current.read()
    }

    fn set(&self, state: ConnectionState, status: ConnectionStatus) {
        *self.current.write() = (state, status);
    }
}

pub(crate) struct ConnectionWorker {
    id: ConnectionId,
    machine: ConnectionStateMachine,
    record: RecordTracker,
    driver: Arc<dyn TransportDriver>,
    handle: DriverHandle,
    queue: Receiver<ConnectionEvent>,
    notifier: NotifierHandle,
    recorder: Arc<dyn Recorder>,
    shared: Arc<ConnectionShared>,
    connect_timeout: Option<Duration>,
}

impl ConnectionWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: ConnectionId,
        driver: Arc<dyn TransportDriver>,
        handle: DriverHandle,
        queue: Receiver<ConnectionEvent>,
        notifier: NotifierHandle,
        recorder: Arc<dyn Recorder>,
        shared: Arc<ConnectionShared>,
        connect_timeout: Option<Duration>,
    ) -> Self {
        Self {
            id,
            machine: ConnectionStateMachine::new(id),
            record: RecordTracker::new(),
            driver,
            handle,
            queue,
            notifier,
            recorder,
            shared,
            connect_timeout,
        }
    }

    /// Run until the connection reaches `Disconnected`.
    pub fn run(mut self) {
        let span = info_span!("connection", connection_id = %self.id, protocol = %self.handle.protocol());
        let _enter = span.enter();
        info!("Connection worker started");

        let deadline = self.connect_timeout.map(|timeout| Instant::now() + timeout);

        while !self.machine.is_terminal() {
            let pending = match deadline {
                Some(deadline) if self.machine.state() == ConnectionState::Initialized => {
                    self.queue.recv_deadline(deadline)
                }
                _ => self.queue.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };
            let event = match pending {
                Ok(event) => event,
                Err(RecvTimeoutError::Timeout) => {
                    warn!("Connect timed out");
                    ConnectionEvent::Transport(RawEvent::Timeout)
                }
                Err(RecvTimeoutError::Disconnected) => ConnectionEvent::Close,
            };
            self.handle_event(event);
        }

        // Last message for this id; the entry is dropped once it is delivered.
        self.notifier.retire(self.id);
        info!("Connection worker stopped");
    }

    fn handle_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Transport(raw) => {
                debug!(?raw, "Raw transport event");
                if let Some(transition) = self.machine.on_raw_event(&raw) {
                    self.apply(transition);
                }
            }
            ConnectionEvent::Close => {
                info!("Disconnect requested");
                if let Some(transition) = self.machine.on_disconnect_requested() {
                    self.apply(transition);
                }
            }
            ConnectionEvent::StartRecording { url, reply } => {
                let result = self.start_recording(url);
                let _ = reply.send(result);
            }
            ConnectionEvent::StopRecording { reply } => {
                let result = self.stop_recording();
                let _ = reply.send(result);
            }
            ConnectionEvent::RecordFailed { reason } => match self.record.fail() {
                Some(change) => {
                    warn!(%reason, "Recording failed");
                    self.recorder.close(self.id);
                    self.publish_record(change);
                }
                None => debug!(%reason, "Record failure with no running recording ignored"),
            },
        }
    }

    fn apply(&mut self, transition: Transition) {
        if transition.state.is_terminal() {
            // A running recording always ends before the connection does.
            if let Some(change) = self.record.stop() {
                self.recorder.close(self.id);
                self.publish_record(change);
            }
            self.driver.disconnect(&self.handle);
        }

        self.shared.set(transition.state, transition.status);
        info!(state = transition.state.name(), status = ?transition.status, "Connection state changed");
        self.notifier
            .connection(self.id, transition.state, transition.status, transition.info);
    }

    fn start_recording(&mut self, url: Url) -> SessionResult<()> {
        self.record.ensure_startable(self.machine.state())?;

        let change = match self.recorder.open(self.id, &url) {
            Ok(()) => {
                info!(%url, "Recording started");
                self.record.started(url)
            }
            Err(e) => {
                warn!(%url, error = %e, "Could not open record destination");
                self.record.open_failed(url)
            }
        };
        self.publish_record(change);
        Ok(())
    }

    fn stop_recording(&mut self) -> SessionResult<()> {
        let change = self.record.stop().ok_or(SessionError::NotRecording)?;
        self.recorder.close(self.id);
        info!("Recording stopped");
        self.publish_record(change);
        Ok(())
    }

    fn publish_record(&self, change: RecordChange) {
        self.notifier.record(change.state, change.url);
    }
}
