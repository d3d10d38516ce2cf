//! Session manager: owns the connections of one streamer.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, instrument};
use url::Url;

use streamer_ipc::{ConnectionId, ConnectionState, ConnectionStatus, StreamerEvent};
use streamer_transport::{DriverRegistry, MediaPacket, TransportConfig};

use crate::config::SessionConfig;
use crate::delegate::{ChannelDelegate, Notifier, NotifierHandle, StreamerDelegate};
use crate::error::SessionError;
use crate::record::{FileRecorder, Recorder};
use crate::worker::{ConnectionEvent, ConnectionShared, ConnectionWorker, QueueSink};
use crate::SessionResult;

struct ConnectionSlot {
    queue: Sender<ConnectionEvent>,
    shared: Arc<ConnectionShared>,
    packets: Sender<MediaPacket>,
    worker: Option<JoinHandle<()>>,
}

struct ConnectionTable {
    next_id: u64,
    slots: HashMap<ConnectionId, ConnectionSlot>,
}

impl ConnectionTable {
    fn new() -> Self {
        Self {
            next_id: 1,
            slots: HashMap::new(),
        }
    }

    fn allocate(&mut self) -> ConnectionId {
        let id = ConnectionId::new(self.next_id);
        self.next_id += 1;
        id
    }

    fn was_issued(&self, id: ConnectionId) -> bool {
        id.get() >= 1 && id.get() < self.next_id
    }

    fn slot(&self, id: ConnectionId) -> SessionResult<&ConnectionSlot> {
        match self.slots.get(&id) {
            Some(slot) => Ok(slot),
            None if self.was_issued(id) => Err(SessionError::ConnectionTerminated(id)),
            None => Err(SessionError::UnknownConnection(id)),
        }
    }

    /// Slot of a connection that has not reached `Disconnected`.
    fn live_slot(&self, id: ConnectionId) -> SessionResult<&ConnectionSlot> {
        let slot = self.slot(id)?;
        if slot.shared.state().is_terminal() {
            return Err(SessionError::ConnectionTerminated(id));
        }
        Ok(slot)
    }
}

/// Builder for [`SessionManager`].
pub struct SessionManagerBuilder {
    drivers: DriverRegistry,
    recorder: Arc<dyn Recorder>,
    config: SessionConfig,
}

impl Default for SessionManagerBuilder {
    fn default() -> Self {
        Self {
            drivers: DriverRegistry::with_defaults(),
            recorder: Arc::new(FileRecorder::new()),
            config: SessionConfig::default(),
        }
    }
}

impl SessionManagerBuilder {
    pub fn drivers(mut self, drivers: DriverRegistry) -> Self {
        self.drivers = drivers;
        self
    }

    pub fn recorder(mut self, recorder: Arc<dyn Recorder>) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Build a manager reporting to `delegate`.
    pub fn build(self, delegate: Arc<dyn StreamerDelegate>) -> SessionResult<SessionManager> {
        let table = Arc::new(Mutex::new(ConnectionTable::new()));
        let retire_table = Arc::downgrade(&table);
        let notifier = Notifier::spawn(delegate, move |id| retire(&retire_table, id))?;

        info!(drivers = ?self.drivers, "Session manager ready");

        Ok(SessionManager {
            drivers: self.drivers,
            recorder: self.recorder,
            config: self.config,
            table,
            notifier,
        })
    }

    /// Build a manager whose notifications arrive on a channel.
    pub fn build_with_channel(self) -> SessionResult<(SessionManager, Receiver<StreamerEvent>)> {
        let (event_tx, event_rx) = streamer_ipc::event_channel_with_capacity(self.config.event_channel_capacity);
        let manager = self.build(Arc::new(ChannelDelegate::new(event_tx)))?;
        Ok((manager, event_rx))
    }
}

/// Drop a retired connection's entry. Runs on the notifier thread after
/// the connection's `Disconnected` notification was delivered.
fn retire(table: &Weak<Mutex<ConnectionTable>>, id: ConnectionId) {
    let Some(table) = table.upgrade() else {
        return;
    };
    let slot = table.lock().slots.remove(&id);
    debug!(connection_id = %id, "Connection retired");

    if let Some(worker) = slot.and_then(|slot| slot.worker) {
        if worker.join().is_err() {
            error!(connection_id = %id, "Connection worker panicked");
        }
    }
}

/// Owns every connection of one streamer and routes operations by id.
///
/// Ids are issued from a monotonic counter and never reused. All
/// notifications go to the single delegate given at construction.
pub struct SessionManager {
    drivers: DriverRegistry,
    recorder: Arc<dyn Recorder>,
    config: SessionConfig,
    table: Arc<Mutex<ConnectionTable>>,
    notifier: Notifier,
}

impl SessionManager {
    pub fn builder() -> SessionManagerBuilder {
        SessionManagerBuilder::default()
    }

    /// A manager with the built-in drivers and default settings.
    pub fn new(delegate: Arc<dyn StreamerDelegate>) -> SessionResult<Self> {
        Self::builder().build(delegate)
    }

    /// A manager with the built-in drivers whose notifications arrive on
    /// a channel sized by `config`.
    pub fn with_event_channel(config: SessionConfig) -> SessionResult<(Self, Receiver<StreamerEvent>)> {
        Self::builder().config(config).build_with_channel()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Start a connection and return its id at once.
    ///
    /// Progress is reported through the delegate. Configuration and
    /// driver errors are returned here, before any id is issued.
    #[instrument(name = "session_open", skip_all, fields(protocol = %config.protocol()))]
    pub fn open(&self, config: TransportConfig) -> SessionResult<ConnectionId> {
        config.validate()?;
        let driver = self.drivers.get(config.protocol())?;
        let notifier = self.notifier_handle()?;

        info!(target_addr = %config.describe(), "Opening connection");

        let (queue_tx, queue_rx) = crossbeam_channel::unbounded();
        let sink = Arc::new(QueueSink::new(queue_tx.clone()));
        let handle = driver.connect(Arc::new(config), sink)?;
        let shared = Arc::new(ConnectionShared::default());

        let id = {
            let mut table = self.table.lock();
            let id = table.allocate();
            table.slots.insert(
                id,
                ConnectionSlot {
                    queue: queue_tx,
                    shared: Arc::clone(&shared),
                    packets: handle.packet_sender(),
                    worker: None,
                },
            );
            id
        };

        let worker = ConnectionWorker::new(
            id,
            driver,
            handle,
            queue_rx,
            notifier,
            Arc::clone(&self.recorder),
            shared,
            self.config.connect_timeout(),
        );

        let spawned = thread::Builder::new()
            .name(format!("connection-{}", id))
            .spawn(move || worker.run());

        match spawned {
            Ok(thread) => {
                // The worker may already have retired its slot.
                if let Some(slot) = self.table.lock().slots.get_mut(&id) {
                    slot.worker = Some(thread);
                }
                info!(connection_id = %id, "Connection opened");
                Ok(id)
            }
            Err(e) => {
                self.table.lock().slots.remove(&id);
                Err(e.into())
            }
        }
    }

    /// Request an orderly disconnect.
    ///
    /// Valid in every non-terminal state, including while the transport
    /// handshake is still pending. The delegate later sees exactly one
    /// `Disconnected` for the id.
    #[instrument(name = "session_close", skip(self))]
    pub fn close(&self, id: ConnectionId) -> SessionResult<()> {
        let queue = self.table.lock().live_slot(id)?.queue.clone();
        queue
            .send(ConnectionEvent::Close)
            .map_err(|_| SessionError::ConnectionTerminated(id))
    }

    /// Start recording the connection's media to `url`.
    ///
    /// Fails with `NotRecordable` unless the connection is in `Record` and
    /// not already recording. Failing to open the destination is reported
    /// as `RecordState::Failed` through the delegate.
    #[instrument(name = "session_start_recording", skip(self))]
    pub fn start_recording(&self, id: ConnectionId, url: Url) -> SessionResult<()> {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        self.request(id, ConnectionEvent::StartRecording { url, reply: reply_tx })?;
        reply_rx
            .recv()
            .map_err(|_| SessionError::ConnectionTerminated(id))?
    }

    /// Stop the running recording.
    #[instrument(name = "session_stop_recording", skip(self))]
    pub fn stop_recording(&self, id: ConnectionId) -> SessionResult<()> {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        self.request(id, ConnectionEvent::StopRecording { reply: reply_tx })?;
        reply_rx
            .recv()
            .map_err(|_| SessionError::ConnectionTerminated(id))?
    }

    /// Report that writing the running recording failed.
    ///
    /// The recording moves to `Failed`; the connection is unaffected.
    pub fn report_record_failure(&self, id: ConnectionId, reason: impl Into<String>) -> SessionResult<()> {
        self.request(
            id,
            ConnectionEvent::RecordFailed {
                reason: reason.into(),
            },
        )
    }

    /// Last state and status reported for `id`.
    pub fn state(&self, id: ConnectionId) -> SessionResult<(ConnectionState, ConnectionStatus)> {
        Ok(self.table.lock().slot(id)?.shared.snapshot())
    }

    /// Sender for media packets carried by the connection.
    pub fn packet_sender(&self, id: ConnectionId) -> SessionResult<Sender<MediaPacket>> {
        Ok(self.table.lock().live_slot(id)?.packets.clone())
    }

    /// Ids of connections that have not reached `Disconnected`.
    pub fn connections(&self) -> Vec<ConnectionId> {
        let table = self.table.lock();
        let mut ids: Vec<_> = table
            .slots
            .iter()
            .filter(|(_, slot)| !slot.shared.state().is_terminal())
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    fn request(&self, id: ConnectionId, event: ConnectionEvent) -> SessionResult<()> {
        let queue = self.table.lock().live_slot(id)?.queue.clone();
        queue
            .send(event)
            .map_err(|_| SessionError::ConnectionTerminated(id))
    }

    fn notifier_handle(&self) -> SessionResult<NotifierHandle> {
        self.notifier
            .handle()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "notifier stopped").into())
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        let workers: Vec<JoinHandle<()>> = {
            let mut table = self.table.lock();
            table
                .slots
                .values_mut()
                .filter_map(|slot| {
                    let _ = slot.queue.send(ConnectionEvent::Close);
                    slot.worker.take()
                })
                .collect()
        };

        if !workers.is_empty() {
            info!(count = workers.len(), "Closing remaining connections");
        }
        for worker in workers {
            if worker.join().is_err() {
                error!("Connection worker panicked");
            }
        }
        // The notifier drains what the workers queued when it is dropped.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    use bytes::Bytes;
    use streamer_ipc::{info_keys, ConnectionInfo, RecordState};
    use streamer_transport::{
        check_config, DriverHandle, Protocol, RawEvent, RawEventSink, ShutdownSignal, SrtConfig,
        TransportDriver, TransportError, TransportResult,
    };

    const WAIT: Duration = Duration::from_secs(2);
    const QUIET: Duration = Duration::from_millis(150);

    /// Driver that hands its sinks to the test instead of touching a network.
    #[derive(Default)]
    struct ScriptedDriver {
        sinks: Mutex<Vec<Arc<dyn RawEventSink>>>,
        packets: Mutex<Vec<Receiver<MediaPacket>>>,
        disconnects: AtomicUsize,
    }

    impl ScriptedDriver {
        fn emit(&self, index: usize, event: RawEvent) {
            let sink = Arc::clone(&self.sinks.lock()[index]);
            sink.emit(event);
        }

        fn bring_up(&self, index: usize) {
            self.emit(index, RawEvent::LinkUp { peer_address: None });
            self.emit(index, RawEvent::HandshakeComplete);
            self.emit(index, RawEvent::DataFlowing);
        }
    }

    impl TransportDriver for ScriptedDriver {
        fn protocol(&self) -> Protocol {
            Protocol::Srt
        }

        fn connect(
            &self,
            config: Arc<TransportConfig>,
            sink: Arc<dyn RawEventSink>,
        ) -> TransportResult<DriverHandle> {
            check_config(Protocol::Srt, &config)?;
            let (tx, rx) = crossbeam_channel::bounded(8);
            self.sinks.lock().push(sink);
            self.packets.lock().push(rx);
            Ok(DriverHandle::new(Protocol::Srt, ShutdownSignal::new(), tx))
        }

        fn disconnect(&self, handle: &DriverHandle) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            handle.shutdown();
        }
    }

    #[derive(Default)]
    struct MemoryRecorder {
        opened: Mutex<Vec<(ConnectionId, Url)>>,
        closed: Mutex<Vec<ConnectionId>>,
        refuse: bool,
    }

    impl Recorder for MemoryRecorder {
        fn open(&self, connection_id: ConnectionId, url: &Url) -> io::Result<()> {
            if self.refuse {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only"));
            }
            self.opened.lock().push((connection_id, url.clone()));
            Ok(())
        }

        fn close(&self, connection_id: ConnectionId) {
            self.closed.lock().push(connection_id);
        }
    }

    struct Harness {
        manager: SessionManager,
        driver: Arc<ScriptedDriver>,
        recorder: Arc<MemoryRecorder>,
        events: Receiver<StreamerEvent>,
    }

    fn harness_with(recorder: MemoryRecorder, config: SessionConfig) -> Harness {
        let driver = Arc::new(ScriptedDriver::default());
        let recorder = Arc::new(recorder);
        let mut drivers = DriverRegistry::new();
        drivers.register(driver.clone());

        let (manager, events) = SessionManager::builder()
            .drivers(drivers)
            .recorder(recorder.clone())
            .config(config)
            .build_with_channel()
            .unwrap();

        Harness {
            manager,
            driver,
            recorder,
            events,
        }
    }

    fn harness() -> Harness {
        harness_with(MemoryRecorder::default(), SessionConfig::default())
    }

    fn srt_config() -> TransportConfig {
        SrtConfig::builder("203.0.113.5", 9000).build().unwrap().into()
    }

    fn record_url() -> Url {
        Url::parse("file:///out.ts").unwrap()
    }

    fn next_event(events: &Receiver<StreamerEvent>) -> StreamerEvent {
        events.recv_timeout(WAIT).expect("expected a notification")
    }

    fn expect_connection(
        events: &Receiver<StreamerEvent>,
        id: ConnectionId,
        state: ConnectionState,
        status: ConnectionStatus,
    ) -> ConnectionInfo {
        match next_event(events) {
            StreamerEvent::ConnectionStateChanged {
                connection_id,
                state: got_state,
                status: got_status,
                info,
            } => {
                assert_eq!(connection_id, id);
                assert_eq!(got_state, state);
                assert_eq!(got_status, status);
                info
            }
            other => panic!("expected connection event, got {:?}", other),
        }
    }

    fn expect_record(events: &Receiver<StreamerEvent>, state: RecordState) -> Option<Url> {
        match next_event(events) {
            StreamerEvent::RecordStateChanged { state: got, url } => {
                assert_eq!(got, state);
                url
            }
            other => panic!("expected record event, got {:?}", other),
        }
    }

    fn expect_quiet(events: &Receiver<StreamerEvent>) {
        if let Ok(event) = events.recv_timeout(QUIET) {
            panic!("unexpected notification: {:?}", event);
        }
    }

    fn open_to_record(h: &Harness, index: usize) -> ConnectionId {
        let id = h.manager.open(srt_config()).unwrap();
        h.driver.bring_up(index);
        expect_connection(&h.events, id, ConnectionState::Connected, ConnectionStatus::Success);
        expect_connection(&h.events, id, ConnectionState::Setup, ConnectionStatus::Success);
        expect_connection(&h.events, id, ConnectionState::Record, ConnectionStatus::Success);
        id
    }

    fn wait_until_retired(manager: &SessionManager, id: ConnectionId) {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if matches!(manager.state(id), Err(SessionError::ConnectionTerminated(_))) {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("connection {} was never retired", id);
    }

    #[test]
    fn test_record_then_close_sequence() {
        let h = harness();
        let id = open_to_record(&h, 0);

        h.manager.start_recording(id, record_url()).unwrap();
        assert_eq!(expect_record(&h.events, RecordState::Started), Some(record_url()));

        h.manager.close(id).unwrap();
        assert_eq!(expect_record(&h.events, RecordState::Stopped), Some(record_url()));
        let info = expect_connection(&h.events, id, ConnectionState::Disconnected, ConnectionStatus::Success);
        assert!(info.is_empty());
        expect_quiet(&h.events);

        assert!(matches!(
            h.manager.start_recording(id, record_url()),
            Err(SessionError::ConnectionTerminated(_))
        ));
        assert!(matches!(h.manager.close(id), Err(SessionError::ConnectionTerminated(_))));
        assert_eq!(*h.recorder.closed.lock(), vec![id]);
        assert_eq!(h.driver.disconnects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failure_does_not_affect_other_connections() {
        let h = harness();
        let failing = h.manager.open(srt_config()).unwrap();
        let healthy = h.manager.open(srt_config()).unwrap();

        h.driver.emit(0, RawEvent::LinkUp { peer_address: None });
        expect_connection(&h.events, failing, ConnectionState::Connected, ConnectionStatus::Success);
        h.driver.emit(1, RawEvent::LinkUp { peer_address: None });
        expect_connection(&h.events, healthy, ConnectionState::Connected, ConnectionStatus::Success);

        h.driver.emit(
            0,
            RawEvent::LinkDown {
                reason: "peer closed".to_string(),
            },
        );
        let info = expect_connection(
            &h.events,
            failing,
            ConnectionState::Disconnected,
            ConnectionStatus::ConnectionFail,
        );
        assert_eq!(info.get(info_keys::REASON).and_then(|v| v.as_str()), Some("peer closed"));
        wait_until_retired(&h.manager, failing);

        h.driver.emit(1, RawEvent::HandshakeComplete);
        expect_connection(&h.events, healthy, ConnectionState::Setup, ConnectionStatus::Success);
        h.driver.emit(1, RawEvent::DataFlowing);
        expect_connection(&h.events, healthy, ConnectionState::Record, ConnectionStatus::Success);

        h.manager.start_recording(healthy, record_url()).unwrap();
        assert_eq!(expect_record(&h.events, RecordState::Started), Some(record_url()));
        assert_eq!(
            h.manager.state(healthy).unwrap(),
            (ConnectionState::Record, ConnectionStatus::Success)
        );
        assert_eq!(h.manager.connections(), vec![healthy]);
        assert_eq!(h.driver.disconnects.load(Ordering::SeqCst), 1);
        expect_quiet(&h.events);
    }

    #[test]
    fn test_close_while_connect_pending() {
        let h = harness();
        let id = h.manager.open(srt_config()).unwrap();
        h.manager.close(id).unwrap();

        let info = expect_connection(&h.events, id, ConnectionState::Disconnected, ConnectionStatus::Success);
        assert!(info.is_empty());

        // The handshake finishing late changes nothing.
        h.driver.emit(0, RawEvent::LinkUp { peer_address: None });
        h.driver.emit(0, RawEvent::HandshakeComplete);
        expect_quiet(&h.events);
    }

    #[test]
    fn test_auth_failure_is_terminal() {
        let h = harness();
        let id = h.manager.open(srt_config()).unwrap();

        h.driver.emit(
            0,
            RawEvent::AuthRejected {
                reason: "passphrase mismatch".to_string(),
            },
        );
        let info = expect_connection(&h.events, id, ConnectionState::Disconnected, ConnectionStatus::AuthFail);
        assert_eq!(
            info.get(info_keys::REASON).and_then(|v| v.as_str()),
            Some("passphrase mismatch")
        );

        h.driver.emit(0, RawEvent::LinkUp { peer_address: None });
        h.driver.emit(0, RawEvent::LinkDown {
            reason: "gone".to_string(),
        });
        expect_quiet(&h.events);

        assert!(matches!(h.manager.close(id), Err(SessionError::ConnectionTerminated(_))));
    }

    #[test]
    fn test_disconnected_reported_once() {
        let h = harness();
        let id = open_to_record(&h, 0);

        h.driver.emit(0, RawEvent::LinkDown {
            reason: "peer closed".to_string(),
        });
        let _ = h.manager.close(id);
        h.driver.emit(0, RawEvent::Timeout);

        expect_connection(&h.events, id, ConnectionState::Disconnected, ConnectionStatus::ConnectionFail);
        expect_quiet(&h.events);
    }

    #[test]
    fn test_recording_requires_record_state() {
        let h = harness();
        let id = h.manager.open(srt_config()).unwrap();
        h.driver.emit(0, RawEvent::LinkUp { peer_address: None });
        h.driver.emit(0, RawEvent::HandshakeComplete);
        expect_connection(&h.events, id, ConnectionState::Connected, ConnectionStatus::Success);
        expect_connection(&h.events, id, ConnectionState::Setup, ConnectionStatus::Success);

        assert!(matches!(
            h.manager.start_recording(id, record_url()),
            Err(SessionError::NotRecordable)
        ));
        assert!(matches!(h.manager.stop_recording(id), Err(SessionError::NotRecording)));

        h.driver.emit(0, RawEvent::DataFlowing);
        expect_connection(&h.events, id, ConnectionState::Record, ConnectionStatus::Success);

        h.manager.start_recording(id, record_url()).unwrap();
        expect_record(&h.events, RecordState::Started);
        assert!(matches!(
            h.manager.start_recording(id, record_url()),
            Err(SessionError::NotRecordable)
        ));
        expect_quiet(&h.events);
    }

    #[test]
    fn test_stop_then_restart_recording() {
        let h = harness();
        let id = open_to_record(&h, 0);

        h.manager.start_recording(id, record_url()).unwrap();
        expect_record(&h.events, RecordState::Started);
        h.manager.stop_recording(id).unwrap();
        assert_eq!(expect_record(&h.events, RecordState::Stopped), Some(record_url()));

        let second = Url::parse("file:///second.ts").unwrap();
        h.manager.start_recording(id, second.clone()).unwrap();
        assert_eq!(expect_record(&h.events, RecordState::Started), Some(second));
        assert_eq!(h.recorder.opened.lock().len(), 2);
    }

    #[test]
    fn test_record_failure_leaves_connection_up() {
        let h = harness();
        let id = open_to_record(&h, 0);

        h.manager.start_recording(id, record_url()).unwrap();
        expect_record(&h.events, RecordState::Started);

        h.manager.report_record_failure(id, "disk full").unwrap();
        assert_eq!(expect_record(&h.events, RecordState::Failed), Some(record_url()));
        assert_eq!(h.manager.state(id).unwrap().0, ConnectionState::Record);
        assert!(matches!(h.manager.stop_recording(id), Err(SessionError::NotRecording)));

        h.manager.close(id).unwrap();
        expect_connection(&h.events, id, ConnectionState::Disconnected, ConnectionStatus::Success);
    }

    #[test]
    fn test_record_open_failure_is_reported() {
        let h = harness_with(
            MemoryRecorder {
                refuse: true,
                ..MemoryRecorder::default()
            },
            SessionConfig::default(),
        );
        let id = open_to_record(&h, 0);

        h.manager.start_recording(id, record_url()).unwrap();
        assert_eq!(expect_record(&h.events, RecordState::Failed), Some(record_url()));

        h.manager.close(id).unwrap();
        expect_connection(&h.events, id, ConnectionState::Disconnected, ConnectionStatus::Success);
    }

    #[test]
    fn test_unknown_and_retired_ids() {
        let h = harness();
        let stranger = ConnectionId::new(999);
        assert!(matches!(h.manager.close(stranger), Err(SessionError::UnknownConnection(_))));
        assert!(matches!(h.manager.state(stranger), Err(SessionError::UnknownConnection(_))));
        assert!(matches!(
            h.manager.report_record_failure(stranger, "x"),
            Err(SessionError::UnknownConnection(_))
        ));

        let id = h.manager.open(srt_config()).unwrap();
        h.manager.close(id).unwrap();
        expect_connection(&h.events, id, ConnectionState::Disconnected, ConnectionStatus::Success);
        wait_until_retired(&h.manager, id);

        assert!(h.manager.connections().is_empty());
        assert!(matches!(h.manager.packet_sender(id), Err(SessionError::ConnectionTerminated(_))));
    }

    #[test]
    fn test_invalid_configuration_issues_no_id() {
        let h = harness();
        let bad: TransportConfig =
            serde_json::from_str(r#"{"protocol":"srt","host":"203.0.113.5","port":0}"#).unwrap();

        let err = h.manager.open(bad).unwrap_err();
        assert!(matches!(
            err,
            SessionError::Transport(TransportError::InvalidConfiguration(_))
        ));

        let id = h.manager.open(srt_config()).unwrap();
        assert_eq!(id, ConnectionId::new(1));
    }

    #[test]
    fn test_unsupported_protocol() {
        let h = harness();
        let rtmp = TransportConfig::from_url("rtmp://live.example.com/app/key").unwrap();
        assert!(matches!(
            h.manager.open(rtmp),
            Err(SessionError::Transport(TransportError::UnsupportedProtocol(_)))
        ));
    }

    #[test]
    fn test_concurrent_opens_get_unique_ids() {
        let h = harness();
        let ids = Mutex::new(Vec::new());

        thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..10 {
                        let id = h.manager.open(srt_config()).unwrap();
                        ids.lock().push(id);
                    }
                });
            }
        });

        let mut ids = ids.into_inner();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 80);
        assert_eq!(ids.first(), Some(&ConnectionId::new(1)));
        assert_eq!(ids.last(), Some(&ConnectionId::new(80)));
    }

    #[test]
    fn test_connect_timeout() {
        let h = harness_with(
            MemoryRecorder::default(),
            SessionConfig {
                connect_timeout_ms: 50,
                ..SessionConfig::default()
            },
        );
        let id = h.manager.open(srt_config()).unwrap();

        expect_connection(&h.events, id, ConnectionState::Disconnected, ConnectionStatus::ConnectionFail);
        assert_eq!(h.driver.disconnects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_timeout_does_not_apply_after_link_up() {
        let h = harness_with(
            MemoryRecorder::default(),
            SessionConfig {
                connect_timeout_ms: 50,
                ..SessionConfig::default()
            },
        );
        let id = h.manager.open(srt_config()).unwrap();
        h.driver.emit(0, RawEvent::LinkUp { peer_address: None });
        expect_connection(&h.events, id, ConnectionState::Connected, ConnectionStatus::Success);
        expect_quiet(&h.events);
    }

    #[test]
    fn test_packets_reach_driver() {
        let h = harness();
        let id = open_to_record(&h, 0);

        let sender = h.manager.packet_sender(id).unwrap();
        sender
            .send(MediaPacket {
                data: Bytes::from_static(b"frame"),
                timestamp_ms: 40,
                is_video: true,
                is_keyframe: true,
            })
            .unwrap();

        let rx = h.driver.packets.lock()[0].clone();
        let packet = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(packet.timestamp_ms, 40);
    }

    #[test]
    fn test_drop_disconnects_open_connections() {
        let h = harness();
        let first = open_to_record(&h, 0);
        let second = h.manager.open(srt_config()).unwrap();

        h.manager.start_recording(first, record_url()).unwrap();
        expect_record(&h.events, RecordState::Started);

        let Harness { manager, events, .. } = h;
        drop(manager);

        let remaining: Vec<StreamerEvent> = events.try_iter().collect();
        let disconnects: Vec<_> = remaining
            .iter()
            .filter(|event| event.is_disconnect())
            .filter_map(StreamerEvent::connection_id)
            .collect();
        assert_eq!(disconnects.len(), 2);
        assert!(disconnects.contains(&first));
        assert!(disconnects.contains(&second));
        assert!(remaining.iter().any(|event| matches!(
            event,
            StreamerEvent::RecordStateChanged {
                state: RecordState::Stopped,
                ..
            }
        )));
    }
}
