//! RTMP driver.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use rml_rtmp::handshake::{Handshake, HandshakeProcessResult, PeerType};
use rml_rtmp::sessions::{
    ClientSession, ClientSessionConfig, ClientSessionEvent, ClientSessionResult,
    PublishRequestType,
};
use rml_rtmp::time::RtmpTimestamp;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, instrument, trace, warn};

use crate::auth::Authenticator;
use crate::config::{Protocol, RtmpConfig, TransportConfig};
use crate::driver::{
    check_config, DriverHandle, MediaPacket, RawEvent, RawEventSink, ShutdownSignal,
    TransportDriver,
};
use crate::error::TransportError;
use crate::{TransportResult, PACKET_CHANNEL_CAPACITY};

/// Read polls while waiting for the server to accept `connect`.
const CONNECT_ACCEPT_POLLS: u32 = 50;

/// Read polls while waiting for the server to accept `publish`.
const PUBLISH_ACCEPT_POLLS: u32 = 30;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A failed step, already translated into the event to report.
type Step<T> = Result<T, RawEvent>;

/// RTMP publishing driver over plain TCP.
#[derive(Debug, Default)]
pub struct RtmpDriver {
    next_link: AtomicU64,
}

impl RtmpDriver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TransportDriver for RtmpDriver {
    fn protocol(&self) -> Protocol {
        Protocol::Rtmp
    }

    #[instrument(name = "rtmp_connect", skip_all)]
    fn connect(
        &self,
        config: Arc<TransportConfig>,
        sink: Arc<dyn RawEventSink>,
    ) -> TransportResult<DriverHandle> {
        check_config(Protocol::Rtmp, &config)?;
        let rtmp = match config.as_ref() {
            TransportConfig::Rtmp(rtmp) => rtmp.clone(),
            other => return Err(TransportError::protocol_mismatch(Protocol::Rtmp, other.protocol())),
        };
        if rtmp.url().scheme().eq_ignore_ascii_case("rtmps") {
            return Err(TransportError::ConfigurationRejected(
                "rtmps is not supported by the built-in RTMP driver".to_string(),
            ));
        }

        info!(url = %rtmp.url(), "Connecting to RTMP server");

        // Dedicated runtime for async network operations
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let (sender, receiver) = crossbeam_channel::bounded(PACKET_CHANNEL_CAPACITY);
        let shutdown = ShutdownSignal::new();
        let stop = shutdown.clone();
        let link_no = self.next_link.fetch_add(1, Ordering::Relaxed);

        thread::Builder::new()
            .name(format!("rtmp-link-{}", link_no))
            .spawn(move || {
                runtime.block_on(async {
                    tokio::select! {
                        _ = stop.wait() => debug!("RTMP connection cancelled"),
                        _ = run_rtmp_connection(&rtmp, receiver, sink.as_ref(), &stop) => {}
                    }
                });
            })?;

        Ok(DriverHandle::new(Protocol::Rtmp, shutdown, sender))
    }
}

/// RTMP connection with session state.
struct RtmpConnection {
    /// TCP stream to the RTMP server.
    stream: TcpStream,
    /// RTMP client session for protocol handling.
    session: ClientSession,
}

async fn run_rtmp_connection(
    config: &RtmpConfig,
    receiver: Receiver<MediaPacket>,
    sink: &dyn RawEventSink,
    shutdown: &ShutdownSignal,
) {
    let mut connection = match connect_rtmp(config, sink).await {
        Ok(connection) => connection,
        Err(event) => {
            warn!(?event, "RTMP connection failed");
            sink.emit(event);
            return;
        }
    };

    sink.emit(RawEvent::HandshakeComplete);
    info!("RTMP connection established and publishing started");

    let mode = config.mode();
    let mut data_flowing = false;

    // Send packets until error or stop
    loop {
        if shutdown.is_triggered() {
            break;
        }

        match receiver.recv_timeout(POLL_INTERVAL) {
            Ok(packet) => {
                if !mode.accepts(&packet) {
                    trace!(is_video = packet.is_video, "Skipping packet excluded by connection mode");
                    continue;
                }
                if let Err(event) = send_packet(&mut connection, &packet).await {
                    warn!(?event, "Send error");
                    sink.emit(event);
                    return;
                }
                if !data_flowing {
                    data_flowing = true;
                    sink.emit(RawEvent::DataFlowing);
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                debug!("Packet channel disconnected");
                return;
            }
        }
    }

    debug!("RTMP connection stopped");
}

fn io_event(error: std::io::Error) -> RawEvent {
    RawEvent::from_io(&error)
}

fn protocol_event(context: &str, detail: impl std::fmt::Debug) -> RawEvent {
    RawEvent::ProtocolError {
        message: format!("{}: {:?}", context, detail),
    }
}

async fn write_all(stream: &mut TcpStream, bytes: &[u8]) -> Step<()> {
    stream.write_all(bytes).await.map_err(io_event)
}

async fn read_some(stream: &mut TcpStream, buf: &mut [u8], context: &str) -> Step<usize> {
    let n = stream.read(buf).await.map_err(io_event)?;
    if n == 0 {
        return Err(RawEvent::LinkDown {
            reason: format!("Connection closed {}", context),
        });
    }
    Ok(n)
}

/// How the server answered `connect`.
enum ConnectReply {
    Accepted(RtmpConnection),
    Rejected(String),
}

async fn connect_rtmp(config: &RtmpConfig, sink: &dyn RawEventSink) -> Step<RtmpConnection> {
    let mut auth = Authenticator::new(config);
    let mut app = auth.initial_app();
    let mut report_link = true;

    // Every refusal the authenticator can answer costs one reconnect.
    let mut connection = loop {
        match open_session(config, &app, sink, report_link).await? {
            ConnectReply::Accepted(connection) => break connection,
            ConnectReply::Rejected(description) => {
                app = auth
                    .on_rejected(&description)
                    .map_err(|reason| RawEvent::AuthRejected { reason })?;
                info!("Server requested authentication, reconnecting");
                report_link = false;
            }
        }
    };

    start_publishing(config, &mut connection).await?;
    Ok(connection)
}

/// Open TCP, run the handshake and send `connect` for `app`.
async fn open_session(
    config: &RtmpConfig,
    app: &str,
    sink: &dyn RawEventSink,
    report_link: bool,
) -> Step<ConnectReply> {
    let host = config.host().unwrap_or_default().to_string();
    let port = config.port();

    debug!(host = %host, port = port, app = %config.app_name(), "Opening TCP connection");

    // Establish TCP connection
    let mut stream = TcpStream::connect((host.as_str(), port))
        .await
        .map_err(io_event)?;

    if report_link {
        let peer_address = stream.peer_addr().ok().map(|addr| addr.to_string());
        sink.emit(RawEvent::LinkUp { peer_address });
    }

    debug!("TCP connection established, starting handshake");

    // Perform RTMP handshake
    let mut handshake = Handshake::new(PeerType::Client);

    // Generate and send C0+C1
    let p0_p1 = handshake
        .generate_outbound_p0_and_p1()
        .map_err(|e| protocol_event("Handshake generation failed", e))?;
    write_all(&mut stream, &p0_p1).await?;

    // Read handshake response (S0+S1+S2 = 1 + 1536 + 1536 = 3073 bytes)
    let mut handshake_buf = vec![0u8; 4096];
    let leftover_bytes;

    loop {
        let n = read_some(&mut stream, &mut handshake_buf, "during handshake").await?;

        match handshake.process_bytes(&handshake_buf[..n]) {
            Ok(HandshakeProcessResult::InProgress { response_bytes }) => {
                if !response_bytes.is_empty() {
                    write_all(&mut stream, &response_bytes).await?;
                }
            }
            Ok(HandshakeProcessResult::Completed {
                response_bytes,
                remaining_bytes,
            }) => {
                if !response_bytes.is_empty() {
                    write_all(&mut stream, &response_bytes).await?;
                }
                leftover_bytes = remaining_bytes;
                break;
            }
            Err(e) => return Err(protocol_event("Handshake failed", e)),
        }
    }

    debug!("Handshake complete, creating RTMP session");

    // Create RTMP client session
    let mut session_config = ClientSessionConfig::new();
    session_config.tc_url = Some(format!("rtmp://{}:{}/{}", host, port, app));
    let (mut session, initial_results) = ClientSession::new(session_config)
        .map_err(|e| protocol_event("Session creation failed", e))?;

    // Send initial session packets (chunk size, etc.)
    for result in initial_results {
        if let ClientSessionResult::OutboundResponse(packet) = result {
            write_all(&mut stream, &packet.bytes).await?;
        }
    }

    // Server messages that arrived with the end of the handshake
    if !leftover_bytes.is_empty() {
        for event in process_input(&mut stream, &mut session, &leftover_bytes).await? {
            trace!("Received event: {:?}", event);
        }
    }

    // Request connection to the application
    debug!(app = %config.app_name(), "Requesting RTMP connection");
    let connect_request = session
        .request_connection(app.to_string())
        .map_err(|e| protocol_event("Connection request failed", e))?;
    if let ClientSessionResult::OutboundResponse(packet) = connect_request {
        write_all(&mut stream, &packet.bytes).await?;
    }

    let mut read_buf = vec![0u8; 4096];

    // Wait for connection acceptance
    for _ in 0..CONNECT_ACCEPT_POLLS {
        tokio::select! {
            result = read_some(&mut stream, &mut read_buf, "while connecting") => {
                let n = result?;
                for event in process_input(&mut stream, &mut session, &read_buf[..n]).await? {
                    match event {
                        ClientSessionEvent::ConnectionRequestAccepted => {
                            debug!("Connection accepted by server");
                            return Ok(ConnectReply::Accepted(RtmpConnection { stream, session }));
                        }
                        ClientSessionEvent::ConnectionRequestRejected { description } => {
                            debug!(%description, "Connection rejected by server");
                            return Ok(ConnectReply::Rejected(description));
                        }
                        event => trace!("Received event: {:?}", event),
                    }
                }
            }
            _ = tokio::time::sleep(POLL_INTERVAL) => continue,
        }
    }

    Err(RawEvent::Timeout)
}

async fn start_publishing(config: &RtmpConfig, connection: &mut RtmpConnection) -> Step<()> {
    let RtmpConnection { stream, session } = connection;

    // Request publishing
    debug!("Requesting publish");
    let publish_request = session
        .request_publishing(config.stream_key().to_string(), PublishRequestType::Live)
        .map_err(|e| protocol_event("Publish request failed", e))?;
    if let ClientSessionResult::OutboundResponse(packet) = publish_request {
        write_all(stream, &packet.bytes).await?;
    }

    let mut read_buf = vec![0u8; 4096];

    // Wait for publish acceptance
    for _ in 0..PUBLISH_ACCEPT_POLLS {
        tokio::select! {
            result = read_some(stream, &mut read_buf, "while publishing") => {
                let n = result?;
                for event in process_input(stream, session, &read_buf[..n]).await? {
                    if event == ClientSessionEvent::PublishRequestAccepted {
                        debug!("Publish request accepted");
                        return Ok(());
                    }
                    trace!("Received event: {:?}", event);
                }
            }
            _ = tokio::time::sleep(POLL_INTERVAL) => continue,
        }
    }

    Err(RawEvent::Timeout)
}

/// Feed received bytes to the session, write whatever it answers, and
/// return the events it raised.
async fn process_input(
    stream: &mut TcpStream,
    session: &mut ClientSession,
    bytes: &[u8],
) -> Step<Vec<ClientSessionEvent>> {
    let results = session
        .handle_input(bytes)
        .map_err(|e| protocol_event("Session input error", e))?;

    let mut events = Vec::new();
    for result in results {
        match result {
            ClientSessionResult::OutboundResponse(packet) => write_all(stream, &packet.bytes).await?,
            ClientSessionResult::RaisedEvent(event) => events.push(event),
            ClientSessionResult::UnhandleableMessageReceived(payload) => {
                trace!(type_id = payload.type_id, "Unhandled RTMP message")
            }
        }
    }
    Ok(events)
}

async fn send_packet(connection: &mut RtmpConnection, packet: &MediaPacket) -> Step<()> {
    let timestamp = RtmpTimestamp::new(packet.timestamp_ms);

    // Publish the packet through the session
    let result = if packet.is_video {
        connection.session.publish_video_data(
            packet.data.clone(),
            timestamp,
            !packet.is_keyframe, // can_be_dropped: true for non-keyframes
        )
    } else {
        connection.session.publish_audio_data(
            packet.data.clone(),
            timestamp,
            false, // can_be_dropped: audio is important
        )
    };

    let session_result = result.map_err(|e| protocol_event("Failed to publish data", e))?;

    if let ClientSessionResult::OutboundResponse(rtmp_packet) = session_result {
        write_all(&mut connection.stream, &rtmp_packet.bytes).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpListener;

    use parking_lot::Mutex;
    use rml_rtmp::sessions::{
        ServerSession, ServerSessionConfig, ServerSessionEvent, ServerSessionResult,
    };

    use url::Url;

    use super::*;
    use crate::auth::adobe_response;
    use crate::config::RtmpAuthMode;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<RawEvent>>,
    }

    impl RawEventSink for RecordingSink {
        fn emit(&self, event: RawEvent) {
            self.events.lock().push(event);
        }
    }

    fn wait_for_events(sink: &RecordingSink, count: usize) -> Vec<RawEvent> {
        for _ in 0..400 {
            if sink.events.lock().len() >= count {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        sink.events.lock().clone()
    }

    fn write_results(stream: &mut std::net::TcpStream, results: Vec<ServerSessionResult>) {
        for result in results {
            if let ServerSessionResult::OutboundResponse(packet) = result {
                stream.write_all(&packet.bytes).unwrap();
            }
        }
    }

    /// Serve one client connection. The server's opening messages are sent
    /// in the same write as the handshake reply, so the client receives them
    /// as handshake leftovers. `decide` gets the requested app name and
    /// returns a rejection description to refuse `connect`.
    ///
    /// Returns the app name the client asked for.
    fn serve_once(listener: &TcpListener, decide: impl Fn(&str) -> Option<String>) -> String {
        let (mut stream, _) = listener.accept().unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

        let mut handshake = Handshake::new(PeerType::Server);
        let (mut session, opening) = ServerSession::new(ServerSessionConfig::new()).unwrap();
        let mut opening = Some(opening);
        let mut buf = [0u8; 4096];

        let mut pending = loop {
            let n = stream.read(&mut buf).unwrap();
            match handshake.process_bytes(&buf[..n]).unwrap() {
                HandshakeProcessResult::InProgress { mut response_bytes } => {
                    if response_bytes.is_empty() {
                        continue;
                    }
                    for result in opening.take().unwrap_or_default() {
                        if let ServerSessionResult::OutboundResponse(packet) = result {
                            response_bytes.extend_from_slice(&packet.bytes);
                        }
                    }
                    stream.write_all(&response_bytes).unwrap();
                }
                HandshakeProcessResult::Completed {
                    response_bytes,
                    remaining_bytes,
                } => {
                    stream.write_all(&response_bytes).unwrap();
                    break remaining_bytes;
                }
            }
        };

        let mut requested_app = String::new();
        loop {
            for result in session.handle_input(&pending).unwrap() {
                match result {
                    ServerSessionResult::OutboundResponse(packet) => stream.write_all(&packet.bytes).unwrap(),
                    ServerSessionResult::RaisedEvent(ServerSessionEvent::ConnectionRequested {
                        request_id,
                        app_name,
                    }) => {
                        requested_app = app_name.clone();
                        match decide(&app_name) {
                            Some(description) => {
                                let replies = session
                                    .reject_request(request_id, "NetConnection.Connect.Rejected", &description)
                                    .unwrap();
                                write_results(&mut stream, replies);
                                return requested_app;
                            }
                            None => {
                                let replies = session.accept_request(request_id).unwrap();
                                write_results(&mut stream, replies);
                            }
                        }
                    }
                    ServerSessionResult::RaisedEvent(ServerSessionEvent::PublishStreamRequested {
                        request_id,
                        ..
                    }) => {
                        let replies = session.accept_request(request_id).unwrap();
                        write_results(&mut stream, replies);
                        // Hold the link open while the client reports progress.
                        thread::sleep(Duration::from_millis(200));
                        return requested_app;
                    }
                    _ => {}
                }
            }

            let n = stream.read(&mut buf).unwrap_or(0);
            if n == 0 {
                return requested_app;
            }
            pending = buf[..n].to_vec();
        }
    }

    fn config_for(port: u16) -> Arc<TransportConfig> {
        let url = format!("rtmp://127.0.0.1:{}/live/test-key", port);
        Arc::new(TransportConfig::from_url(&url).unwrap())
    }

    #[test]
    fn test_refused_connection_reports_socket_error() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let sink = Arc::new(RecordingSink::default());
        let _handle = RtmpDriver::new().connect(config_for(port), sink.clone()).unwrap();

        let events = wait_for_events(&sink, 1);
        assert!(matches!(events.as_slice(), [RawEvent::SocketError { .. }]));
    }

    #[test]
    fn test_server_hangup_during_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            drop(stream);
        });

        let sink = Arc::new(RecordingSink::default());
        let _handle = RtmpDriver::new().connect(config_for(port), sink.clone()).unwrap();

        let events = wait_for_events(&sink, 2);
        server.join().unwrap();

        assert!(matches!(events[0], RawEvent::LinkUp { peer_address: Some(_) }));
        assert!(events[1].is_fatal());
    }

    #[test]
    fn test_publishes_after_server_messages_in_handshake_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || serve_once(&listener, |_| None));

        let sink = Arc::new(RecordingSink::default());
        let _handle = RtmpDriver::new().connect(config_for(port), sink.clone()).unwrap();

        let events = wait_for_events(&sink, 2);
        assert_eq!(server.join().unwrap(), "live");
        assert!(matches!(events[0], RawEvent::LinkUp { peer_address: Some(_) }));
        assert_eq!(events[1], RawEvent::HandshakeComplete);
    }

    #[test]
    fn test_adobe_challenge_reconnects_and_publishes() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let first = serve_once(&listener, |_| {
                Some(
                    "[ AccessManager.Reject ] : [ authmod=adobe ] : \
                     ?reason=needauth&user=alice&salt=Xy9s&challenge=c0ffee&opaque=op4que"
                        .to_string(),
                )
            });
            let second = serve_once(&listener, |app| {
                let query: std::collections::HashMap<_, _> = app
                    .split_once('?')
                    .map(|(_, q)| q)
                    .unwrap_or_default()
                    .split('&')
                    .filter_map(|pair| pair.split_once('='))
                    .collect();
                let ours = query.get("challenge").copied().unwrap_or_default();
                let expected = adobe_response("alice", "secret", "Xy9s", Some("c0ffee"), Some("op4que"), ours);
                if query.get("response").copied() == Some(expected.as_str()) {
                    None
                } else {
                    Some("[ AccessManager.Reject ] : [ authmod=adobe ] : ?reason=authfailed".to_string())
                }
            });
            (first, second)
        });

        let url = Url::parse(&format!("rtmp://127.0.0.1:{}/live", port)).unwrap();
        let config = RtmpConfig::new(url, "test-key", Default::default())
            .unwrap()
            .with_auth(RtmpAuthMode::Rtmp, "alice", "secret")
            .unwrap();
        let sink = Arc::new(RecordingSink::default());
        let _handle = RtmpDriver::new()
            .connect(Arc::new(TransportConfig::Rtmp(config)), sink.clone())
            .unwrap();

        let events = wait_for_events(&sink, 2);
        let (first, second) = server.join().unwrap();
        assert_eq!(first, "live?authmod=adobe&user=alice");
        assert!(second.starts_with("live?authmod=adobe&user=alice&challenge="));

        // The reconnect is invisible to the lifecycle: one link-up only.
        assert!(matches!(events[0], RawEvent::LinkUp { .. }));
        assert_eq!(events[1], RawEvent::HandshakeComplete);
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_refused_credentials_report_auth_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            serve_once(&listener, |_| Some("code=403 need auth; authmod=adobe".to_string()))
        });

        let sink = Arc::new(RecordingSink::default());
        let _handle = RtmpDriver::new().connect(config_for(port), sink.clone()).unwrap();

        let events = wait_for_events(&sink, 2);
        server.join().unwrap();
        assert!(matches!(events[0], RawEvent::LinkUp { .. }));
        assert!(matches!(
            &events[1],
            RawEvent::AuthRejected { reason } if reason.contains("need auth")
        ));
    }

    #[test]
    fn test_rejects_rtmps() {
        let config = Arc::new(TransportConfig::from_url("rtmps://live.example.com/app/key").unwrap());
        let sink: Arc<dyn RawEventSink> = Arc::new(RecordingSink::default());

        let err = RtmpDriver::new().connect(config, sink).unwrap_err();
        assert!(matches!(err, TransportError::ConfigurationRejected(_)));
    }

    #[test]
    fn test_disconnect_before_link_up_is_silent() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let driver = RtmpDriver::new();
        let sink = Arc::new(RecordingSink::default());
        let handle = driver.connect(config_for(port), sink.clone()).unwrap();

        driver.disconnect(&handle);
        driver.disconnect(&handle);
        assert!(handle.is_shut_down());
        drop(listener);
    }
}
