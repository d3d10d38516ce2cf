//! Uniform driver surface shared by every protocol adapter.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use crossbeam_channel::Sender;
use tokio::sync::Notify;

use crate::config::{Protocol, TransportConfig};
use crate::error::TransportError;
use crate::rtmp::RtmpDriver;
use crate::TransportResult;

/// Transport-level event reported by a driver.
///
/// Drivers only translate; deciding what an event means for the
/// connection lifecycle happens in the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawEvent {
    /// The transport link is up.
    LinkUp { peer_address: Option<String> },

    /// Protocol handshake and session setup finished.
    HandshakeComplete,

    /// The first media packet was accepted by the transport.
    DataFlowing,

    /// The link went away.
    LinkDown { reason: String },

    /// The peer rejected credentials, passphrase or stream id.
    AuthRejected { reason: String },

    /// A socket operation failed.
    ///
    /// `os_code` is the OS error number, when one is known. Library error
    /// codes (libsrt, librist) go in `protocol_code` and are never read as
    /// errno values.
    SocketError {
        os_code: Option<i32>,
        protocol_code: Option<i32>,
        message: String,
    },

    /// The peer did not answer in time.
    Timeout,

    /// The peer sent something the protocol layer could not make sense of.
    ProtocolError { message: String },
}

impl RawEvent {
    /// Build a socket error event from an IO error.
    pub fn from_io(error: &std::io::Error) -> Self {
        Self::SocketError {
            os_code: error.raw_os_error(),
            protocol_code: None,
            message: error.to_string(),
        }
    }

    /// Returns true if the event can only end a connection.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::LinkDown { .. }
                | Self::AuthRejected { .. }
                | Self::SocketError { .. }
                | Self::Timeout
                | Self::ProtocolError { .. }
        )
    }
}

/// Receives raw events from a driver's background context.
pub trait RawEventSink: Send + Sync {
    /// Deliver one event. Must not block on the consumer.
    fn emit(&self, event: RawEvent);
}

/// A media packet handed to a transport.
#[derive(Debug, Clone)]
pub struct MediaPacket {
    /// Packet data.
    pub data: Bytes,

    /// Presentation timestamp in milliseconds.
    pub timestamp_ms: u32,

    /// Whether this is a video packet.
    pub is_video: bool,

    /// Whether this is a keyframe (for video).
    pub is_keyframe: bool,
}

/// One-shot stop signal usable from both threads and async tasks.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    inner: Arc<ShutdownInner>,
}

#[derive(Debug, Default)]
struct ShutdownInner {
    triggered: AtomicBool,
    notify: Notify,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal. Idempotent.
    pub fn trigger(&self) {
        if !self.inner.triggered.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    /// Wait until the signal is raised.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }
}

/// Live handle to one driver connection.
///
/// Dropping the handle stops the connection.
pub struct DriverHandle {
    protocol: Protocol,
    shutdown: ShutdownSignal,
    packets: Sender<MediaPacket>,
}

impl DriverHandle {
    pub fn new(protocol: Protocol, shutdown: ShutdownSignal, packets: Sender<MediaPacket>) -> Self {
        Self {
            protocol,
            shutdown,
            packets,
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Sender for media packets bound for this connection.
    pub fn packet_sender(&self) -> Sender<MediaPacket> {
        self.packets.clone()
    }

    /// Ask the background context to stop. Never blocks.
    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_triggered()
    }
}

impl fmt::Debug for DriverHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverHandle")
            .field("protocol", &self.protocol)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

impl Drop for DriverHandle {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

/// Per-protocol adapter driving an underlying transport.
pub trait TransportDriver: Send + Sync {
    /// The protocol this driver speaks.
    fn protocol(&self) -> Protocol;

    /// Start the transport handshake in the background and return at once.
    ///
    /// Raw events for the connection are delivered to `sink`.
    fn connect(
        &self,
        config: Arc<TransportConfig>,
        sink: Arc<dyn RawEventSink>,
    ) -> TransportResult<DriverHandle>;

    /// Stop a connection. Safe in any state, including mid-handshake and
    /// after the link is already gone.
    fn disconnect(&self, handle: &DriverHandle) {
        handle.shutdown();
    }
}

/// Make sure a configuration may be handed to a driver for `protocol`.
///
/// Anything that fails here surfaces as `ConfigurationRejected`.
pub fn check_config(protocol: Protocol, config: &TransportConfig) -> TransportResult<()> {
    if config.protocol() != protocol {
        return Err(TransportError::protocol_mismatch(protocol, config.protocol()));
    }
    config.validate().map_err(|e| match e {
        TransportError::InvalidConfiguration(message) => TransportError::ConfigurationRejected(message),
        other => other,
    })
}

/// Drivers available to a session, keyed by protocol.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: HashMap<Protocol, Arc<dyn TransportDriver>>,
}

impl DriverRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every built-in driver.
    ///
    /// SRT and RIST need a link backend and must be registered explicitly.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(RtmpDriver::new()));
        registry
    }

    /// Add or replace the driver for its protocol.
    pub fn register(&mut self, driver: Arc<dyn TransportDriver>) -> &mut Self {
        self.drivers.insert(driver.protocol(), driver);
        self
    }

    pub fn get(&self, protocol: Protocol) -> TransportResult<Arc<dyn TransportDriver>> {
        self.drivers
            .get(&protocol)
            .cloned()
            .ok_or_else(|| TransportError::UnsupportedProtocol(protocol.to_string()))
    }

    pub fn supports(&self, protocol: Protocol) -> bool {
        self.drivers.contains_key(&protocol)
    }
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.drivers.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RistConfig, SrtConfig};

    #[test]
    fn test_shutdown_signal_is_idempotent() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_triggered());

        signal.trigger();
        signal.trigger();
        assert!(signal.is_triggered());
    }

    #[tokio::test]
    async fn test_shutdown_signal_wakes_waiter() {
        let signal = ShutdownSignal::new();
        let waiter = signal.clone();
        let task = tokio::spawn(async move { waiter.wait().await });

        signal.trigger();
        tokio::time::timeout(std::time::Duration::from_secs(1), task)
            .await
            .expect("waiter did not wake")
            .unwrap();
    }

    #[test]
    fn test_check_config_rejects_other_protocol() {
        let config = TransportConfig::Srt(SrtConfig::builder("a.example.com", 9000).build().unwrap());
        let err = check_config(Protocol::Rist, &config).unwrap_err();
        assert!(matches!(err, TransportError::ConfigurationRejected(_)));
    }

    #[test]
    fn test_check_config_rejects_unvalidated_values() {
        let json = r#"{"protocol":"rist","uri":"rist://10.0.0.2:1968?secret=abc","profile":"simple"}"#;
        let config: TransportConfig = serde_json::from_str(json).unwrap();

        let err = check_config(Protocol::Rist, &config).unwrap_err();
        assert!(matches!(err, TransportError::ConfigurationRejected(_)));

        let valid = TransportConfig::Rist(
            RistConfig::builder(url::Url::parse("rist://10.0.0.2:1968").unwrap())
                .build()
                .unwrap(),
        );
        assert!(check_config(Protocol::Rist, &valid).is_ok());
    }

    #[test]
    fn test_from_io_keeps_os_code_only() {
        let error = std::io::Error::from_raw_os_error(104);
        match RawEvent::from_io(&error) {
            RawEvent::SocketError {
                os_code,
                protocol_code,
                ..
            } => {
                assert_eq!(os_code, Some(104));
                assert_eq!(protocol_code, None);
            }
            other => panic!("unexpected event {other:?}"),
        }

        let synthetic = std::io::Error::new(std::io::ErrorKind::Other, "no errno");
        assert!(matches!(
            RawEvent::from_io(&synthetic),
            RawEvent::SocketError { os_code: None, .. }
        ));
    }

    #[test]
    fn test_registry_defaults_to_rtmp_only() {
        let registry = DriverRegistry::with_defaults();
        assert!(registry.supports(Protocol::Rtmp));
        assert!(!registry.supports(Protocol::Srt));
        assert!(matches!(
            registry.get(Protocol::Rist),
            Err(TransportError::UnsupportedProtocol(_))
        ));
    }
}
