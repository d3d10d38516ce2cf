//! SRT and RIST adapters over an opaque link backend.
//!
//! The wire protocols live in external libraries. An adapter turns a
//! configuration into a [`LinkRequest`] (endpoint plus library options)
//! and runs the backend on its own thread, so protocol quirks such as the
//! SRT caller/listener asymmetry or RIST profile gating stay out of the
//! engine.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::config::{
    ConnectionMode, Protocol, RetransmitAlgo, RistConfig, SrtConfig, SrtConnectMode,
    TransportConfig,
};
use crate::driver::{
    check_config, DriverHandle, MediaPacket, RawEvent, RawEventSink, ShutdownSignal,
    TransportDriver,
};
use crate::error::TransportError;
use crate::{TransportResult, PACKET_CHANNEL_CAPACITY};

/// Value of a library socket option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    Int(i64),
    Bool(bool),
    Str(String),
}

/// One named library option, e.g. `SRTO_LATENCY`.
#[derive(Clone, PartialEq, Eq)]
pub struct SocketOption {
    pub name: &'static str,
    pub value: OptionValue,
}

impl SocketOption {
    fn new(name: &'static str, value: OptionValue) -> Self {
        Self { name, value }
    }

    /// Returns true for options whose value must not be logged.
    pub fn is_secret(&self) -> bool {
        matches!(self.name, "SRTO_PASSPHRASE")
    }
}

impl fmt::Debug for SocketOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_secret() {
            write!(f, "{}=<redacted>", self.name)
        } else {
            write!(f, "{}={:?}", self.name, self.value)
        }
    }
}

/// Where and how a link should be opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEndpoint {
    /// Connect out to a listening peer.
    Caller { host: String, port: u16 },

    /// Bind locally and wait for the peer to connect.
    Listener { host: String, port: u16 },

    /// Both sides connect to each other.
    Rendezvous { host: String, port: u16 },

    /// Library-native URI.
    Uri(Url),
}

/// Everything a backend needs to open one link.
#[derive(Debug, Clone)]
pub struct LinkRequest {
    pub protocol: Protocol,
    pub endpoint: LinkEndpoint,
    pub options: Vec<SocketOption>,
}

impl LinkRequest {
    /// Translate an SRT configuration into libsrt socket options.
    pub fn from_srt(config: &SrtConfig) -> Self {
        let host = config.host().to_string();
        let port = config.port();

        let endpoint = match config.connect_mode() {
            SrtConnectMode::Caller => LinkEndpoint::Caller { host, port },
            SrtConnectMode::Listen => LinkEndpoint::Listener { host, port },
            SrtConnectMode::Rendezvous => LinkEndpoint::Rendezvous { host, port },
        };

        let mut options = vec![
            SocketOption::new("SRTO_TRANSTYPE", OptionValue::Str("live".to_string())),
            SocketOption::new("SRTO_SENDER", OptionValue::Bool(true)),
            SocketOption::new("SRTO_LATENCY", OptionValue::Int(i64::from(config.latency()))),
            SocketOption::new("SRTO_MAXBW", OptionValue::Int(config.maxbw())),
            SocketOption::new(
                "SRTO_RETRANSMITALGO",
                OptionValue::Int(match config.retransmit_algo() {
                    RetransmitAlgo::Default => 0,
                    RetransmitAlgo::Reduced => 1,
                }),
            ),
        ];

        if config.connect_mode() == SrtConnectMode::Rendezvous {
            options.push(SocketOption::new("SRTO_RENDEZVOUS", OptionValue::Bool(true)));
        }

        if config.is_encrypted() {
            options.push(SocketOption::new(
                "SRTO_PASSPHRASE",
                OptionValue::Str(config.passphrase().to_string()),
            ));
            // libsrt takes the key length in bytes.
            options.push(SocketOption::new(
                "SRTO_PBKEYLEN",
                OptionValue::Int(i64::from(config.effective_pbkeylen() / 8)),
            ));
        }

        if !config.stream_id().is_empty() {
            options.push(SocketOption::new(
                "SRTO_STREAMID",
                OptionValue::Str(config.stream_id().to_string()),
            ));
        }

        Self {
            protocol: Protocol::Srt,
            endpoint,
            options,
        }
    }

    /// Translate a RIST configuration. Everything except the profile
    /// travels in the URI.
    pub fn from_rist(config: &RistConfig) -> Self {
        Self {
            protocol: Protocol::Rist,
            endpoint: LinkEndpoint::Uri(config.uri().clone()),
            options: vec![SocketOption::new(
                "RIST_PROFILE",
                OptionValue::Int(config.profile().as_index()),
            )],
        }
    }

    /// Look up an option by name.
    pub fn option(&self, name: &str) -> Option<&OptionValue> {
        self.options.iter().find(|opt| opt.name == name).map(|opt| &opt.value)
    }
}

/// Context handed to a backend for the lifetime of one link.
pub struct LinkContext {
    sink: Arc<dyn RawEventSink>,
    shutdown: ShutdownSignal,
    packets: Receiver<MediaPacket>,
    mode: ConnectionMode,
    data_flowing: AtomicBool,
}

impl LinkContext {
    /// Report a raw transport event.
    pub fn emit(&self, event: RawEvent) {
        self.sink.emit(event);
    }

    /// Record that the transport accepted a packet.
    ///
    /// Reports `DataFlowing` on the first call only, so backends can call
    /// this after every successful send.
    pub fn packet_sent(&self) {
        if !self.data_flowing.swap(true, Ordering::SeqCst) {
            self.emit(RawEvent::DataFlowing);
        }
    }

    /// Returns true once the link should be torn down.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_triggered()
    }

    /// Next packet this connection should carry, waiting up to `timeout`.
    ///
    /// Packets excluded by the connection mode are skipped. Returns `None`
    /// on timeout, shutdown, or when the packet source is gone.
    pub fn next_packet(&self, timeout: Duration) -> Option<MediaPacket> {
        loop {
            if self.is_shutdown() {
                return None;
            }
            match self.packets.recv_timeout(timeout) {
                Ok(packet) if self.mode.accepts(&packet) => return Some(packet),
                Ok(_) => continue,
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    return None
                }
            }
        }
    }
}

/// An external SRT or RIST implementation.
///
/// `run` blocks for the lifetime of the link: it opens the endpoint,
/// reports events through the context, sends packets until
/// [`LinkContext::is_shutdown`] turns true, then closes and returns.
///
/// The backend reports `LinkUp` and `HandshakeComplete` itself. After each
/// packet the library accepts it calls [`LinkContext::packet_sent`], which
/// reports `DataFlowing` once; without it the connection never leaves
/// `Setup`.
pub trait LinkBackend: Send + Sync + 'static {
    fn run(&self, request: &LinkRequest, link: &LinkContext);
}

/// Driver for SRT or RIST over a [`LinkBackend`].
pub struct LinkAdapter {
    protocol: Protocol,
    backend: Arc<dyn LinkBackend>,
    next_link: AtomicU64,
}

impl LinkAdapter {
    /// SRT adapter.
    pub fn srt(backend: Arc<dyn LinkBackend>) -> Self {
        Self::new(Protocol::Srt, backend)
    }

    /// RIST adapter.
    pub fn rist(backend: Arc<dyn LinkBackend>) -> Self {
        Self::new(Protocol::Rist, backend)
    }

    fn new(protocol: Protocol, backend: Arc<dyn LinkBackend>) -> Self {
        Self {
            protocol,
            backend,
            next_link: AtomicU64::new(1),
        }
    }

    fn request_for(&self, config: &TransportConfig) -> TransportResult<LinkRequest> {
        match config {
            TransportConfig::Srt(srt) => Ok(LinkRequest::from_srt(srt)),
            TransportConfig::Rist(rist) => Ok(LinkRequest::from_rist(rist)),
            other => Err(TransportError::protocol_mismatch(self.protocol, other.protocol())),
        }
    }
}

impl TransportDriver for LinkAdapter {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    #[instrument(name = "link_connect", skip_all, fields(protocol = %self.protocol))]
    fn connect(
        &self,
        config: Arc<TransportConfig>,
        sink: Arc<dyn RawEventSink>,
    ) -> TransportResult<DriverHandle> {
        check_config(self.protocol, &config)?;
        let request = self.request_for(&config)?;

        info!(target_addr = %config.describe(), "Opening link");
        debug!(options = ?request.options, "Link options");

        let (sender, receiver) = crossbeam_channel::bounded(PACKET_CHANNEL_CAPACITY);
        let shutdown = ShutdownSignal::new();
        let context = LinkContext {
            sink: Arc::clone(&sink),
            shutdown: shutdown.clone(),
            packets: receiver,
            mode: config.mode(),
            data_flowing: AtomicBool::new(false),
        };

        let backend = Arc::clone(&self.backend);
        let link_no = self.next_link.fetch_add(1, Ordering::Relaxed);

        thread::Builder::new()
            .name(format!("{}-link-{}", self.protocol, link_no))
            .spawn(move || {
                backend.run(&request, &context);

                if context.is_shutdown() {
                    debug!("Link stopped on request");
                } else {
                    warn!("Link backend returned without a shutdown request");
                    context.emit(RawEvent::LinkDown {
                        reason: "link closed by backend".to_string(),
                    });
                }
            })?;

        Ok(DriverHandle::new(self.protocol, shutdown, sender))
    }
}
