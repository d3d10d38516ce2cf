//! SRT configuration.

use serde::{Deserialize, Serialize};
use url::Url;

use super::{query_number, query_param, ConnectionMode};
use crate::error::TransportError;
use crate::TransportResult;

/// Key lengths, in bits, accepted for `pbkeylen`. Zero derives a default.
pub const SRT_KEY_LENGTHS: [u32; 4] = [0, 128, 192, 256];

/// Default receiver latency in milliseconds.
pub const SRT_DEFAULT_LATENCY_MS: i32 = 120;

/// Passphrase length bounds enforced by libsrt.
const PASSPHRASE_MIN_LEN: usize = 10;
const PASSPHRASE_MAX_LEN: usize = 79;

/// Maximum stream id length enforced by libsrt.
const STREAM_ID_MAX_LEN: usize = 512;

/// Connection topology.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SrtConnectMode {
    #[default]
    Caller,
    Listen,
    Rendezvous,
}

impl SrtConnectMode {
    fn parse(raw: &str) -> TransportResult<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "caller" | "client" => Ok(Self::Caller),
            "listen" | "listener" | "server" => Ok(Self::Listen),
            "rendezvous" => Ok(Self::Rendezvous),
            other => Err(TransportError::InvalidUrl(format!("unknown SRT mode: {}", other))),
        }
    }
}

/// Retransmission algorithm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetransmitAlgo {
    #[default]
    Default,
    Reduced,
}

/// SRT connection parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SrtConfig {
    host: String,
    port: u16,
    mode: ConnectionMode,
    connect_mode: SrtConnectMode,

    /// Empty means no encryption.
    passphrase: String,

    /// Key length in bits.
    pbkeylen: u32,

    /// Receiver latency in milliseconds.
    latency: i32,

    /// Bytes per second; -1 is unlimited, 0 lets the library decide.
    maxbw: i64,

    retransmit_algo: RetransmitAlgo,
    stream_id: String,
}

impl Default for SrtConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 0,
            mode: ConnectionMode::default(),
            connect_mode: SrtConnectMode::default(),
            passphrase: String::new(),
            pbkeylen: 0,
            latency: SRT_DEFAULT_LATENCY_MS,
            maxbw: 0,
            retransmit_algo: RetransmitAlgo::default(),
            stream_id: String::new(),
        }
    }
}

impl SrtConfig {
    /// Start building a configuration for `host:port`.
    pub fn builder(host: impl Into<String>, port: u16) -> SrtConfigBuilder {
        SrtConfigBuilder {
            config: Self {
                host: host.into(),
                port,
                ..Self::default()
            },
        }
    }

    /// Build from an `srt://host:port?…` URL.
    ///
    /// `pbkeylen` in the query follows the libsrt convention of bytes
    /// (16/24/32); any other value is taken as bits.
    pub fn from_url(url: &Url) -> TransportResult<Self> {
        let host = url
            .host_str()
            .ok_or_else(|| TransportError::InvalidUrl("SRT URL is missing a host".to_string()))?;
        let port = url
            .port()
            .ok_or_else(|| TransportError::InvalidUrl("SRT URL is missing a port".to_string()))?;

        let mut builder = Self::builder(host, port);

        if let Some(stream_id) = query_param(url, "streamid") {
            builder = builder.stream_id(stream_id);
        }
        if let Some(passphrase) = query_param(url, "passphrase") {
            builder = builder.passphrase(passphrase);
        }
        if let Some(keylen) = query_number::<u32>(url, "pbkeylen")? {
            let bits = match keylen {
                16 | 24 | 32 => keylen * 8,
                other => other,
            };
            builder = builder.pbkeylen(bits);
        }
        if let Some(latency) = query_number::<i32>(url, "latency")? {
            builder = builder.latency(latency);
        }
        if let Some(maxbw) = query_number::<i64>(url, "maxbw")? {
            builder = builder.maxbw(maxbw);
        }
        if let Some(mode) = query_param(url, "mode") {
            builder = builder.connect_mode(SrtConnectMode::parse(&mode)?);
        }
        if let Some(algo) = query_number::<u8>(url, "retransmitalgo")? {
            builder = builder.retransmit_algo(if algo == 1 {
                RetransmitAlgo::Reduced
            } else {
                RetransmitAlgo::Default
            });
        }

        builder.build()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn mode(&self) -> ConnectionMode {
        self.mode
    }

    pub fn connect_mode(&self) -> SrtConnectMode {
        self.connect_mode
    }

    pub fn passphrase(&self) -> &str {
        &self.passphrase
    }

    pub fn is_encrypted(&self) -> bool {
        !self.passphrase.is_empty()
    }

    /// Configured key length in bits; zero when unset.
    pub fn pbkeylen(&self) -> u32 {
        self.pbkeylen
    }

    /// Key length in bits that will actually be used.
    ///
    /// AES-128 is derived when a passphrase is set and no length was given.
    pub fn effective_pbkeylen(&self) -> u32 {
        match (self.pbkeylen, self.is_encrypted()) {
            (0, true) => 128,
            (bits, _) => bits,
        }
    }

    pub fn latency(&self) -> i32 {
        self.latency
    }

    pub fn maxbw(&self) -> i64 {
        self.maxbw
    }

    pub fn retransmit_algo(&self) -> RetransmitAlgo {
        self.retransmit_algo
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Check every parameter against the SRT rules.
    pub fn validate(&self) -> TransportResult<()> {
        if self.host.trim().is_empty() {
            return Err(TransportError::invalid("SRT host is empty"));
        }
        if self.port == 0 {
            return Err(TransportError::invalid("SRT port must be within 1-65535"));
        }
        if !SRT_KEY_LENGTHS.contains(&self.pbkeylen) {
            return Err(TransportError::invalid(format!(
                "SRT pbkeylen must be one of 0, 128, 192, 256 (got {})",
                self.pbkeylen
            )));
        }
        if self.latency < 0 {
            return Err(TransportError::invalid(format!(
                "SRT latency must not be negative (got {})",
                self.latency
            )));
        }
        if self.maxbw < -1 {
            return Err(TransportError::invalid(format!(
                "SRT maxbw must be -1, 0 or a positive rate (got {})",
                self.maxbw
            )));
        }
        if self.is_encrypted() {
            let len = self.passphrase.chars().count();
            if !(PASSPHRASE_MIN_LEN..=PASSPHRASE_MAX_LEN).contains(&len) {
                return Err(TransportError::invalid(format!(
                    "SRT passphrase must be {}-{} characters",
                    PASSPHRASE_MIN_LEN, PASSPHRASE_MAX_LEN
                )));
            }
        }
        if self.stream_id.len() > STREAM_ID_MAX_LEN {
            return Err(TransportError::invalid(format!(
                "SRT stream id exceeds {} bytes",
                STREAM_ID_MAX_LEN
            )));
        }
        Ok(())
    }
}

/// Builder for [`SrtConfig`].
#[derive(Debug, Clone)]
pub struct SrtConfigBuilder {
    config: SrtConfig,
}

impl SrtConfigBuilder {
    pub fn mode(mut self, mode: ConnectionMode) -> Self {
        self.config.mode = mode;
        self
    }

    pub fn connect_mode(mut self, connect_mode: SrtConnectMode) -> Self {
        self.config.connect_mode = connect_mode;
        self
    }

    pub fn passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.config.passphrase = passphrase.into();
        self
    }

    pub fn pbkeylen(mut self, bits: u32) -> Self {
        self.config.pbkeylen = bits;
        self
    }

    pub fn latency(mut self, latency_ms: i32) -> Self {
        self.config.latency = latency_ms;
        self
    }

    pub fn maxbw(mut self, maxbw: i64) -> Self {
        self.config.maxbw = maxbw;
        self
    }

    pub fn retransmit_algo(mut self, algo: RetransmitAlgo) -> Self {
        self.config.retransmit_algo = algo;
        self
    }

    pub fn stream_id(mut self, stream_id: impl Into<String>) -> Self {
        self.config.stream_id = stream_id.into();
        self
    }

    /// Validate and produce the configuration.
    pub fn build(self) -> TransportResult<SrtConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
