//! Protocol-specific transport configurations.
//!
//! Configurations are immutable value objects. Builders validate on
//! `build()`; deserialized values skip that step, which is why drivers
//! run [`TransportConfig::validate`] again before opening anything.

mod rist;
mod rtmp;
mod srt;

pub use rist::{RistConfig, RistConfigBuilder, RistProfile};
pub use rtmp::{RtmpAuthMode, RtmpConfig};
pub use srt::{RetransmitAlgo, SrtConfig, SrtConfigBuilder, SrtConnectMode};

use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::driver::MediaPacket;
use crate::error::TransportError;
use crate::TransportResult;

/// Wire protocol family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Srt,
    Rist,
    Rtmp,
}

impl Protocol {
    /// Lowercase protocol name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Srt => "srt",
            Self::Rist => "rist",
            Self::Rtmp => "rtmp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which media a connection carries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionMode {
    #[default]
    VideoAudio,
    VideoOnly,
    AudioOnly,
}

impl ConnectionMode {
    /// Returns true if a packet of this kind belongs on the connection.
    pub fn accepts(self, packet: &MediaPacket) -> bool {
        match self {
            Self::VideoAudio => true,
            Self::VideoOnly => packet.is_video,
            Self::AudioOnly => !packet.is_video,
        }
    }
}

/// A validated transport configuration, one variant per protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum TransportConfig {
    Srt(SrtConfig),
    Rist(RistConfig),
    Rtmp(RtmpConfig),
}

impl TransportConfig {
    /// Build a configuration from a stream URL.
    ///
    /// Supported schemes are `srt`, `rist`, `rtmp` and `rtmps`. Anything
    /// else, `rtsp` included, is `UnsupportedProtocol`.
    pub fn from_url(input: &str) -> TransportResult<Self> {
        let url = Url::parse(input.trim()).map_err(|e| TransportError::InvalidUrl(e.to_string()))?;

        match url.scheme().to_ascii_lowercase().as_str() {
            "srt" => SrtConfig::from_url(&url).map(Self::Srt),
            "rist" => RistConfig::from_url(&url).map(Self::Rist),
            "rtmp" | "rtmps" => RtmpConfig::from_url(&url).map(Self::Rtmp),
            other => Err(TransportError::UnsupportedProtocol(other.to_string())),
        }
    }

    /// The protocol of the active variant.
    pub fn protocol(&self) -> Protocol {
        match self {
            Self::Srt(_) => Protocol::Srt,
            Self::Rist(_) => Protocol::Rist,
            Self::Rtmp(_) => Protocol::Rtmp,
        }
    }

    /// Media carried by this connection.
    pub fn mode(&self) -> ConnectionMode {
        match self {
            Self::Srt(config) => config.mode(),
            Self::Rist(config) => config.mode(),
            Self::Rtmp(config) => config.mode(),
        }
    }

    /// Check every invariant of the active variant.
    pub fn validate(&self) -> TransportResult<()> {
        match self {
            Self::Srt(config) => config.validate(),
            Self::Rist(config) => config.validate(),
            Self::Rtmp(config) => config.validate(),
        }
    }

    /// Short target description for logs; never includes secrets.
    pub fn describe(&self) -> String {
        match self {
            Self::Srt(config) => format!("srt://{}:{}", config.host(), config.port()),
            Self::Rist(config) => match (config.uri().host_str(), config.uri().port()) {
                (Some(host), Some(port)) => format!("rist://{}:{}", host, port),
                (Some(host), None) => format!("rist://{}", host),
                _ => "rist://".to_string(),
            },
            Self::Rtmp(config) => config.url().to_string(),
        }
    }
}

impl From<SrtConfig> for TransportConfig {
    fn from(config: SrtConfig) -> Self {
        Self::Srt(config)
    }
}

impl From<RistConfig> for TransportConfig {
    fn from(config: RistConfig) -> Self {
        Self::Rist(config)
    }
}

impl From<RtmpConfig> for TransportConfig {
    fn from(config: RtmpConfig) -> Self {
        Self::Rtmp(config)
    }
}

/// Look up the first non-empty query parameter with the given name.
pub(crate) fn query_param(url: &Url, name: &str) -> Option<String> {
    url.query_pairs()
        .find(|(key, value)| key.eq_ignore_ascii_case(name) && !value.is_empty())
        .map(|(_, value)| value.into_owned())
}

/// Parse an integer query parameter.
pub(crate) fn query_number<T: std::str::FromStr>(
    url: &Url,
    name: &str,
) -> TransportResult<Option<T>> {
    match query_param(url, name) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| TransportError::InvalidUrl(format!("{} is not a number: {}", name, raw))),
        None => Ok(None),
    }
}
