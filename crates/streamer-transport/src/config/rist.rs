//! RIST configuration.

use serde::{Deserialize, Serialize};
use url::Url;

use super::{query_param, ConnectionMode};
use crate::error::TransportError;
use crate::TransportResult;

/// URI parameters that turn on encryption.
const ENCRYPTION_PARAMS: [&str; 2] = ["secret", "aes-type"];

/// RIST profile, which gates the features a connection may use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RistProfile {
    Simple,
    #[default]
    Main,
    Advanced,
}

impl RistProfile {
    /// Returns true if the profile allows encrypted streams.
    pub fn permits_encryption(self) -> bool {
        self >= Self::Main
    }

    /// Numeric profile as used by librist.
    pub fn as_index(self) -> i64 {
        match self {
            Self::Simple => 0,
            Self::Main => 1,
            Self::Advanced => 2,
        }
    }

    fn parse(raw: &str) -> TransportResult<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "simple" | "0" => Ok(Self::Simple),
            "main" | "1" => Ok(Self::Main),
            "advanced" | "2" => Ok(Self::Advanced),
            other => Err(TransportError::InvalidUrl(format!("unknown RIST profile: {}", other))),
        }
    }
}

/// RIST connection parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RistConfig {
    uri: Url,
    #[serde(default)]
    mode: ConnectionMode,
    #[serde(default)]
    profile: RistProfile,
}

impl RistConfig {
    /// Start building a configuration for `uri`.
    pub fn builder(uri: Url) -> RistConfigBuilder {
        RistConfigBuilder {
            config: Self {
                uri,
                mode: ConnectionMode::default(),
                profile: RistProfile::default(),
            },
        }
    }

    /// Build from a `rist://` URL, reading the profile from `?profile=`.
    pub fn from_url(url: &Url) -> TransportResult<Self> {
        let mut builder = Self::builder(url.clone());
        if let Some(profile) = query_param(url, "profile") {
            builder = builder.profile(RistProfile::parse(&profile)?);
        }
        builder.build()
    }

    pub fn uri(&self) -> &Url {
        &self.uri
    }

    pub fn mode(&self) -> ConnectionMode {
        self.mode
    }

    pub fn profile(&self) -> RistProfile {
        self.profile
    }

    /// Returns true if the URI asks for an encrypted stream.
    pub fn is_encrypted(&self) -> bool {
        ENCRYPTION_PARAMS
            .iter()
            .any(|name| query_param(&self.uri, name).is_some())
    }

    /// Check the URI and the profile/feature combination.
    ///
    /// A profile too weak for the requested features is rejected, never
    /// silently upgraded or stripped.
    pub fn validate(&self) -> TransportResult<()> {
        if !self.uri.scheme().eq_ignore_ascii_case("rist") {
            return Err(TransportError::invalid(format!(
                "RIST URI must use the rist scheme (got {})",
                self.uri.scheme()
            )));
        }
        if self.uri.host_str().map_or(true, str::is_empty) {
            return Err(TransportError::invalid("RIST URI is missing a host"));
        }
        if self.is_encrypted() && !self.profile.permits_encryption() {
            return Err(TransportError::invalid(
                "RIST simple profile does not support encryption; use main or advanced",
            ));
        }
        if let Some(aes) = query_param(&self.uri, "aes-type") {
            if aes != "128" && aes != "256" {
                return Err(TransportError::invalid(format!(
                    "RIST aes-type must be 128 or 256 (got {})",
                    aes
                )));
            }
        }
        Ok(())
    }
}

/// Builder for [`RistConfig`].
#[derive(Debug, Clone)]
pub struct RistConfigBuilder {
    config: RistConfig,
}

impl RistConfigBuilder {
    pub fn mode(mut self, mode: ConnectionMode) -> Self {
        self.config.mode = mode;
        self
    }

    pub fn profile(mut self, profile: RistProfile) -> Self {
        self.config.profile = profile;
        self
    }

    /// Validate and produce the configuration.
    pub fn build(self) -> TransportResult<RistConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
