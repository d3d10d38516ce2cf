//! Settings file and command line merging.

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

use streamer_engine::SessionConfig;
use streamer_transport::{DriverRegistry, ReconnectPolicy, TransportConfig};

/// Everything needed to run one stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Where to stream to.
    pub connection: TransportConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub reconnect: ReconnectPolicy,

    /// Local recording destination, started once media flows.
    #[serde(default)]
    pub record: Option<Url>,
}

impl Settings {
    /// Load settings from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("Invalid settings file {}", path.display()))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let settings: Self = serde_json::from_str(raw)?;
        settings
            .connection
            .validate()
            .context("Connection settings failed validation")?;
        Ok(settings)
    }

    /// Settings for a bare stream URL.
    pub fn from_url(url: &str) -> Result<Self> {
        let connection = TransportConfig::from_url(url)
            .with_context(|| format!("Cannot stream to {}", url))?;
        Ok(Self {
            connection,
            session: SessionConfig::default(),
            reconnect: ReconnectPolicy::default(),
            record: None,
        })
    }

    /// Fail early when no driver in `drivers` speaks the configured protocol.
    pub fn ensure_supported(&self, drivers: &DriverRegistry) -> Result<()> {
        let protocol = self.connection.protocol();
        if !drivers.supports(protocol) {
            bail!(
                "{} streaming needs a link backend that this binary does not bundle",
                protocol
            );
        }
        Ok(())
    }

    /// Resolve the settings source given on the command line.
    pub fn resolve(config: Option<&Path>, url: Option<&str>) -> Result<Self> {
        match (config, url) {
            (Some(path), None) => Self::load(path),
            (None, Some(url)) => Self::from_url(url),
            (Some(_), Some(_)) => bail!("--config and --url are mutually exclusive"),
            (None, None) => bail!("either --config or --url is required"),
        }
    }
}
