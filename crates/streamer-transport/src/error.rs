//! Error types for the transport module.

use thiserror::Error;

use crate::config::Protocol;

/// Errors that can occur during transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Configuration failed validation at construction time.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A driver refused a configuration handed to it.
    #[error("Configuration rejected: {0}")]
    ConfigurationRejected(String),

    /// No driver is available for the protocol.
    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    /// Stream URL could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidConfiguration(message.into())
    }

    pub(crate) fn protocol_mismatch(expected: Protocol, actual: Protocol) -> Self {
        Self::ConfigurationRejected(format!(
            "{} driver cannot open a {} configuration",
            expected, actual
        ))
    }
}
