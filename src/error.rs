//! Crate-wide error types.
//!
//! Per-concern errors ([`CryptoError`], [`MessageError`],
//! [`ConnectionError`]) aggregate here with their chains preserved via
//! `#[source]`. Per-connection failures are handled inside the registry
//! loop and never surface through this type; what does surface is the
//! startup/configuration class of errors that is fatal to the operator.

use thiserror::Error;

use crate::crypto::CryptoError;
use crate::protocol::{ConnectionError, MessageError};

/// Errors surfaced by the public API.
#[derive(Debug, Error)]
pub enum LinkError {
    /// Cryptographic operation failed
    #[error("Crypto error: {0}")]
    Crypto(#[source] CryptoError),

    /// Wire message could not be parsed or produced
    #[error("Message error: {0}")]
    Message(#[source] MessageError),

    /// Per-connection protocol failure
    #[error("Connection error: {0}")]
    Connection(#[source] ConnectionError),

    /// Invalid or missing configuration (fatal at startup)
    #[error("Config error: {0}")]
    Config(String),

    /// I/O error (listener bind, socket operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The registry is no longer running
    #[error("Registry stopped")]
    Stopped,
}

/// Result type alias for crate operations
pub type Result<T> = std::result::Result<T, LinkError>;

impl From<CryptoError> for LinkError {
    fn from(err: CryptoError) -> Self {
        LinkError::Crypto(err)
    }
}

impl From<MessageError> for LinkError {
    fn from(err: MessageError) -> Self {
        LinkError::Message(err)
    }
}

impl From<ConnectionError> for LinkError {
    fn from(err: ConnectionError) -> Self {
        LinkError::Connection(err)
    }
}

impl From<toml::de::Error> for LinkError {
    fn from(err: toml::de::Error) -> Self {
        LinkError::Config(err.to_string())
    }
}
