//! Unified cryptographic error type.
//!
//! Aggregates the per-concern error enums so callers can match one type
//! while the full chain stays available through `#[source]`. Decode
//! failures stay distinguishable (malformed encoding, truncation, tag
//! failure, expiry) but are all handled identically at the connection
//! layer: the connection is closed and no detail is echoed to the peer.

use thiserror::Error;

use super::frame::FrameError;
use super::keys::KeyError;
use super::psk::PskError;

/// Unified error type for all cryptographic operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Frame encoding/decoding error
    #[error("Frame: {0}")]
    Frame(#[source] FrameError),

    /// Key handling error
    #[error("Key: {0}")]
    Key(#[source] KeyError),

    /// Passphrase derivation error
    #[error("Passphrase: {0}")]
    Psk(#[source] PskError),
}

impl From<FrameError> for CryptoError {
    fn from(err: FrameError) -> Self {
        CryptoError::Frame(err)
    }
}

impl From<KeyError> for CryptoError {
    fn from(err: KeyError) -> Self {
        CryptoError::Key(err)
    }
}

impl From<PskError> for CryptoError {
    fn from(err: PskError) -> Self {
        CryptoError::Psk(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_error_conversion() {
        let err: CryptoError = FrameError::AuthenticationFailed.into();
        assert!(matches!(err, CryptoError::Frame(_)));
        assert!(err.to_string().contains("Frame"));
    }

    #[test]
    fn test_error_source_chain() {
        use std::error::Error;

        let err: CryptoError = FrameError::Expired { skew_secs: 301 }.into();
        let source = err.source().unwrap();
        assert!(source.to_string().contains("301"));
    }

    #[test]
    fn test_psk_error_conversion() {
        let err: CryptoError = PskError::PassphraseTooShort { min: 6 }.into();
        assert!(matches!(err, CryptoError::Psk(_)));
    }
}
