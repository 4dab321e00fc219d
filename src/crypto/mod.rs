//! Cryptographic core: key agreement, frame encryption, replay bounds.
//!
//! Everything a connection needs to turn plaintext JSON into opaque wire
//! frames and back:
//!
//! - **X25519 key exchange**: long-lived host identity, per-connection
//!   peer keys, direction-separated session keys via HKDF-SHA256
//! - **XChaCha20-Poly1305 AEAD**: confidentiality + integrity per frame,
//!   with the frame timestamp as associated data
//! - **Sealed transfer**: the host public key travels to the peer inside
//!   an anonymous-sender sealed box
//! - **Argon2i passphrase hardening**: pre-shared-key mode for
//!   installations without a device identity
//!
//! # Wire Frame
//!
//! ```text
//! base64( timestamp(8B BE) ∥ nonce(24B) ∥ AEAD(plaintext, AAD=timestamp) ) '\n'
//! ```
//!
//! # Freshness
//!
//! Frames carry their creation time as authenticated associated data.
//! Decoding rejects any frame whose timestamp deviates from the local
//! clock by more than [`TIMESTAMP_LEEWAY_SECS`], independent of tag
//! validity, which caps the replay window for captured frames.
//!
//! # Nonce Strategy
//!
//! Fully random 192-bit nonces from the system CSPRNG, drawn inside the
//! encode path so no caller can ever reuse one. At 24 bytes the birthday
//! bound is far beyond any realistic per-session frame count, and no
//! counter state has to survive restarts.

mod error;
mod frame;
mod keys;
mod psk;
mod session;

pub use error::CryptoError;
pub use frame::{FrameCipher, FrameError};
pub use keys::{open_sealed, seal_to, KeyError, KeyMaterial, KeyPair, PublicKey};
pub use psk::{derive_passphrase_key, PskError};
pub use session::{CryptoSession, Role, SessionKeys, SessionMode};

/// Nonce size for XChaCha20-Poly1305 (192 bits)
pub const NONCE_SIZE: usize = 24;

/// Authentication tag size for XChaCha20-Poly1305 (128 bits)
pub const TAG_SIZE: usize = 16;

/// Symmetric and asymmetric key size (256 bits)
pub const KEY_SIZE: usize = 32;

/// Size of the big-endian Unix timestamp prefix
pub const TIMESTAMP_SIZE: usize = 8;

/// Maximum tolerated clock skew for inbound frames, in seconds
pub const TIMESTAMP_LEEWAY_SECS: u64 = 300;

/// Minimum accepted passphrase length for pre-shared-key mode
pub const MIN_PASSPHRASE_LEN: usize = 6;

/// Truncated fingerprint length in bytes (rendered as hex groups)
pub const FINGERPRINT_SIZE: usize = 8;

/// Current Unix time in seconds.
pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
