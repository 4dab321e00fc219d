//! XChaCha20-Poly1305 AEAD wire frames.
//!
//! A frame is the unit of wire transport: one newline-terminated base64
//! blob. Binary layout before encoding:
//!
//! ```text
//! [timestamp: 8B big-endian Unix seconds] [nonce: 24B random] [ciphertext + tag]
//! ```
//!
//! The timestamp is associated data: authenticated but not encrypted. A
//! frame whose timestamp is outside the ±300 s leeway is rejected as
//! expired even when its tag verifies, bounding replay exposure for
//! captured traffic.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use thiserror::Error;

use super::keys::KeyMaterial;
use super::{unix_now, NONCE_SIZE, TAG_SIZE, TIMESTAMP_LEEWAY_SECS, TIMESTAMP_SIZE};

/// Errors from frame encoding/decoding.
///
/// Decoding failures are reported as distinct kinds so the connection layer
/// can log them precisely; none of them ever yields partial plaintext.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Input was not well-formed base64
    #[error("Malformed frame encoding: {0}")]
    MalformedEncoding(String),

    /// Decoded payload too short to hold timestamp, nonce and tag
    #[error("Frame too short")]
    Truncated,

    /// Tag verification failed (corruption or wrong key)
    #[error("Frame authentication failed")]
    AuthenticationFailed,

    /// Timestamp outside the freshness window despite a valid tag
    #[error("Frame expired: {skew_secs}s of clock skew exceeds the leeway")]
    Expired {
        /// Absolute clock difference in seconds
        skew_secs: u64,
    },

    /// Encryption itself failed
    #[error("Frame encryption failed: {0}")]
    EncryptionFailed(String),
}

/// Single-direction AEAD cipher over wire frames.
pub struct FrameCipher {
    cipher: XChaCha20Poly1305,
}

impl FrameCipher {
    /// Create a cipher from 32-byte key material
    pub fn new(key: &KeyMaterial) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(key.as_bytes().into()),
        }
    }

    /// Encrypt a plaintext into a base64 wire frame.
    ///
    /// A fresh random nonce is drawn from the system CSPRNG on every call;
    /// callers cannot supply one, which rules out nonce reuse under a given
    /// key by construction. Panics only if the system RNG is unavailable,
    /// which is unrecoverable.
    pub fn encode(&self, plaintext: &[u8]) -> Result<String, FrameError> {
        self.encode_at(plaintext, unix_now())
    }

    pub(crate) fn encode_at(&self, plaintext: &[u8], timestamp: u64) -> Result<String, FrameError> {
        use rand::RngCore;

        let mut nonce = [0u8; NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let timestamp_bytes = timestamp.to_be_bytes();

        let ciphertext = self
            .cipher
            .encrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &timestamp_bytes,
                },
            )
            .map_err(|e| FrameError::EncryptionFailed(e.to_string()))?;

        let mut raw = Vec::with_capacity(TIMESTAMP_SIZE + NONCE_SIZE + ciphertext.len());
        raw.extend_from_slice(&timestamp_bytes);
        raw.extend_from_slice(&nonce);
        raw.extend_from_slice(&ciphertext);

        Ok(BASE64.encode(raw))
    }

    /// Decrypt a wire frame back into plaintext.
    pub fn decode(&self, frame: &str) -> Result<Vec<u8>, FrameError> {
        self.decode_at(frame, unix_now())
    }

    pub(crate) fn decode_at(&self, frame: &str, now: u64) -> Result<Vec<u8>, FrameError> {
        let cleaned: String = frame
            .chars()
            .filter(|c| !matches!(c, '\n' | '\r' | ' '))
            .collect();

        if cleaned.is_empty() || cleaned.len() % 4 != 0 {
            return Err(FrameError::MalformedEncoding(
                "length is not a multiple of 4".to_string(),
            ));
        }

        let raw = BASE64
            .decode(&cleaned)
            .map_err(|e| FrameError::MalformedEncoding(e.to_string()))?;

        if raw.len() <= TIMESTAMP_SIZE + NONCE_SIZE + TAG_SIZE {
            return Err(FrameError::Truncated);
        }

        let (timestamp_bytes, rest) = raw.split_at(TIMESTAMP_SIZE);
        let (nonce, ciphertext) = rest.split_at(NONCE_SIZE);

        let plaintext = self
            .cipher
            .decrypt(
                XNonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: timestamp_bytes,
                },
            )
            .map_err(|_| FrameError::AuthenticationFailed)?;

        let timestamp = u64::from_be_bytes(
            timestamp_bytes
                .try_into()
                .expect("split_at yields exactly TIMESTAMP_SIZE bytes"),
        );

        let skew_secs = now.abs_diff(timestamp);
        if skew_secs > TIMESTAMP_LEEWAY_SECS {
            return Err(FrameError::Expired { skew_secs });
        }

        Ok(plaintext)
    }
}

impl std::fmt::Debug for FrameCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FrameCipher([REDACTED])")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn test_cipher() -> FrameCipher {
        FrameCipher::new(&KeyMaterial::new([0x42u8; 32]))
    }

    #[test]
    fn test_round_trip() {
        let cipher = test_cipher();
        let frame = cipher.encode(b"{\"type\":\"handshake\"}").unwrap();
        let plaintext = cipher.decode(&frame).unwrap();
        assert_eq!(plaintext, b"{\"type\":\"handshake\"}");
    }

    #[test]
    fn test_round_trip_tolerates_whitespace() {
        let cipher = test_cipher();
        let frame = cipher.encode(b"payload").unwrap();
        let sloppy = format!(" {}\r\n", frame);
        assert_eq!(cipher.decode(&sloppy).unwrap(), b"payload");
    }

    #[test]
    fn test_fresh_nonce_per_call() {
        let cipher = test_cipher();
        let a = cipher.encode(b"same plaintext").unwrap();
        let b = cipher.encode(b"same plaintext").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_stale_timestamp_rejected_despite_valid_tag() {
        let cipher = test_cipher();
        let now = unix_now();

        // Valid MAC, timestamp just past the window in either direction
        let stale = cipher
            .encode_at(b"data", now - TIMESTAMP_LEEWAY_SECS - 1)
            .unwrap();
        assert!(matches!(
            cipher.decode_at(&stale, now),
            Err(FrameError::Expired { .. })
        ));

        let future = cipher
            .encode_at(b"data", now + TIMESTAMP_LEEWAY_SECS + 1)
            .unwrap();
        assert!(matches!(
            cipher.decode_at(&future, now),
            Err(FrameError::Expired { .. })
        ));
    }

    #[test]
    fn test_timestamp_inside_leeway_accepted() {
        let cipher = test_cipher();
        let now = unix_now();

        let frame = cipher
            .encode_at(b"data", now - TIMESTAMP_LEEWAY_SECS)
            .unwrap();
        assert_eq!(cipher.decode_at(&frame, now).unwrap(), b"data");
    }

    #[test]
    fn test_bit_flip_fails_authentication() {
        let cipher = test_cipher();
        let frame = cipher.encode(b"sensitive payload").unwrap();
        let mut raw = BASE64.decode(&frame).unwrap();

        // Flip one bit in every region: timestamp (AAD), nonce, ciphertext, tag
        for idx in [0, TIMESTAMP_SIZE, TIMESTAMP_SIZE + NONCE_SIZE, raw.len() - 1] {
            raw[idx] ^= 0x01;
            let tampered = BASE64.encode(&raw);
            assert!(matches!(
                cipher.decode(&tampered),
                Err(FrameError::AuthenticationFailed)
            ));
            raw[idx] ^= 0x01;
        }
    }

    #[test]
    fn test_malformed_base64_rejected() {
        let cipher = test_cipher();
        assert!(matches!(
            cipher.decode("abc"),
            Err(FrameError::MalformedEncoding(_))
        ));
        assert!(matches!(
            cipher.decode("not!valid!b64!!!"),
            Err(FrameError::MalformedEncoding(_))
        ));
        assert!(matches!(
            cipher.decode(""),
            Err(FrameError::MalformedEncoding(_))
        ));
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let cipher = test_cipher();
        // Exactly timestamp + nonce + tag, zero plaintext bytes
        let short = BASE64.encode([0u8; TIMESTAMP_SIZE + NONCE_SIZE + TAG_SIZE]);
        assert!(matches!(cipher.decode(&short), Err(FrameError::Truncated)));
    }

    #[test]
    fn test_wrong_key_fails_authentication() {
        let frame = test_cipher().encode(b"payload").unwrap();
        let other = FrameCipher::new(&KeyMaterial::new([0x43u8; 32]));
        assert!(matches!(
            other.decode(&frame),
            Err(FrameError::AuthenticationFailed)
        ));
    }

    proptest! {
        #[test]
        fn prop_round_trip(data in proptest::collection::vec(any::<u8>(), 1..2048)) {
            let cipher = test_cipher();
            let frame = cipher.encode(&data).unwrap();
            prop_assert_eq!(cipher.decode(&frame).unwrap(), data);
        }
    }
}
