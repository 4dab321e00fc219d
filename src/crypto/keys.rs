//! Host identity keys for the key-exchange protocol mode.
//!
//! The host holds a long-lived X25519 key pair, generated once per
//! installation and persisted externally as base64. Each connecting peer
//! supplies its own public key; the pair is fed into the session key
//! derivation in [`super::session`].
//!
//! The host public key is shipped to the peer inside a sealed box
//! (anonymous-sender public-key encryption), so it cannot be read without
//! the peer's own secret key.

use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::{FINGERPRINT_SIZE, KEY_SIZE};

/// Domain separation key for the display fingerprint.
const FINGERPRINT_CONTEXT: &[u8] = b"pairlink/fingerprint/v1";

/// Errors from key handling operations
#[derive(Debug, Error)]
pub enum KeyError {
    /// Key bytes had the wrong length
    #[error("Invalid key length: expected {expected} bytes, got {got}")]
    InvalidLength {
        /// Required length
        expected: usize,
        /// Actual length
        got: usize,
    },

    /// Key text was not valid hex/base64
    #[error("Invalid key encoding: {0}")]
    InvalidEncoding(String),

    /// Peer public key produced an all-zero shared secret (low-order point)
    #[error("Peer public key is not contributory")]
    WeakPeerKey,

    /// Session key derivation failed
    #[error("Key derivation failed: {0}")]
    DerivationFailed(String),

    /// Sealed box could not be produced
    #[error("Sealing failed")]
    SealFailed,

    /// Sealed box could not be opened
    #[error("Unsealing failed")]
    OpenFailed,
}

/// Symmetric key material (32 bytes), zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial([u8; KEY_SIZE]);

impl KeyMaterial {
    /// Wrap raw key bytes
    pub fn new(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the key bytes
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Don't leak key material in debug output
        write!(f, "KeyMaterial([REDACTED, {} bytes])", KEY_SIZE)
    }
}

/// X25519 public key (32 bytes)
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey([u8; KEY_SIZE]);

impl PublicKey {
    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create from a byte slice
    pub fn from_slice(slice: &[u8]) -> Result<Self, KeyError> {
        let bytes: [u8; KEY_SIZE] = slice.try_into().map_err(|_| KeyError::InvalidLength {
            expected: KEY_SIZE,
            got: slice.len(),
        })?;
        Ok(Self(bytes))
    }

    /// Parse the hex form a peer sends on its key-exchange line
    pub fn from_hex(text: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(text.trim())
            .map_err(|e| KeyError::InvalidEncoding(e.to_string()))?;
        Self::from_slice(&bytes)
    }

    /// Hex form, as sent on the wire
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Short keyed hash of the key, grouped for human comparison during
    /// pairing (e.g. `3af2-9c01-77de-b4a2`). Display only, never an
    /// authentication input.
    pub fn fingerprint(&self) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(FINGERPRINT_CONTEXT)
            .expect("HMAC accepts any key size");
        mac.update(&self.0);
        let digest = mac.finalize().into_bytes();

        digest[..FINGERPRINT_SIZE]
            .chunks(2)
            .map(hex::encode)
            .collect::<Vec<_>>()
            .join("-")
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.fingerprint())
    }
}

/// X25519 key pair (long-lived host identity)
#[derive(Clone)]
pub struct KeyPair {
    secret: x25519_dalek::StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        use rand::rngs::OsRng;

        let secret = x25519_dalek::StaticSecret::random_from_rng(OsRng);
        let public = x25519_dalek::PublicKey::from(&secret);

        Self {
            secret,
            public: PublicKey::from_bytes(public.to_bytes()),
        }
    }

    /// Load a key pair from its persisted base64 form.
    ///
    /// The public key is re-derived from the secret; if a stored public key
    /// is supplied it is checked against the derived one so a mismatched
    /// config is caught at startup rather than at pairing time.
    pub fn from_base64(public: Option<&str>, secret: &str) -> Result<Self, KeyError> {
        let secret_bytes = BASE64
            .decode(secret.trim())
            .map_err(|e| KeyError::InvalidEncoding(e.to_string()))?;
        let secret_bytes: [u8; KEY_SIZE] =
            secret_bytes
                .as_slice()
                .try_into()
                .map_err(|_| KeyError::InvalidLength {
                    expected: KEY_SIZE,
                    got: secret_bytes.len(),
                })?;

        let secret = x25519_dalek::StaticSecret::from(secret_bytes);
        let derived = PublicKey::from_bytes(x25519_dalek::PublicKey::from(&secret).to_bytes());

        if let Some(stored) = public {
            let stored_bytes = BASE64
                .decode(stored.trim())
                .map_err(|e| KeyError::InvalidEncoding(e.to_string()))?;
            if stored_bytes != derived.as_bytes() {
                return Err(KeyError::InvalidEncoding(
                    "stored public key does not match secret key".to_string(),
                ));
            }
        }

        Ok(Self {
            secret,
            public: derived,
        })
    }

    /// Get the public key
    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Base64 form of the public key, for persistence
    pub fn public_key_base64(&self) -> String {
        BASE64.encode(self.public.as_bytes())
    }

    /// Base64 form of the secret key, for persistence
    pub fn secret_key_base64(&self) -> String {
        BASE64.encode(self.secret.to_bytes())
    }

    /// Display fingerprint of the public key
    pub fn fingerprint(&self) -> String {
        self.public.fingerprint()
    }

    /// Perform Diffie-Hellman key exchange with a peer public key.
    ///
    /// Rejects low-order peer points that would yield a non-contributory
    /// (all-zero) shared secret.
    pub fn diffie_hellman(&self, peer: &PublicKey) -> Result<KeyMaterial, KeyError> {
        let peer_key = x25519_dalek::PublicKey::from(*peer.as_bytes());
        let shared = self.secret.diffie_hellman(&peer_key);

        if !shared.was_contributory() {
            return Err(KeyError::WeakPeerKey);
        }

        Ok(KeyMaterial::new(shared.to_bytes()))
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Seal a payload to a recipient public key (anonymous sender).
///
/// Only the holder of the matching secret key can open the result; the
/// sender is not authenticated. Used to ship the host public key in the
/// key-exchange reply.
pub fn seal_to(recipient: &PublicKey, plaintext: &[u8]) -> Result<Vec<u8>, KeyError> {
    use crypto_box::aead::OsRng;

    let recipient_key = crypto_box::PublicKey::from(*recipient.as_bytes());
    recipient_key.seal(&mut OsRng, plaintext).map_err(|_| KeyError::SealFailed)
}

/// Open a payload sealed to our key pair.
pub fn open_sealed(ours: &KeyPair, sealed: &[u8]) -> Result<Vec<u8>, KeyError> {
    let secret = crypto_box::SecretKey::from(ours.secret.to_bytes());
    secret.unseal(sealed).map_err(|_| KeyError::OpenFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_pair_generation() {
        let kp = KeyPair::generate();
        assert_eq!(kp.public_key().as_bytes().len(), KEY_SIZE);
    }

    #[test]
    fn test_diffie_hellman_symmetric() {
        let host = KeyPair::generate();
        let peer = KeyPair::generate();

        let host_shared = host.diffie_hellman(peer.public_key()).unwrap();
        let peer_shared = peer.diffie_hellman(host.public_key()).unwrap();

        assert_eq!(host_shared.as_bytes(), peer_shared.as_bytes());
    }

    #[test]
    fn test_diffie_hellman_rejects_low_order_point() {
        let host = KeyPair::generate();
        // The identity element is a low-order point
        let weak = PublicKey::from_bytes([0u8; KEY_SIZE]);

        let result = host.diffie_hellman(&weak);
        assert!(matches!(result, Err(KeyError::WeakPeerKey)));
    }

    /// RFC 7748 section 6.1 X25519 test vector.
    #[test]
    fn test_diffie_hellman_rfc7748_vector() {
        use hex_literal::hex;

        let alice_secret = hex!("77076d0a7318a57d3c16c17251b26645df4c2f87ebc0992ab177fba51db92c2a");
        let alice_public = hex!("8520f0098930a754748b7ddcb43ef75a0dbf3a0d26381af4eba4a98eaa9b4e6a");
        let bob_public = hex!("de9edb7d7b7dc1b4d35b61c2ece435373f8343c85b78674dadfc7e146f882b4f");
        let shared = hex!("4a5d9d5ba4ce2de1728e3bf480350f25e07e21c947d19e3376f09b3c1e161742");

        let alice = KeyPair::from_base64(None, &BASE64.encode(alice_secret)).unwrap();
        assert_eq!(alice.public_key().as_bytes(), &alice_public);

        let derived = alice
            .diffie_hellman(&PublicKey::from_bytes(bob_public))
            .unwrap();
        assert_eq!(derived.as_bytes(), &shared);
    }

    #[test]
    fn test_base64_round_trip() {
        let kp = KeyPair::generate();
        let restored =
            KeyPair::from_base64(Some(&kp.public_key_base64()), &kp.secret_key_base64()).unwrap();

        assert_eq!(restored.public_key(), kp.public_key());
    }

    #[test]
    fn test_base64_mismatched_public_rejected() {
        let kp = KeyPair::generate();
        let other = KeyPair::generate();

        let result = KeyPair::from_base64(Some(&other.public_key_base64()), &kp.secret_key_base64());
        assert!(result.is_err());
    }

    #[test]
    fn test_hex_round_trip() {
        let kp = KeyPair::generate();
        let parsed = PublicKey::from_hex(&kp.public_key().to_hex()).unwrap();
        assert_eq!(&parsed, kp.public_key());
    }

    #[test]
    fn test_hex_rejects_wrong_length() {
        assert!(PublicKey::from_hex("abcd").is_err());
        assert!(PublicKey::from_hex("not hex at all").is_err());
    }

    #[test]
    fn test_fingerprint_stable_and_grouped() {
        let kp = KeyPair::generate();
        let fp1 = kp.fingerprint();
        let fp2 = kp.public_key().fingerprint();

        assert_eq!(fp1, fp2);
        // Four groups of four hex chars
        let groups: Vec<&str> = fp1.split('-').collect();
        assert_eq!(groups.len(), 4);
        assert!(groups.iter().all(|g| g.len() == 4));
    }

    #[test]
    fn test_fingerprint_differs_between_keys() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_sealed_round_trip() {
        let recipient = KeyPair::generate();
        let payload = b"host public key bytes";

        let sealed = seal_to(recipient.public_key(), payload).unwrap();
        assert_ne!(sealed.as_slice(), payload.as_slice());

        let opened = open_sealed(&recipient, &sealed).unwrap();
        assert_eq!(opened, payload);
    }

    #[test]
    fn test_sealed_wrong_recipient_fails() {
        let recipient = KeyPair::generate();
        let other = KeyPair::generate();

        let sealed = seal_to(recipient.public_key(), b"secret").unwrap();
        assert!(open_sealed(&other, &sealed).is_err());
    }

    #[test]
    fn test_key_material_debug_redacted() {
        let key = KeyMaterial::new([0x41u8; KEY_SIZE]);
        let debug = format!("{:?}", key);
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains("41414141"));
    }
}
