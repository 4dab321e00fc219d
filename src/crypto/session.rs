//! Per-connection crypto sessions.
//!
//! A [`CryptoSession`] turns plaintext bytes into wire frames and back for
//! exactly one connection. Two modes:
//!
//! - **Key exchange** (primary): the host's long-lived X25519 pair plus the
//!   peer's public key yield a shared secret, expanded with HKDF-SHA256
//!   into two directionally independent session keys. The expansion info
//!   binds the direction label and both public keys, so host and peer
//!   derive mirrored send/receive keys — a role mix-up produces a session
//!   that cannot decrypt either direction rather than one that half-works.
//! - **Pre-shared key**: one Argon2-hardened passphrase key used for both
//!   directions, for installations without a device identity yet.
//!
//! Session keys live as long as the connection and are zeroized on drop.

use hkdf::Hkdf;
use sha2::Sha256;

use super::error::CryptoError;
use super::frame::FrameCipher;
use super::keys::{KeyError, KeyMaterial, KeyPair, PublicKey};
use super::psk::derive_passphrase_key;
use super::KEY_SIZE;

/// HKDF expansion label prefix for session key derivation.
const KDF_CONTEXT: &[u8] = b"pairlink/kx/v1";

/// Which side of the exchange we are deriving keys for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Desktop host (listener)
    Host,
    /// Companion device (connector)
    Peer,
}

/// Direction-separated session keys for one connection.
pub struct SessionKeys {
    /// Key for frames we send
    pub tx: KeyMaterial,
    /// Key for frames we receive
    pub rx: KeyMaterial,
}

impl SessionKeys {
    /// Derive both directions from a completed key exchange.
    pub fn from_exchange(
        role: Role,
        ours: &KeyPair,
        theirs: &PublicKey,
    ) -> Result<Self, KeyError> {
        let shared = ours.diffie_hellman(theirs)?;

        let (host_pk, peer_pk) = match role {
            Role::Host => (ours.public_key(), theirs),
            Role::Peer => (theirs, ours.public_key()),
        };

        let host_to_peer = expand(&shared, b"h2p", host_pk, peer_pk)?;
        let peer_to_host = expand(&shared, b"p2h", host_pk, peer_pk)?;

        Ok(match role {
            Role::Host => Self {
                tx: host_to_peer,
                rx: peer_to_host,
            },
            Role::Peer => Self {
                tx: peer_to_host,
                rx: host_to_peer,
            },
        })
    }
}

/// Expand one directional key from the shared secret.
fn expand(
    shared: &KeyMaterial,
    direction: &[u8],
    host_pk: &PublicKey,
    peer_pk: &PublicKey,
) -> Result<KeyMaterial, KeyError> {
    let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());

    let mut info = Vec::with_capacity(KDF_CONTEXT.len() + direction.len() + 2 + 2 * KEY_SIZE);
    info.extend_from_slice(KDF_CONTEXT);
    info.push(b'|');
    info.extend_from_slice(direction);
    info.push(b'|');
    info.extend_from_slice(host_pk.as_bytes());
    info.extend_from_slice(peer_pk.as_bytes());

    let mut okm = [0u8; KEY_SIZE];
    hk.expand(&info, &mut okm)
        .map_err(|e| KeyError::DerivationFailed(format!("HKDF expand failed: {e}")))?;

    Ok(KeyMaterial::new(okm))
}

/// Authenticated encrypt/decrypt for one connection.
pub struct CryptoSession {
    tx: FrameCipher,
    rx: FrameCipher,
}

impl CryptoSession {
    /// Key-exchange mode: derive direction-separated keys.
    pub fn from_key_exchange(
        role: Role,
        ours: &KeyPair,
        theirs: &PublicKey,
    ) -> Result<Self, CryptoError> {
        let keys = SessionKeys::from_exchange(role, ours, theirs)?;
        Ok(Self {
            tx: FrameCipher::new(&keys.tx),
            rx: FrameCipher::new(&keys.rx),
        })
    }

    /// Pre-shared-key mode from an already-derived symmetric key.
    pub fn from_symmetric(key: &KeyMaterial) -> Self {
        Self {
            tx: FrameCipher::new(key),
            rx: FrameCipher::new(key),
        }
    }

    /// Pre-shared-key mode straight from a passphrase.
    pub fn from_passphrase(passphrase: &str) -> Result<Self, CryptoError> {
        let key = derive_passphrase_key(passphrase)?;
        Ok(Self::from_symmetric(&key))
    }

    /// Encrypt a plaintext into an outbound wire frame.
    pub fn encode(&self, plaintext: &[u8]) -> Result<String, CryptoError> {
        Ok(self.tx.encode(plaintext)?)
    }

    /// Decrypt an inbound wire frame.
    pub fn decode(&self, frame: &str) -> Result<Vec<u8>, CryptoError> {
        Ok(self.rx.decode(frame)?)
    }
}

impl std::fmt::Debug for CryptoSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CryptoSession([REDACTED])")
    }
}

/// How connections obtain their crypto session.
#[derive(Debug)]
pub enum SessionMode {
    /// Primary mode: per-connection key exchange against the host identity
    Exchange(KeyPair),
    /// Shared passphrase-derived key, no exchange phase
    Psk(KeyMaterial),
}
