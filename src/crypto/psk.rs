//! Pre-shared-key mode: passphrase hardening.
//!
//! Used when no per-device identity exists yet. Both ends derive the same
//! symmetric key from a user-supplied passphrase with Argon2i, deliberately
//! slow and memory-hard so a captured wire log cannot be brute-forced
//! cheaply. The salt is fixed (byte-rotated from an ASCII seed) so both
//! ends agree without a salt exchange.

use argon2::{Algorithm, Argon2, Params, Version};
use thiserror::Error;

use super::keys::KeyMaterial;
use super::{KEY_SIZE, MIN_PASSPHRASE_LEN};

/// Seed rotated into the fixed derivation salt.
const SALT_SEED: &[u8] = b"pairlink-host";

/// Argon2 salt length in bytes.
const SALT_LEN: usize = 16;

/// Argon2i memory cost (64 MiB, in KiB units).
const ARGON2_MEMORY_KIB: u32 = 65536;

/// Argon2i iteration count.
const ARGON2_ITERATIONS: u32 = 4;

/// Errors from passphrase key derivation
#[derive(Debug, Error)]
pub enum PskError {
    /// Passphrase below the minimum length (expected negative outcome,
    /// surfaced to the operator, not a fault)
    #[error("Passphrase too short: minimum {min} characters")]
    PassphraseTooShort {
        /// Required minimum length
        min: usize,
    },

    /// The password hash itself failed
    #[error("Passphrase hashing failed: {0}")]
    HashingFailed(String),
}

/// Derive the shared symmetric key from a passphrase.
pub fn derive_passphrase_key(passphrase: &str) -> Result<KeyMaterial, PskError> {
    if passphrase.chars().count() < MIN_PASSPHRASE_LEN {
        return Err(PskError::PassphraseTooShort {
            min: MIN_PASSPHRASE_LEN,
        });
    }

    let params = Params::new(
        ARGON2_MEMORY_KIB,
        ARGON2_ITERATIONS,
        1,
        Some(KEY_SIZE),
    )
    .map_err(|e| PskError::HashingFailed(e.to_string()))?;

    let argon2 = Argon2::new(Algorithm::Argon2i, Version::V0x13, params);

    let salt = rotate_salt(SALT_SEED);
    let mut key = [0u8; KEY_SIZE];
    argon2
        .hash_password_into(passphrase.as_bytes(), &salt, &mut key)
        .map_err(|e| PskError::HashingFailed(e.to_string()))?;

    Ok(KeyMaterial::new(key))
}

/// Fill the salt by cycling the seed bytes.
fn rotate_salt(seed: &[u8]) -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    for (i, byte) in salt.iter_mut().enumerate() {
        *byte = seed[i % seed.len()];
    }
    salt
}
