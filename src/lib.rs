//! # PairLink - Encrypted Companion-Device Session Protocol
//!
//! Lets a single trusted companion device (a phone) hold an authenticated,
//! confidential, replay-protected connection to a desktop host over plain
//! TCP. All confidentiality and integrity comes from the application-level
//! AEAD scheme; there is no TLS underneath.
//!
//! ## Architecture
//!
//! ```text
//! Phone                          Host
//!   |                              |
//!   |---- "@@" + hex(peer pk) --->|   key exchange
//!   |<--- "@@" + sealed host pk --|
//!   |                              |
//!   |==== handshake frame ========>|   feature flags, device metadata
//!   |<=== {success: true} =========|   promotion (single active peer)
//!   |                              |
//!   |==== encrypted frames =======>|   notifications, SMS, ...
//!   |<=== encrypted frames ========|
//! ```
//!
//! TCP accept -> [`SessionRegistry`] creates a [`protocol::Connection`] ->
//! key exchange via [`crypto::CryptoSession`] -> application handshake ->
//! promotion to the single active slot -> decrypted [`PeerMessage`]s flow
//! to the gateway as [`LinkEvent`]s; outbound [`HostMessage`]s are
//! encrypted and framed back.
//!
//! ## Wire Format
//!
//! Newline-delimited ASCII lines. Pre-authentication lines carry hex/base64
//! public key material prefixed `@@`; everything after key exchange is
//! base64 of `timestamp(8B BE) ∥ nonce(24B) ∥ ciphertext`, decrypting to
//! UTF-8 JSON with a mandatory `type` tag. Frames older (or newer) than
//! 300 s are rejected regardless of tag validity, bounding replay exposure.
//!
//! ## Single-Peer Arbitration
//!
//! At most one connection is ever `Authenticated` per registry. Later
//! handshakes are denied (`{success: false}`) and closed after a grace
//! period; a reconnecting device with the same key identity and address
//! may supersede its own stale session. Kicking the active peer bans its
//! address for a fixed time; banned addresses are refused at accept time
//! before any cryptographic work.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use pairlink::{Config, HostMessage, LinkEvent, SessionRegistry};
//!
//! let config = Config::from_file("pairlink.toml")?;
//! let (handle, mut events) = SessionRegistry::start(&config).await?;
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         LinkEvent::ConnectedChange(true) => {
//!             handle.send(HostMessage::ListNotifications).await?;
//!         }
//!         LinkEvent::Message(msg) => println!("peer says: {:?}", msg),
//!         LinkEvent::ConnectedChange(false) => println!("peer gone"),
//!     }
//! }
//! ```
//!
//! ## Modules
//!
//! - [`crypto`]: key agreement, AEAD frames, passphrase hardening
//! - [`protocol`]: typed messages, handshake state machine, registry
//! - [`config`]: TOML + environment configuration
//! - [`error`]: error types and result alias

pub mod config;
pub mod crypto;
pub mod error;
pub mod protocol;

// Re-exports for convenience
pub use config::Config;
pub use crypto::{CryptoSession, KeyPair, PublicKey, Role};
pub use error::{LinkError, Result};
pub use protocol::{
    FeatureFlags, HandshakeState, HostMessage, LinkEvent, PeerMessage, PeerMetadata,
    RegistryHandle, RegistryTuning, SessionRegistry,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
