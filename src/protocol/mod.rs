//! Wire protocol: framing, handshake state machine, session arbitration.
//!
//! # Connection Lifecycle
//!
//! ```text
//!                      "@@" + hex(peer pk)
//!  [AwaitingPublicKey] ─────────────────────> [KeyExchanged]
//!                                                   │ encrypted handshake JSON
//!                                                   v
//!                                     [AwaitingFeatureHandshake]
//!                                        │                  │
//!                            allow       │                  │  deny
//!                                        v                  v
//!                                 [Authenticated]      [Rejected] ──grace──> [Closed]
//! ```
//!
//! Exactly one connection per registry reaches `Authenticated`; the
//! [`registry::SessionRegistry`] arbitrates promotion, supersession and
//! eviction. All messages are newline-delimited base64 AEAD frames (see
//! [`crate::crypto`]) decrypting to JSON objects with a `type` tag.

pub mod connection;
pub mod message;
pub mod registry;

pub use connection::{Connection, ConnectionError, HandshakeState, PeerMetadata};
pub use message::{
    format_date, parse_date, FeatureFlags, HandshakeRequest, HostMessage, MessageError,
    Notification, PeerMessage, ShortSms, Sms, SmsDirection, DATE_FORMAT,
};
pub use registry::{LinkEvent, RegistryHandle, RegistryTuning, SessionRegistry};

/// How long a kicked peer's address stays banned, in seconds
pub const KICK_BAN_SECS: u64 = 300;

/// Maintenance sweep interval, in seconds
pub const SWEEP_INTERVAL_SECS: u64 = 10;

/// Grace period before a denied connection is force-closed, in seconds
pub const HANDSHAKE_GRACE_SECS: u64 = 10;

/// Maximum time a connection may remain unauthenticated, in seconds
pub const HANDSHAKE_WINDOW_SECS: u64 = 30;

/// Delay between promotion and the connected state change, in milliseconds
pub const CONNECTED_SETTLE_MS: u64 = 1000;

/// Upper bound on one wire line; longer input is a framing violation
pub const MAX_LINE_LEN: usize = 64 * 1024;
