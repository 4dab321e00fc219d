//! Per-socket connection state machine.
//!
//! Each accepted TCP stream gets one [`Connection`]. The registry loop
//! feeds it complete wire lines and drives the two-phase handshake:
//!
//! | State                    | Trigger                      | Next                      |
//! |--------------------------|------------------------------|---------------------------|
//! | AwaitingPublicKey        | `@@` + hex peer public key   | KeyExchanged              |
//! | KeyExchanged             | encrypted `handshake` JSON   | AwaitingFeatureHandshake  |
//! | AwaitingFeatureHandshake | owner allow / deny           | Authenticated / Rejected  |
//! | Authenticated            | encrypted frame              | Authenticated (self-loop) |
//! | any                      | socket error / close / kick  | Closed                    |
//!
//! Any decode failure past key exchange (bad tag, stale timestamp,
//! malformed JSON, missing `type`) closes the connection; partial trust
//! is not tolerated. Sends before key exchange fail with
//! [`ConnectionError::NotReady`] and are logged by the caller, never
//! fatal to the process.

use std::net::SocketAddr;
use std::time::Instant;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::message::{FeatureFlags, HandshakeRequest, HostMessage, PeerMessage};
use super::MAX_LINE_LEN;
use crate::crypto::{self, CryptoError, CryptoSession, PublicKey, Role, SessionMode};

/// Wire prefix for the pre-authentication key-exchange lines.
const KEY_EXCHANGE_PREFIX: &str = "@@";

/// Registry-local connection identifier.
pub(crate) type ConnId = u64;

/// Handshake progress of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Waiting for the peer's `@@` public key line
    AwaitingPublicKey,
    /// Session keys derived, waiting for the application handshake
    KeyExchanged,
    /// Handshake received, waiting for the owner's allow/deny decision
    AwaitingFeatureHandshake,
    /// Exactly one connection per registry may hold this state
    Authenticated,
    /// Denied; lives only until the grace timer fires
    Rejected,
    /// Terminal
    Closed,
}

/// Metadata captured from the peer's handshake message.
///
/// Mutable only while the handshake is in flight; read-only once the
/// connection authenticates; discarded when it closes.
#[derive(Debug, Clone)]
pub struct PeerMetadata {
    /// Companion app version
    pub app_version: String,
    /// Human-readable device name
    pub device_name: String,
    /// Peer operating system type
    pub os_type: String,
    /// Peer operating system version
    pub os_version: String,
    /// Advertised features
    pub features: FeatureFlags,
    /// Remote socket address
    pub address: SocketAddr,
    /// Fingerprint of the peer public key (key-exchange mode only)
    pub identity: Option<String>,
}

impl PeerMetadata {
    fn new(request: HandshakeRequest, address: SocketAddr, identity: Option<String>) -> Self {
        Self {
            app_version: request.app_version,
            device_name: request.device_name,
            os_type: request.os_type,
            os_version: request.os_version,
            features: request.features,
            address,
            identity,
        }
    }
}

/// Errors from connection-level operations
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Cryptographic failure (decode, key exchange)
    #[error("Crypto failure: {0}")]
    Crypto(#[from] CryptoError),

    /// Malformed or untyped message
    #[error("Malformed message: {0}")]
    Message(#[from] super::message::MessageError),

    /// Peer violated the wire protocol
    #[error("Protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// Send attempted before session keys exist
    #[error("Encryption not available yet")]
    NotReady,

    /// Socket error
    #[error("Socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// What a processed line means to the owner.
#[derive(Debug)]
pub(crate) enum Inbound {
    /// Peer completed its application handshake; owner must allow or deny
    HandshakePending,
    /// Decrypted application message from the authenticated peer
    Message(PeerMessage),
    /// Consumed internally, nothing for the owner
    Handled,
}

/// One TCP connection and its handshake state.
pub struct Connection {
    id: ConnId,
    addr: SocketAddr,
    opened_at: Instant,
    state: HandshakeState,
    crypto: Option<CryptoSession>,
    metadata: Option<PeerMetadata>,
    identity: Option<String>,
    writer: OwnedWriteHalf,
}

impl Connection {
    /// Wrap an accepted stream. Returns the connection and the read half
    /// for the caller to hand to [`read_lines`].
    pub(crate) fn accept(
        id: ConnId,
        stream: TcpStream,
        addr: SocketAddr,
        mode: &SessionMode,
    ) -> (Self, OwnedReadHalf) {
        let (reader, writer) = stream.into_split();

        // In PSK mode both ends already share the key, so there is no
        // public-key phase; the first line is expected to be a frame.
        let (state, crypto) = match mode {
            SessionMode::Exchange(_) => (HandshakeState::AwaitingPublicKey, None),
            SessionMode::Psk(key) => (
                HandshakeState::KeyExchanged,
                Some(CryptoSession::from_symmetric(key)),
            ),
        };

        (
            Self {
                id,
                addr,
                opened_at: Instant::now(),
                state,
                crypto,
                metadata: None,
                identity: None,
                writer,
            },
            reader,
        )
    }

    /// Remote socket address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Current handshake state
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Peer metadata, once the handshake message arrived
    pub fn metadata(&self) -> Option<&PeerMetadata> {
        self.metadata.as_ref()
    }

    /// Fingerprint of the peer public key, once exchanged
    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    /// When the socket was accepted
    pub(crate) fn opened_at(&self) -> Instant {
        self.opened_at
    }

    /// Whether the connection has not yet authenticated (nor been denied)
    pub(crate) fn is_pre_auth(&self) -> bool {
        matches!(
            self.state,
            HandshakeState::AwaitingPublicKey
                | HandshakeState::KeyExchanged
                | HandshakeState::AwaitingFeatureHandshake
        )
    }

    /// Process one complete wire line.
    pub(crate) async fn process_line(
        &mut self,
        line: &str,
        mode: &SessionMode,
    ) -> Result<Inbound, ConnectionError> {
        match self.state {
            HandshakeState::AwaitingPublicKey => self.process_key_exchange(line, mode).await,
            HandshakeState::KeyExchanged => {
                match self.decode_message(line)? {
                    PeerMessage::Handshake(request) => {
                        self.metadata = Some(PeerMetadata::new(
                            request,
                            self.addr,
                            self.identity.clone(),
                        ));
                        self.state = HandshakeState::AwaitingFeatureHandshake;
                        Ok(Inbound::HandshakePending)
                    }
                    _ => Err(ConnectionError::ProtocolViolation(
                        "application message before handshake",
                    )),
                }
            }
            HandshakeState::AwaitingFeatureHandshake => {
                // Metadata stays mutable until the owner decides
                match self.decode_message(line)? {
                    PeerMessage::Handshake(request) => {
                        self.metadata = Some(PeerMetadata::new(
                            request,
                            self.addr,
                            self.identity.clone(),
                        ));
                        Ok(Inbound::Handled)
                    }
                    _ => Err(ConnectionError::ProtocolViolation(
                        "application message before handshake",
                    )),
                }
            }
            HandshakeState::Authenticated => match self.decode_message(line)? {
                PeerMessage::Handshake(_) => {
                    // Re-acknowledge without touching the frozen metadata
                    self.send(&HostMessage::Handshake { success: true }).await?;
                    Ok(Inbound::Handled)
                }
                PeerMessage::Unknown { msg_type, .. } => {
                    debug!(id = self.id, %msg_type, "ignoring unrecognized message type");
                    Ok(Inbound::Handled)
                }
                message => Ok(Inbound::Message(message)),
            },
            // Lines racing a rejection or teardown are discarded
            HandshakeState::Rejected | HandshakeState::Closed => Ok(Inbound::Handled),
        }
    }

    async fn process_key_exchange(
        &mut self,
        line: &str,
        mode: &SessionMode,
    ) -> Result<Inbound, ConnectionError> {
        let hex_key = line
            .strip_prefix(KEY_EXCHANGE_PREFIX)
            .ok_or(ConnectionError::ProtocolViolation(
                "expected public key line",
            ))?;

        let SessionMode::Exchange(identity) = mode else {
            return Err(ConnectionError::ProtocolViolation(
                "key exchange line in pre-shared-key mode",
            ));
        };

        let peer_key = PublicKey::from_hex(hex_key).map_err(CryptoError::from)?;
        let session = CryptoSession::from_key_exchange(Role::Host, identity, &peer_key)?;
        let sealed =
            crypto::seal_to(&peer_key, identity.public_key().as_bytes()).map_err(CryptoError::from)?;

        self.crypto = Some(session);
        self.identity = Some(peer_key.fingerprint());
        self.state = HandshakeState::KeyExchanged;

        self.write_line(&format!("{}{}", KEY_EXCHANGE_PREFIX, BASE64.encode(sealed)))
            .await?;

        debug!(id = self.id, peer = ?self.identity, "key exchange complete");
        Ok(Inbound::Handled)
    }

    fn decode_message(&self, line: &str) -> Result<PeerMessage, ConnectionError> {
        let crypto = self.crypto.as_ref().ok_or(ConnectionError::NotReady)?;
        let plaintext = crypto.decode(line)?;
        let text = String::from_utf8(plaintext).map_err(super::message::MessageError::from)?;
        Ok(PeerMessage::from_json(&text)?)
    }

    /// Encrypt and send one message to the peer.
    pub(crate) async fn send(&mut self, message: &HostMessage) -> Result<(), ConnectionError> {
        let crypto = self.crypto.as_ref().ok_or(ConnectionError::NotReady)?;
        let json = serde_json::to_string(message)
            .map_err(super::message::MessageError::from)?;
        let frame = crypto.encode(json.as_bytes())?;
        self.write_line(&frame).await
    }

    /// Send the handshake verdict and advance the state machine.
    pub(crate) async fn answer_handshake(&mut self, allow: bool) -> Result<(), ConnectionError> {
        self.send(&HostMessage::Handshake { success: allow }).await?;
        self.state = if allow {
            HandshakeState::Authenticated
        } else {
            HandshakeState::Rejected
        };
        Ok(())
    }

    /// Release the socket. Safe to call more than once.
    pub(crate) async fn close(&mut self) {
        self.state = HandshakeState::Closed;
        let _ = self.writer.shutdown().await;
    }

    async fn write_line(&mut self, line: &str) -> Result<(), ConnectionError> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        Ok(())
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Raw socket events forwarded to the registry loop.
#[derive(Debug)]
pub(crate) enum SocketEvent {
    /// One complete line (newline stripped, never empty)
    Line {
        /// Originating connection
        id: ConnId,
        /// Line content
        line: String,
    },
    /// Peer broke framing rules (oversized or non-UTF-8 line)
    Violation {
        /// Originating connection
        id: ConnId,
        /// What was violated
        reason: &'static str,
    },
    /// Socket reached EOF or errored
    Closed {
        /// Originating connection
        id: ConnId,
    },
}

/// Read newline-delimited lines from a socket into the registry channel.
///
/// Accumulation is bounded: a line longer than [`MAX_LINE_LEN`] without a
/// newline is reported as a violation instead of growing without limit.
pub(crate) async fn read_lines(
    id: ConnId,
    mut reader: OwnedReadHalf,
    events: mpsc::Sender<SocketEvent>,
) {
    let mut buf = BytesMut::with_capacity(4096);

    loop {
        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let raw = buf.split_to(pos + 1);
            match std::str::from_utf8(&raw[..pos]) {
                Ok(text) => {
                    let line = text.trim_end_matches('\r');
                    if !line.is_empty()
                        && events
                            .send(SocketEvent::Line {
                                id,
                                line: line.to_string(),
                            })
                            .await
                            .is_err()
                    {
                        return;
                    }
                }
                Err(_) => {
                    let _ = events
                        .send(SocketEvent::Violation {
                            id,
                            reason: "line is not valid UTF-8",
                        })
                        .await;
                    return;
                }
            }
        }

        if buf.len() > MAX_LINE_LEN {
            let _ = events
                .send(SocketEvent::Violation {
                    id,
                    reason: "line exceeds maximum length",
                })
                .await;
            return;
        }

        match reader.read_buf(&mut buf).await {
            Ok(0) => {
                let _ = events.send(SocketEvent::Closed { id }).await;
                return;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(id, error = %e, "socket read failed");
                let _ = events.send(SocketEvent::Closed { id }).await;
                return;
            }
        }
    }
}
