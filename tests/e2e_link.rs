//! End-to-end protocol tests over real localhost TCP.
//!
//! A minimal wire-accurate companion-device simulator drives the host
//! through pairing, arbitration, kick/ban and eviction scenarios.

use std::net::SocketAddr;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

use pairlink::config::{Config, IdentityConfig, ListenConfig};
use pairlink::crypto::{open_sealed, CryptoSession, KeyPair, PublicKey, Role};
use pairlink::protocol::SessionRegistry;
use pairlink::{HostMessage, LinkEvent, PeerMessage, RegistryHandle, RegistryTuning};

const TIMEOUT: Duration = Duration::from_secs(5);

/// Compressed timing so ban expiry and eviction fit in test wall-clock.
fn test_tuning() -> RegistryTuning {
    RegistryTuning {
        ban_duration: Duration::from_secs(1),
        sweep_interval: Duration::from_millis(200),
        handshake_grace: Duration::from_millis(600),
        handshake_window: Duration::from_secs(2),
        settle_delay: Duration::from_millis(100),
    }
}

fn exchange_config(keys: &KeyPair) -> Config {
    Config {
        listen: ListenConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        },
        identity: IdentityConfig {
            public_key: Some(keys.public_key_base64()),
            secret_key: Some(keys.secret_key_base64()),
            passphrase: None,
        },
    }
}

async fn start_host() -> (RegistryHandle, mpsc::Receiver<LinkEvent>) {
    let config = exchange_config(&KeyPair::generate());
    SessionRegistry::start_with_tuning(&config, test_tuning())
        .await
        .expect("registry failed to start")
}

async fn next_event(events: &mut mpsc::Receiver<LinkEvent>) -> LinkEvent {
    timeout(TIMEOUT, events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("registry event stream closed")
}

/// Wire-accurate companion-device simulator.
struct TestPeer {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    keys: KeyPair,
    crypto: Option<CryptoSession>,
}

impl TestPeer {
    async fn connect(addr: SocketAddr) -> Self {
        Self::connect_with_keys(addr, KeyPair::generate()).await
    }

    async fn connect_with_keys(addr: SocketAddr, keys: KeyPair) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect failed");
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
            keys,
            crypto: None,
        }
    }

    async fn write_line(&mut self, line: &str) {
        self.writer
            .write_all(line.as_bytes())
            .await
            .expect("write failed");
        self.writer.write_all(b"\n").await.expect("write failed");
    }

    /// Read one line; `None` means the host closed (or reset) the socket.
    async fn read_line(&mut self) -> Option<String> {
        let mut line = String::new();
        match timeout(TIMEOUT, self.reader.read_line(&mut line))
            .await
            .expect("read timed out")
        {
            Ok(0) => None,
            Ok(_) => Some(line.trim_end().to_string()),
            Err(_) => None,
        }
    }

    /// Run the `@@` public key exchange and derive session keys.
    async fn exchange_keys(&mut self) {
        let line = format!("@@{}", self.keys.public_key().to_hex());
        self.write_line(&line).await;

        let reply = self.read_line().await.expect("host closed during key exchange");
        let sealed = BASE64
            .decode(reply.strip_prefix("@@").expect("reply missing @@ prefix"))
            .expect("reply is not base64");
        let host_pk_bytes = open_sealed(&self.keys, &sealed).expect("cannot open sealed host key");
        let host_pk = PublicKey::from_slice(&host_pk_bytes).expect("bad host key length");

        self.crypto = Some(
            CryptoSession::from_key_exchange(Role::Peer, &self.keys, &host_pk)
                .expect("peer key derivation failed"),
        );
    }

    async fn send_frame(&mut self, payload: &serde_json::Value) {
        let frame = self
            .crypto
            .as_ref()
            .expect("no session keys yet")
            .encode(payload.to_string().as_bytes())
            .expect("encode failed");
        self.write_line(&frame).await;
    }

    /// Receive and decrypt one frame; `None` on socket close.
    async fn recv_json(&mut self) -> Option<serde_json::Value> {
        let line = self.read_line().await?;
        let plain = self
            .crypto
            .as_ref()
            .expect("no session keys yet")
            .decode(&line)
            .expect("decode failed");
        Some(serde_json::from_slice(&plain).expect("frame is not JSON"))
    }

    /// Send the application handshake and return the host's verdict.
    async fn handshake(&mut self, device_name: &str, sms: bool) -> serde_json::Value {
        self.send_frame(&json!({
            "type": "handshake",
            "app_version": "2.1.0",
            "device_name": device_name,
            "os_type": "Android",
            "os_version": "15",
            "features": {"notifications": true, "sms": sms}
        }))
        .await;
        self.recv_json().await.expect("no handshake reply")
    }
}

#[tokio::test]
async fn full_pairing_reports_connected_with_features() {
    let (handle, mut events) = start_host().await;

    let mut peer = TestPeer::connect(handle.local_addr()).await;
    peer.exchange_keys().await;

    let verdict = peer.handshake("Test Phone", true).await;
    assert_eq!(verdict["type"], "handshake");
    assert_eq!(verdict["success"], true);

    match next_event(&mut events).await {
        LinkEvent::ConnectedChange(true) => {}
        other => panic!("expected connected, got {other:?}"),
    }

    let meta = handle.active_peer().expect("no active peer metadata");
    assert_eq!(meta.device_name, "Test Phone");
    assert!(meta.features.sms);
    assert!(meta.features.notifications);
    assert!(meta.identity.is_some());
    assert!(handle.is_connected());

    // Host -> peer
    handle.send(HostMessage::ListSms).await.unwrap();
    let msg = peer.recv_json().await.expect("peer socket closed");
    assert_eq!(msg["type"], "list_sms");

    // Peer -> host
    peer.send_frame(&json!({
        "type": "sms_list",
        "list": [{"type": "in", "date": "2026-08-01T12:00:00Z", "body": "hi", "number": "+15550100"}]
    }))
    .await;

    match next_event(&mut events).await {
        LinkEvent::Message(PeerMessage::SmsList { list }) => {
            assert_eq!(list.len(), 1);
            assert_eq!(list[0].number, "+15550100");
        }
        other => panic!("expected sms_list, got {other:?}"),
    }

    handle.stop().await.unwrap();
    match next_event(&mut events).await {
        LinkEvent::ConnectedChange(false) => {}
        other => panic!("expected disconnect on stop, got {other:?}"),
    }
}

#[tokio::test]
async fn second_peer_is_denied_and_closed_within_grace() {
    let (handle, mut events) = start_host().await;

    let mut first = TestPeer::connect(handle.local_addr()).await;
    first.exchange_keys().await;
    assert_eq!(first.handshake("Phone A", true).await["success"], true);
    match next_event(&mut events).await {
        LinkEvent::ConnectedChange(true) => {}
        other => panic!("expected connected, got {other:?}"),
    }

    // A different device tries while A is active
    let mut second = TestPeer::connect(handle.local_addr()).await;
    second.exchange_keys().await;
    let verdict = second.handshake("Phone B", false).await;
    assert_eq!(verdict["success"], false);

    // The denied socket closes within the grace window
    assert!(second.recv_json().await.is_none());

    // Peer A is unaffected
    let meta = handle.active_peer().expect("active peer lost");
    assert_eq!(meta.device_name, "Phone A");

    handle.send(HostMessage::ListNotifications).await.unwrap();
    let msg = first.recv_json().await.expect("peer A socket closed");
    assert_eq!(msg["type"], "list_notifications");
}

#[tokio::test]
async fn same_device_reconnect_supersedes_stale_session() {
    let (handle, mut events) = start_host().await;
    let device_keys = KeyPair::generate();

    let mut stale =
        TestPeer::connect_with_keys(handle.local_addr(), device_keys.clone()).await;
    stale.exchange_keys().await;
    assert_eq!(stale.handshake("Phone", true).await["success"], true);
    match next_event(&mut events).await {
        LinkEvent::ConnectedChange(true) => {}
        other => panic!("expected connected, got {other:?}"),
    }

    // Same key identity, same address: allowed to take over
    let mut fresh = TestPeer::connect_with_keys(handle.local_addr(), device_keys).await;
    fresh.exchange_keys().await;
    let verdict = fresh.handshake("Phone", true).await;
    assert_eq!(verdict["success"], true);

    // Old session is torn down before the new one is announced
    match next_event(&mut events).await {
        LinkEvent::ConnectedChange(false) => {}
        other => panic!("expected disconnect of stale session, got {other:?}"),
    }
    match next_event(&mut events).await {
        LinkEvent::ConnectedChange(true) => {}
        other => panic!("expected reconnect, got {other:?}"),
    }

    assert!(stale.recv_json().await.is_none());
    assert!(handle.is_connected());
}

#[tokio::test]
async fn kick_bans_address_until_expiry() {
    let (handle, mut events) = start_host().await;

    let mut peer = TestPeer::connect(handle.local_addr()).await;
    peer.exchange_keys().await;
    assert_eq!(peer.handshake("Phone", true).await["success"], true);
    match next_event(&mut events).await {
        LinkEvent::ConnectedChange(true) => {}
        other => panic!("expected connected, got {other:?}"),
    }

    handle.kick_active_peer().await.unwrap();
    match next_event(&mut events).await {
        LinkEvent::ConnectedChange(false) => {}
        other => panic!("expected disconnect on kick, got {other:?}"),
    }
    assert!(peer.recv_json().await.is_none());
    assert!(!handle.is_connected());

    // Banned: the socket is dropped before any handshake starts
    let mut banned = TestPeer::connect(handle.local_addr()).await;
    assert!(banned.read_line().await.is_none());

    // After the ban expires (plus a sweep), the address works again
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let mut again = TestPeer::connect(handle.local_addr()).await;
    again.exchange_keys().await;
    assert_eq!(again.handshake("Phone", true).await["success"], true);
}

#[tokio::test]
async fn malformed_pre_key_exchange_line_disconnects() {
    let (handle, _events) = start_host().await;

    let mut peer = TestPeer::connect(handle.local_addr()).await;
    peer.write_line("GET / HTTP/1.1").await;
    assert!(peer.read_line().await.is_none());
}

#[tokio::test]
async fn stalled_connection_is_evicted_after_handshake_window() {
    let (handle, _events) = start_host().await;

    // Connect and send nothing; the sweep evicts after the window
    let mut silent = TestPeer::connect(handle.local_addr()).await;
    assert!(silent.read_line().await.is_none());
}

#[tokio::test]
async fn unknown_message_types_are_ignored_not_fatal() {
    let (handle, mut events) = start_host().await;

    let mut peer = TestPeer::connect(handle.local_addr()).await;
    peer.exchange_keys().await;
    assert_eq!(peer.handshake("Phone", true).await["success"], true);
    match next_event(&mut events).await {
        LinkEvent::ConnectedChange(true) => {}
        other => panic!("expected connected, got {other:?}"),
    }

    // A future message type the host does not know
    peer.send_frame(&json!({"type": "battery_status", "level": 80}))
        .await;

    // The connection stays up and later messages still arrive
    peer.send_frame(&json!({
        "type": "notification_received",
        "notification": {"key": "k1", "app_name": "Mail", "title": "Hello"}
    }))
    .await;

    match next_event(&mut events).await {
        LinkEvent::Message(PeerMessage::NotificationReceived { notification }) => {
            assert_eq!(notification.key, "k1");
        }
        other => panic!("expected notification, got {other:?}"),
    }
}

#[tokio::test]
async fn psk_mode_pairs_without_key_exchange() {
    let config = Config {
        listen: ListenConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        },
        identity: IdentityConfig {
            public_key: None,
            secret_key: None,
            passphrase: Some("orbital pancakes".to_string()),
        },
    };
    let (handle, mut events) = SessionRegistry::start_with_tuning(&config, test_tuning())
        .await
        .expect("psk registry failed to start");

    let mut peer = TestPeer::connect(handle.local_addr()).await;
    peer.crypto = Some(CryptoSession::from_passphrase("orbital pancakes").unwrap());

    let verdict = peer.handshake("PSK Phone", false).await;
    assert_eq!(verdict["success"], true);

    match next_event(&mut events).await {
        LinkEvent::ConnectedChange(true) => {}
        other => panic!("expected connected, got {other:?}"),
    }

    let meta = handle.active_peer().expect("no active peer");
    assert_eq!(meta.device_name, "PSK Phone");
    assert!(meta.identity.is_none());
}
