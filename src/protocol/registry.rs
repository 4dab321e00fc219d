//! Session registry: listener, single-peer arbitration, abuse policing.
//!
//! The registry owns the TCP listener and every live [`Connection`]. It
//! runs as one actor loop driven by socket readability, commands and
//! timers, so the ban map and the single active-connection slot have
//! exactly one owner and promotion decisions are serialized: a disconnect
//! is always fully processed (slot cleared, state change emitted) before
//! any later promotion is considered.
//!
//! Policing:
//!
//! - banned addresses are refused at accept time, before any crypto work
//! - a periodic sweep purges expired bans, reaps dead reader tasks,
//!   force-closes non-active connections while a peer is active, and
//!   evicts connections stalled in pre-authentication states
//! - denied handshakes get a short grace period, then a forced close
//! - only the explicit kick command creates ban entries; protocol errors
//!   never do

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::connection::{
    read_lines, ConnId, Connection, HandshakeState, Inbound, PeerMetadata, SocketEvent,
};
use super::message::{HostMessage, PeerMessage};
use super::{
    CONNECTED_SETTLE_MS, HANDSHAKE_GRACE_SECS, HANDSHAKE_WINDOW_SECS, KICK_BAN_SECS,
    SWEEP_INTERVAL_SECS,
};
use crate::config::Config;
use crate::crypto::SessionMode;
use crate::error::{LinkError, Result};

/// Events delivered to the gateway collaborator.
#[derive(Debug)]
pub enum LinkEvent {
    /// The authenticated peer appeared (after the settle delay) or went away
    ConnectedChange(bool),
    /// Decrypted application message from the authenticated peer
    Message(PeerMessage),
}

/// Timing knobs, defaulting to the wire protocol's fixed values.
///
/// Production uses [`Default`]; integration tests compress the durations.
#[derive(Debug, Clone)]
pub struct RegistryTuning {
    /// How long a kicked peer's address stays banned
    pub ban_duration: Duration,
    /// Interval of the maintenance sweep
    pub sweep_interval: Duration,
    /// Grace period before a denied connection is force-closed
    pub handshake_grace: Duration,
    /// Maximum time a connection may remain unauthenticated
    pub handshake_window: Duration,
    /// Delay between promotion and the connected state change
    pub settle_delay: Duration,
}

impl Default for RegistryTuning {
    fn default() -> Self {
        Self {
            ban_duration: Duration::from_secs(KICK_BAN_SECS),
            sweep_interval: Duration::from_secs(SWEEP_INTERVAL_SECS),
            handshake_grace: Duration::from_secs(HANDSHAKE_GRACE_SECS),
            handshake_window: Duration::from_secs(HANDSHAKE_WINDOW_SECS),
            settle_delay: Duration::from_millis(CONNECTED_SETTLE_MS),
        }
    }
}

/// Operator/gateway commands into the registry loop.
#[derive(Debug)]
enum Command {
    Send(HostMessage),
    Kick,
    Stop,
}

/// Deferred single-shot actions on the registry's timer wheel.
///
/// Actions fire through the loop and no-op when their target connection
/// is already gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerAction {
    /// Close a denied connection once its grace period elapses
    GraceClose(ConnId),
    /// Emit the connected state change after the settle delay
    AnnounceConnected(ConnId),
}

#[derive(Debug, PartialEq, Eq)]
struct TimerEntry {
    at: Instant,
    seq: u64,
    action: TimerAction,
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.at, self.seq).cmp(&(other.at, other.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Minimal single-owner timer wheel for deferred loop actions.
#[derive(Debug, Default)]
struct TimerWheel {
    entries: BinaryHeap<Reverse<TimerEntry>>,
    next_seq: u64,
}

impl TimerWheel {
    fn schedule(&mut self, at: Instant, action: TimerAction) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push(Reverse(TimerEntry { at, seq, action }));
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.entries.peek().map(|Reverse(entry)| entry.at)
    }

    fn pop_due(&mut self, now: Instant) -> Vec<TimerAction> {
        let mut due = Vec::new();
        while let Some(Reverse(entry)) = self.entries.peek() {
            if entry.at > now {
                break;
            }
            let Some(Reverse(entry)) = self.entries.pop() else {
                break;
            };
            due.push(entry.action);
        }
        due
    }
}

/// Handle to a running registry.
///
/// Cloneable; the GUI and the gateway each hold one. Dropping every handle
/// stops the registry.
#[derive(Debug, Clone)]
pub struct RegistryHandle {
    commands: mpsc::Sender<Command>,
    peer: watch::Receiver<Option<PeerMetadata>>,
    local_addr: SocketAddr,
}

impl RegistryHandle {
    /// Encrypt and send a message to the active peer.
    ///
    /// With no active peer the message is dropped with a warning, matching
    /// the fire-and-forget contract of the gateway interface.
    pub async fn send(&self, message: HostMessage) -> Result<()> {
        self.commands
            .send(Command::Send(message))
            .await
            .map_err(|_| LinkError::Stopped)
    }

    /// Kick the active peer and ban its address.
    pub async fn kick_active_peer(&self) -> Result<()> {
        self.commands
            .send(Command::Kick)
            .await
            .map_err(|_| LinkError::Stopped)
    }

    /// Stop listening and drop every connection.
    pub async fn stop(&self) -> Result<()> {
        self.commands
            .send(Command::Stop)
            .await
            .map_err(|_| LinkError::Stopped)
    }

    /// Snapshot of the active peer's metadata, if one is authenticated.
    pub fn active_peer(&self) -> Option<PeerMetadata> {
        self.peer.borrow().clone()
    }

    /// Whether a peer is currently authenticated.
    pub fn is_connected(&self) -> bool {
        self.peer.borrow().is_some()
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// Listener and arbitration entry point.
pub struct SessionRegistry;

impl SessionRegistry {
    /// Bind the listener and start the registry loop.
    ///
    /// Configuration problems (bad bind address, missing key material) are
    /// fatal here, before any connection is accepted. Returns the command
    /// handle and the gateway event stream.
    pub async fn start(config: &Config) -> Result<(RegistryHandle, mpsc::Receiver<LinkEvent>)> {
        Self::start_with_tuning(config, RegistryTuning::default()).await
    }

    /// [`SessionRegistry::start`] with explicit timing knobs.
    pub async fn start_with_tuning(
        config: &Config,
        tuning: RegistryTuning,
    ) -> Result<(RegistryHandle, mpsc::Receiver<LinkEvent>)> {
        let mode = config.session_mode()?;
        let bind_addr = config.listen.socket_addr()?;

        let listener = TcpListener::bind(bind_addr).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "listening for companion connections");

        let (command_tx, command_rx) = mpsc::channel(16);
        let (event_tx, event_rx) = mpsc::channel(64);
        let (socket_tx, socket_rx) = mpsc::channel(64);
        let (peer_tx, peer_rx) = watch::channel(None);

        let registry = Registry {
            mode,
            listener,
            tuning,
            conns: HashMap::new(),
            readers: HashMap::new(),
            active: None,
            bans: HashMap::new(),
            timers: TimerWheel::default(),
            next_id: 0,
            socket_tx,
            socket_rx,
            command_rx,
            events: event_tx,
            peer_tx,
        };

        tokio::spawn(registry.run());

        Ok((
            RegistryHandle {
                commands: command_tx,
                peer: peer_rx,
                local_addr,
            },
            event_rx,
        ))
    }
}

struct Registry {
    mode: SessionMode,
    listener: TcpListener,
    tuning: RegistryTuning,
    conns: HashMap<ConnId, Connection>,
    readers: HashMap<ConnId, tokio::task::JoinHandle<()>>,
    /// The single authenticated peer slot; mutated only inside the loop
    active: Option<ConnId>,
    /// Remote address -> ban expiry
    bans: HashMap<IpAddr, Instant>,
    timers: TimerWheel,
    next_id: ConnId,
    socket_tx: mpsc::Sender<SocketEvent>,
    socket_rx: mpsc::Receiver<SocketEvent>,
    command_rx: mpsc::Receiver<Command>,
    events: mpsc::Sender<LinkEvent>,
    peer_tx: watch::Sender<Option<PeerMetadata>>,
}

impl Registry {
    async fn run(mut self) {
        let start = tokio::time::Instant::now() + self.tuning.sweep_interval;
        let mut sweep = tokio::time::interval_at(start, self.tuning.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            let timer_at = self.timers.next_deadline();

            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => self.on_accept(stream, addr),
                    Err(e) => warn!(error = %e, "accept failed"),
                },
                Some(event) = self.socket_rx.recv() => self.on_socket_event(event).await,
                command = self.command_rx.recv() => match command {
                    Some(Command::Send(message)) => self.send_to_active(message).await,
                    Some(Command::Kick) => self.kick_active().await,
                    Some(Command::Stop) | None => {
                        self.shutdown().await;
                        return;
                    }
                },
                _ = sweep.tick() => self.sweep().await,
                () = sleep_until_deadline(timer_at) => self.fire_timers().await,
            }
        }
    }

    fn on_accept(&mut self, stream: TcpStream, addr: SocketAddr) {
        if self
            .bans
            .get(&addr.ip())
            .is_some_and(|expiry| *expiry > Instant::now())
        {
            info!(%addr, "refused connection from banned address");
            drop(stream);
            return;
        }

        let id = self.next_id;
        self.next_id += 1;

        let (conn, reader) = Connection::accept(id, stream, addr, &self.mode);
        let handle = tokio::spawn(read_lines(id, reader, self.socket_tx.clone()));

        self.conns.insert(id, conn);
        self.readers.insert(id, handle);
        debug!(id, %addr, "connection accepted");
    }

    async fn on_socket_event(&mut self, event: SocketEvent) {
        match event {
            SocketEvent::Line { id, line } => {
                // Lines racing a teardown are discarded, never delivered
                let Some(conn) = self.conns.get_mut(&id) else {
                    return;
                };

                match conn.process_line(&line, &self.mode).await {
                    Ok(Inbound::Handled) => {}
                    Ok(Inbound::HandshakePending) => self.decide_handshake(id).await,
                    Ok(Inbound::Message(message)) => {
                        if self.active == Some(id) {
                            let _ = self.events.send(LinkEvent::Message(message)).await;
                        } else {
                            debug!(id, "dropping message from non-active connection");
                        }
                    }
                    Err(e) => {
                        warn!(id, error = %e, "closing connection after protocol failure");
                        self.drop_conn(id).await;
                    }
                }
            }
            SocketEvent::Violation { id, reason } => {
                warn!(id, reason, "closing connection after framing violation");
                self.drop_conn(id).await;
            }
            SocketEvent::Closed { id } => {
                debug!(id, "socket closed");
                self.drop_conn(id).await;
            }
        }
    }

    /// Decide a pending handshake: promote, supersede, or deny.
    async fn decide_handshake(&mut self, id: ConnId) {
        let allow = match self.active {
            None => true,
            Some(active_id) if active_id == id => true,
            Some(active_id) => {
                if self.is_same_peer(active_id, id) {
                    // The previously authenticated device reconnected before
                    // the old socket's teardown was observed; the identity
                    // check (not arrival order) authorizes the takeover.
                    info!(id, "active peer superseded by reconnection");
                    self.drop_conn(active_id).await;
                    true
                } else {
                    false
                }
            }
        };

        let Some(conn) = self.conns.get_mut(&id) else {
            return;
        };

        if allow {
            if let Err(e) = conn.answer_handshake(true).await {
                warn!(id, error = %e, "failed to confirm handshake");
                self.drop_conn(id).await;
                return;
            }
            self.active = Some(id);
            self.peer_tx.send_replace(conn_metadata(&self.conns, id));
            self.timers.schedule(
                Instant::now() + self.tuning.settle_delay,
                TimerAction::AnnounceConnected(id),
            );
            info!(id, "peer authenticated");
        } else {
            info!(id, "denying handshake while another peer is active");
            if let Err(e) = conn.answer_handshake(false).await {
                warn!(id, error = %e, "failed to deny handshake");
                self.drop_conn(id).await;
                return;
            }
            self.timers.schedule(
                Instant::now() + self.tuning.handshake_grace,
                TimerAction::GraceClose(id),
            );
        }
    }

    /// Same device identity (public key fingerprint) from the same address.
    fn is_same_peer(&self, active_id: ConnId, candidate_id: ConnId) -> bool {
        let (Some(active), Some(candidate)) =
            (self.conns.get(&active_id), self.conns.get(&candidate_id))
        else {
            return false;
        };

        match (active.identity(), candidate.identity()) {
            (Some(a), Some(b)) => a == b && active.addr().ip() == candidate.addr().ip(),
            _ => false,
        }
    }

    async fn send_to_active(&mut self, message: HostMessage) {
        let Some(id) = self.active else {
            warn!("no active peer, dropping outbound message");
            return;
        };

        if let Some(conn) = self.conns.get_mut(&id) {
            if let Err(e) = conn.send(&message).await {
                error!(id, error = %e, "failed to send message to peer");
            }
        }
    }

    /// Explicit operator kick: the only path that creates ban entries.
    async fn kick_active(&mut self) {
        let Some(id) = self.active else {
            return;
        };

        if let Some(conn) = self.conns.get(&id) {
            let ip = conn.addr().ip();
            self.bans
                .insert(ip, Instant::now() + self.tuning.ban_duration);
            info!(%ip, "active peer kicked and banned");
        }

        self.drop_conn(id).await;
    }

    /// Tear down one connection. Clears the active slot synchronously and
    /// emits the disconnected state change before returning, so no later
    /// promotion can observe a half-cleared slot.
    async fn drop_conn(&mut self, id: ConnId) {
        if let Some(mut conn) = self.conns.remove(&id) {
            conn.close().await;
        }
        if let Some(handle) = self.readers.remove(&id) {
            handle.abort();
        }

        if self.active == Some(id) {
            self.active = None;
            self.peer_tx.send_replace(None);
            let _ = self.events.send(LinkEvent::ConnectedChange(false)).await;
            info!(id, "active peer disconnected");
        }
    }

    async fn fire_timers(&mut self) {
        for action in self.timers.pop_due(Instant::now()) {
            match action {
                TimerAction::GraceClose(id) => {
                    // No-op unless the connection still exists and is still
                    // the denied one the timer was armed for
                    if self
                        .conns
                        .get(&id)
                        .is_some_and(|c| c.state() == HandshakeState::Rejected)
                    {
                        debug!(id, "grace period elapsed, closing rejected connection");
                        self.drop_conn(id).await;
                    }
                }
                TimerAction::AnnounceConnected(id) => {
                    if self.active == Some(id) {
                        let _ = self.events.send(LinkEvent::ConnectedChange(true)).await;
                    }
                }
            }
        }
    }

    /// Periodic maintenance pass.
    async fn sweep(&mut self) {
        let now = Instant::now();

        self.bans.retain(|ip, expiry| {
            let live = *expiry > now;
            if !live {
                debug!(%ip, "ban expired");
            }
            live
        });

        let mut doomed: Vec<(ConnId, &'static str)> = Vec::new();

        for (&id, conn) in &self.conns {
            if self
                .readers
                .get(&id)
                .map_or(true, |handle| handle.is_finished())
                && self.active != Some(id)
            {
                doomed.push((id, "reader task gone"));
            } else if self.active.is_some_and(|active| active != id)
                && conn.state() != HandshakeState::Rejected
                && conn.opened_at().elapsed() > self.tuning.handshake_grace
            {
                // While a peer is active no other socket may linger
                // half-authenticated. Fresh sockets get one grace period to
                // reach their deny verdict; rejected ones wait for their
                // grace close.
                doomed.push((id, "non-active connection while a peer is active"));
            } else if conn.is_pre_auth() && conn.opened_at().elapsed() > self.tuning.handshake_window
            {
                doomed.push((id, "handshake window elapsed"));
            }
        }

        for (id, why) in doomed {
            debug!(id, why, "sweeping connection");
            self.drop_conn(id).await;
        }
    }

    async fn shutdown(&mut self) {
        let ids: Vec<ConnId> = self.conns.keys().copied().collect();
        for id in ids {
            self.drop_conn(id).await;
        }
        info!("registry stopped");
    }
}

fn conn_metadata(conns: &HashMap<ConnId, Connection>, id: ConnId) -> Option<PeerMetadata> {
    conns.get(&id).and_then(|c| c.metadata().cloned())
}

async fn sleep_until_deadline(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}
