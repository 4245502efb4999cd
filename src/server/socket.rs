//! Server Socket Handler
//!
//! The socket-facing handler of the server. It owns the UDP endpoint, the
//! session table and the internal pipe timers report into, and it relays
//! traffic between the network and each peer's [`ComHandler`](super::ComHandler).
//!
//! ## State Machine
//!
//! ```text
//!                         ┌──────────┐
//!                         │ NewEvent │  dispatch by role
//!                         └────┬─────┘
//!        InternalLink ┌────────┼──────────────┐ ComLink
//!                     ▼        │ NetworkLink  ▼
//!        ┌───────────────────┐ │   ┌─────────────┐
//!        │ ConnectionTimeout │ │   │ NewComEvent │── Packet ──> peer
//!        └───────────────────┘ ▼   └─────────────┘
//!                  ┌─────────────────┐
//!                  │ NewNetworkEvent │ credential, session, timer
//!                  └────────┬────────┘
//!                           ▼
//!                  ┌──────────────────┐
//!                  │ NewNetworkPacket │ ping / buffer
//!                  └────────┬─────────┘
//!                           ▼
//!                  ┌──────────────────┐
//!                  │ CompletedMessage │ inner message ──> relay
//!                  └──────────────────┘
//! ```
//!
//! Every state ends in `Idle`; failures go through `Error`.

use crate::protocol::{FrameError, Message, MessageKind};
use crate::reactor::{
    drive, relay_pair, EndpointId, Handler, HandlerError, Machine, NetworkEndpoint, PipeReader,
    PipeWriter, ReactorHandle, RelayPair, Role, Subscription,
};
use crate::session::{Arrival, SessionTable, Timers, DISCONNECTION_DELAY};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Builds the handler for a newly seen peer from the peer side of its relay.
pub type PeerFactory = Box<dyn Fn(SocketAddr, RelayPair) -> Box<dyn Handler> + Send>;

/// Settings for [`ServerSocketHandler`].
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Idle time after which a peer is disconnected
    pub disconnection_delay: Duration,
    /// Token every datagram must carry, if set
    pub credential: Option<String>,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            disconnection_delay: DISCONNECTION_DELAY,
            credential: None,
        }
    }
}

/// Session counters.
#[derive(Debug, Default)]
pub struct SessionStats {
    /// Total sessions opened
    pub sessions_opened: AtomicU64,
    /// Currently open sessions
    pub active_sessions: AtomicU64,
    /// Sessions closed by the idle timer
    pub timeouts: AtomicU64,
    /// `Close` messages written to peer handlers
    pub closes_relayed: AtomicU64,
    /// Datagrams received, malformed ones included
    pub datagrams_received: AtomicU64,
    /// Datagrams sent
    pub datagrams_sent: AtomicU64,
}

impl SessionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_opened(&self) {
        self.sessions_opened.fetch_add(1, Ordering::Relaxed);
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self) {
        self.active_sessions.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn active(&self) -> u64 {
        self.active_sessions.load(Ordering::Relaxed)
    }

    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    pub fn closes_relayed(&self) -> u64 {
        self.closes_relayed.load(Ordering::Relaxed)
    }
}

/// States of a [`ServerSocketHandler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Idle,
    NewEvent,
    ConnectionTimeout,
    NewNetworkEvent,
    NewNetworkPacket,
    CompletedMessage,
    NewComEvent,
    Error,
}

/// Owns the server socket and every peer session.
pub struct ServerSocketHandler {
    state: SocketState,
    config: SocketConfig,
    network: NetworkEndpoint,
    internal: PipeReader,
    internal_tx: PipeWriter,
    sessions: SessionTable,
    timers: Timers,
    reactor: ReactorHandle,
    factory: PeerFactory,
    stats: Arc<SessionStats>,

    // Scratch for the event in progress
    event: Option<(Role, EndpointId)>,
    datagram: Option<(SocketAddr, Message)>,
    completed: Option<(SocketAddr, Message)>,
}

impl ServerSocketHandler {
    pub fn new(
        config: SocketConfig,
        network: NetworkEndpoint,
        timers: Timers,
        reactor: ReactorHandle,
        factory: PeerFactory,
    ) -> io::Result<Self> {
        let (internal_tx, internal) = crate::reactor::pipe(Role::InternalLink)?;
        Ok(Self {
            state: SocketState::Idle,
            config,
            network,
            internal,
            internal_tx,
            sessions: SessionTable::new(),
            timers,
            reactor,
            factory,
            stats: Arc::new(SessionStats::new()),
            event: None,
            datagram: None,
            completed: None,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.network.local_addr()
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn stats(&self) -> Arc<SessionStats> {
        Arc::clone(&self.stats)
    }

    pub fn state(&self) -> SocketState {
        self.state
    }

    /// Creates the session and the peer's handler.
    fn open_session(&mut self, peer: SocketAddr) -> Result<bool, HandlerError> {
        let (socket_side, peer_side) = relay_pair(Role::ComLink, Role::NetworkLink)?;
        let handler = (self.factory)(peer, peer_side);

        if let Err(e) = self.reactor.admit(handler) {
            warn!(peer = %peer, error = %e, "Failed to admit peer handler");
            return Ok(false);
        }

        self.sessions.insert(peer, socket_side);
        self.stats.session_opened();
        info!(peer = %peer, sessions = self.sessions.len(), "Session opened");
        Ok(true)
    }

    /// Removes the session. With `notify_peer_handler` a `Close` goes down
    /// the relay first.
    fn teardown(&mut self, peer: &SocketAddr, notify_peer_handler: bool) -> bool {
        let Some(session) = self.sessions.remove(peer) else {
            return false;
        };

        if notify_peer_handler {
            match session.relay.writer.write_message(&Message::close()) {
                Ok(()) => {
                    self.stats.closes_relayed.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => debug!(peer = %peer, error = %e, "Peer handler already gone"),
            }
        }
        self.stats.session_closed();
        info!(peer = %peer, sessions = self.sessions.len(), "Session closed");
        true
    }

    fn send_to_peer(&self, message: &Message, peer: SocketAddr) -> Result<(), HandlerError> {
        self.network.send(message, peer)?;
        self.stats.datagrams_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    // ========================================================================
    // States
    // ========================================================================

    fn on_new_event(&mut self) -> Result<SocketState, HandlerError> {
        let (role, endpoint) = self
            .event
            .ok_or(HandlerError::MissingEvent("NewEvent"))?;

        let next = match role {
            Role::NetworkLink => SocketState::NewNetworkEvent,
            Role::InternalLink => SocketState::ConnectionTimeout,
            Role::ComLink => SocketState::NewComEvent,
            Role::ShellLink => {
                warn!(endpoint = %endpoint, role = %role, "Unexpected event role");
                SocketState::Idle
            }
        };
        Ok(next)
    }

    fn on_new_network_event(&mut self) -> Result<SocketState, HandlerError> {
        let (peer, decoded) = match self.network.receive() {
            Ok(pair) => pair,
            Err(FrameError::Empty) => return Ok(SocketState::Idle),
            Err(e) => return Err(e.into()),
        };
        self.stats.datagrams_received.fetch_add(1, Ordering::Relaxed);

        let message = match decoded {
            Ok(message) => message,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Dropping malformed datagram");
                return Ok(SocketState::Idle);
            }
        };

        if let Some(expected) = &self.config.credential {
            if message.credential.as_deref() != Some(expected.as_str()) {
                warn!(peer = %peer, "Dropping datagram with bad credential");
                return Ok(SocketState::Idle);
            }
        }

        if message.kind == MessageKind::Close {
            if self.teardown(&peer, true) {
                debug!(peer = %peer, "Peer said goodbye");
            }
            return Ok(SocketState::Idle);
        }

        if !self.sessions.contains(&peer) && !self.open_session(peer)? {
            return Ok(SocketState::Idle);
        }

        // Every datagram pushes the disconnection back
        let timer = self.timers.schedule(
            peer,
            self.config.disconnection_delay,
            self.internal_tx.clone(),
        );
        self.sessions.touch(&peer, timer);

        self.datagram = Some((peer, message));
        Ok(SocketState::NewNetworkPacket)
    }

    fn on_new_network_packet(&mut self) -> Result<SocketState, HandlerError> {
        let (peer, message) = self
            .datagram
            .take()
            .ok_or(HandlerError::MissingEvent("NewNetworkPacket"))?;

        match self.sessions.accept(&peer, message) {
            Some(Arrival::Ping) => {
                trace!(peer = %peer, "Ping");
                Ok(SocketState::Idle)
            }
            Some(Arrival::Buffered { pending }) => {
                trace!(peer = %peer, pending, "Packet buffered");
                Ok(SocketState::Idle)
            }
            Some(Arrival::Complete(packet)) => {
                self.completed = Some((peer, packet));
                Ok(SocketState::CompletedMessage)
            }
            None => Err(HandlerError::UnknownPeer(peer)),
        }
    }

    fn on_completed_message(&mut self) -> Result<SocketState, HandlerError> {
        let (peer, packet) = self
            .completed
            .take()
            .ok_or(HandlerError::MissingEvent("CompletedMessage"))?;

        let inner = if packet.kind == MessageKind::Packet {
            match packet.unwrap_packet() {
                Ok(inner) => inner,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "Dropping malformed packet");
                    return Ok(SocketState::Idle);
                }
            }
        } else {
            packet
        };

        let session = self
            .sessions
            .get(&peer)
            .ok_or(HandlerError::UnknownPeer(peer))?;
        match session.relay.writer.write_message(&inner) {
            Ok(()) => {
                trace!(peer = %peer, kind = %inner.kind, "Relayed to peer handler");
                Ok(SocketState::Idle)
            }
            Err(FrameError::Closed) => {
                // The peer handler has already finished
                self.teardown(&peer, false);
                self.send_to_peer(&Message::close(), peer)?;
                Ok(SocketState::Idle)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn on_new_com_event(&mut self) -> Result<SocketState, HandlerError> {
        let (_, endpoint) = self
            .event
            .ok_or(HandlerError::MissingEvent("NewComEvent"))?;

        let Some(peer) = self.sessions.peer_for(endpoint) else {
            trace!(endpoint = %endpoint, "Event for a closed session");
            return Ok(SocketState::Idle);
        };
        let session = self
            .sessions
            .get_mut(&peer)
            .ok_or(HandlerError::UnknownPeer(peer))?;

        let message = match session.relay.reader.read_message() {
            Ok(message) => message,
            Err(FrameError::Empty) => return Ok(SocketState::Idle),
            Err(FrameError::Closed) => {
                self.teardown(&peer, false);
                self.send_to_peer(&Message::close(), peer)?;
                return Ok(SocketState::Idle);
            }
            Err(e) if e.is_protocol() => {
                warn!(peer = %peer, error = %e, "Ignoring malformed relay message");
                return Ok(SocketState::Idle);
            }
            Err(e) => return Err(e.into()),
        };

        if message.kind == MessageKind::Close {
            self.teardown(&peer, false);
            self.send_to_peer(&Message::close(), peer)?;
            return Ok(SocketState::Idle);
        }

        trace!(peer = %peer, kind = %message.kind, "Relaying to network");
        self.send_to_peer(&message.into_packet(), peer)?;
        Ok(SocketState::Idle)
    }

    fn on_connection_timeout(&mut self) -> Result<SocketState, HandlerError> {
        let message = match self.internal.read_message() {
            Ok(message) => message,
            Err(FrameError::Empty) => return Ok(SocketState::Idle),
            Err(e) => return Err(e.into()),
        };

        if message.kind != MessageKind::Timeout {
            warn!(kind = %message.kind, "Unexpected internal message");
            return Ok(SocketState::Idle);
        }

        let peer: SocketAddr = match message.text().parse() {
            Ok(peer) => peer,
            Err(_) => {
                warn!(payload = %message.text(), "Timeout for an unparsable address");
                return Ok(SocketState::Idle);
            }
        };

        if self.sessions.contains(&peer) && !self.sessions.is_expired(&peer) {
            trace!(peer = %peer, "Stale timeout; peer was heard from since");
            return Ok(SocketState::Idle);
        }

        if self.teardown(&peer, true) {
            self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
            info!(peer = %peer, "Peer timed out");
        } else {
            trace!(peer = %peer, "Timeout for a closed session");
        }
        Ok(SocketState::Idle)
    }
}

impl Machine for ServerSocketHandler {
    type State = SocketState;

    const IDLE: SocketState = SocketState::Idle;
    const ERROR: SocketState = SocketState::Error;

    fn state(&self) -> SocketState {
        self.state
    }

    fn set_state(&mut self, state: SocketState) {
        self.state = state;
    }

    fn step(&mut self, state: SocketState) -> Result<SocketState, HandlerError> {
        match state {
            SocketState::NewEvent => self.on_new_event(),
            SocketState::NewNetworkEvent => self.on_new_network_event(),
            SocketState::NewNetworkPacket => self.on_new_network_packet(),
            SocketState::CompletedMessage => self.on_completed_message(),
            SocketState::NewComEvent => self.on_new_com_event(),
            SocketState::ConnectionTimeout => self.on_connection_timeout(),
            SocketState::Idle | SocketState::Error => Ok(SocketState::Idle),
        }
    }

    fn recover(&mut self) {
        self.datagram = None;
        self.completed = None;
    }
}

impl Handler for ServerSocketHandler {
    fn name(&self) -> &str {
        "server-socket"
    }

    fn process(&mut self, role: Role, endpoint: EndpointId) {
        self.event = Some((role, endpoint));
        self.state = SocketState::NewEvent;
        drive(self);
        self.event = None;
    }

    fn endpoints(&self) -> Vec<Subscription> {
        let mut endpoints = vec![
            self.network.subscription(true),
            self.internal.subscription(true),
        ];
        endpoints.extend(self.sessions.subscriptions());
        endpoints
    }

    fn is_running(&self) -> bool {
        true
    }
}
