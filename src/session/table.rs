//! Peer Session Table
//!
//! Server-side state for every peer that has sent a datagram recently.
//!
//! ## Reassembly
//!
//! Each session buffers non-ping packets until `required_packets` of them
//! have arrived, then hands back the most recently received packet and
//! clears the buffer. Only that last packet's payload is forwarded; payloads
//! of earlier packets in the same batch are dropped. Every client in this
//! protocol sends single-packet messages, so `required_packets` stays at 1
//! and the batch is always exactly one packet.
//!
//! ## Ownership
//!
//! The table is owned by the socket handler and is only mutated from its
//! `process`, which the reactor never runs concurrently with itself.

use crate::protocol::Message;
use crate::reactor::{EndpointId, RelayPair, Subscription};
use crate::session::timer::IdleTimer;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

/// Number of packets a fresh session expects per message.
pub const DEFAULT_REQUIRED_PACKETS: usize = 1;

/// What happened to an accepted packet.
#[derive(Debug, Clone, PartialEq)]
pub enum Arrival {
    /// Liveness only; nothing was buffered
    Ping,
    /// Buffered; `pending` more packets complete the message
    Buffered { pending: usize },
    /// The message is complete; carries the last received packet
    Complete(Message),
}

/// State kept for one peer.
#[derive(Debug)]
pub struct PeerSession {
    /// Socket-side end of the relay to this peer's handler
    pub relay: RelayPair,
    /// Packets that make up one message
    pub required_packets: usize,
    received: Vec<Message>,
    timer: Option<IdleTimer>,
    created_at: Instant,
    last_seen: Instant,
}

impl PeerSession {
    fn new(relay: RelayPair) -> Self {
        let now = Instant::now();
        Self {
            relay,
            required_packets: DEFAULT_REQUIRED_PACKETS,
            received: Vec::new(),
            timer: None,
            created_at: now,
            last_seen: now,
        }
    }

    /// Packets currently buffered.
    pub fn buffered(&self) -> usize {
        self.received.len()
    }

    pub fn has_timer(&self) -> bool {
        self.timer.is_some()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    fn accept(&mut self, packet: Message) -> Arrival {
        if packet.is_ping() {
            return Arrival::Ping;
        }

        self.received.push(packet);
        if self.received.len() < self.required_packets {
            return Arrival::Buffered {
                pending: self.required_packets - self.received.len(),
            };
        }

        // The batch is complete; forward only the newest packet
        let last = self.received.pop();
        self.received.clear();
        match last {
            Some(packet) => Arrival::Complete(packet),
            None => Arrival::Buffered { pending: 0 },
        }
    }
}

/// All live sessions, keyed by peer address and by relay endpoint.
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: HashMap<SocketAddr, PeerSession>,
    by_endpoint: HashMap<EndpointId, SocketAddr>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, peer: &SocketAddr) -> bool {
        self.sessions.contains_key(peer)
    }

    pub fn get(&self, peer: &SocketAddr) -> Option<&PeerSession> {
        self.sessions.get(peer)
    }

    pub fn get_mut(&mut self, peer: &SocketAddr) -> Option<&mut PeerSession> {
        self.sessions.get_mut(peer)
    }

    /// The peer whose relay reader is `endpoint`.
    pub fn peer_for(&self, endpoint: EndpointId) -> Option<SocketAddr> {
        self.by_endpoint.get(&endpoint).copied()
    }

    pub fn peers(&self) -> impl Iterator<Item = &SocketAddr> {
        self.sessions.keys()
    }

    /// Creates a session for a new peer.
    pub fn insert(&mut self, peer: SocketAddr, relay: RelayPair) -> &mut PeerSession {
        self.by_endpoint.insert(relay.reader.id(), peer);
        self.sessions
            .entry(peer)
            .or_insert_with(|| PeerSession::new(relay))
    }

    /// Replaces the peer's idle timer, cancelling the old one.
    ///
    /// Returns false for unknown peers.
    pub fn touch(&mut self, peer: &SocketAddr, timer: IdleTimer) -> bool {
        match self.sessions.get_mut(peer) {
            Some(session) => {
                if let Some(old) = session.timer.replace(timer) {
                    old.cancel();
                }
                session.last_seen = Instant::now();
                true
            }
            None => {
                timer.cancel();
                false
            }
        }
    }

    /// True unless the peer's current timer is still ahead of its deadline.
    ///
    /// A `Timeout` read while the session holds a younger timer came from a
    /// timer that fired just before being replaced, and is stale.
    pub fn is_expired(&self, peer: &SocketAddr) -> bool {
        self.sessions
            .get(peer)
            .and_then(|session| session.timer.as_ref())
            .map_or(true, |timer| Instant::now() >= timer.deadline())
    }

    /// Buffers a packet from a known peer.
    pub fn accept(&mut self, peer: &SocketAddr, packet: Message) -> Option<Arrival> {
        self.sessions
            .get_mut(peer)
            .map(|session| session.accept(packet))
    }

    /// Tears a session down: timer cancelled, buffers and maps cleared.
    pub fn remove(&mut self, peer: &SocketAddr) -> Option<PeerSession> {
        let mut session = self.sessions.remove(peer)?;
        self.by_endpoint.remove(&session.relay.reader.id());
        if let Some(timer) = session.timer.take() {
            timer.cancel();
        }
        session.received.clear();
        Some(session)
    }

    /// Relay readers of every session, all wanted.
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.sessions
            .values()
            .map(|session| session.relay.reader.subscription(true))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FrameError, MessageKind};
    use crate::reactor::{pipe, relay_pair, Role};
    use crate::session::timer::{TimerConfig, TimerService};
    use std::thread;
    use std::time::Duration;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn relay() -> RelayPair {
        relay_pair(Role::ComLink, Role::NetworkLink).unwrap().0
    }

    fn packet(text: &str) -> Message {
        Message::new(MessageKind::CommandReq, text.to_string()).into_packet()
    }

    #[test]
    fn test_single_packet_completes_immediately() {
        let mut table = SessionTable::new();
        table.insert(addr(1), relay());
        assert_eq!(table.get(&addr(1)).unwrap().required_packets, 1);

        let arrival = table.accept(&addr(1), packet("get a")).unwrap();
        assert_eq!(arrival, Arrival::Complete(packet("get a")));
        assert_eq!(table.get(&addr(1)).unwrap().buffered(), 0);
    }

    #[test]
    fn test_fewer_packets_never_deliver() {
        let mut table = SessionTable::new();
        table.insert(addr(2), relay()).required_packets = 3;

        assert_eq!(
            table.accept(&addr(2), packet("one")),
            Some(Arrival::Buffered { pending: 2 })
        );
        assert_eq!(
            table.accept(&addr(2), packet("two")),
            Some(Arrival::Buffered { pending: 1 })
        );
        assert_eq!(table.get(&addr(2)).unwrap().buffered(), 2);

        // The third completes the batch and only the newest payload survives
        assert_eq!(
            table.accept(&addr(2), packet("three")),
            Some(Arrival::Complete(packet("three")))
        );
        assert_eq!(table.get(&addr(2)).unwrap().buffered(), 0);
    }

    #[test]
    fn test_ping_is_never_buffered() {
        let mut table = SessionTable::new();
        table.insert(addr(3), relay()).required_packets = 2;

        table.accept(&addr(3), packet("first"));
        assert_eq!(table.accept(&addr(3), Message::ping()), Some(Arrival::Ping));
        assert_eq!(table.get(&addr(3)).unwrap().buffered(), 1);

        assert_eq!(
            table.accept(&addr(3), packet("second")),
            Some(Arrival::Complete(packet("second")))
        );
    }

    #[test]
    fn test_unknown_peer_is_not_an_error() {
        let mut table = SessionTable::new();
        assert_eq!(table.accept(&addr(4), packet("x")), None);
        assert!(table.remove(&addr(4)).is_none());
    }

    #[test]
    fn test_remove_clears_both_maps_once() {
        let mut table = SessionTable::new();
        let relay = relay();
        let endpoint = relay.reader.id();
        table.insert(addr(5), relay);
        assert_eq!(table.peer_for(endpoint), Some(addr(5)));
        assert_eq!(table.subscriptions().len(), 1);

        assert!(table.remove(&addr(5)).is_some());
        assert!(table.remove(&addr(5)).is_none());
        assert_eq!(table.peer_for(endpoint), None);
        assert!(table.is_empty());
    }

    #[test]
    fn test_touch_replaces_and_cancels_old_timer() {
        let service = TimerService::new(TimerConfig::default()).unwrap();
        let timers = service.timers();
        let (writer, mut reader) = pipe(Role::InternalLink).unwrap();

        let mut table = SessionTable::new();
        table.insert(addr(6), relay());

        let first = timers.schedule(addr(6), Duration::from_millis(40), writer.clone());
        assert!(table.touch(&addr(6), first));
        let second = timers.schedule(addr(6), Duration::from_millis(400), writer.clone());
        assert!(table.touch(&addr(6), second));
        assert!(table.get(&addr(6)).unwrap().has_timer());
        assert!(!table.is_expired(&addr(6)));

        // The first timer would have fired by now
        thread::sleep(Duration::from_millis(120));
        assert_eq!(reader.read_message(), Err(FrameError::Empty));

        // Removing the session cancels the second one too
        table.remove(&addr(6));
        thread::sleep(Duration::from_millis(400));
        assert_eq!(reader.read_message(), Err(FrameError::Empty));

        // Touching an unknown peer cancels the offered timer
        assert!(table.is_expired(&addr(7)));
        let stray = timers.schedule(addr(7), Duration::from_millis(20), writer.clone());
        assert!(!table.touch(&addr(7), stray));
        thread::sleep(Duration::from_millis(80));
        assert_eq!(reader.read_message(), Err(FrameError::Empty));
    }
}
