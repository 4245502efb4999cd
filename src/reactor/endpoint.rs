//! Endpoints
//!
//! An endpoint is a non-blocking OS channel the reactor can poll for
//! readability: one end of a pipe, or a UDP socket. Each endpoint carries a
//! process-unique [`EndpointId`] (its poll token) and a [`Role`] telling the
//! owning handler what kind of traffic arrives on it.
//!
//! ```text
//!   socket-facing handler                      peer handler
//!  ┌──────────────────────┐   pipe a   ┌──────────────────────┐
//!  │ RelayPair.writer ────┼───────────>│ RelayPair.reader     │
//!  │ RelayPair.reader <───┼────────────┼── RelayPair.writer   │
//!  └──────────────────────┘   pipe b   └──────────────────────┘
//! ```

use crate::protocol::{codec, FrameError, Message, MAX_FRAME_SIZE, PREFIX_LEN};
use mio::unix::pipe;
use mio::Token;
use std::fmt;
use std::io::{self, Read};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Token reserved for the reactor's waker.
pub const WAKER_TOKEN: Token = Token(0);

/// Receive buffer size for one datagram.
const DATAGRAM_BUFFER: usize = PREFIX_LEN + MAX_FRAME_SIZE;

static NEXT_ENDPOINT_ID: AtomicUsize = AtomicUsize::new(1);

/// What kind of traffic an endpoint carries, from its owner's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Lines typed by the local user
    ShellLink,
    /// Messages relayed between the socket handler and a peer handler
    ComLink,
    /// Datagrams from the network, or network traffic relayed to a peer handler
    NetworkLink,
    /// Timer and keepalive notifications
    InternalLink,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Process-unique endpoint identifier, doubling as the poll token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId(usize);

impl EndpointId {
    /// Allocates a fresh identifier. Never returns the waker token.
    pub fn next() -> Self {
        EndpointId(NEXT_ENDPOINT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn token(self) -> Token {
        Token(self.0)
    }

    pub fn from_token(token: Token) -> Self {
        EndpointId(token.0)
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ep#{}", self.0)
    }
}

/// One entry of a handler's subscription list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription {
    pub id: EndpointId,
    pub fd: RawFd,
    pub role: Role,
    /// Whether the handler currently wants readability events for it
    pub wanted: bool,
}

/// The reading end of a pipe.
#[derive(Debug)]
pub struct PipeReader {
    id: EndpointId,
    role: Role,
    rx: pipe::Receiver,
}

impl PipeReader {
    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn subscription(&self, wanted: bool) -> Subscription {
        Subscription {
            id: self.id,
            fd: self.rx.as_raw_fd(),
            role: self.role,
            wanted,
        }
    }

    /// Reads one framed message.
    pub fn read_message(&mut self) -> Result<Message, FrameError> {
        codec::read_message(&mut self.rx)
    }
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.rx.read(buf)
    }
}

/// The writing end of a pipe.
///
/// Clones share the underlying sender behind a mutex so frames written from
/// different threads never interleave.
#[derive(Debug, Clone)]
pub struct PipeWriter {
    tx: Arc<Mutex<pipe::Sender>>,
}

impl PipeWriter {
    /// Writes one framed message.
    pub fn write_message(&self, message: &Message) -> Result<(), FrameError> {
        let frame = codec::encode(message);
        self.write_frame(&frame)
    }

    /// Writes a pre-encoded frame.
    pub fn write_frame(&self, frame: &[u8]) -> Result<(), FrameError> {
        let mut tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        codec::write_frame(&mut *tx, frame)
    }

    /// Writes an already-serialized message body as one frame.
    pub fn write_body(&self, body: &[u8]) -> Result<(), FrameError> {
        let mut frame = Vec::with_capacity(PREFIX_LEN + body.len());
        frame.extend_from_slice(&(body.len() as u64).to_be_bytes());
        frame.extend_from_slice(body);
        self.write_frame(&frame)
    }
}

/// Creates a non-blocking pipe whose reading end carries `role`.
pub fn pipe(role: Role) -> io::Result<(PipeWriter, PipeReader)> {
    let (tx, rx) = pipe::new()?;
    let writer = PipeWriter {
        tx: Arc::new(Mutex::new(tx)),
    };
    let reader = PipeReader {
        id: EndpointId::next(),
        role,
        rx,
    };
    Ok((writer, reader))
}

/// One side of a bidirectional relay between two handlers.
#[derive(Debug)]
pub struct RelayPair {
    pub reader: PipeReader,
    pub writer: PipeWriter,
}

/// Creates two connected relay sides.
///
/// Whatever `left.writer` writes arrives on `right.reader` (tagged
/// `right_role`) and vice versa (tagged `left_role`).
pub fn relay_pair(left_role: Role, right_role: Role) -> io::Result<(RelayPair, RelayPair)> {
    let (to_right, right_reader) = pipe(right_role)?;
    let (to_left, left_reader) = pipe(left_role)?;
    Ok((
        RelayPair {
            reader: left_reader,
            writer: to_right,
        },
        RelayPair {
            reader: right_reader,
            writer: to_left,
        },
    ))
}

/// A raw datagram transport.
///
/// The core only needs to send bytes to an address, receive bytes with their
/// source, and hand the reactor a pollable descriptor.
pub trait Datagram: Send {
    fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
    fn local_addr(&self) -> io::Result<SocketAddr>;
    fn raw_fd(&self) -> RawFd;
}

impl Datagram for mio::net::UdpSocket {
    fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        mio::net::UdpSocket::send_to(self, buf, target)
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        mio::net::UdpSocket::recv_from(self, buf)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        mio::net::UdpSocket::local_addr(self)
    }

    fn raw_fd(&self) -> RawFd {
        self.as_raw_fd()
    }
}

/// A datagram socket speaking framed messages.
pub struct NetworkEndpoint<D: Datagram = mio::net::UdpSocket> {
    id: EndpointId,
    socket: D,
    buffer: Box<[u8]>,
}

impl NetworkEndpoint<mio::net::UdpSocket> {
    /// Binds a non-blocking UDP socket.
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        Ok(Self::new(mio::net::UdpSocket::bind(addr)?))
    }
}

impl<D: Datagram> NetworkEndpoint<D> {
    pub fn new(socket: D) -> Self {
        Self {
            id: EndpointId::next(),
            socket,
            buffer: vec![0u8; DATAGRAM_BUFFER].into_boxed_slice(),
        }
    }

    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn subscription(&self, wanted: bool) -> Subscription {
        Subscription {
            id: self.id,
            fd: self.socket.raw_fd(),
            role: Role::NetworkLink,
            wanted,
        }
    }

    /// Sends one message as one datagram.
    pub fn send(&self, message: &Message, peer: SocketAddr) -> Result<(), FrameError> {
        let frame = codec::encode(message);
        let sent = self.socket.send_to(&frame, peer)?;
        if sent != frame.len() {
            return Err(FrameError::ShortWrite {
                expected: frame.len(),
                written: sent,
            });
        }
        Ok(())
    }

    /// Receives one datagram.
    ///
    /// The outer error is the transport's; the inner result is the decoding
    /// of the datagram, so a malformed datagram still reports its source.
    pub fn receive(&mut self) -> Result<(SocketAddr, Result<Message, FrameError>), FrameError> {
        let (n, peer) = self.socket.recv_from(&mut self.buffer)?;
        Ok((peer, codec::decode_datagram(&self.buffer[..n])))
    }
}

impl<D: Datagram> fmt::Debug for NetworkEndpoint<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkEndpoint")
            .field("id", &self.id)
            .field("local_addr", &self.socket.local_addr().ok())
            .finish()
    }
}
