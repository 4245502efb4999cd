//! Length-Prefixed Framing Codec
//!
//! One message per frame:
//!
//! ```text
//! ┌──────────────────────────┬──────────────────────────────┐
//! │ length prefix            │ message body                 │
//! │ u64 big-endian (8 bytes) │ exactly `length` bytes       │
//! └──────────────────────────┴──────────────────────────────┘
//! ```
//!
//! ## Partial I/O
//!
//! The codec issues exactly one read call for the prefix and one for the
//! body, and one write call for the whole frame. It does not retry partial
//! transfers: a short read or write is reported as a transport error and the
//! caller discards whatever was in flight. This is sound for the local pipe
//! endpoints (frames below `PIPE_BUF` are written atomically and the reader
//! is only woken once data is there) and for datagrams (a datagram arrives
//! whole or not at all). It is not sound for arbitrary byte streams.
//!
//! Frames larger than [`MAX_FRAME_SIZE`] are rejected on read. Writers are
//! expected to stay well below it; nothing splits large messages.

use crate::protocol::message::Message;
use bytes::{BufMut, Bytes, BytesMut};
use std::io::{self, Read, Write};
use thiserror::Error;

/// Width of the length prefix: one reference-width integer.
pub const PREFIX_LEN: usize = std::mem::size_of::<u64>();

/// Largest body accepted by the reader (one pipe buffer).
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Errors raised while framing or unframing a message.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FrameError {
    /// Nothing was available to read (spurious wake-up)
    #[error("no data available")]
    Empty,

    /// The endpoint reported end of stream
    #[error("endpoint closed")]
    Closed,

    /// Fewer bytes than requested came back from one read call
    #[error("short read: expected {expected} bytes, got {got}")]
    ShortRead { expected: usize, got: usize },

    /// Fewer bytes than the frame were accepted by one write call
    #[error("short write: expected {expected} bytes, wrote {written}")]
    ShortWrite { expected: usize, written: usize },

    /// The prefix announces a body larger than the reader accepts
    #[error("frame too large: {size} bytes (max: {max})")]
    TooLarge { size: usize, max: usize },

    /// The body carries a kind tag this build does not know
    #[error("unknown message kind: {0:#04x}")]
    UnknownKind(u8),

    /// The body is structurally invalid
    #[error("malformed message: {0}")]
    Malformed(String),

    /// Any other I/O failure
    #[error("I/O error: {0}")]
    Io(io::ErrorKind),
}

impl FrameError {
    /// Returns true for errors caused by the peer's data rather than the
    /// transport.
    pub fn is_protocol(&self) -> bool {
        matches!(self, FrameError::UnknownKind(_) | FrameError::Malformed(_))
    }
}

impl From<io::Error> for FrameError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::WouldBlock => FrameError::Empty,
            io::ErrorKind::UnexpectedEof | io::ErrorKind::BrokenPipe => FrameError::Closed,
            kind => FrameError::Io(kind),
        }
    }
}

/// Encodes a message into a complete frame (prefix + body).
pub fn encode(message: &Message) -> BytesMut {
    let body_len = message.body_len();
    let mut buf = BytesMut::with_capacity(PREFIX_LEN + body_len);
    buf.put_u64(body_len as u64);
    message.serialize_into(&mut buf);
    buf
}

/// Writes an already-encoded frame with a single write call.
pub fn write_frame<W: Write>(writer: &mut W, frame: &[u8]) -> Result<(), FrameError> {
    let written = writer.write(frame)?;
    if written != frame.len() {
        return Err(FrameError::ShortWrite {
            expected: frame.len(),
            written,
        });
    }
    Ok(())
}

/// Encodes and writes one message.
pub fn write_message<W: Write>(writer: &mut W, message: &Message) -> Result<(), FrameError> {
    write_frame(writer, &encode(message))
}

/// Reads one message: one read for the prefix, one for the body.
pub fn read_message<R: Read>(reader: &mut R) -> Result<Message, FrameError> {
    let mut prefix = [0u8; PREFIX_LEN];
    let got = reader.read(&mut prefix)?;
    if got == 0 {
        return Err(FrameError::Closed);
    }
    if got != PREFIX_LEN {
        return Err(FrameError::ShortRead {
            expected: PREFIX_LEN,
            got,
        });
    }

    let size = u64::from_be_bytes(prefix);
    if size > MAX_FRAME_SIZE as u64 {
        return Err(FrameError::TooLarge {
            size: size as usize,
            max: MAX_FRAME_SIZE,
        });
    }
    let size = size as usize;

    let mut body = vec![0u8; size];
    if size > 0 {
        let got = match reader.read(&mut body) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => 0,
            Err(e) => return Err(e.into()),
        };
        if got != size {
            return Err(FrameError::ShortRead {
                expected: size,
                got,
            });
        }
    }

    Message::deserialize(Bytes::from(body))
}

/// Decodes a message from one received datagram.
pub fn decode_datagram(datagram: &[u8]) -> Result<Message, FrameError> {
    let mut cursor = datagram;
    let message = read_message(&mut cursor)?;
    if !cursor.is_empty() {
        return Err(FrameError::Malformed(format!(
            "{} trailing bytes after frame",
            cursor.len()
        )));
    }
    Ok(message)
}
