//! Message Envelope Types
//!
//! Every unit exchanged between handlers, whether over a relay pipe or inside
//! a UDP datagram, is a [`Message`]: a kind tag, an opaque payload and an
//! optional credential token.
//!
//! ## Body Layout
//!
//! ```text
//! ┌────────┬──────────────────┬──────────────────┬─────────────────┐
//! │ kind   │ credential len   │ credential bytes │ payload         │
//! │ 1 byte │ u16 BE           │ UTF-8            │ rest of body    │
//! └────────┴──────────────────┴──────────────────┴─────────────────┘
//! ```
//!
//! A credential length of `0xFFFF` marks an absent credential. The body is
//! what the framing codec wraps in a length prefix.
//!
//! ## Envelopes
//!
//! On the wire a datagram carries an envelope: a `Ping`, a `Close`, or a
//! `Packet` whose payload is the framed body of the inner message being
//! relayed (`CommandReq`, `CommandResp`, ...).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

use crate::protocol::codec::{self, FrameError};

/// Marker for "no credential" in the credential length field.
const NO_CREDENTIAL: u16 = u16::MAX;

/// The kind of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Liveness signal; refreshes the idle timer and is never forwarded.
    Ping,
    /// Datagram envelope around one inner message.
    Packet,
    /// A batch of command lines to execute.
    CommandReq,
    /// Output lines produced by a command batch.
    CommandResp,
    /// Names of scripts the server needs from the client.
    ScriptReq,
    /// The body of one requested script.
    ScriptResp,
    /// The other side is going away.
    Close,
    /// An idle timer fired for the peer named in the payload.
    Timeout,
    /// Keepalive ticker fired.
    Tick,
}

impl MessageKind {
    /// Returns the wire tag for this kind.
    pub fn to_byte(self) -> u8 {
        match self {
            MessageKind::Ping => 0x01,
            MessageKind::Packet => 0x02,
            MessageKind::CommandReq => 0x10,
            MessageKind::CommandResp => 0x11,
            MessageKind::ScriptReq => 0x12,
            MessageKind::ScriptResp => 0x13,
            MessageKind::Close => 0x20,
            MessageKind::Timeout => 0x30,
            MessageKind::Tick => 0x31,
        }
    }

    /// Parses a wire tag.
    pub fn from_byte(b: u8) -> Option<Self> {
        let kind = match b {
            0x01 => MessageKind::Ping,
            0x02 => MessageKind::Packet,
            0x10 => MessageKind::CommandReq,
            0x11 => MessageKind::CommandResp,
            0x12 => MessageKind::ScriptReq,
            0x13 => MessageKind::ScriptResp,
            0x20 => MessageKind::Close,
            0x30 => MessageKind::Timeout,
            0x31 => MessageKind::Tick,
            _ => return None,
        };
        Some(kind)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A typed envelope with an opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub payload: Bytes,
    pub credential: Option<String>,
}

impl Message {
    /// Creates a message without a credential.
    pub fn new(kind: MessageKind, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
            credential: None,
        }
    }

    /// Creates an empty message of the given kind.
    pub fn empty(kind: MessageKind) -> Self {
        Self::new(kind, Bytes::new())
    }

    pub fn ping() -> Self {
        Self::empty(MessageKind::Ping)
    }

    pub fn close() -> Self {
        Self::empty(MessageKind::Close)
    }

    /// Creates a message whose payload is a list of lines.
    pub fn lines<S: AsRef<str>>(kind: MessageKind, lines: &[S]) -> Self {
        let mut text = String::new();
        for (i, line) in lines.iter().enumerate() {
            if i > 0 {
                text.push('\n');
            }
            text.push_str(line.as_ref());
        }
        Self::new(kind, Bytes::from(text))
    }

    /// Attaches a credential token.
    pub fn with_credential(mut self, credential: Option<String>) -> Self {
        self.credential = credential;
        self
    }

    /// Wraps this message into a `Packet` envelope for a datagram.
    ///
    /// The envelope carries the credential; the inner message is framed
    /// as-is.
    pub fn into_packet(self) -> Self {
        let credential = self.credential.clone();
        let inner = codec::encode(&self);
        Self {
            kind: MessageKind::Packet,
            payload: inner.freeze(),
            credential,
        }
    }

    /// Unwraps the inner message of a `Packet` envelope.
    pub fn unwrap_packet(&self) -> Result<Message, FrameError> {
        codec::decode_datagram(&self.payload)
    }

    /// Returns the payload as UTF-8 text, replacing invalid sequences.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// Returns the payload split into non-empty lines.
    pub fn payload_lines(&self) -> Vec<String> {
        self.text()
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Returns true if this is a liveness-only message.
    pub fn is_ping(&self) -> bool {
        self.kind == MessageKind::Ping
    }

    /// Returns the size of the serialized body.
    pub fn body_len(&self) -> usize {
        let credential = self.credential.as_deref().map_or(0, |t| wire_credential(t).len());
        1 + 2 + credential + self.payload.len()
    }

    /// Serializes the message body (without the length prefix).
    pub fn serialize(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.body_len());
        self.serialize_into(&mut buf);
        buf
    }

    /// Serializes the message body into an existing buffer.
    pub fn serialize_into(&self, buf: &mut BytesMut) {
        buf.put_u8(self.kind.to_byte());
        match &self.credential {
            Some(token) => {
                let token = wire_credential(token);
                buf.put_u16(token.len() as u16);
                buf.put_slice(token.as_bytes());
            }
            None => buf.put_u16(NO_CREDENTIAL),
        }
        buf.put_slice(&self.payload);
    }

    /// Parses a message body produced by [`Message::serialize`].
    pub fn deserialize(body: Bytes) -> Result<Self, FrameError> {
        let mut body = body;
        if body.remaining() < 3 {
            return Err(FrameError::Malformed("body shorter than header".into()));
        }

        let tag = body.get_u8();
        let kind = MessageKind::from_byte(tag).ok_or(FrameError::UnknownKind(tag))?;

        let credential = match body.get_u16() {
            NO_CREDENTIAL => None,
            len => {
                let len = len as usize;
                if body.remaining() < len {
                    return Err(FrameError::Malformed("credential overruns body".into()));
                }
                let raw = body.split_to(len);
                let token = std::str::from_utf8(&raw)
                    .map_err(|e| FrameError::Malformed(format!("credential: {}", e)))?;
                Some(token.to_string())
            }
        };

        Ok(Self {
            kind,
            payload: body,
            credential,
        })
    }
}

/// The part of a token that fits the credential field.
///
/// Tokens longer than the field are truncated at a char boundary.
fn wire_credential(token: &str) -> &str {
    let mut end = token.len().min(NO_CREDENTIAL as usize - 1);
    while !token.is_char_boundary(end) {
        end -= 1;
    }
    &token[..end]
}
