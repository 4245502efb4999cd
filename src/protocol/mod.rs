//! Wire Protocol
//!
//! This module provides the message envelope and the framing codec shared
//! by every handler.
//!
//! ## Modules
//!
//! - `message`: the `Message` envelope and its body serialization
//! - `codec`: length-prefixed framing over pipes and datagrams
//!
//! ## Example
//!
//! ```
//! use relay::protocol::{read_message, write_message, Message, MessageKind};
//! use std::io::Cursor;
//!
//! let request = Message::new(MessageKind::CommandReq, "get name");
//!
//! let mut wire = Vec::new();
//! write_message(&mut wire, &request).unwrap();
//!
//! let decoded = read_message(&mut Cursor::new(wire)).unwrap();
//! assert_eq!(decoded, request);
//! ```

pub mod codec;
pub mod message;

// Re-export commonly used types for convenience
pub use codec::{
    decode_datagram, encode, read_message, write_frame, write_message, FrameError,
    MAX_FRAME_SIZE, PREFIX_LEN,
};
pub use message::{Message, MessageKind};
