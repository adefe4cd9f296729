//! Peer wire protocol module
//!
//! Frame types, the session handshake, and the async framed codec used
//! by every peer session.

pub mod handshake;
pub mod message;
pub mod wire;

pub use handshake::{Handshake, PROTOCOL_LENGTH, PROTOCOL_STRING};
pub use message::{Message, MessageId};
pub use wire::{decode_frame, read_frame, read_handshake, write_frame, write_handshake, MAX_FRAME_LENGTH};
