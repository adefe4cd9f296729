//! Peer wire messages
//!
//! Length-prefixed frames exchanged after the handshake. Payload lengths
//! are checked strictly: a frame whose payload does not match its id is a
//! protocol error, not a best-effort parse.

use anyhow::Result;
use bytes::{Buf, BufMut, BytesMut};
use tracing::{debug, error, trace};

use crate::error::ShareError;

/// Wire message IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
}

impl TryFrom<u8> for MessageId {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            8 => Ok(MessageId::Cancel),
            9 => Ok(MessageId::Port),
            _ => {
                error!("Invalid message ID: {}", value);
                Err(ShareError::protocol_error_with_source(
                    "Invalid message ID",
                    format!("value: {}", value),
                )
                .into())
            }
        }
    }
}

/// A peer wire frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: u32 },
    Bitfield { bits: Vec<u8> },
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
    Port { dht_port: u16 },
}

impl Message {
    /// Message ID for this frame (None for KeepAlive)
    pub fn message_id(&self) -> Option<MessageId> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(MessageId::Choke),
            Message::Unchoke => Some(MessageId::Unchoke),
            Message::Interested => Some(MessageId::Interested),
            Message::NotInterested => Some(MessageId::NotInterested),
            Message::Have { .. } => Some(MessageId::Have),
            Message::Bitfield { .. } => Some(MessageId::Bitfield),
            Message::Request { .. } => Some(MessageId::Request),
            Message::Piece { .. } => Some(MessageId::Piece),
            Message::Cancel { .. } => Some(MessageId::Cancel),
            Message::Port { .. } => Some(MessageId::Port),
        }
    }

    /// Frame length excluding the 4-byte length prefix
    pub fn length(&self) -> u32 {
        match self {
            Message::KeepAlive => 0,
            Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => 1,
            Message::Have { .. } => 5,
            Message::Bitfield { bits } => 1 + bits.len() as u32,
            Message::Request { .. } | Message::Cancel { .. } => 13,
            Message::Piece { block, .. } => 9 + block.len() as u32,
            Message::Port { .. } => 3,
        }
    }

    /// Serialize the frame, including the length prefix
    pub fn serialize(&self) -> Vec<u8> {
        trace!("Serializing frame: {:?}", self.message_id());
        let mut buf = BytesMut::with_capacity(4 + self.length() as usize);

        buf.put_u32(self.length());

        match self {
            Message::KeepAlive => {}
            Message::Choke => buf.put_u8(MessageId::Choke as u8),
            Message::Unchoke => buf.put_u8(MessageId::Unchoke as u8),
            Message::Interested => buf.put_u8(MessageId::Interested as u8),
            Message::NotInterested => buf.put_u8(MessageId::NotInterested as u8),
            Message::Have { piece_index } => {
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(*piece_index);
            }
            Message::Bitfield { bits } => {
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put_slice(bits);
            }
            Message::Request { index, begin, length } => {
                buf.put_u8(MessageId::Request as u8);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Piece { index, begin, block } => {
                buf.put_u8(MessageId::Piece as u8);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(block);
            }
            Message::Cancel { index, begin, length } => {
                buf.put_u8(MessageId::Cancel as u8);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Port { dht_port } => {
                buf.put_u8(MessageId::Port as u8);
                buf.put_u16(*dht_port);
            }
        }

        buf.to_vec()
    }

    /// Deserialize a frame, including the length prefix
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let mut buf = BytesMut::from(data);

        if buf.remaining() < 4 {
            return Err(ShareError::protocol_error("Frame shorter than length prefix").into());
        }

        let length = buf.get_u32() as usize;

        if length == 0 {
            return Ok(Message::KeepAlive);
        }

        if buf.remaining() != length {
            error!(
                "Frame payload length mismatch: prefix says {}, got {}",
                length,
                buf.remaining()
            );
            return Err(ShareError::protocol_error_with_source(
                "Frame payload length mismatch",
                format!("prefix: {}, payload: {}", length, buf.remaining()),
            )
            .into());
        }

        let id = buf.get_u8();
        let message_id = MessageId::try_from(id)?;
        debug!("Deserializing frame id {:?} ({} payload bytes)", message_id, length - 1);

        let payload_err = |expected: &str| {
            ShareError::protocol_error_with_source(
                format!("Invalid payload for {:?}", message_id),
                format!("expected {}, got {} bytes", expected, length - 1),
            )
        };

        match message_id {
            MessageId::Choke => Ok(Message::Choke),
            MessageId::Unchoke => Ok(Message::Unchoke),
            MessageId::Interested => Ok(Message::Interested),
            MessageId::NotInterested => Ok(Message::NotInterested),
            MessageId::Have => {
                if buf.remaining() != 4 {
                    return Err(payload_err("4 bytes").into());
                }
                Ok(Message::Have { piece_index: buf.get_u32() })
            }
            MessageId::Bitfield => Ok(Message::Bitfield { bits: buf.to_vec() }),
            MessageId::Request => {
                if buf.remaining() != 12 {
                    return Err(payload_err("12 bytes").into());
                }
                Ok(Message::Request {
                    index: buf.get_u32(),
                    begin: buf.get_u32(),
                    length: buf.get_u32(),
                })
            }
            MessageId::Piece => {
                if buf.remaining() < 8 {
                    return Err(payload_err("at least 8 bytes").into());
                }
                Ok(Message::Piece {
                    index: buf.get_u32(),
                    begin: buf.get_u32(),
                    block: buf.to_vec(),
                })
            }
            MessageId::Cancel => {
                if buf.remaining() != 12 {
                    return Err(payload_err("12 bytes").into());
                }
                Ok(Message::Cancel {
                    index: buf.get_u32(),
                    begin: buf.get_u32(),
                    length: buf.get_u32(),
                })
            }
            MessageId::Port => {
                if buf.remaining() != 2 {
                    return Err(payload_err("2 bytes").into());
                }
                Ok(Message::Port { dht_port: buf.get_u16() })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keepalive_is_four_zero_bytes() {
        let serialized = Message::KeepAlive.serialize();
        assert_eq!(serialized, vec![0, 0, 0, 0]);
        assert_eq!(Message::deserialize(&serialized).unwrap(), Message::KeepAlive);
    }

    #[test]
    fn test_choke_round_trip() {
        let serialized = Message::Choke.serialize();
        assert_eq!(serialized, vec![0, 0, 0, 1, 0]);
        assert_eq!(Message::deserialize(&serialized).unwrap(), Message::Choke);
    }

    #[test]
    fn test_have_round_trip() {
        let message = Message::Have { piece_index: 42 };
        let deserialized = Message::deserialize(&message.serialize()).unwrap();
        assert_eq!(deserialized, message);
    }

    #[test]
    fn test_request_round_trip() {
        let message = Message::Request { index: 1, begin: 16384, length: 16384 };
        let deserialized = Message::deserialize(&message.serialize()).unwrap();
        assert_eq!(deserialized, message);
    }

    #[test]
    fn test_piece_round_trip() {
        let message = Message::Piece { index: 10, begin: 0, block: vec![1, 2, 3, 4, 5] };
        let deserialized = Message::deserialize(&message.serialize()).unwrap();
        assert_eq!(deserialized, message);
    }

    #[test]
    fn test_port_round_trip() {
        let message = Message::Port { dht_port: 6881 };
        let deserialized = Message::deserialize(&message.serialize()).unwrap();
        assert_eq!(deserialized, message);
    }

    #[test]
    fn test_frame_lengths() {
        assert_eq!(Message::KeepAlive.length(), 0);
        assert_eq!(Message::Choke.length(), 1);
        assert_eq!(Message::Have { piece_index: 0 }.length(), 5);
        assert_eq!(Message::Request { index: 0, begin: 0, length: 0 }.length(), 13);
        assert_eq!(Message::Piece { index: 0, begin: 0, block: vec![1, 2, 3] }.length(), 12);
        assert_eq!(Message::Port { dht_port: 0 }.length(), 3);
    }

    #[test]
    fn test_truncated_have_rejected() {
        // Have with a 2-byte payload
        let data = vec![0, 0, 0, 3, 4, 0, 0];
        assert!(Message::deserialize(&data).is_err());
    }

    #[test]
    fn test_payload_length_mismatch_rejected() {
        // Prefix claims 5 bytes, only 2 present
        let data = vec![0, 0, 0, 5, 4, 0];
        assert!(Message::deserialize(&data).is_err());
    }

    #[test]
    fn test_unknown_id_rejected() {
        let data = vec![0, 0, 0, 1, 10];
        assert!(Message::deserialize(&data).is_err());
        assert!(MessageId::try_from(10).is_err());
    }

    #[test]
    fn test_message_id_table() {
        assert_eq!(MessageId::try_from(0).unwrap(), MessageId::Choke);
        assert_eq!(MessageId::try_from(5).unwrap(), MessageId::Bitfield);
        assert_eq!(MessageId::try_from(9).unwrap(), MessageId::Port);
    }
}
