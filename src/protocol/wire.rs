//! Framed async IO for the peer wire protocol
//!
//! Length-prefixed reads and writes over any async stream. Sessions use
//! these over TcpStream; tests use them over in-memory duplex pipes.

use anyhow::Result;
use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::ShareError;
use crate::protocol::handshake::HANDSHAKE_LENGTH;
use crate::protocol::{Handshake, Message};

/// Upper bound for a single frame's declared payload length.
/// The largest legitimate frame is a piece frame with one 16 KiB block;
/// anything near this cap is a corrupt or hostile prefix.
pub const MAX_FRAME_LENGTH: usize = 64 * 1024;

/// Read one complete length-prefixed frame from the stream
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Message> {
    let mut length_buf = [0u8; 4];
    reader.read_exact(&mut length_buf).await?;
    let length = u32::from_be_bytes(length_buf) as usize;

    if length == 0 {
        return Ok(Message::KeepAlive);
    }

    if length > MAX_FRAME_LENGTH {
        return Err(ShareError::protocol_error_with_source(
            "Frame length exceeds limit",
            format!("length: {}, limit: {}", length, MAX_FRAME_LENGTH),
        )
        .into());
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;

    let mut frame = BytesMut::with_capacity(4 + length);
    frame.put_slice(&length_buf);
    frame.put_slice(&payload);

    Message::deserialize(&frame)
}

/// Extract one complete frame from the front of a read buffer.
///
/// Returns None while only part of a frame has arrived, leaving the
/// buffered bytes in place. Session read loops accumulate into the
/// buffer with cancel-safe reads and drain frames through here, so a
/// timer firing mid-frame never loses consumed bytes.
pub fn decode_frame(buf: &mut BytesMut) -> Result<Option<Message>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if length == 0 {
        buf.advance(4);
        return Ok(Some(Message::KeepAlive));
    }

    if length > MAX_FRAME_LENGTH {
        return Err(ShareError::protocol_error_with_source(
            "Frame length exceeds limit",
            format!("length: {}, limit: {}", length, MAX_FRAME_LENGTH),
        )
        .into());
    }

    if buf.len() < 4 + length {
        return Ok(None);
    }

    let frame = buf.split_to(4 + length);
    Message::deserialize(&frame).map(Some)
}

/// Write one frame to the stream
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, message: &Message) -> Result<()> {
    let serialized = message.serialize();
    writer.write_all(&serialized).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the fixed-size handshake from the stream
pub async fn read_handshake<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Handshake> {
    let mut buf = [0u8; HANDSHAKE_LENGTH];
    reader.read_exact(&mut buf).await?;
    Handshake::deserialize(&buf)
}

/// Write the handshake to the stream
pub async fn write_handshake<W: AsyncWriteExt + Unpin>(writer: &mut W, handshake: &Handshake) -> Result<()> {
    let serialized = handshake.serialize();
    writer.write_all(&serialized).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_round_trip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        let message = Message::Request { index: 3, begin: 0, length: 16384 };
        write_frame(&mut a, &message).await.unwrap();

        let received = read_frame(&mut b).await.unwrap();
        assert_eq!(received, message);
    }

    #[tokio::test]
    async fn test_keepalive_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(64);

        write_frame(&mut a, &Message::KeepAlive).await.unwrap();
        let received = read_frame(&mut b).await.unwrap();
        assert_eq!(received, Message::KeepAlive);
    }

    #[tokio::test]
    async fn test_handshake_round_trip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(128);

        let handshake = Handshake::new([7u8; 20], [9u8; 20]);
        write_handshake(&mut a, &handshake).await.unwrap();

        let received = read_handshake(&mut b).await.unwrap();
        assert_eq!(received.info_hash, handshake.info_hash);
        assert_eq!(received.peer_id, handshake.peer_id);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);

        let prefix = ((MAX_FRAME_LENGTH + 1) as u32).to_be_bytes();
        a.write_all(&prefix).await.unwrap();

        assert!(read_frame(&mut b).await.is_err());
    }

    #[test]
    fn test_decode_frame_waits_for_full_frame() {
        let message = Message::Request { index: 1, begin: 0, length: 16384 };
        let serialized = message.serialize();

        // Partial prefix, then partial payload, then the rest: the
        // buffer must hold its bytes until the frame is whole
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&serialized[..2]);
        assert!(decode_frame(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&serialized[2..7]);
        assert!(decode_frame(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 7);

        buf.extend_from_slice(&serialized[7..]);
        assert_eq!(decode_frame(&mut buf).unwrap(), Some(message));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_frame_drains_back_to_back_frames() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&Message::KeepAlive.serialize());
        buf.extend_from_slice(&Message::Have { piece_index: 2 }.serialize());

        assert_eq!(decode_frame(&mut buf).unwrap(), Some(Message::KeepAlive));
        assert_eq!(decode_frame(&mut buf).unwrap(), Some(Message::Have { piece_index: 2 }));
        assert_eq!(decode_frame(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_decode_frame_rejects_oversized_prefix() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&((MAX_FRAME_LENGTH + 1) as u32).to_be_bytes());
        assert!(decode_frame(&mut buf).is_err());
    }

    #[tokio::test]
    async fn test_multiple_frames_in_sequence() {
        let (mut a, mut b) = tokio::io::duplex(4096);

        write_frame(&mut a, &Message::Interested).await.unwrap();
        write_frame(&mut a, &Message::Unchoke).await.unwrap();
        write_frame(&mut a, &Message::Have { piece_index: 5 }).await.unwrap();

        assert_eq!(read_frame(&mut b).await.unwrap(), Message::Interested);
        assert_eq!(read_frame(&mut b).await.unwrap(), Message::Unchoke);
        assert_eq!(read_frame(&mut b).await.unwrap(), Message::Have { piece_index: 5 });
    }
}
