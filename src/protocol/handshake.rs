//! Session handshake
//!
//! The fixed 68-byte preamble both ends exchange before any frames.

use anyhow::Result;
use bytes::{BufMut, BytesMut};
use tracing::{debug, error, trace, warn};

use crate::error::ShareError;

/// Protocol identifier string
pub const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// Length of the protocol string
pub const PROTOCOL_LENGTH: u8 = 19;

/// Total serialized handshake size
pub const HANDSHAKE_LENGTH: usize = 68;

/// Session handshake message
#[derive(Debug, Clone)]
pub struct Handshake {
    /// Protocol identifier (19 bytes)
    pub protocol_id: [u8; 19],
    /// Reserved bytes, always zero
    pub reserved: [u8; 8],
    /// Torrent identity
    pub info_hash: [u8; 20],
    /// Sender's peer ID
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// Create a new handshake for the given torrent and peer identity
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        debug!("Creating handshake for info_hash: {}", hex::encode(info_hash));
        Self {
            protocol_id: PROTOCOL_STRING.as_bytes().try_into()
                .unwrap_or([0u8; 19]),
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    /// Generate a random peer ID with a "-PS" client prefix
    pub fn generate_peer_id() -> [u8; 20] {
        let mut peer_id = [0u8; 20];
        peer_id[0..8].copy_from_slice(b"-PS0100-");
        peer_id[8..].copy_from_slice(&rand::random::<[u8; 12]>());
        debug!("Generated peer ID: {}", hex::encode(peer_id));
        peer_id
    }

    /// Serialize to the fixed 68-byte wire layout
    pub fn serialize(&self) -> Vec<u8> {
        trace!("Serializing handshake");
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LENGTH);
        buf.put_u8(PROTOCOL_LENGTH);
        buf.put_slice(&self.protocol_id);
        buf.put_slice(&self.reserved);
        buf.put_slice(&self.info_hash);
        buf.put_slice(&self.peer_id);
        buf.to_vec()
    }

    /// Deserialize from the fixed 68-byte wire layout
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        trace!("Deserializing handshake from {} bytes", data.len());

        if data.len() < HANDSHAKE_LENGTH {
            error!("Handshake too short: expected {} bytes, got {}", HANDSHAKE_LENGTH, data.len());
            return Err(ShareError::protocol_error_with_source(
                "Handshake too short",
                format!("expected {} bytes, got {}", HANDSHAKE_LENGTH, data.len()),
            )
            .into());
        }

        let protocol_length = data[0];
        if protocol_length != PROTOCOL_LENGTH {
            error!("Invalid protocol length: expected {}, got {}", PROTOCOL_LENGTH, protocol_length);
            return Err(ShareError::protocol_error_with_source(
                "Invalid protocol length",
                format!("expected {}, got {}", PROTOCOL_LENGTH, protocol_length),
            )
            .into());
        }

        let protocol_id: [u8; 19] = data[1..20].try_into()
            .map_err(|e: std::array::TryFromSliceError| {
                ShareError::protocol_error_with_source("Failed to read protocol_id", e.to_string())
            })?;

        if protocol_id != PROTOCOL_STRING.as_bytes() {
            error!("Invalid protocol string");
            return Err(ShareError::protocol_error("Invalid protocol string").into());
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);

        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);

        debug!(
            "Deserialized handshake: info_hash={}, peer_id={}",
            hex::encode(info_hash),
            hex::encode(peer_id)
        );
        Ok(Self {
            protocol_id,
            reserved,
            info_hash,
            peer_id,
        })
    }

    /// Validate the protocol string and info-hash against ours
    pub fn validate(&self, expected_info_hash: &[u8; 20]) -> bool {
        if self.protocol_id != PROTOCOL_STRING.as_bytes() {
            warn!("Handshake validation failed: invalid protocol identifier");
            return false;
        }

        if self.info_hash != *expected_info_hash {
            warn!(
                "Handshake validation failed: info-hash mismatch (expected {}, got {})",
                hex::encode(expected_info_hash),
                hex::encode(self.info_hash)
            );
            return false;
        }

        true
    }
}
