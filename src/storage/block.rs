//! Blocks and content-addressed block pointers
//!
//! A block is the 16 KiB transfer unit. Its pointer is derived from the
//! piece index, the block index within the piece, and the torrent's
//! info-hash, so the same block always lands at the same address no
//! matter which peer sent it.

use std::fmt;

use anyhow::Result;
use sha1::{Digest, Sha1};

use crate::error::ShareError;
use crate::torrent::BLOCK_LENGTH;

/// Content address of a single block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockPointer([u8; 20]);

impl BlockPointer {
    /// Derive the pointer for a block: SHA-1 over the decimal piece
    /// index, the decimal block index, and the hex info-hash
    pub fn derive(piece_index: u32, block_index: u32, info_hash: &[u8; 20]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(piece_index.to_string().as_bytes());
        hasher.update(block_index.to_string().as_bytes());
        hasher.update(hex::encode(info_hash).as_bytes());
        BlockPointer(hasher.finalize().into())
    }

    /// Raw digest bytes
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Hex form, as written to the block log
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for BlockPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// A received block, positioned by piece index and byte offset
#[derive(Debug, Clone)]
pub struct Block {
    pub piece_index: u32,
    pub begin: u32,
    pub data: Vec<u8>,
}

impl Block {
    /// Validate the block's position and size. `begin` must sit on a
    /// block boundary and the payload must not exceed the block length.
    pub fn new(piece_index: u32, begin: u32, data: Vec<u8>) -> Result<Self> {
        if begin as u64 % BLOCK_LENGTH != 0 {
            return Err(ShareError::protocol_error_with_source(
                "Block offset not on a block boundary",
                format!("begin: {}", begin),
            )
            .into());
        }
        if data.is_empty() || data.len() as u64 > BLOCK_LENGTH {
            return Err(ShareError::protocol_error_with_source(
                "Invalid block size",
                format!("size: {}", data.len()),
            )
            .into());
        }
        Ok(Self {
            piece_index,
            begin,
            data,
        })
    }

    /// Index of this block within its piece
    pub fn block_index(&self) -> u32 {
        (self.begin as u64 / BLOCK_LENGTH) as u32
    }

    /// Content address of this block under the given torrent identity
    pub fn pointer(&self, info_hash: &[u8; 20]) -> BlockPointer {
        BlockPointer::derive(self.piece_index, self.block_index(), info_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pointer_is_deterministic() {
        let info_hash = [0xabu8; 20];
        let a = BlockPointer::derive(1, 2, &info_hash);
        let b = BlockPointer::derive(1, 2, &info_hash);
        assert_eq!(a, b);
    }

    #[test]
    fn test_pointer_varies_with_inputs() {
        let info_hash = [0xabu8; 20];
        let base = BlockPointer::derive(1, 2, &info_hash);
        assert_ne!(base, BlockPointer::derive(2, 2, &info_hash));
        assert_ne!(base, BlockPointer::derive(1, 3, &info_hash));
        assert_ne!(base, BlockPointer::derive(1, 2, &[0xcdu8; 20]));
    }

    #[test]
    fn test_pointer_matches_manual_recipe() {
        let info_hash = [0x11u8; 20];
        let mut hasher = Sha1::new();
        hasher.update(b"3");
        hasher.update(b"7");
        hasher.update(hex::encode(info_hash).as_bytes());
        let expected: [u8; 20] = hasher.finalize().into();
        assert_eq!(BlockPointer::derive(3, 7, &info_hash).as_bytes(), &expected);
    }

    #[test]
    fn test_pointer_hex_length() {
        let ptr = BlockPointer::derive(0, 0, &[0u8; 20]);
        assert_eq!(ptr.to_hex().len(), 40);
        assert_eq!(ptr.to_string(), ptr.to_hex());
    }

    #[test]
    fn test_block_boundary_validation() {
        assert!(Block::new(0, 0, vec![1u8; 16]).is_ok());
        assert!(Block::new(0, 16 * 1024, vec![1u8; 16 * 1024]).is_ok());
        assert!(Block::new(0, 100, vec![1u8; 16]).is_err());
        assert!(Block::new(0, 0, vec![]).is_err());
        assert!(Block::new(0, 0, vec![1u8; 16 * 1024 + 1]).is_err());
    }

    #[test]
    fn test_block_index() {
        let block = Block::new(2, 32 * 1024, vec![1u8; 100]).unwrap();
        assert_eq!(block.block_index(), 2);
    }
}
