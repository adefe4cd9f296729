//! Piece availability bitfield
//!
//! One bit per piece, most significant bit first. Piece 0 is bit 7 of
//! byte 0. Spare bits in the final byte are always zero.

use anyhow::Result;

use crate::error::ShareError;

/// Tracks which pieces a peer (or we) can serve
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    num_pieces: usize,
}

impl Bitfield {
    /// Create an all-zero bitfield for the given piece count
    pub fn new(num_pieces: usize) -> Self {
        Self {
            bits: vec![0u8; num_pieces.div_ceil(8)],
            num_pieces,
        }
    }

    /// Build a bitfield from wire bytes, validating length and spare bits
    pub fn from_bytes(bytes: &[u8], num_pieces: usize) -> Result<Self> {
        let expected_len = num_pieces.div_ceil(8);
        if bytes.len() != expected_len {
            return Err(ShareError::protocol_error_with_source(
                "Bitfield length mismatch",
                format!("expected {} bytes for {} pieces, got {}", expected_len, num_pieces, bytes.len()),
            )
            .into());
        }

        let spare_bits = expected_len * 8 - num_pieces;
        if spare_bits > 0 {
            let mask = (1u8 << spare_bits) - 1;
            if bytes[expected_len - 1] & mask != 0 {
                return Err(ShareError::protocol_error("Bitfield spare bits must be zero").into());
            }
        }

        Ok(Self {
            bits: bytes.to_vec(),
            num_pieces,
        })
    }

    /// Check whether a piece bit is set
    pub fn has(&self, piece_index: usize) -> bool {
        if piece_index >= self.num_pieces {
            return false;
        }
        let byte_index = piece_index / 8;
        let bit_index = 7 - (piece_index % 8);
        self.bits[byte_index] & (1 << bit_index) != 0
    }

    /// Set a piece bit
    pub fn set(&mut self, piece_index: usize) {
        if piece_index >= self.num_pieces {
            return;
        }
        let byte_index = piece_index / 8;
        let bit_index = 7 - (piece_index % 8);
        self.bits[byte_index] |= 1 << bit_index;
    }

    /// Clear a piece bit
    pub fn clear(&mut self, piece_index: usize) {
        if piece_index >= self.num_pieces {
            return;
        }
        let byte_index = piece_index / 8;
        let bit_index = 7 - (piece_index % 8);
        self.bits[byte_index] &= !(1 << bit_index);
    }

    /// Number of pieces the bitfield covers
    pub fn num_pieces(&self) -> usize {
        self.num_pieces
    }

    /// Number of set bits
    pub fn count_set(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// True when every piece bit is set
    pub fn is_complete(&self) -> bool {
        self.count_set() == self.num_pieces
    }

    /// Indexes of pieces not yet present
    pub fn missing(&self) -> Vec<usize> {
        (0..self.num_pieces).filter(|&i| !self.has(i)).collect()
    }

    /// Wire representation
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_msb_first_layout() {
        let mut bf = Bitfield::new(10);
        bf.set(0);
        assert_eq!(bf.as_bytes()[0], 0b1000_0000);
        bf.set(1);
        assert_eq!(bf.as_bytes()[0], 0b1100_0000);
        bf.set(8);
        assert_eq!(bf.as_bytes()[1], 0b1000_0000);
    }

    #[test]
    fn test_set_has_clear() {
        let mut bf = Bitfield::new(5);
        assert!(!bf.has(3));
        bf.set(3);
        assert!(bf.has(3));
        bf.clear(3);
        assert!(!bf.has(3));
    }

    #[test]
    fn test_out_of_range_set_ignored() {
        let mut bf = Bitfield::new(5);
        bf.set(5);
        bf.set(100);
        assert_eq!(bf.count_set(), 0);
        assert!(!bf.has(100));
    }

    #[test]
    fn test_spare_bits_stay_zero() {
        let mut bf = Bitfield::new(10);
        for i in 0..10 {
            bf.set(i);
        }
        assert!(bf.is_complete());
        // 10 pieces use 2 bytes, the last 6 bits must be zero
        assert_eq!(bf.as_bytes()[1] & 0b0011_1111, 0);
    }

    #[test]
    fn test_from_bytes_validates_length() {
        assert!(Bitfield::from_bytes(&[0xff], 10).is_err());
        assert!(Bitfield::from_bytes(&[0xff, 0xc0, 0x00], 10).is_err());
        assert!(Bitfield::from_bytes(&[0xff, 0xc0], 10).is_ok());
    }

    #[test]
    fn test_from_bytes_rejects_dirty_spare_bits() {
        // 10 pieces: bits 10..15 of the second byte must be zero
        assert!(Bitfield::from_bytes(&[0xff, 0xc1], 10).is_err());
        assert!(Bitfield::from_bytes(&[0xff, 0xe0], 10).is_err());
    }

    #[test]
    fn test_missing() {
        let mut bf = Bitfield::new(4);
        bf.set(1);
        bf.set(3);
        assert_eq!(bf.missing(), vec![0, 2]);
    }

    #[test]
    fn test_exact_byte_boundary() {
        let mut bf = Bitfield::new(8);
        for i in 0..8 {
            bf.set(i);
        }
        assert!(bf.is_complete());
        assert_eq!(bf.as_bytes(), &[0xff]);
        assert!(Bitfield::from_bytes(&[0xff], 8).is_ok());
    }
}
