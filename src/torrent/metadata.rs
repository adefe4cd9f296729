//! Parsed metainfo for a single-file torrent
//!
//! The metadata is immutable after parsing. Peer sessions, the piece
//! store, and the DHT all key off the info-hash computed here.

use anyhow::Result;
use sha1::{Digest, Sha1};
use tracing::{debug, error, info};

use crate::error::ShareError;
use crate::torrent::parser::{BencodeValue, MetainfoParser};

/// Fixed transfer block size in bytes
pub const BLOCK_LENGTH: u64 = 16 * 1024;

/// High-level metainfo for a single-file torrent
#[derive(Debug, Clone)]
pub struct TorrentMetadata {
    /// Tracker announce URL carried by the metainfo (unused for discovery,
    /// the DHT replaces it, but kept for display)
    pub announce_url: String,
    /// Free-form comment
    pub comment: Option<String>,
    /// Creating client
    pub created_by: Option<String>,
    /// Creation time, seconds since the epoch
    pub creation_date: Option<i64>,
    /// File name, also the name of the finalized shared file
    pub file_name: String,
    /// Total file size in bytes
    pub file_length: u64,
    /// Size of each piece in bytes (last piece may be shorter)
    pub piece_length: u64,
    /// SHA-1 hash per piece
    pub pieces: Vec<[u8; 20]>,
    /// SHA-1 of the bencoded info dictionary, the torrent's identity
    pub info_hash: [u8; 20],
}

impl TorrentMetadata {
    /// Load and parse a metainfo file from disk
    pub fn load(path: &std::path::Path) -> Result<Self> {
        info!("Loading metainfo file from: {}", path.display());

        let data = std::fs::read(path).map_err(|e| {
            error!("Failed to read metainfo file '{}': {}", path.display(), e);
            ShareError::parse_error_with_source(
                format!("Failed to read metainfo file '{}'", path.display()),
                e.to_string(),
            )
        })?;

        debug!("Read {} bytes from metainfo file", data.len());
        Self::parse_bytes(&data)
    }

    /// Parse metainfo from raw bytes
    pub fn parse_bytes(data: &[u8]) -> Result<Self> {
        let (root, info_span) = MetainfoParser::parse_document(data)?;
        let root_dict = root
            .as_dict()
            .ok_or_else(|| ShareError::parse_error("Metainfo root must be a dictionary"))?;

        fn get_bytes<'a>(
            dict: &'a std::collections::BTreeMap<Vec<u8>, BencodeValue>,
            key: &[u8],
        ) -> Option<&'a [u8]> {
            dict.get(key).and_then(|v| v.as_bytes())
        }
        fn get_string(
            dict: &std::collections::BTreeMap<Vec<u8>, BencodeValue>,
            key: &[u8],
        ) -> Option<String> {
            get_bytes(dict, key).map(|b| String::from_utf8_lossy(b).to_string())
        }

        let announce_url = get_string(root_dict, b"announce")
            .ok_or_else(|| ShareError::parse_error("Missing announce field"))?;
        let comment = get_string(root_dict, b"comment");
        let created_by = get_string(root_dict, b"created by");
        let creation_date = root_dict.get(b"creation date".as_ref()).and_then(|v| v.as_int());

        let info_dict = root_dict
            .get(b"info".as_ref())
            .and_then(|v| v.as_dict())
            .ok_or_else(|| ShareError::parse_error("Missing info dictionary"))?;

        let file_name = get_string(info_dict, b"name")
            .ok_or_else(|| ShareError::parse_error("Missing name field"))?;

        if info_dict.contains_key(b"files".as_ref()) {
            return Err(ShareError::parse_error("Multi-file torrents are not supported").into());
        }

        let file_length = info_dict
            .get(b"length".as_ref())
            .and_then(|v| v.as_int())
            .filter(|&len| len >= 0)
            .ok_or_else(|| ShareError::parse_error("Missing or invalid length field"))?
            as u64;

        let piece_length = info_dict
            .get(b"piece length".as_ref())
            .and_then(|v| v.as_int())
            .filter(|&len| len > 0)
            .ok_or_else(|| ShareError::parse_error("Missing or invalid piece length"))?
            as u64;

        if piece_length % BLOCK_LENGTH != 0 {
            return Err(ShareError::parse_error(format!(
                "Piece length {} is not a multiple of the {} byte block length",
                piece_length, BLOCK_LENGTH
            ))
            .into());
        }

        let pieces_bytes = get_bytes(info_dict, b"pieces")
            .ok_or_else(|| ShareError::parse_error("Missing pieces field"))?;
        let pieces = Self::parse_piece_hashes(pieces_bytes)?;

        let expected_pieces = file_length.div_ceil(piece_length) as usize;
        if pieces.len() != expected_pieces {
            return Err(ShareError::parse_error(format!(
                "Piece count {} does not match file length {} with piece length {} (expected {})",
                pieces.len(),
                file_length,
                piece_length,
                expected_pieces
            ))
            .into());
        }

        // Hash the exact info bytes from the source buffer. Re-serializing
        // the parsed value could reorder or renormalize and change the hash.
        let (info_start, info_end) = info_span
            .ok_or_else(|| ShareError::parse_error("Missing info dictionary"))?;
        let info_hash = Self::generate_info_hash(&data[info_start..info_end]);

        info!(
            "Parsed metainfo: {} ({} bytes, {} pieces)",
            file_name,
            file_length,
            pieces.len()
        );
        Ok(TorrentMetadata {
            announce_url,
            comment,
            created_by,
            creation_date,
            file_name,
            file_length,
            piece_length,
            pieces,
            info_hash,
        })
    }

    /// Generate the info-hash from info dictionary bytes
    pub fn generate_info_hash(info_dict_bytes: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(info_dict_bytes);
        hasher.finalize().into()
    }

    /// Parse piece hashes from the concatenated `pieces` bytes
    pub fn parse_piece_hashes(pieces_bytes: &[u8]) -> Result<Vec<[u8; 20]>> {
        if pieces_bytes.len() % 20 != 0 {
            return Err(ShareError::parse_error(format!(
                "Pieces field length must be a multiple of 20, got {}",
                pieces_bytes.len()
            ))
            .into());
        }

        let mut pieces = Vec::new();
        for chunk in pieces_bytes.chunks_exact(20) {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(chunk);
            pieces.push(hash);
        }

        Ok(pieces)
    }

    /// Compare a handshake's info-hash against ours
    pub fn validate_info_hash(&self, candidate: &[u8; 20]) -> bool {
        &self.info_hash == candidate
    }

    /// Number of pieces in the torrent
    pub fn num_pieces(&self) -> usize {
        self.pieces.len()
    }

    /// SHA-1 hash for a specific piece index
    pub fn piece_hash(&self, index: usize) -> Option<[u8; 20]> {
        self.pieces.get(index).copied()
    }

    /// Actual length of a piece, accounting for a short final piece
    pub fn piece_len_at(&self, index: usize) -> Option<u64> {
        if index >= self.pieces.len() {
            return None;
        }
        let start = (index as u64) * self.piece_length;
        let end = std::cmp::min(start + self.piece_length, self.file_length);
        Some(end - start)
    }

    /// Number of blocks in a piece (the final block may be short)
    pub fn blocks_in_piece(&self, index: usize) -> Option<u32> {
        self.piece_len_at(index)
            .map(|len| len.div_ceil(BLOCK_LENGTH) as u32)
    }

    /// Actual length of a block within a piece
    pub fn block_len_at(&self, piece_index: usize, block_index: u32) -> Option<u64> {
        let piece_len = self.piece_len_at(piece_index)?;
        let blocks = self.blocks_in_piece(piece_index)?;
        if block_index >= blocks {
            return None;
        }
        let start = block_index as u64 * BLOCK_LENGTH;
        Some(std::cmp::min(BLOCK_LENGTH, piece_len - start))
    }

    /// Info-hash as a hex string
    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    /// Human-readable summary of the metainfo fields
    pub fn summary(&self) -> String {
        let mut out = format!(
            "name: {}\nsize: {} bytes\npieces: {} x {} bytes\ninfo-hash: {}\nannounce: {}",
            self.file_name,
            self.file_length,
            self.num_pieces(),
            self.piece_length,
            self.info_hash_hex(),
            self.announce_url,
        );
        if let Some(comment) = &self.comment {
            out.push_str(&format!("\ncomment: {}", comment));
        }
        if let Some(created_by) = &self.created_by {
            out.push_str(&format!("\ncreated by: {}", created_by));
        }
        if let Some(date) = self.creation_date {
            out.push_str(&format!("\ncreated at: {}", date));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a minimal single-file metainfo document
    pub(crate) fn build_metainfo(file_length: u64, piece_length: u64, num_pieces: usize) -> Vec<u8> {
        let mut pieces = Vec::new();
        for i in 0..num_pieces {
            pieces.extend_from_slice(&[i as u8; 20]);
        }
        let mut doc = Vec::new();
        doc.extend_from_slice(b"d8:announce20:udp://dht.local:6881");
        doc.extend_from_slice(b"4:infod");
        doc.extend_from_slice(format!("6:lengthi{}e", file_length).as_bytes());
        doc.extend_from_slice(b"4:name8:demo.bin");
        doc.extend_from_slice(format!("12:piece lengthi{}e", piece_length).as_bytes());
        doc.extend_from_slice(format!("6:pieces{}:", pieces.len()).as_bytes());
        doc.extend_from_slice(&pieces);
        doc.extend_from_slice(b"ee");
        doc
    }

    #[test]
    fn test_parse_minimal_metainfo() {
        let doc = build_metainfo(32 * 1024, 16 * 1024, 2);
        let meta = TorrentMetadata::parse_bytes(&doc).unwrap();
        assert_eq!(meta.file_name, "demo.bin");
        assert_eq!(meta.file_length, 32 * 1024);
        assert_eq!(meta.piece_length, 16 * 1024);
        assert_eq!(meta.num_pieces(), 2);
        assert_eq!(meta.announce_url, "udp://dht.local:6881");
    }

    #[test]
    fn test_info_hash_is_deterministic() {
        let doc = build_metainfo(32 * 1024, 16 * 1024, 2);
        let a = TorrentMetadata::parse_bytes(&doc).unwrap();
        let b = TorrentMetadata::parse_bytes(&doc).unwrap();
        assert_eq!(a.info_hash, b.info_hash);

        // Must equal SHA-1 over the raw info dict substring
        let start = doc.windows(4).position(|w| w == b"info").unwrap() + 4;
        let end = doc.len() - 1;
        let expected = TorrentMetadata::generate_info_hash(&doc[start..end]);
        assert_eq!(a.info_hash, expected);
    }

    #[test]
    fn test_piece_count_mismatch_rejected() {
        // 3 piece hashes for a 2-piece file
        let doc = build_metainfo(32 * 1024, 16 * 1024, 3);
        assert!(TorrentMetadata::parse_bytes(&doc).is_err());
    }

    #[test]
    fn test_uneven_piece_length_rejected() {
        let doc = build_metainfo(3000, 1000, 3);
        assert!(TorrentMetadata::parse_bytes(&doc).is_err());
    }

    #[test]
    fn test_short_last_piece() {
        let doc = build_metainfo(24 * 1024, 16 * 1024, 2);
        let meta = TorrentMetadata::parse_bytes(&doc).unwrap();
        assert_eq!(meta.piece_len_at(0), Some(16 * 1024));
        assert_eq!(meta.piece_len_at(1), Some(8 * 1024));
        assert_eq!(meta.piece_len_at(2), None);
        assert_eq!(meta.blocks_in_piece(0), Some(1));
        assert_eq!(meta.blocks_in_piece(1), Some(1));
    }

    #[test]
    fn test_block_len_at() {
        let doc = build_metainfo(40 * 1024, 32 * 1024, 2);
        let meta = TorrentMetadata::parse_bytes(&doc).unwrap();
        assert_eq!(meta.block_len_at(0, 0), Some(16 * 1024));
        assert_eq!(meta.block_len_at(0, 1), Some(16 * 1024));
        assert_eq!(meta.block_len_at(0, 2), None);
        // Last piece is 8 KiB, a single short block
        assert_eq!(meta.blocks_in_piece(1), Some(1));
        assert_eq!(meta.block_len_at(1, 0), Some(8 * 1024));
    }

    #[test]
    fn test_validate_info_hash() {
        let doc = build_metainfo(16 * 1024, 16 * 1024, 1);
        let meta = TorrentMetadata::parse_bytes(&doc).unwrap();
        let hash = meta.info_hash;
        assert!(meta.validate_info_hash(&hash));
        assert!(!meta.validate_info_hash(&[0u8; 20]));
    }

    #[test]
    fn test_parse_piece_hashes_invalid() {
        let hashes = vec![1u8; 21];
        assert!(TorrentMetadata::parse_piece_hashes(&hashes).is_err());
    }

    #[test]
    fn test_missing_announce_rejected() {
        let doc = b"d4:infod6:lengthi1e4:name1:a12:piece lengthi16384e6:pieces20:aaaaaaaaaaaaaaaaaaaaee";
        assert!(TorrentMetadata::parse_bytes(doc).is_err());
    }

    #[test]
    fn test_multi_file_rejected() {
        let doc = b"d8:announce3:url4:infod5:filesld6:lengthi1e4:pathl1:aeee4:name1:a12:piece lengthi16384e6:pieces20:aaaaaaaaaaaaaaaaaaaaee";
        assert!(TorrentMetadata::parse_bytes(doc).is_err());
    }

    #[test]
    fn test_summary_contains_fields() {
        let doc = build_metainfo(16 * 1024, 16 * 1024, 1);
        let meta = TorrentMetadata::parse_bytes(&doc).unwrap();
        let summary = meta.summary();
        assert!(summary.contains("demo.bin"));
        assert!(summary.contains(&meta.info_hash_hex()));
    }
}
