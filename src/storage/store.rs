//! Piece store
//!
//! Blocks arrive out of order and land in an append-only block log,
//! addressed by their content pointer. Once every block of a piece is
//! present the piece is reassembled, hash-checked, and only then written
//! into the pre-sized working file. The finished file is moved into the
//! shared directory in one rename.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use sha1::{Digest, Sha1};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::error::ShareError;
use crate::peer::Bitfield;
use crate::storage::block::{Block, BlockPointer};
use crate::torrent::TorrentMetadata;

/// Separator between a pointer and its block bytes in the log
const LOG_DELIMITER: &[u8] = b"$$$";

/// Location of one block's bytes inside the log file
#[derive(Debug, Clone, Copy)]
struct LogEntry {
    offset: u64,
    length: u32,
}

struct StoreInner {
    log_file: fs::File,
    log_len: u64,
    index: HashMap<BlockPointer, LogEntry>,
    bitfield: Bitfield,
}

/// Single-torrent block and piece storage
pub struct PieceStore {
    metadata: Arc<TorrentMetadata>,
    tmp_path: PathBuf,
    log_path: PathBuf,
    inner: Mutex<StoreInner>,
}

impl PieceStore {
    /// Create the working files for a fresh session: a sparse tmp file
    /// sized to the full download and an empty block log
    pub async fn create(work_dir: &Path, metadata: Arc<TorrentMetadata>) -> Result<Self> {
        info!(
            "Creating piece store for {} in {}",
            metadata.file_name,
            work_dir.display()
        );

        fs::create_dir_all(work_dir).await.map_err(|e| {
            error!("Failed to create work directory '{}': {}", work_dir.display(), e);
            ShareError::transport_error_full(
                "Failed to create work directory",
                work_dir.display().to_string(),
                e.to_string(),
            )
        })?;

        let tmp_path = work_dir.join(format!("{}.tmp", metadata.file_name));
        let log_path = work_dir.join(format!("{}.blocks", metadata.info_hash_hex()));

        let mut tmp_file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .await
            .map_err(|e| {
                error!("Failed to create tmp file '{}': {}", tmp_path.display(), e);
                ShareError::transport_error_full(
                    "Failed to create tmp file",
                    tmp_path.display().to_string(),
                    e.to_string(),
                )
            })?;
        tmp_file.set_len(metadata.file_length).await.map_err(|e| {
            ShareError::transport_error_full(
                "Failed to size tmp file",
                tmp_path.display().to_string(),
                e.to_string(),
            )
        })?;
        tmp_file.flush().await?;

        let log_file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&log_path)
            .await
            .map_err(|e| {
                error!("Failed to create block log '{}': {}", log_path.display(), e);
                ShareError::transport_error_full(
                    "Failed to create block log",
                    log_path.display().to_string(),
                    e.to_string(),
                )
            })?;

        let bitfield = Bitfield::new(metadata.num_pieces());
        debug!(
            "Piece store ready: {} pieces, tmp file sized to {} bytes",
            metadata.num_pieces(),
            metadata.file_length
        );

        Ok(Self {
            metadata,
            tmp_path,
            log_path,
            inner: Mutex::new(StoreInner {
                log_file,
                log_len: 0,
                index: HashMap::new(),
                bitfield,
            }),
        })
    }

    /// Append a block to the log. Returns false if the same block was
    /// already stored; re-writes of a pointer are a no-op.
    pub async fn write_block(&self, block: Block) -> Result<bool> {
        let piece_index = block.piece_index;
        let block_index = block.block_index();

        let expected_len = self
            .metadata
            .block_len_at(piece_index as usize, block_index)
            .ok_or_else(|| {
                ShareError::protocol_error_with_source(
                    "Block outside torrent bounds",
                    format!("piece: {}, block: {}", piece_index, block_index),
                )
            })?;
        if block.data.len() as u64 != expected_len {
            return Err(ShareError::protocol_error_with_source(
                "Block size mismatch",
                format!(
                    "piece: {}, block: {}, expected {} bytes, got {}",
                    piece_index,
                    block_index,
                    expected_len,
                    block.data.len()
                ),
            )
            .into());
        }

        let pointer = block.pointer(&self.metadata.info_hash);
        let mut inner = self.inner.lock().await;

        if inner.index.contains_key(&pointer) {
            trace!("Block {} already stored, skipping", pointer);
            return Ok(false);
        }

        let header = pointer.to_hex();
        let data_offset = inner.log_len + header.len() as u64 + LOG_DELIMITER.len() as u64;

        inner.log_file.write_all(header.as_bytes()).await?;
        inner.log_file.write_all(LOG_DELIMITER).await?;
        inner.log_file.write_all(&block.data).await?;
        inner.log_file.write_all(b"\n").await?;
        inner.log_file.flush().await?;

        inner.log_len = data_offset + block.data.len() as u64 + 1;
        inner.index.insert(
            pointer,
            LogEntry {
                offset: data_offset,
                length: block.data.len() as u32,
            },
        );

        trace!(
            "Stored block {} (piece {}, block {}, {} bytes)",
            pointer,
            piece_index,
            block_index,
            block.data.len()
        );
        Ok(true)
    }

    /// Number of distinct blocks in the log
    pub async fn distinct_blocks(&self) -> usize {
        self.inner.lock().await.index.len()
    }

    /// Block indexes of a piece that have not arrived yet
    pub async fn missing_blocks(&self, piece_index: u32) -> Result<Vec<u32>> {
        let blocks = self
            .metadata
            .blocks_in_piece(piece_index as usize)
            .ok_or_else(|| {
                ShareError::protocol_error_with_source(
                    "Piece index out of range",
                    format!("piece: {}", piece_index),
                )
            })?;

        let inner = self.inner.lock().await;
        Ok((0..blocks)
            .filter(|&b| {
                let ptr = BlockPointer::derive(piece_index, b, &self.metadata.info_hash);
                !inner.index.contains_key(&ptr)
            })
            .collect())
    }

    /// Reassemble a piece from logged blocks, in block order
    pub async fn assemble_piece(&self, piece_index: u32) -> Result<Vec<u8>> {
        let inner = self.inner.lock().await;
        self.assemble_locked(&inner, piece_index).await
    }

    async fn assemble_locked(&self, inner: &StoreInner, piece_index: u32) -> Result<Vec<u8>> {
        let blocks = self
            .metadata
            .blocks_in_piece(piece_index as usize)
            .ok_or_else(|| {
                ShareError::protocol_error_with_source(
                    "Piece index out of range",
                    format!("piece: {}", piece_index),
                )
            })?;

        let mut entries = Vec::with_capacity(blocks as usize);
        let mut missing = 0usize;
        for b in 0..blocks {
            let ptr = BlockPointer::derive(piece_index, b, &self.metadata.info_hash);
            match inner.index.get(&ptr) {
                Some(entry) => entries.push(*entry),
                None => missing += 1,
            }
        }
        if missing > 0 {
            return Err(ShareError::incomplete_piece(piece_index, missing).into());
        }

        let mut log_reader = fs::File::open(&self.log_path).await.map_err(|e| {
            ShareError::transport_error_full(
                "Failed to open block log",
                self.log_path.display().to_string(),
                e.to_string(),
            )
        })?;

        let mut piece = Vec::new();
        for entry in entries {
            log_reader.seek(std::io::SeekFrom::Start(entry.offset)).await?;
            let mut buf = vec![0u8; entry.length as usize];
            log_reader.read_exact(&mut buf).await?;
            piece.extend_from_slice(&buf);
        }
        Ok(piece)
    }

    /// Validate a fully assembled piece against its expected hash and,
    /// on success, write it into the tmp file at its final offset.
    ///
    /// On a hash mismatch the piece's logged blocks are discarded so
    /// they will be re-requested, the tmp file is left untouched, and
    /// false is returned. Flushes are serialized by the store lock.
    pub async fn validate_and_flush(&self, piece_index: u32) -> Result<bool> {
        let mut inner = self.inner.lock().await;

        if inner.bitfield.has(piece_index as usize) {
            debug!("Piece {} already flushed", piece_index);
            return Ok(true);
        }

        let piece = self.assemble_locked(&inner, piece_index).await?;

        let expected = self
            .metadata
            .piece_hash(piece_index as usize)
            .ok_or_else(|| {
                ShareError::protocol_error_with_source(
                    "Piece index out of range",
                    format!("piece: {}", piece_index),
                )
            })?;

        let mut hasher = Sha1::new();
        hasher.update(&piece);
        let actual: [u8; 20] = hasher.finalize().into();

        if actual != expected {
            warn!("{}", ShareError::hash_validation_failure(piece_index));
            let blocks = self
                .metadata
                .blocks_in_piece(piece_index as usize)
                .unwrap_or(0);
            for b in 0..blocks {
                let ptr = BlockPointer::derive(piece_index, b, &self.metadata.info_hash);
                inner.index.remove(&ptr);
            }
            return Ok(false);
        }

        let offset = piece_index as u64 * self.metadata.piece_length;
        let mut tmp_file = fs::OpenOptions::new()
            .write(true)
            .open(&self.tmp_path)
            .await
            .map_err(|e| {
                ShareError::transport_error_full(
                    "Failed to open tmp file",
                    self.tmp_path.display().to_string(),
                    e.to_string(),
                )
            })?;
        tmp_file.seek(std::io::SeekFrom::Start(offset)).await?;
        tmp_file.write_all(&piece).await?;
        tmp_file.flush().await?;

        inner.bitfield.set(piece_index as usize);
        info!(
            "Piece {} verified and flushed ({}/{} complete)",
            piece_index,
            inner.bitfield.count_set(),
            self.metadata.num_pieces()
        );
        Ok(true)
    }

    /// Serve bytes of a verified piece from the tmp file
    pub async fn read_block(&self, piece_index: u32, begin: u32, length: u32) -> Result<Vec<u8>> {
        let inner = self.inner.lock().await;

        if !inner.bitfield.has(piece_index as usize) {
            return Err(ShareError::protocol_error_with_source(
                "Requested piece not available",
                format!("piece: {}", piece_index),
            )
            .into());
        }

        let piece_len = self
            .metadata
            .piece_len_at(piece_index as usize)
            .unwrap_or(0);
        if begin as u64 + length as u64 > piece_len {
            return Err(ShareError::protocol_error_with_source(
                "Requested range outside piece",
                format!("piece: {}, begin: {}, length: {}", piece_index, begin, length),
            )
            .into());
        }

        let offset = piece_index as u64 * self.metadata.piece_length + begin as u64;
        let mut tmp_file = fs::File::open(&self.tmp_path).await.map_err(|e| {
            ShareError::transport_error_full(
                "Failed to open tmp file",
                self.tmp_path.display().to_string(),
                e.to_string(),
            )
        })?;
        tmp_file.seek(std::io::SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; length as usize];
        tmp_file.read_exact(&mut buf).await?;
        Ok(buf)
    }

    /// Snapshot of the local availability bitfield
    pub async fn bitfield(&self) -> Bitfield {
        self.inner.lock().await.bitfield.clone()
    }

    /// True when a specific piece is verified
    pub async fn has_piece(&self, piece_index: u32) -> bool {
        self.inner.lock().await.bitfield.has(piece_index as usize)
    }

    /// True when every piece is verified
    pub async fn is_complete(&self) -> bool {
        self.inner.lock().await.bitfield.is_complete()
    }

    /// Download progress in [0.0, 1.0]
    pub async fn progress(&self) -> f64 {
        let inner = self.inner.lock().await;
        if self.metadata.num_pieces() == 0 {
            return 1.0;
        }
        inner.bitfield.count_set() as f64 / self.metadata.num_pieces() as f64
    }

    /// Move the completed tmp file into the shared directory under the
    /// torrent's file name. Refuses to overwrite an existing file.
    pub async fn finalize(&self, shared_dir: &Path) -> Result<PathBuf> {
        let inner = self.inner.lock().await;

        if !inner.bitfield.is_complete() {
            return Err(ShareError::transport_error(format!(
                "Cannot finalize: {}/{} pieces verified",
                inner.bitfield.count_set(),
                self.metadata.num_pieces()
            ))
            .into());
        }

        fs::create_dir_all(shared_dir).await.map_err(|e| {
            ShareError::transport_error_full(
                "Failed to create shared directory",
                shared_dir.display().to_string(),
                e.to_string(),
            )
        })?;

        let target = shared_dir.join(&self.metadata.file_name);
        if fs::try_exists(&target).await? {
            error!("Refusing to overwrite existing file: {}", target.display());
            return Err(ShareError::transport_error_with_address(
                "Target file already exists",
                target.display().to_string(),
            )
            .into());
        }

        fs::rename(&self.tmp_path, &target).await.map_err(|e| {
            ShareError::transport_error_full(
                "Failed to move completed file",
                target.display().to_string(),
                e.to_string(),
            )
        })?;

        info!("Finalized download: {}", target.display());
        Ok(target)
    }

    /// Metadata this store was created for
    pub fn metadata(&self) -> &Arc<TorrentMetadata> {
        &self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::BLOCK_LENGTH;

    fn temp_dir(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("peershare-{}-{}", tag, rand::random::<u64>()))
    }

    /// Deterministic file content plus matching metadata: two pieces of
    /// two blocks each, the final block short
    fn test_metadata() -> (Arc<TorrentMetadata>, Vec<u8>) {
        let piece_length = 2 * BLOCK_LENGTH;
        let file_length = piece_length + BLOCK_LENGTH + 100;
        let content: Vec<u8> = (0..file_length).map(|i| (i % 251) as u8).collect();

        let mut pieces = Vec::new();
        for chunk in content.chunks(piece_length as usize) {
            let mut hasher = Sha1::new();
            hasher.update(chunk);
            pieces.push(hasher.finalize().into());
        }

        let metadata = TorrentMetadata {
            announce_url: "udp://dht.local:6881".to_string(),
            comment: None,
            created_by: None,
            creation_date: None,
            file_name: "store-test.bin".to_string(),
            file_length,
            piece_length,
            pieces,
            info_hash: [0x5au8; 20],
        };
        (Arc::new(metadata), content)
    }

    fn block_of(content: &[u8], meta: &TorrentMetadata, piece: u32, block: u32) -> Block {
        let start = piece as u64 * meta.piece_length + block as u64 * BLOCK_LENGTH;
        let len = meta.block_len_at(piece as usize, block).unwrap();
        Block::new(
            piece,
            (block as u64 * BLOCK_LENGTH) as u32,
            content[start as usize..(start + len) as usize].to_vec(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_write_block_is_idempotent() {
        let (meta, content) = test_metadata();
        let store = PieceStore::create(&temp_dir("idem"), meta.clone()).await.unwrap();

        let block = block_of(&content, &meta, 0, 0);
        assert!(store.write_block(block.clone()).await.unwrap());
        assert_eq!(store.distinct_blocks().await, 1);

        // Same block again does not grow the index
        assert!(!store.write_block(block).await.unwrap());
        assert_eq!(store.distinct_blocks().await, 1);
    }

    #[tokio::test]
    async fn test_log_entry_layout() {
        let (meta, content) = test_metadata();
        let store = PieceStore::create(&temp_dir("layout"), meta.clone()).await.unwrap();

        let block = block_of(&content, &meta, 0, 0);
        let pointer = block.pointer(&meta.info_hash);
        let data = block.data.clone();
        store.write_block(block).await.unwrap();

        // One entry: hex pointer, "$$$", block bytes, newline
        let log = fs::read(&store.log_path).await.unwrap();
        let mut expected = pointer.to_hex().into_bytes();
        expected.extend_from_slice(b"$$$");
        expected.extend_from_slice(&data);
        expected.push(b'\n');
        assert_eq!(log, expected);
    }

    #[tokio::test]
    async fn test_assemble_incomplete_piece_fails() {
        let (meta, content) = test_metadata();
        let store = PieceStore::create(&temp_dir("incomplete"), meta.clone()).await.unwrap();

        store.write_block(block_of(&content, &meta, 0, 0)).await.unwrap();

        let err = store.assemble_piece(0).await.unwrap_err();
        let share_err = err.downcast_ref::<ShareError>().unwrap();
        assert!(matches!(
            share_err,
            ShareError::IncompletePiece { piece_index: 0, missing_blocks: 1 }
        ));
    }

    #[tokio::test]
    async fn test_validate_and_flush_success() {
        let (meta, content) = test_metadata();
        let store = PieceStore::create(&temp_dir("flush"), meta.clone()).await.unwrap();

        // Out-of-order arrival
        store.write_block(block_of(&content, &meta, 0, 1)).await.unwrap();
        store.write_block(block_of(&content, &meta, 0, 0)).await.unwrap();

        assert!(store.validate_and_flush(0).await.unwrap());
        assert!(store.has_piece(0).await);

        let served = store.read_block(0, 0, BLOCK_LENGTH as u32).await.unwrap();
        assert_eq!(served, &content[..BLOCK_LENGTH as usize]);
    }

    #[tokio::test]
    async fn test_validate_and_flush_rejects_corrupt_piece() {
        let (meta, content) = test_metadata();
        let store = PieceStore::create(&temp_dir("corrupt"), meta.clone()).await.unwrap();

        let mut bad = block_of(&content, &meta, 0, 0);
        bad.data[0] ^= 0xff;
        store.write_block(bad).await.unwrap();
        store.write_block(block_of(&content, &meta, 0, 1)).await.unwrap();

        assert!(!store.validate_and_flush(0).await.unwrap());
        assert!(!store.has_piece(0).await);

        // Blocks were discarded so the piece can be re-requested
        assert_eq!(store.missing_blocks(0).await.unwrap(), vec![0, 1]);

        // The tmp file was not written
        let tmp = fs::read(&store.tmp_path).await.unwrap();
        assert!(tmp[..meta.piece_length as usize].iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn test_read_block_requires_verified_piece() {
        let (meta, content) = test_metadata();
        let store = PieceStore::create(&temp_dir("unverified"), meta.clone()).await.unwrap();

        store.write_block(block_of(&content, &meta, 0, 0)).await.unwrap();
        assert!(store.read_block(0, 0, 16).await.is_err());
    }

    #[tokio::test]
    async fn test_short_final_piece_round_trip() {
        let (meta, content) = test_metadata();
        let store = PieceStore::create(&temp_dir("short"), meta.clone()).await.unwrap();

        store.write_block(block_of(&content, &meta, 1, 0)).await.unwrap();
        store.write_block(block_of(&content, &meta, 1, 1)).await.unwrap();

        assert!(store.validate_and_flush(1).await.unwrap());
        let tail_len = (meta.file_length - meta.piece_length) as u32;
        let served = store.read_block(1, 0, tail_len).await.unwrap();
        assert_eq!(served, &content[meta.piece_length as usize..]);
    }

    #[tokio::test]
    async fn test_finalize_moves_completed_file() {
        let (meta, content) = test_metadata();
        let work = temp_dir("final-work");
        let shared = temp_dir("final-shared");
        let store = PieceStore::create(&work, meta.clone()).await.unwrap();

        for piece in 0..meta.num_pieces() as u32 {
            for block in 0..meta.blocks_in_piece(piece as usize).unwrap() {
                store.write_block(block_of(&content, &meta, piece, block)).await.unwrap();
            }
            assert!(store.validate_and_flush(piece).await.unwrap());
        }
        assert!(store.is_complete().await);

        let target = store.finalize(&shared).await.unwrap();
        assert_eq!(fs::read(&target).await.unwrap(), content);
    }

    #[tokio::test]
    async fn test_finalize_refuses_overwrite() {
        let (meta, content) = test_metadata();
        let work = temp_dir("clash-work");
        let shared = temp_dir("clash-shared");
        let store = PieceStore::create(&work, meta.clone()).await.unwrap();

        for piece in 0..meta.num_pieces() as u32 {
            for block in 0..meta.blocks_in_piece(piece as usize).unwrap() {
                store.write_block(block_of(&content, &meta, piece, block)).await.unwrap();
            }
            store.validate_and_flush(piece).await.unwrap();
        }

        fs::create_dir_all(&shared).await.unwrap();
        fs::write(shared.join(&meta.file_name), b"occupied").await.unwrap();

        assert!(store.finalize(&shared).await.is_err());
        // The occupant survives
        assert_eq!(fs::read(shared.join(&meta.file_name)).await.unwrap(), b"occupied");
    }

    #[tokio::test]
    async fn test_finalize_requires_completion() {
        let (meta, _content) = test_metadata();
        let store = PieceStore::create(&temp_dir("early"), meta.clone()).await.unwrap();
        assert!(store.finalize(&temp_dir("early-shared")).await.is_err());
    }

    #[tokio::test]
    async fn test_oversized_block_rejected() {
        let (meta, _content) = test_metadata();
        let store = PieceStore::create(&temp_dir("bounds"), meta.clone()).await.unwrap();

        // Full-size block where the short final block belongs
        let block = Block::new(1, BLOCK_LENGTH as u32, vec![0u8; BLOCK_LENGTH as usize]).unwrap();
        assert!(store.write_block(block).await.is_err());

        // Piece index past the end
        let block = Block::new(9, 0, vec![0u8; BLOCK_LENGTH as usize]).unwrap();
        assert!(store.write_block(block).await.is_err());
    }
}
