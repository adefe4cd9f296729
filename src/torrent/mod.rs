//! Metainfo handling module
//!
//! This module provides parsing of single-file .torrent metainfo files and
//! access to the fields that drive downloading, storage, and discovery.

pub mod metadata;
pub mod parser;

pub use metadata::{TorrentMetadata, BLOCK_LENGTH};
pub use parser::MetainfoParser;
