//! Error types for the file-sharing core
//!
//! This module defines the error taxonomy shared by every component:
//! metadata parsing, the peer wire protocol, piece storage, and the DHT.

use std::fmt;

/// Comprehensive error type for file-sharing operations
#[derive(Debug, Clone)]
pub enum ShareError {
    /// Metainfo and bencode parsing errors
    ParseError {
        message: String,
        source: Option<String>,
    },

    /// Peer wire protocol errors (malformed frames, out-of-state messages)
    ProtocolError {
        message: String,
        source: Option<String>,
    },

    /// Handshake presented an info-hash for a different torrent
    InfoHashMismatch {
        expected: String,
        received: String,
    },

    /// A piece was assembled before all of its blocks arrived
    IncompletePiece {
        piece_index: u32,
        missing_blocks: usize,
    },

    /// An assembled piece failed SHA-1 verification
    HashValidationFailure {
        piece_index: u32,
    },

    /// Socket and file I/O errors
    TransportError {
        message: String,
        address: Option<String>,
        source: Option<String>,
    },

    /// DHT messaging errors
    DhtError {
        message: String,
        node: Option<String>,
        source: Option<String>,
    },

    /// Configuration errors
    ConfigError {
        message: String,
        field: Option<String>,
    },
}

impl ShareError {
    /// Create a new ParseError
    pub fn parse_error(message: impl Into<String>) -> Self {
        ShareError::ParseError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new ParseError with source
    pub fn parse_error_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        ShareError::ParseError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new ProtocolError
    pub fn protocol_error(message: impl Into<String>) -> Self {
        ShareError::ProtocolError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new ProtocolError with source
    pub fn protocol_error_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        ShareError::ProtocolError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new InfoHashMismatch from the raw 20-byte digests
    pub fn info_hash_mismatch(expected: &[u8; 20], received: &[u8; 20]) -> Self {
        ShareError::InfoHashMismatch {
            expected: hex::encode(expected),
            received: hex::encode(received),
        }
    }

    /// Create a new IncompletePiece
    pub fn incomplete_piece(piece_index: u32, missing_blocks: usize) -> Self {
        ShareError::IncompletePiece {
            piece_index,
            missing_blocks,
        }
    }

    /// Create a new HashValidationFailure
    pub fn hash_validation_failure(piece_index: u32) -> Self {
        ShareError::HashValidationFailure { piece_index }
    }

    /// Create a new TransportError
    pub fn transport_error(message: impl Into<String>) -> Self {
        ShareError::TransportError {
            message: message.into(),
            address: None,
            source: None,
        }
    }

    /// Create a new TransportError with address
    pub fn transport_error_with_address(message: impl Into<String>, address: impl Into<String>) -> Self {
        ShareError::TransportError {
            message: message.into(),
            address: Some(address.into()),
            source: None,
        }
    }

    /// Create a new TransportError with address and source
    pub fn transport_error_full(message: impl Into<String>, address: impl Into<String>, source: impl Into<String>) -> Self {
        ShareError::TransportError {
            message: message.into(),
            address: Some(address.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new DhtError
    pub fn dht_error(message: impl Into<String>) -> Self {
        ShareError::DhtError {
            message: message.into(),
            node: None,
            source: None,
        }
    }

    /// Create a new DhtError with node
    pub fn dht_error_with_node(message: impl Into<String>, node: impl Into<String>) -> Self {
        ShareError::DhtError {
            message: message.into(),
            node: Some(node.into()),
            source: None,
        }
    }

    /// Create a new DhtError with node and source
    pub fn dht_error_full(message: impl Into<String>, node: impl Into<String>, source: impl Into<String>) -> Self {
        ShareError::DhtError {
            message: message.into(),
            node: Some(node.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new ConfigError
    pub fn config_error(message: impl Into<String>) -> Self {
        ShareError::ConfigError {
            message: message.into(),
            field: None,
        }
    }

    /// Create a new ConfigError with field
    pub fn config_error_with_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        ShareError::ConfigError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Add context to the error
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        let ctx = context.into();
        match &mut self {
            ShareError::ParseError { source, .. }
            | ShareError::ProtocolError { source, .. }
            | ShareError::TransportError { source, .. }
            | ShareError::DhtError { source, .. } => {
                *source = Some(source.as_ref().map_or_else(|| ctx.clone(), |s| format!("{}: {}", s, ctx)));
            }
            _ => {}
        }
        self
    }

    /// True when the error should close only the offending session
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            ShareError::ProtocolError { .. }
                | ShareError::InfoHashMismatch { .. }
                | ShareError::TransportError { .. }
        )
    }
}

impl fmt::Display for ShareError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShareError::ParseError { message, source } => {
                if let Some(src) = source {
                    write!(f, "Parse error: {} (source: {})", message, src)
                } else {
                    write!(f, "Parse error: {}", message)
                }
            }
            ShareError::ProtocolError { message, source } => {
                if let Some(src) = source {
                    write!(f, "Protocol error: {} (source: {})", message, src)
                } else {
                    write!(f, "Protocol error: {}", message)
                }
            }
            ShareError::InfoHashMismatch { expected, received } => {
                write!(f, "Info-hash mismatch: expected {}, received {}", expected, received)
            }
            ShareError::IncompletePiece { piece_index, missing_blocks } => {
                write!(f, "Piece {} is incomplete: {} block(s) missing", piece_index, missing_blocks)
            }
            ShareError::HashValidationFailure { piece_index } => {
                write!(f, "Piece {} failed hash validation", piece_index)
            }
            ShareError::TransportError { message, address, source } => {
                match (address, source) {
                    (Some(a), Some(s)) => write!(f, "Transport error: {} (address: {}, source: {})", message, a, s),
                    (Some(a), None) => write!(f, "Transport error: {} (address: {})", message, a),
                    (None, Some(s)) => write!(f, "Transport error: {} (source: {})", message, s),
                    (None, None) => write!(f, "Transport error: {}", message),
                }
            }
            ShareError::DhtError { message, node, source } => {
                match (node, source) {
                    (Some(n), Some(s)) => write!(f, "DHT error: {} (node: {}, source: {})", message, n, s),
                    (Some(n), None) => write!(f, "DHT error: {} (node: {})", message, n),
                    (None, Some(s)) => write!(f, "DHT error: {} (source: {})", message, s),
                    (None, None) => write!(f, "DHT error: {}", message),
                }
            }
            ShareError::ConfigError { message, field } => {
                if let Some(field_val) = field {
                    write!(f, "Config error: {} (field: {})", message, field_val)
                } else {
                    write!(f, "Config error: {}", message)
                }
            }
        }
    }
}

impl std::error::Error for ShareError {}

impl From<std::io::Error> for ShareError {
    fn from(err: std::io::Error) -> Self {
        ShareError::TransportError {
            message: err.to_string(),
            address: None,
            source: Some(err.kind().to_string()),
        }
    }
}

// Note: serde_bencode::Error is the public type, not de::Error or ser::Error
impl From<serde_bencode::Error> for ShareError {
    fn from(err: serde_bencode::Error) -> Self {
        ShareError::parse_error_with_source("Failed to parse bencode data", err.to_string())
    }
}

impl From<std::net::AddrParseError> for ShareError {
    fn from(err: std::net::AddrParseError) -> Self {
        ShareError::transport_error_full("Failed to parse address", "unknown".to_string(), err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for ShareError {
    fn from(_err: tokio::time::error::Elapsed) -> Self {
        ShareError::transport_error("Operation timed out")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error() {
        let err = ShareError::parse_error("Invalid metainfo file");
        assert_eq!(err.to_string(), "Parse error: Invalid metainfo file");
    }

    #[test]
    fn test_parse_error_with_source() {
        let err = ShareError::parse_error_with_source("Invalid metainfo file", "bencode error");
        assert!(err.to_string().contains("Parse error"));
        assert!(err.to_string().contains("Invalid metainfo file"));
        assert!(err.to_string().contains("bencode error"));
    }

    #[test]
    fn test_info_hash_mismatch_display() {
        let expected = [0xaa; 20];
        let received = [0xbb; 20];
        let err = ShareError::info_hash_mismatch(&expected, &received);
        assert!(err.to_string().contains(&hex::encode(expected)));
        assert!(err.to_string().contains(&hex::encode(received)));
    }

    #[test]
    fn test_incomplete_piece_display() {
        let err = ShareError::incomplete_piece(3, 2);
        assert!(err.to_string().contains("Piece 3"));
        assert!(err.to_string().contains("2 block(s) missing"));
    }

    #[test]
    fn test_transport_error_with_address() {
        let err = ShareError::transport_error_with_address("Connection refused", "127.0.0.1:6881");
        assert!(err.to_string().contains("Transport error"));
        assert!(err.to_string().contains("127.0.0.1:6881"));
    }

    #[test]
    fn test_with_context() {
        let err = ShareError::parse_error("Invalid data").with_context("while reading metainfo");
        assert!(err.to_string().contains("while reading metainfo"));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "File not found");
        let err: ShareError = io_err.into();
        assert!(matches!(err, ShareError::TransportError { .. }));
    }

    #[test]
    fn test_from_addr_parse_error() {
        let addr_err = "invalid:address".parse::<std::net::SocketAddr>().unwrap_err();
        let err: ShareError = addr_err.into();
        assert!(matches!(err, ShareError::TransportError { .. }));
    }

    #[test]
    fn test_config_error_with_field() {
        let err = ShareError::config_error_with_field("Invalid value", "max_connections");
        assert!(err.to_string().contains("Config error"));
        assert!(err.to_string().contains("max_connections"));
    }

    #[test]
    fn test_session_fatal_classification() {
        assert!(ShareError::protocol_error("bad frame").is_session_fatal());
        assert!(!ShareError::config_error("bad port").is_session_fatal());
    }
}
