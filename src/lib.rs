//! peershare
//!
//! Decentralized peer-to-peer file sharing: torrent metainfo parsing,
//! a BitTorrent-style peer wire protocol, content-addressed block
//! storage with hash-verified pieces, and tracker-less peer discovery
//! over a KRPC DHT.

pub mod cli;
pub mod dht;
pub mod error;
pub mod peer;
pub mod protocol;
pub mod storage;
pub mod torrent;

pub use error::ShareError;

pub use cli::{CliArgs, Config};
pub use dht::{DhtNode, KrpcDatagram, KrpcKind, NodeId, RouteEntry, RoutingTable};
pub use peer::{Bitfield, ConnectionSlots, PeerWireSession, SessionManager, SessionState};
pub use protocol::{Handshake, Message, MessageId};
pub use storage::{Block, BlockPointer, PieceStore};
pub use torrent::{TorrentMetadata, BLOCK_LENGTH};
