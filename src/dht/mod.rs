//! DHT module
//!
//! Tracker-less peer discovery over KRPC datagrams.

pub mod message;
pub mod node;
pub mod routing;

pub use message::{
    decode_peer_list, encode_peer_list, generate_transaction_id, KrpcArgs, KrpcDatagram,
    KrpcKind, KrpcPayload, NodeId,
};
pub use node::DhtNode;
pub use routing::{RouteEntry, RoutingTable, MAX_ROUTES_PER_TORRENT};
