//! KRPC messages
//!
//! Bencoded UDP datagrams with the `t`/`y` envelope: `y` is "q" for
//! queries (method name in `q`, arguments in `a`), "r" for responses
//! (fields in `r`) and "e" for errors. Node ids and info-hashes travel
//! hex-encoded; peer addresses travel as `ip:port` strings.

use std::fmt;
use std::net::SocketAddr;

use anyhow::Result;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::ShareError;

/// Random 160-bit node identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub [u8; 20]);

impl NodeId {
    pub fn random() -> Self {
        let mut id = [0u8; 20];
        rand::thread_rng().fill(&mut id);
        NodeId(id)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let id: [u8; 20] = bytes.try_into().ok()?;
        Some(NodeId(id))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// The four KRPC methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KrpcKind {
    Ping,
    FindNode,
    GetPeers,
    AnnouncePeer,
}

impl KrpcKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            KrpcKind::Ping => "ping",
            KrpcKind::FindNode => "find_node",
            KrpcKind::GetPeers => "get_peers",
            KrpcKind::AnnouncePeer => "announce_peer",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "ping" => Some(KrpcKind::Ping),
            "find_node" => Some(KrpcKind::FindNode),
            "get_peers" => Some(KrpcKind::GetPeers),
            "announce_peer" => Some(KrpcKind::AnnouncePeer),
            _ => None,
        }
    }
}

impl fmt::Display for KrpcKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Flattened argument dictionary shared by queries (`a`) and
/// responses (`r`); each method reads the fields it needs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KrpcArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Contact addresses, `ip:port` per entry
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nodes: Option<Vec<String>>,
    /// Peer addresses for a torrent, `ip:port` per entry
    #[serde(skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<String>>,
}

/// Wire-shape envelope, serialized with serde_bencode
#[derive(Debug, Clone, Serialize, Deserialize)]
struct KrpcEnvelope {
    t: String,
    y: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    q: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    a: Option<KrpcArgs>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    r: Option<KrpcArgs>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    e: Option<(i64, String)>,
}

/// Decoded datagram body
#[derive(Debug, Clone)]
pub enum KrpcPayload {
    Query { kind: KrpcKind, args: KrpcArgs },
    Response { args: KrpcArgs },
    Error { code: i64, message: String },
}

/// One KRPC datagram: transaction id plus payload
#[derive(Debug, Clone)]
pub struct KrpcDatagram {
    pub transaction_id: String,
    pub payload: KrpcPayload,
}

impl KrpcDatagram {
    pub fn query(transaction_id: String, kind: KrpcKind, args: KrpcArgs) -> Self {
        Self { transaction_id, payload: KrpcPayload::Query { kind, args } }
    }

    pub fn response(transaction_id: String, args: KrpcArgs) -> Self {
        Self { transaction_id, payload: KrpcPayload::Response { args } }
    }

    pub fn error(transaction_id: String, code: i64, message: String) -> Self {
        Self { transaction_id, payload: KrpcPayload::Error { code, message } }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let envelope = match &self.payload {
            KrpcPayload::Query { kind, args } => KrpcEnvelope {
                t: self.transaction_id.clone(),
                y: "q".to_string(),
                q: Some(kind.as_str().to_string()),
                a: Some(args.clone()),
                r: None,
                e: None,
            },
            KrpcPayload::Response { args } => KrpcEnvelope {
                t: self.transaction_id.clone(),
                y: "r".to_string(),
                q: None,
                a: None,
                r: Some(args.clone()),
                e: None,
            },
            KrpcPayload::Error { code, message } => KrpcEnvelope {
                t: self.transaction_id.clone(),
                y: "e".to_string(),
                q: None,
                a: None,
                r: None,
                e: Some((*code, message.clone())),
            },
        };
        serde_bencode::ser::to_bytes(&envelope)
            .map_err(|e| ShareError::dht_error_with_node("Failed to encode datagram", e.to_string()).into())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let envelope: KrpcEnvelope = serde_bencode::de::from_bytes(data)?;

        let payload = match envelope.y.as_str() {
            "q" => {
                let name = envelope.q.ok_or_else(|| {
                    ShareError::dht_error("Query datagram without a method name")
                })?;
                let kind = KrpcKind::from_str(&name).ok_or_else(|| {
                    ShareError::dht_error_with_node("Unknown query method", name.clone())
                })?;
                KrpcPayload::Query { kind, args: envelope.a.unwrap_or_default() }
            }
            "r" => KrpcPayload::Response { args: envelope.r.unwrap_or_default() },
            "e" => {
                let (code, message) = envelope.e.unwrap_or((201, "unspecified".to_string()));
                KrpcPayload::Error { code, message }
            }
            other => {
                return Err(ShareError::dht_error_with_node(
                    "Unknown datagram type",
                    other.to_string(),
                )
                .into())
            }
        };

        Ok(Self { transaction_id: envelope.t, payload })
    }
}

/// Random 4-byte transaction id, hex-encoded
pub fn generate_transaction_id() -> String {
    let id: u32 = rand::thread_rng().gen();
    hex::encode(id.to_be_bytes())
}

/// Render peer addresses as `ip:port` strings for the wire
pub fn encode_peer_list(addrs: &[SocketAddr]) -> Vec<String> {
    addrs.iter().map(|a| a.to_string()).collect()
}

/// Parse `ip:port` strings back to addresses, skipping malformed ones
pub fn decode_peer_list(values: &[String]) -> Vec<SocketAddr> {
    values.iter().filter_map(|v| v.parse().ok()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_hex_round_trip() {
        let id = NodeId::random();
        assert_eq!(NodeId::from_hex(&id.to_hex()), Some(id));
        assert_eq!(id.to_hex().len(), 40);
    }

    #[test]
    fn test_node_id_rejects_bad_hex() {
        assert!(NodeId::from_hex("zz").is_none());
        assert!(NodeId::from_hex("abcd").is_none());
    }

    #[test]
    fn test_query_round_trip() {
        let args = KrpcArgs {
            id: Some(NodeId::random().to_hex()),
            info_hash: Some(hex::encode([7u8; 20])),
            ..Default::default()
        };
        let datagram = KrpcDatagram::query("ab12".to_string(), KrpcKind::GetPeers, args);
        let bytes = datagram.encode().unwrap();

        let decoded = KrpcDatagram::decode(&bytes).unwrap();
        assert_eq!(decoded.transaction_id, "ab12");
        match decoded.payload {
            KrpcPayload::Query { kind, args } => {
                assert_eq!(kind, KrpcKind::GetPeers);
                assert_eq!(args.info_hash, Some(hex::encode([7u8; 20])));
            }
            other => panic!("expected query, got {:?}", other),
        }
    }

    #[test]
    fn test_response_round_trip() {
        let args = KrpcArgs {
            id: Some(NodeId::random().to_hex()),
            token: Some("tok".to_string()),
            values: Some(vec!["127.0.0.1:6881".to_string()]),
            ..Default::default()
        };
        let datagram = KrpcDatagram::response("cd34".to_string(), args);
        let bytes = datagram.encode().unwrap();

        let decoded = KrpcDatagram::decode(&bytes).unwrap();
        match decoded.payload {
            KrpcPayload::Response { args } => {
                assert_eq!(args.token.as_deref(), Some("tok"));
                assert_eq!(args.values, Some(vec!["127.0.0.1:6881".to_string()]));
            }
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[test]
    fn test_error_round_trip() {
        let datagram = KrpcDatagram::error("ef56".to_string(), 203, "bad token".to_string());
        let bytes = datagram.encode().unwrap();

        let decoded = KrpcDatagram::decode(&bytes).unwrap();
        match decoded.payload {
            KrpcPayload::Error { code, message } => {
                assert_eq!(code, 203);
                assert_eq!(message, "bad token");
            }
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_method_rejected() {
        let envelope = KrpcEnvelope {
            t: "xx".to_string(),
            y: "q".to_string(),
            q: Some("made_up".to_string()),
            a: Some(KrpcArgs::default()),
            r: None,
            e: None,
        };
        let bytes = serde_bencode::ser::to_bytes(&envelope).unwrap();
        assert!(KrpcDatagram::decode(&bytes).is_err());
    }

    #[test]
    fn test_garbage_datagram_rejected() {
        assert!(KrpcDatagram::decode(b"not bencode at all").is_err());
    }

    #[test]
    fn test_transaction_ids_differ() {
        assert_ne!(generate_transaction_id(), generate_transaction_id());
        assert_eq!(generate_transaction_id().len(), 8);
    }

    #[test]
    fn test_peer_list_round_trip() {
        let addrs: Vec<SocketAddr> =
            vec!["10.0.0.1:6881".parse().unwrap(), "192.168.1.2:7000".parse().unwrap()];
        let encoded = encode_peer_list(&addrs);
        assert_eq!(decode_peer_list(&encoded), addrs);
    }

    #[test]
    fn test_peer_list_skips_malformed() {
        let values = vec!["10.0.0.1:6881".to_string(), "bogus".to_string()];
        assert_eq!(decode_peer_list(&values).len(), 1);
    }
}
