//! DHT routing table
//!
//! Contacts are grouped per info-hash and ordered by measured
//! round-trip time, fastest first. Each group holds at most eight
//! entries; a newcomer only displaces the slowest entry when it is
//! strictly faster. Eviction is capacity-driven, there is no age-out.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use tracing::{debug, trace};

use crate::dht::message::NodeId;

/// Contacts kept per info-hash
pub const MAX_ROUTES_PER_TORRENT: usize = 8;

/// One routed contact with its measured round-trip time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub node_id: NodeId,
    pub addr: SocketAddr,
    pub rtt: Duration,
}

impl RouteEntry {
    pub fn new(node_id: NodeId, addr: SocketAddr, rtt: Duration) -> Self {
        Self { node_id, addr, rtt }
    }
}

/// RTT-ordered contact lists keyed by info-hash
#[derive(Debug, Default)]
pub struct RoutingTable {
    routes: HashMap<[u8; 20], Vec<RouteEntry>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self { routes: HashMap::new() }
    }

    /// Insert or update a contact. The check and the insert happen
    /// under one `&mut` borrow, so a full list can never overshoot.
    /// Returns whether the entry made it into the table.
    pub fn insert(&mut self, info_hash: [u8; 20], entry: RouteEntry) -> bool {
        let list = self.routes.entry(info_hash).or_default();

        // A re-measured contact gets its rtt refreshed in place
        if let Some(pos) = list.iter().position(|e| e.addr == entry.addr) {
            list.remove(pos);
        } else if list.len() >= MAX_ROUTES_PER_TORRENT {
            // Full list: the newcomer must beat the slowest entry
            let slowest = list
                .last()
                .map(|e| e.rtt)
                .unwrap_or(Duration::MAX);
            if entry.rtt >= slowest {
                trace!(
                    "Contact {} ({}ms) slower than slowest routed entry, dropped",
                    entry.addr,
                    entry.rtt.as_millis()
                );
                return false;
            }
            list.pop();
        }

        debug!(
            "Routing contact {} at {}ms for {}",
            entry.addr,
            entry.rtt.as_millis(),
            hex::encode(info_hash)
        );
        let at = list.partition_point(|e| e.rtt <= entry.rtt);
        list.insert(at, entry);
        true
    }

    /// Contacts for a torrent, fastest first
    pub fn contacts(&self, info_hash: &[u8; 20]) -> Vec<RouteEntry> {
        self.routes.get(info_hash).cloned().unwrap_or_default()
    }

    /// Peer addresses routed for a torrent
    pub fn peer_addrs(&self, info_hash: &[u8; 20]) -> Vec<SocketAddr> {
        self.routes
            .get(info_hash)
            .map(|list| list.iter().map(|e| e.addr).collect())
            .unwrap_or_default()
    }

    pub fn remove(&mut self, info_hash: &[u8; 20], addr: SocketAddr) {
        if let Some(list) = self.routes.get_mut(info_hash) {
            list.retain(|e| e.addr != addr);
            if list.is_empty() {
                self.routes.remove(info_hash);
            }
        }
    }

    pub fn contact_count(&self, info_hash: &[u8; 20]) -> usize {
        self.routes.get(info_hash).map(Vec::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
