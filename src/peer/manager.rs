//! Session manager
//!
//! Tracks known peer addresses, enforces the connection cap, accepts
//! inbound connections and dials discovered peers. Every session runs
//! in its own task; a failed session is logged and forgotten.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, trace, warn};

use crate::peer::session::{PeerWireSession, SessionRole};
use crate::storage::PieceStore;

/// Bounded counter for serving slots. Acquire/release is lock-free so
/// sessions can check capacity without touching the registry.
pub struct ConnectionSlots {
    max: usize,
    active: AtomicUsize,
}

impl ConnectionSlots {
    pub fn new(max: usize) -> Self {
        Self { max, active: AtomicUsize::new(0) }
    }

    /// Claim a slot, failing when all are taken
    pub fn try_acquire(&self) -> bool {
        let mut current = self.active.load(Ordering::Acquire);
        loop {
            if current >= self.max {
                return false;
            }
            match self.active.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn release(&self) {
        let prev = self.active.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn max(&self) -> usize {
        self.max
    }
}

/// Owns the set of peer sessions for one torrent
pub struct SessionManager {
    store: Arc<PieceStore>,
    our_peer_id: [u8; 20],
    slots: Arc<ConnectionSlots>,
    /// Addresses with a live or in-progress session
    connected: RwLock<HashSet<SocketAddr>>,
    /// Pieces completed locally, relayed to every session as have frames
    completed_tx: broadcast::Sender<u32>,
    idle_timeout: Duration,
}

impl SessionManager {
    pub fn new(
        store: Arc<PieceStore>,
        our_peer_id: [u8; 20],
        max_connections: usize,
        idle_timeout: Duration,
    ) -> Arc<Self> {
        let (completed_tx, _) = broadcast::channel(64);
        Arc::new(Self {
            store,
            our_peer_id,
            slots: Arc::new(ConnectionSlots::new(max_connections)),
            connected: RwLock::new(HashSet::new()),
            completed_tx,
            idle_timeout,
        })
    }

    /// Accept inbound connections until the listener fails. Each
    /// accepted socket gets its own session task; accept errors are
    /// logged and the loop keeps going.
    pub async fn listen(self: Arc<Self>, listener: TcpListener) {
        match listener.local_addr() {
            Ok(addr) => info!("Listening for peers on {}", addr),
            Err(_) => info!("Listening for peers"),
        }

        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!("Inbound connection from {}", addr);
                    let manager = self.clone();
                    tokio::spawn(async move {
                        manager.run_inbound(stream, addr).await;
                    });
                }
                Err(e) => {
                    warn!("Accept failed: {}", e);
                }
            }
        }
    }

    async fn run_inbound(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        if !self.track(addr).await {
            trace!("Already connected to {}, dropping duplicate", addr);
            return;
        }

        let mut session = PeerWireSession::from_stream(
            stream,
            addr.to_string(),
            SessionRole::Responder,
            self.store.clone(),
            self.slots.clone(),
            Some(self.completed_tx.subscribe()),
            self.idle_timeout,
        );

        let outcome = async {
            session.handshake_as_responder(self.our_peer_id).await?;
            session.run().await
        }
        .await;

        if let Err(e) = outcome {
            warn!("Session with {} ended: {}", addr, e);
        }
        self.untrack(addr).await;
    }

    /// Dial a discovered peer in a background task. Duplicates and our
    /// own listen address are skipped.
    pub async fn dial(self: &Arc<Self>, addr: SocketAddr) {
        if !self.track(addr).await {
            trace!("Already connected to {}, not dialing", addr);
            return;
        }

        let manager = self.clone();
        tokio::spawn(async move {
            let outcome = async {
                let mut session = PeerWireSession::connect(
                    addr,
                    manager.store.clone(),
                    manager.our_peer_id,
                    manager.slots.clone(),
                    Some(manager.completed_tx.subscribe()),
                    manager.idle_timeout,
                )
                .await?;
                session.run().await
            }
            .await;

            if let Err(e) = outcome {
                error!("Failed session with {}: {}", addr, e);
            }
            manager.untrack(addr).await;
        });
    }

    /// Announce a locally completed piece to every session
    pub fn broadcast_have(&self, piece_index: u32) {
        // Send only fails with no live receivers, which is fine
        let _ = self.completed_tx.send(piece_index);
    }

    async fn track(&self, addr: SocketAddr) -> bool {
        self.connected.write().await.insert(addr)
    }

    async fn untrack(&self, addr: SocketAddr) {
        self.connected.write().await.remove(&addr);
        debug!("Session with {} removed from registry", addr);
    }

    pub async fn session_count(&self) -> usize {
        self.connected.read().await.len()
    }

    pub fn slots(&self) -> &Arc<ConnectionSlots> {
        &self.slots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slots_cap() {
        let slots = ConnectionSlots::new(2);
        assert!(slots.try_acquire());
        assert!(slots.try_acquire());
        assert!(!slots.try_acquire());
        assert_eq!(slots.active(), 2);

        slots.release();
        assert!(slots.try_acquire());
        assert_eq!(slots.active(), 2);
        assert_eq!(slots.max(), 2);
    }

    #[test]
    fn test_slots_zero_capacity_refuses_all() {
        let slots = ConnectionSlots::new(0);
        assert!(!slots.try_acquire());
    }
}
