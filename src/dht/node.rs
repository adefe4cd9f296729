//! DHT node
//!
//! One UDP socket per process. The receive loop decodes KRPC
//! datagrams and dispatches on `y`; malformed or unexpected datagrams
//! are logged and dropped, never fatal. Round-trip times come from a
//! pending-transaction map on the querying side: the elapsed time
//! between sending a query and matching its response by transaction id.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use sha1::{Digest, Sha1};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::dht::message::{
    decode_peer_list, encode_peer_list, generate_transaction_id, KrpcArgs, KrpcDatagram,
    KrpcKind, KrpcPayload, NodeId,
};
use crate::dht::routing::{RouteEntry, RoutingTable};
use crate::error::ShareError;

/// Queries with no response after this long are forgotten
const TRANSACTION_TIMEOUT: Duration = Duration::from_secs(30);

/// KRPC protocol error code for a rejected token
const ERROR_BAD_TOKEN: i64 = 203;

/// A query we sent and are awaiting a response for
#[derive(Debug, Clone)]
struct PendingQuery {
    kind: KrpcKind,
    sent_at: Instant,
    /// Peer address to route on success, when it differs from the
    /// datagram source (announce verification pings)
    peer_addr: Option<SocketAddr>,
}

/// The local DHT participant for one torrent
pub struct DhtNode {
    socket: UdpSocket,
    node_id: NodeId,
    info_hash: [u8; 20],
    /// TCP port our peer wire listener serves on
    tcp_port: u16,
    routing: Mutex<RoutingTable>,
    pending: Mutex<HashMap<String, PendingQuery>>,
    /// Tokens we handed out are recomputed from this, never stored
    token_secret: [u8; 16],
    /// Tokens other nodes handed us, needed to announce back to them
    received_tokens: Mutex<HashMap<SocketAddr, String>>,
    discovered_tx: mpsc::UnboundedSender<SocketAddr>,
}

impl DhtNode {
    /// Bind the UDP socket and assemble the node. Bind failure is one
    /// of the few errors that aborts startup.
    pub async fn bind(
        bind_addr: SocketAddr,
        info_hash: [u8; 20],
        tcp_port: u16,
        discovered_tx: mpsc::UnboundedSender<SocketAddr>,
    ) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(bind_addr).await.map_err(|e| {
            error!("Failed to bind DHT socket to {}: {}", bind_addr, e);
            ShareError::transport_error_full(
                "Failed to bind DHT socket",
                bind_addr.to_string(),
                e.to_string(),
            )
        })?;
        socket.set_broadcast(true)?;

        let node_id = NodeId::random();
        match socket.local_addr() {
            Ok(addr) => info!("DHT node {} listening on {}", node_id, addr),
            Err(_) => info!("DHT node {} listening", node_id),
        }

        let mut token_secret = [0u8; 16];
        rand::thread_rng().fill(&mut token_secret);

        Ok(Arc::new(Self {
            socket,
            node_id,
            info_hash,
            tcp_port,
            routing: Mutex::new(RoutingTable::new()),
            pending: Mutex::new(HashMap::new()),
            token_secret,
            received_tokens: Mutex::new(HashMap::new()),
            discovered_tx,
        }))
    }

    /// Receive loop plus the periodic pending-transaction sweep
    pub async fn run(self: Arc<Self>) {
        let mut buffer = [0u8; 4096];
        let mut sweep = interval(TRANSACTION_TIMEOUT);

        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buffer) => {
                    match received {
                        Ok((len, from)) => {
                            if let Err(e) = self.process_datagram(&buffer[..len], from).await {
                                debug!("Dropped datagram from {}: {}", from, e);
                            }
                        }
                        Err(e) => warn!("DHT receive failed: {}", e),
                    }
                }
                _ = sweep.tick() => {
                    self.expire_pending().await;
                }
            }
        }
    }

    /// Decode one datagram and dispatch on its type
    pub async fn process_datagram(&self, data: &[u8], from: SocketAddr) -> Result<()> {
        let datagram = KrpcDatagram::decode(data)?;
        trace!("Datagram from {}: {:?}", from, datagram.payload);

        match datagram.payload {
            KrpcPayload::Query { kind, args } => {
                self.handle_query(datagram.transaction_id, kind, args, from).await
            }
            KrpcPayload::Response { args } => {
                self.handle_response(datagram.transaction_id, args, from).await
            }
            KrpcPayload::Error { code, message } => {
                warn!("KRPC error from {}: {} ({})", from, message, code);
                self.pending.lock().await.remove(&datagram.transaction_id);
                Ok(())
            }
        }
    }

    async fn handle_query(
        &self,
        transaction_id: String,
        kind: KrpcKind,
        args: KrpcArgs,
        from: SocketAddr,
    ) -> Result<()> {
        debug!("{} query from {}", kind, from);

        match kind {
            KrpcKind::Ping => {
                self.send_response(transaction_id, self.identity_args(), from).await
            }
            KrpcKind::FindNode => {
                // We only route for our own torrent
                let target = args.target.as_deref().unwrap_or_default();
                if target != hex::encode(self.info_hash) {
                    debug!("find_node for foreign target from {}, ignoring", from);
                    return Ok(());
                }
                let mut reply = self.identity_args();
                let addrs = self.routing.lock().await.peer_addrs(&self.info_hash);
                reply.nodes = Some(encode_peer_list(&addrs));
                self.send_response(transaction_id, reply, from).await
            }
            KrpcKind::GetPeers => {
                let wanted = args.info_hash.as_deref().unwrap_or_default();
                if wanted != hex::encode(self.info_hash) {
                    debug!("get_peers for foreign torrent from {}, ignoring", from);
                    return Ok(());
                }
                let mut reply = self.identity_args();
                let addrs = self.routing.lock().await.peer_addrs(&self.info_hash);
                reply.values = Some(encode_peer_list(&addrs));
                reply.token = Some(self.mint_token(&from));
                self.send_response(transaction_id, reply, from).await
            }
            KrpcKind::AnnouncePeer => self.handle_announce(transaction_id, args, from).await,
        }
    }

    /// Token-guarded announce: the token must be one we minted for the
    /// announcing address via an earlier get_peers
    async fn handle_announce(
        &self,
        transaction_id: String,
        args: KrpcArgs,
        from: SocketAddr,
    ) -> Result<()> {
        let token = args.token.as_deref().unwrap_or_default();
        if token != self.mint_token(&from) {
            warn!("Rejecting announce from {}: bad token", from);
            let error = KrpcDatagram::error(transaction_id, ERROR_BAD_TOKEN, "bad token".to_string());
            self.socket.send_to(&error.encode()?, from).await?;
            return Ok(());
        }

        let port = args.port.ok_or_else(|| {
            ShareError::dht_error_with_node("Announce without a port", from.to_string())
        })?;
        let peer_addr = SocketAddr::new(from.ip(), port);
        info!("Peer {} announced for {}", peer_addr, hex::encode(self.info_hash));

        self.send_response(transaction_id, self.identity_args(), from).await?;

        // The announcer is a downloadable peer right away; its routing
        // entry waits for a measured round-trip
        if self.discovered_tx.send(peer_addr).is_err() {
            trace!("No listener for discovered peers");
        }
        self.send_query(KrpcKind::Ping, self.identity_args(), from, Some(peer_addr)).await
    }

    async fn handle_response(
        &self,
        transaction_id: String,
        args: KrpcArgs,
        from: SocketAddr,
    ) -> Result<()> {
        let pending = match self.pending.lock().await.remove(&transaction_id) {
            Some(pending) => pending,
            None => {
                return Err(ShareError::dht_error_with_node(
                    "Response for unknown transaction",
                    from.to_string(),
                )
                .into())
            }
        };
        let rtt = pending.sent_at.elapsed();
        debug!("{} response from {} in {}ms", pending.kind, from, rtt.as_millis());

        let node_id = args
            .id
            .as_deref()
            .and_then(NodeId::from_hex)
            .unwrap_or_else(NodeId::random);

        match pending.kind {
            KrpcKind::Ping => {
                let addr = pending.peer_addr.unwrap_or(from);
                self.routing
                    .lock()
                    .await
                    .insert(self.info_hash, RouteEntry::new(node_id, addr, rtt));
            }
            KrpcKind::GetPeers => {
                self.routing
                    .lock()
                    .await
                    .insert(self.info_hash, RouteEntry::new(node_id, from, rtt));
                if let Some(token) = args.token {
                    self.received_tokens.lock().await.insert(from, token);
                }
                for peer in decode_peer_list(&args.values.unwrap_or_default()) {
                    trace!("Discovered peer {} via get_peers", peer);
                    if self.discovered_tx.send(peer).is_err() {
                        trace!("No listener for discovered peers");
                    }
                }
            }
            KrpcKind::FindNode => {
                self.routing
                    .lock()
                    .await
                    .insert(self.info_hash, RouteEntry::new(node_id, from, rtt));
                // Measure the reported contacts before routing them
                for contact in decode_peer_list(&args.nodes.unwrap_or_default()) {
                    self.send_query(KrpcKind::Ping, self.identity_args(), contact, None).await?;
                }
            }
            KrpcKind::AnnouncePeer => {
                debug!("Announce acknowledged by {}", from);
            }
        }
        Ok(())
    }

    /// Greet the configured bootstrap contacts
    pub async fn bootstrap(&self, contacts: &[SocketAddr]) -> Result<()> {
        info!("Bootstrapping DHT via {} contacts", contacts.len());
        for &addr in contacts {
            self.send_query(KrpcKind::Ping, self.identity_args(), addr, None).await?;
            let mut args = self.identity_args();
            args.info_hash = Some(hex::encode(self.info_hash));
            self.send_query(KrpcKind::GetPeers, args, addr, None).await?;
        }
        Ok(())
    }

    /// Announce our peer wire port to every routed contact that gave
    /// us a token
    pub async fn announce(&self) -> Result<usize> {
        let contacts = self.routing.lock().await.contacts(&self.info_hash);
        let tokens = self.received_tokens.lock().await.clone();

        let mut announced = 0;
        for contact in contacts {
            let token = match tokens.get(&contact.addr) {
                Some(token) => token.clone(),
                None => {
                    trace!("No token from {}, skipping announce", contact.addr);
                    continue;
                }
            };
            let mut args = self.identity_args();
            args.info_hash = Some(hex::encode(self.info_hash));
            args.port = Some(self.tcp_port);
            args.token = Some(token);
            self.send_query(KrpcKind::AnnouncePeer, args, contact.addr, None).await?;
            announced += 1;
        }
        info!("Announced to {} contacts", announced);
        Ok(announced)
    }

    async fn send_query(
        &self,
        kind: KrpcKind,
        args: KrpcArgs,
        addr: SocketAddr,
        peer_addr: Option<SocketAddr>,
    ) -> Result<()> {
        let transaction_id = generate_transaction_id();
        let datagram = KrpcDatagram::query(transaction_id.clone(), kind, args);

        self.pending.lock().await.insert(
            transaction_id,
            PendingQuery { kind, sent_at: Instant::now(), peer_addr },
        );
        self.socket.send_to(&datagram.encode()?, addr).await.map_err(|e| {
            ShareError::transport_error_full("Failed to send query", addr.to_string(), e.to_string())
        })?;
        trace!("Sent {} query to {}", kind, addr);
        Ok(())
    }

    async fn send_response(
        &self,
        transaction_id: String,
        args: KrpcArgs,
        addr: SocketAddr,
    ) -> Result<()> {
        let datagram = KrpcDatagram::response(transaction_id, args);
        self.socket.send_to(&datagram.encode()?, addr).await.map_err(|e| {
            ShareError::transport_error_full(
                "Failed to send response",
                addr.to_string(),
                e.to_string(),
            )
        })?;
        Ok(())
    }

    fn identity_args(&self) -> KrpcArgs {
        KrpcArgs { id: Some(self.node_id.to_hex()), ..Default::default() }
    }

    /// Token for an address: SHA-1 over the address ip and our secret
    fn mint_token(&self, addr: &SocketAddr) -> String {
        let mut hasher = Sha1::new();
        hasher.update(addr.ip().to_string().as_bytes());
        hasher.update(self.token_secret);
        hex::encode(hasher.finalize())
    }

    async fn expire_pending(&self) {
        let mut pending = self.pending.lock().await;
        let before = pending.len();
        pending.retain(|_, query| query.sent_at.elapsed() < TRANSACTION_TIMEOUT);
        let expired = before - pending.len();
        if expired > 0 {
            debug!("Expired {} unanswered transactions", expired);
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn contact_count(&self) -> usize {
        self.routing.lock().await.contact_count(&self.info_hash)
    }

    #[cfg(test)]
    async fn routed_contacts(&self) -> Vec<RouteEntry> {
        self.routing.lock().await.contacts(&self.info_hash)
    }
}
