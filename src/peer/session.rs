//! Peer wire session
//!
//! One session per TCP connection, driving the state machine
//! Connecting -> Handshaking -> Negotiating -> Active -> Closed.
//! A session that misbehaves is closed on its own; the process and the
//! other sessions are never affected.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::{interval_at, timeout, Instant};
use tracing::{debug, info, trace, warn};

use crate::error::ShareError;
use crate::peer::manager::ConnectionSlots;
use crate::peer::Bitfield;
use crate::protocol::{
    decode_frame, read_handshake, write_frame, write_handshake, Handshake, Message,
    MAX_FRAME_LENGTH,
};
use crate::storage::{Block, PieceStore};
use crate::torrent::BLOCK_LENGTH;

/// How many block requests a session keeps in flight
const MAX_OUTSTANDING_REQUESTS: usize = 5;

/// Dial timeout for outbound connections
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Handshaking,
    Negotiating,
    Active,
    Closed,
}

/// Which end of the connection we are
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    /// We dialed the peer to download
    Initiator,
    /// The peer dialed us; we serve
    Responder,
}

/// The four independent choke/interest flags
#[derive(Debug, Clone, Copy)]
pub struct SessionFlags {
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
}

impl Default for SessionFlags {
    fn default() -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}

/// A single peer connection and its protocol state
pub struct PeerWireSession<S> {
    reader: ReadHalf<S>,
    writer: WriteHalf<S>,
    peer_label: String,
    role: SessionRole,
    state: SessionState,
    flags: SessionFlags,
    store: Arc<PieceStore>,
    remote_peer_id: Option<[u8; 20]>,
    remote_bitfield: Option<Bitfield>,
    /// Blocks we have requested and not yet received
    outstanding: HashSet<(u32, u32)>,
    /// Requests from the peer we have not yet answered
    pending_serves: HashSet<(u32, u32, u32)>,
    slots: Arc<ConnectionSlots>,
    slot_held: bool,
    completed_rx: Option<broadcast::Receiver<u32>>,
    idle_timeout: Duration,
    keepalive_period: Duration,
    last_frame_at: Instant,
}

impl PeerWireSession<TcpStream> {
    /// Dial a peer and complete the handshake
    pub async fn connect(
        addr: SocketAddr,
        store: Arc<PieceStore>,
        our_peer_id: [u8; 20],
        slots: Arc<ConnectionSlots>,
        completed_rx: Option<broadcast::Receiver<u32>>,
        idle_timeout: Duration,
    ) -> Result<Self> {
        info!("Connecting to peer: {}", addr);

        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|e| {
                warn!("Connection timeout to {}", addr);
                ShareError::transport_error_full("Connection timeout", addr.to_string(), e.to_string())
            })?
            .map_err(|e| {
                ShareError::transport_error_full("Failed to connect", addr.to_string(), e.to_string())
            })?;

        let mut session = PeerWireSession::from_stream(
            stream,
            addr.to_string(),
            SessionRole::Initiator,
            store,
            slots,
            completed_rx,
            idle_timeout,
        );
        session.handshake_as_initiator(our_peer_id).await?;
        Ok(session)
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> PeerWireSession<S> {
    /// Wrap an established stream. The session starts in Connecting and
    /// advances through the handshake methods.
    pub fn from_stream(
        stream: S,
        peer_label: String,
        role: SessionRole,
        store: Arc<PieceStore>,
        slots: Arc<ConnectionSlots>,
        completed_rx: Option<broadcast::Receiver<u32>>,
        idle_timeout: Duration,
    ) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader,
            writer,
            peer_label,
            role,
            state: SessionState::Connecting,
            flags: SessionFlags::default(),
            store,
            remote_peer_id: None,
            remote_bitfield: None,
            outstanding: HashSet::new(),
            pending_serves: HashSet::new(),
            slots,
            slot_held: false,
            completed_rx,
            idle_timeout,
            keepalive_period: idle_timeout / 3,
            last_frame_at: Instant::now(),
        }
    }

    /// Send our handshake, read the reply, validate, send our bitfield
    pub async fn handshake_as_initiator(&mut self, our_peer_id: [u8; 20]) -> Result<()> {
        self.state = SessionState::Handshaking;
        let info_hash = self.store.metadata().info_hash;

        debug!("Sending handshake to {}", self.peer_label);
        let ours = Handshake::new(info_hash, our_peer_id);
        write_handshake(&mut self.writer, &ours).await?;

        let theirs = read_handshake(&mut self.reader).await?;
        self.check_handshake(&theirs).await?;
        self.send_local_bitfield().await?;
        self.state = SessionState::Negotiating;

        info!("Handshake complete with {}", self.peer_label);
        Ok(())
    }

    /// Read the peer's handshake, validate, reply with ours and our bitfield
    pub async fn handshake_as_responder(&mut self, our_peer_id: [u8; 20]) -> Result<()> {
        self.state = SessionState::Handshaking;
        let info_hash = self.store.metadata().info_hash;

        let theirs = read_handshake(&mut self.reader).await?;
        self.check_handshake(&theirs).await?;

        debug!("Replying with handshake to {}", self.peer_label);
        let ours = Handshake::new(info_hash, our_peer_id);
        write_handshake(&mut self.writer, &ours).await?;
        self.send_local_bitfield().await?;
        self.state = SessionState::Negotiating;

        info!("Handshake complete with {}", self.peer_label);
        Ok(())
    }

    /// Validate a received handshake. A wrong info-hash gets an explicit
    /// choke as the close notice, then the session is closed.
    async fn check_handshake(&mut self, theirs: &Handshake) -> Result<()> {
        let expected = self.store.metadata().info_hash;
        if !theirs.validate(&expected) {
            let _ = write_frame(&mut self.writer, &Message::Choke).await;
            self.close("info-hash mismatch").await;
            return Err(ShareError::info_hash_mismatch(&expected, &theirs.info_hash).into());
        }
        self.remote_peer_id = Some(theirs.peer_id);
        Ok(())
    }

    async fn send_local_bitfield(&mut self) -> Result<()> {
        let bitfield = self.store.bitfield().await;
        write_frame(
            &mut self.writer,
            &Message::Bitfield { bits: bitfield.as_bytes().to_vec() },
        )
        .await
    }

    /// Drive the session until it closes. Bytes accumulate into a read
    /// buffer and complete frames are parsed out of it, so the
    /// keep-alive timer firing mid-frame never loses consumed bytes.
    /// Protocol violations and idle timeouts close this session only.
    pub async fn run(&mut self) -> Result<()> {
        let mut buf = BytesMut::with_capacity(2 * MAX_FRAME_LENGTH);
        let mut keepalive =
            interval_at(Instant::now() + self.keepalive_period, self.keepalive_period);

        while self.state != SessionState::Closed {
            self.forward_completed_pieces().await?;

            // Drain every complete frame already buffered
            loop {
                let message = match decode_frame(&mut buf) {
                    Ok(Some(message)) => message,
                    Ok(None) => break,
                    Err(e) => {
                        self.close("malformed frame").await;
                        return Err(e);
                    }
                };
                self.last_frame_at = Instant::now();
                if let Err(e) = self.handle_frame(message).await {
                    self.close("protocol violation").await;
                    return Err(e);
                }
                if self.state == SessionState::Closed {
                    return Ok(());
                }
            }

            let received = tokio::select! {
                read = self.reader.read_buf(&mut buf) => Some(read),
                _ = keepalive.tick() => None,
            };

            match received {
                Some(Ok(0)) => {
                    self.close("peer disconnected").await;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    self.close("read failed").await;
                    return Err(e.into());
                }
                None => {
                    if self.last_frame_at.elapsed() >= self.idle_timeout {
                        info!("Peer {} idle for {:?}, closing", self.peer_label, self.idle_timeout);
                        self.close("idle timeout").await;
                    } else {
                        trace!("Sending keep-alive to {}", self.peer_label);
                        write_frame(&mut self.writer, &Message::KeepAlive).await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Relay pieces completed on other sessions as have frames
    async fn forward_completed_pieces(&mut self) -> Result<()> {
        if self.state != SessionState::Active && self.state != SessionState::Negotiating {
            return Ok(());
        }
        let mut announce = Vec::new();
        if let Some(rx) = self.completed_rx.as_mut() {
            while let Ok(piece_index) = rx.try_recv() {
                announce.push(piece_index);
            }
        }
        for piece_index in announce {
            write_frame(&mut self.writer, &Message::Have { piece_index }).await?;
        }
        Ok(())
    }

    /// Process one frame according to the current state
    pub async fn handle_frame(&mut self, message: Message) -> Result<()> {
        trace!("Frame {:?} from {} in {:?}", message.message_id(), self.peer_label, self.state);

        match self.state {
            SessionState::Negotiating => self.handle_negotiating(message).await,
            SessionState::Active => self.handle_active(message).await,
            _ => Err(ShareError::protocol_error_with_source(
                "Frame received outside a running session",
                format!("state: {:?}", self.state),
            )
            .into()),
        }
    }

    async fn handle_negotiating(&mut self, message: Message) -> Result<()> {
        match message {
            Message::KeepAlive => Ok(()),
            Message::Bitfield { bits } => self.accept_remote_bitfield(&bits).await,
            Message::Have { piece_index } => self.note_remote_have(piece_index).await,
            Message::Interested => {
                self.flags.peer_interested = true;
                self.answer_interest().await
            }
            Message::NotInterested => {
                self.flags.peer_interested = false;
                Ok(())
            }
            Message::Choke => {
                self.flags.peer_choking = true;
                Ok(())
            }
            Message::Unchoke => {
                self.flags.peer_choking = false;
                self.state = SessionState::Active;
                debug!("Session with {} is active", self.peer_label);
                self.pump_requests().await
            }
            Message::Port { dht_port } => {
                debug!("Peer {} announces DHT port {}", self.peer_label, dht_port);
                Ok(())
            }
            other => Err(ShareError::protocol_error_with_source(
                "Frame not valid while negotiating",
                format!("{:?}", other.message_id()),
            )
            .into()),
        }
    }

    async fn handle_active(&mut self, message: Message) -> Result<()> {
        match message {
            Message::KeepAlive => Ok(()),
            Message::Have { piece_index } => {
                self.note_remote_have(piece_index).await?;
                self.pump_requests().await
            }
            Message::Interested => {
                self.flags.peer_interested = true;
                self.answer_interest().await
            }
            Message::NotInterested => {
                self.flags.peer_interested = false;
                Ok(())
            }
            Message::Choke => {
                self.flags.peer_choking = true;
                // Outstanding requests will not be answered
                self.outstanding.clear();
                Ok(())
            }
            Message::Unchoke => {
                self.flags.peer_choking = false;
                self.pump_requests().await
            }
            Message::Request { index, begin, length } => {
                self.serve_request(index, begin, length).await
            }
            Message::Cancel { index, begin, length } => {
                // Removing an absent entry is a no-op, repeated cancels included
                let was_pending = self.pending_serves.remove(&(index, begin, length));
                trace!(
                    "Cancel for piece {} begin {} from {} (pending: {})",
                    index, begin, self.peer_label, was_pending
                );
                Ok(())
            }
            Message::Piece { index, begin, block } => self.accept_block(index, begin, block).await,
            Message::Port { dht_port } => {
                debug!("Peer {} announces DHT port {}", self.peer_label, dht_port);
                Ok(())
            }
            Message::Bitfield { .. } => Err(ShareError::protocol_error(
                "Bitfield is only valid directly after the handshake",
            )
            .into()),
        }
    }

    async fn accept_remote_bitfield(&mut self, bits: &[u8]) -> Result<()> {
        if self.remote_bitfield.is_some() {
            return Err(ShareError::protocol_error("Duplicate bitfield frame").into());
        }
        let bitfield = Bitfield::from_bytes(bits, self.store.metadata().num_pieces())?;
        debug!(
            "Peer {} has {}/{} pieces",
            self.peer_label,
            bitfield.count_set(),
            bitfield.num_pieces()
        );
        self.remote_bitfield = Some(bitfield);

        // Express interest when the peer can fill any of our gaps
        if self.role == SessionRole::Initiator && self.wants_remote_pieces().await {
            self.flags.am_interested = true;
            write_frame(&mut self.writer, &Message::Interested).await?;
        }
        Ok(())
    }

    /// Record a piece the peer advertised. A peer that skipped the
    /// bitfield frame still becomes interesting through have frames.
    async fn note_remote_have(&mut self, piece_index: u32) -> Result<()> {
        match self.remote_bitfield.as_mut() {
            Some(bitfield) => bitfield.set(piece_index as usize),
            None => {
                let mut bitfield = Bitfield::new(self.store.metadata().num_pieces());
                bitfield.set(piece_index as usize);
                self.remote_bitfield = Some(bitfield);
            }
        }
        if self.role == SessionRole::Initiator
            && !self.flags.am_interested
            && self.wants_remote_pieces().await
        {
            self.flags.am_interested = true;
            write_frame(&mut self.writer, &Message::Interested).await?;
        }
        Ok(())
    }

    async fn wants_remote_pieces(&self) -> bool {
        let local = self.store.bitfield().await;
        match &self.remote_bitfield {
            Some(remote) => local.missing().iter().any(|&i| remote.has(i)),
            None => false,
        }
    }

    /// Answer an interested peer: unchoke if a connection slot is free,
    /// otherwise choke explicitly and close
    async fn answer_interest(&mut self) -> Result<()> {
        if self.slot_held || self.slots.try_acquire() {
            self.slot_held = true;
            self.flags.am_choking = false;
            write_frame(&mut self.writer, &Message::Unchoke).await?;
            if self.state == SessionState::Negotiating {
                self.state = SessionState::Active;
                debug!("Session with {} is active", self.peer_label);
            }
            Ok(())
        } else {
            warn!(
                "At connection capacity ({}), refusing peer {}",
                self.slots.max(),
                self.peer_label
            );
            write_frame(&mut self.writer, &Message::Choke).await?;
            self.close("at capacity").await;
            Ok(())
        }
    }

    /// Serve one requested block from verified local data
    async fn serve_request(&mut self, index: u32, begin: u32, length: u32) -> Result<()> {
        if self.flags.am_choking {
            return Err(ShareError::protocol_error("Request received while choked").into());
        }
        if length as u64 > BLOCK_LENGTH {
            return Err(ShareError::protocol_error_with_source(
                "Requested length exceeds block length",
                format!("length: {}", length),
            )
            .into());
        }

        self.pending_serves.insert((index, begin, length));
        let block = self.store.read_block(index, begin, length).await?;
        // The peer may have cancelled while we were reading
        if self.pending_serves.remove(&(index, begin, length)) {
            trace!("Serving piece {} begin {} ({} bytes) to {}", index, begin, length, self.peer_label);
            write_frame(&mut self.writer, &Message::Piece { index, begin, block }).await?;
        }
        Ok(())
    }

    /// Store a received block; when it completes a piece, validate and
    /// flush, then announce the piece
    async fn accept_block(&mut self, index: u32, begin: u32, data: Vec<u8>) -> Result<()> {
        let block = Block::new(index, begin, data)?;
        self.outstanding.remove(&(index, block.block_index()));
        self.store.write_block(block).await?;

        if self.store.missing_blocks(index).await?.is_empty() && !self.store.has_piece(index).await {
            if self.store.validate_and_flush(index).await? {
                write_frame(&mut self.writer, &Message::Have { piece_index: index }).await?;
            } else {
                debug!("Piece {} failed validation, re-requesting", index);
            }
        }

        if self.store.is_complete().await {
            if self.flags.am_interested {
                self.flags.am_interested = false;
                write_frame(&mut self.writer, &Message::NotInterested).await?;
            }
            return Ok(());
        }

        self.pump_requests().await
    }

    /// Keep a pipeline of block requests in flight for pieces the peer
    /// has and we are missing
    async fn pump_requests(&mut self) -> Result<()> {
        if self.flags.peer_choking || self.state != SessionState::Active {
            return Ok(());
        }
        let remote = match &self.remote_bitfield {
            Some(remote) => remote.clone(),
            None => return Ok(()),
        };

        let local = self.store.bitfield().await;
        let mut requests = Vec::new();

        'pieces: for piece in local.missing() {
            if !remote.has(piece) {
                continue;
            }
            let piece = piece as u32;
            for block_index in self.store.missing_blocks(piece).await? {
                if self.outstanding.len() + requests.len() >= MAX_OUTSTANDING_REQUESTS {
                    break 'pieces;
                }
                if self.outstanding.contains(&(piece, block_index)) {
                    continue;
                }
                let length = self
                    .store
                    .metadata()
                    .block_len_at(piece as usize, block_index)
                    .unwrap_or(0) as u32;
                requests.push((piece, block_index, length));
            }
        }

        for (piece, block_index, length) in requests {
            let begin = (block_index as u64 * BLOCK_LENGTH) as u32;
            trace!("Requesting piece {} block {} from {}", piece, block_index, self.peer_label);
            write_frame(
                &mut self.writer,
                &Message::Request { index: piece, begin, length },
            )
            .await?;
            self.outstanding.insert((piece, block_index));
        }
        Ok(())
    }

    /// Close the session and release any held connection slot
    pub async fn close(&mut self, reason: &str) {
        if self.state == SessionState::Closed {
            return;
        }
        info!("Closing session with {}: {}", self.peer_label, reason);
        if self.slot_held {
            self.slots.release();
            self.slot_held = false;
        }
        self.state = SessionState::Closed;
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Current choke/interest flags
    pub fn flags(&self) -> SessionFlags {
        self.flags
    }

    /// Remote peer id learned from the handshake
    pub fn remote_peer_id(&self) -> Option<[u8; 20]> {
        self.remote_peer_id
    }
}
