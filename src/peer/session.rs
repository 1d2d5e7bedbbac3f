//! Peer sessions.
//!
//! Each connection is driven by three cooperating tasks sharing a split
//! socket:
//!
//! - the *receive* task reads frames and forwards them to control as
//!   typed events, applying the download rate gate;
//! - the *control* task owns the session state machine: choke and
//!   interest flags, the request pipeline against the chunk assigner,
//!   fetched/stored reporting through the disk mailbox, snub detection
//!   and the keepalive watchdog;
//! - the *send* task owns the transmit queue, batching frames,
//!   suppressing redundant keepalives, applying the upload rate gate
//!   and feeding the send-rate meter.
//!
//! A session dies on any frame error, transport error or shutdown
//! command. Death always reports `dropped` to the assigner before the
//! address slot is released, so a reconnecting peer can never observe
//! its predecessor's outstanding requests.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

use super::bitfield::Bitfield;
use super::error::PeerError;
use super::message::{Capabilities, Handshake, Message};
use super::peer_id::PeerId;
use super::state::{next_peer_key, PeerKey, PeerTable, SessionDirectory, SessionEntry};
use super::transport::{FrameReader, FrameWriter, PeerTransport};
use crate::assigner::{Chunk, Offer, TorrentAssigner};
use crate::bandwidth::BandwidthLimiter;
use crate::constants::{
    KEEPALIVE_AFTER, KEEPALIVE_GRACE, MAX_REQUEST_LENGTH, SESSION_CMD_CAPACITY,
    SESSION_EVENT_CAPACITY, SESSION_SEND_CAPACITY, SESSION_TICK, SNUB_TIMEOUT,
};
use crate::event::{EventBus, SwarmEvent};
use crate::manager::BadPeerTable;
use crate::rate::RateMeter;
use crate::registry::{Alteration, Registry, TorrentId};
use crate::storage::DiskHandle;

/// Commands a live session accepts from the rest of the engine.
#[derive(Debug, Clone)]
pub enum SessionCmd {
    /// Choker decision: stop serving this peer.
    Choke,
    /// Choker decision: serve this peer.
    Unchoke,
    /// Announce a freshly completed piece.
    Have(u32),
    /// Endgame: another peer stored this chunk first.
    Cancel(Chunk),
    /// Nudge the request pipeline (endgame entry).
    Fill,
    /// Cooperative shutdown from the supervisor.
    Shutdown,
}

enum PeerEvent {
    /// A decoded frame and its wire size.
    Frame(Message, usize),
    /// The connection is gone, with the error that ended it, if any.
    Closed(Option<PeerError>),
}

enum SendCmd {
    Deliver(Message),
    /// Drop a not-yet-sent piece reply matching an incoming cancel.
    CancelPiece { index: u32, begin: u32 },
    Close,
}

/// Everything a session needs from the engine.
#[derive(Clone)]
pub struct SessionCtx {
    pub torrent: TorrentId,
    pub registry: Arc<Registry>,
    pub table: Arc<PeerTable>,
    pub directory: Arc<SessionDirectory>,
    pub assigner: Arc<TorrentAssigner>,
    pub bad_peers: Arc<BadPeerTable>,
    pub disk: DiskHandle,
    pub bandwidth: Arc<BandwidthLimiter>,
    pub events: EventBus,
    pub pipeline_depth: usize,
}

/// Result of a completed handshake, ready to become a session.
pub struct Handshaken {
    pub transport: PeerTransport,
    pub torrent: TorrentId,
    pub remote_id: [u8; 20],
    pub caps: Capabilities,
}

/// Dials the handshake on an outbound connection where we picked the
/// torrent.
pub async fn handshake_outbound(
    stream: tokio::net::TcpStream,
    torrent: TorrentId,
    info_hash: [u8; 20],
    our_id: &PeerId,
    advertise_dht: bool,
) -> Result<Handshaken, PeerError> {
    let mut transport = PeerTransport::new(stream);
    let ours = Handshake::new(info_hash, *our_id.as_bytes(), advertise_dht);
    transport.send_handshake(&ours).await?;
    let theirs = transport.receive_handshake().await?;
    if theirs.info_hash != info_hash {
        return Err(PeerError::InfoHashMismatch);
    }
    Ok(Handshaken {
        transport,
        torrent,
        remote_id: theirs.peer_id,
        caps: Capabilities::combine(&ours.reserved, &theirs.reserved),
    })
}

/// Answers the handshake on an accepted connection; the remote names
/// the torrent and we must be serving it.
pub async fn handshake_inbound(
    stream: tokio::net::TcpStream,
    registry: &Registry,
    our_id: &PeerId,
    advertise_dht: bool,
) -> Result<Handshaken, PeerError> {
    let mut transport = PeerTransport::new(stream);
    let theirs = transport.receive_handshake().await?;
    let torrent = registry
        .find_by_info_hash(&theirs.info_hash)
        .ok_or(PeerError::UnknownTorrent)?;
    let ours = Handshake::new(theirs.info_hash, *our_id.as_bytes(), advertise_dht);
    transport.send_handshake(&ours).await?;
    Ok(Handshaken {
        transport,
        torrent,
        remote_id: theirs.peer_id,
        caps: Capabilities::combine(&ours.reserved, &theirs.reserved),
    })
}

/// Registers the session and spins up its task trio.
pub fn spawn(ctx: SessionCtx, shaken: Handshaken, addr: SocketAddr) -> Result<PeerKey, PeerError> {
    let key = next_peer_key();
    let (cmd_tx, cmd_rx) = mpsc::channel(SESSION_CMD_CAPACITY);
    ctx.directory.register(
        key,
        SessionEntry {
            addr,
            torrent: ctx.torrent,
            remote_id: shaken.remote_id,
            cmd: cmd_tx,
        },
    )?;
    ctx.table.insert(ctx.torrent, key);
    let _ = ctx
        .registry
        .apply(ctx.torrent, &[Alteration::IncConnectedLeecher]);

    let (event_tx, event_rx) = mpsc::channel(SESSION_EVENT_CAPACITY);
    let (send_tx, send_rx) = mpsc::channel(SESSION_SEND_CAPACITY);
    let (reader, writer) = shaken.transport.split();

    tokio::spawn(receive_loop(reader, event_tx.clone(), ctx.bandwidth.clone()));
    tokio::spawn(send_loop(
        writer,
        send_rx,
        event_tx,
        ctx.bandwidth.clone(),
        ctx.table.clone(),
        ctx.torrent,
        key,
    ));

    let control = Control::new(ctx, key, addr, shaken.remote_id, shaken.caps, send_tx);
    tokio::spawn(control.run(event_rx, cmd_rx));
    Ok(key)
}

async fn receive_loop(
    mut reader: FrameReader,
    events: mpsc::Sender<PeerEvent>,
    bandwidth: Arc<BandwidthLimiter>,
) {
    loop {
        match reader.next_frame().await {
            Ok((message, wire_len)) => {
                bandwidth.acquire_download(wire_len).await;
                if events.send(PeerEvent::Frame(message, wire_len)).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                let _ = events.send(PeerEvent::Closed(Some(err))).await;
                break;
            }
        }
    }
}

async fn send_loop(
    mut writer: FrameWriter,
    mut rx: mpsc::Receiver<SendCmd>,
    events: mpsc::Sender<PeerEvent>,
    bandwidth: Arc<BandwidthLimiter>,
    table: Arc<PeerTable>,
    torrent: TorrentId,
    key: PeerKey,
) {
    let started = Instant::now();
    let mut meter = RateMeter::new(0);
    let mut queue: VecDeque<Message> = VecDeque::new();

    'outer: loop {
        if queue.is_empty() {
            match rx.recv().await {
                Some(cmd) => {
                    if !enqueue(&mut queue, cmd) {
                        break;
                    }
                }
                None => break,
            }
        }
        // Batch whatever else is already waiting.
        while let Ok(cmd) = rx.try_recv() {
            if !enqueue(&mut queue, cmd) {
                break 'outer;
            }
        }
        // A keepalive is pointless next to real traffic.
        if queue.len() > 1 {
            queue.retain(|m| !matches!(m, Message::KeepAlive));
        }

        while let Some(message) = queue.pop_front() {
            let data = message.encode();
            bandwidth.acquire_upload(data.len()).await;
            if let Err(err) = writer.write_raw(&data).await {
                let _ = events.send(PeerEvent::Closed(Some(err))).await;
                break 'outer;
            }
            let rate = meter.update(data.len() as u64, started.elapsed().as_secs());
            table.update(torrent, key, |f| f.send_rate = rate);
        }
    }
}

fn enqueue(queue: &mut VecDeque<Message>, cmd: SendCmd) -> bool {
    match cmd {
        SendCmd::Deliver(message) => queue.push_back(message),
        SendCmd::CancelPiece { index, begin } => {
            queue.retain(|m| {
                !matches!(m, Message::Piece { index: i, begin: b, .. } if *i == index && *b == begin)
            });
        }
        SendCmd::Close => return false,
    }
    true
}

struct Control {
    ctx: SessionCtx,
    key: PeerKey,
    addr: SocketAddr,
    remote_id: [u8; 20],
    send: mpsc::Sender<SendCmd>,
    piece_count: usize,
    peer_pieces: Option<Bitfield>,
    outstanding: Vec<Chunk>,
    local_choke: bool,
    remote_choke: bool,
    local_interest: bool,
    counted_as_seeder: bool,
    endgame_seen: bool,
    started: Instant,
    last_traffic: Instant,
    last_piece: Instant,
    keepalive_sent: bool,
    recv_meter: RateMeter,
}

impl Control {
    fn new(
        ctx: SessionCtx,
        key: PeerKey,
        addr: SocketAddr,
        remote_id: [u8; 20],
        caps: Capabilities,
        send: mpsc::Sender<SendCmd>,
    ) -> Self {
        let now = Instant::now();
        let piece_count = ctx.registry.num_pieces(ctx.torrent).unwrap_or(0) as usize;
        debug!(
            torrent = ctx.torrent,
            peer = key,
            %addr,
            dht = caps.dht(),
            "peer session started"
        );
        Self {
            ctx,
            key,
            addr,
            remote_id,
            send,
            piece_count,
            peer_pieces: None,
            outstanding: Vec::new(),
            local_choke: true,
            remote_choke: true,
            local_interest: false,
            counted_as_seeder: false,
            endgame_seen: false,
            started: now,
            last_traffic: now,
            last_piece: now,
            keepalive_sent: false,
            recv_meter: RateMeter::new(0),
        }
    }

    fn clock(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    async fn run(
        mut self,
        mut events: mpsc::Receiver<PeerEvent>,
        mut commands: mpsc::Receiver<SessionCmd>,
    ) {
        // Tell the peer what we already have.
        let ours = self.ctx.assigner.our_bitfield();
        if !ours.is_empty() {
            self.deliver(Message::Bitfield(ours.to_bytes())).await;
        }

        let mut tick = interval(SESSION_TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let ended: Option<PeerError> = 'main: loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(PeerEvent::Frame(message, wire_len)) => {
                        self.last_traffic = Instant::now();
                        self.keepalive_sent = false;
                        let rate = self.recv_meter.update(wire_len as u64, self.clock());
                        let (torrent, key) = (self.ctx.torrent, self.key);
                        self.ctx.table.update(torrent, key, |f| f.recv_rate = rate);
                        if let Err(err) = self.on_frame(message).await {
                            break 'main Some(err);
                        }
                    }
                    Some(PeerEvent::Closed(err)) => break 'main err,
                    None => break 'main None,
                },
                cmd = commands.recv() => match cmd {
                    Some(SessionCmd::Shutdown) | None => break 'main None,
                    Some(cmd) => self.on_cmd(cmd).await,
                },
                _ = tick.tick() => {
                    if !self.housekeeping().await {
                        break 'main None;
                    }
                }
            }
        };

        if let Some(err) = &ended {
            debug!(peer = self.key, addr = %self.addr, "session ended: {err}");
            if err.is_protocol_offense() {
                self.ctx
                    .bad_peers
                    .enter(self.addr.ip(), self.addr.port(), Some(self.remote_id));
            }
        }
        self.shutdown().await;
    }

    async fn deliver(&self, message: Message) {
        let _ = self.send.send(SendCmd::Deliver(message)).await;
    }

    async fn on_frame(&mut self, message: Message) -> Result<(), PeerError> {
        match message {
            Message::KeepAlive | Message::Unknown { .. } => {}
            Message::Choke => {
                self.remote_choke = true;
                self.update_flags(|f| f.remote_choke = true);
                // Our in-flight requests are presumed discarded.
                self.outstanding.clear();
                self.ctx.assigner.reclaim_pending(self.key);
            }
            Message::Unchoke => {
                self.remote_choke = false;
                self.update_flags(|f| f.remote_choke = false);
                self.try_fill().await;
            }
            Message::Interested => {
                self.update_flags(|f| f.remote_interest = true);
            }
            Message::NotInterested => {
                self.update_flags(|f| f.remote_interest = false);
            }
            Message::Have { piece } => self.on_have(piece).await?,
            Message::Bitfield(bits) => self.on_bitfield(bits).await?,
            Message::Request { index, begin, length } => {
                self.on_request(index, begin, length).await?
            }
            Message::Piece { index, begin, data } => self.on_piece(index, begin, data).await?,
            Message::Cancel { index, begin, .. } => {
                let _ = self.send.send(SendCmd::CancelPiece { index, begin }).await;
            }
        }
        Ok(())
    }

    async fn on_bitfield(&mut self, bits: bytes::Bytes) -> Result<(), PeerError> {
        let bitfield = Bitfield::from_bytes(bits, self.piece_count);
        self.ctx.assigner.peer_has_bitfield(&bitfield);
        if bitfield.is_complete() {
            self.count_as_seeder();
        }
        let interesting = self.ctx.assigner.wants_any(&bitfield);
        self.peer_pieces = Some(bitfield);
        if interesting && !self.local_interest {
            self.local_interest = true;
            self.update_flags(|f| f.local_interest = true);
            self.deliver(Message::Interested).await;
        }
        self.try_fill().await;
        Ok(())
    }

    async fn on_have(&mut self, piece: u32) -> Result<(), PeerError> {
        if piece as usize >= self.piece_count {
            return Err(PeerError::Protocol(format!("have for piece {piece} out of range")));
        }
        let bitfield = self
            .peer_pieces
            .get_or_insert_with(|| Bitfield::new(self.piece_count));
        bitfield.set_piece(piece as usize);
        self.ctx.assigner.peer_has_piece(piece);

        if self.peer_pieces.as_ref().is_some_and(Bitfield::is_complete) {
            self.count_as_seeder();
        }
        if !self.local_interest {
            let interesting = self
                .peer_pieces
                .as_ref()
                .is_some_and(|bf| self.ctx.assigner.wants_any(bf));
            if interesting {
                self.local_interest = true;
                self.update_flags(|f| f.local_interest = true);
                self.deliver(Message::Interested).await;
            }
        }
        self.try_fill().await;
        Ok(())
    }

    async fn on_request(&mut self, index: u32, begin: u32, length: u32) -> Result<(), PeerError> {
        if index as usize >= self.piece_count {
            return Err(PeerError::Protocol(format!(
                "request for piece {index} out of range"
            )));
        }
        if length == 0 || length > MAX_REQUEST_LENGTH {
            return Err(PeerError::Protocol(format!("request of {length} bytes")));
        }
        if self.local_choke {
            debug!(peer = self.key, "ignoring request from choked peer");
            return Ok(());
        }
        let chunk = Chunk { piece: index, offset: begin, length };
        match self.ctx.disk.read_chunk(self.ctx.torrent, chunk).await {
            Ok(data) => {
                self.deliver(Message::Piece { index, begin, data }).await;
                let _ = self
                    .ctx
                    .registry
                    .apply(self.ctx.torrent, &[Alteration::AddUpload(u64::from(length))]);
            }
            Err(err) => {
                debug!(peer = self.key, piece = index, "cannot serve request: {err}");
            }
        }
        Ok(())
    }

    async fn on_piece(&mut self, index: u32, begin: u32, data: bytes::Bytes) -> Result<(), PeerError> {
        let chunk = Chunk {
            piece: index,
            offset: begin,
            length: data.len() as u32,
        };
        let Some(position) = self.outstanding.iter().position(|c| *c == chunk) else {
            // Late arrival for a cancelled or reassigned chunk.
            debug!(peer = self.key, piece = index, begin, "unsolicited piece payload");
            return Ok(());
        };
        self.outstanding.remove(position);
        self.last_piece = Instant::now();
        self.update_flags(|f| f.snubbed = false);

        let length = u64::from(chunk.length);
        let _ = self
            .ctx
            .registry
            .apply(self.ctx.torrent, &[Alteration::AddDownloaded(length)]);
        self.ctx.assigner.fetched(chunk, self.key);

        // Waiting for the ack keeps at most one write in flight and lets
        // a full disk queue throttle this peer via TCP backpressure.
        self.ctx
            .disk
            .write_chunk(self.ctx.torrent, chunk, data)
            .await
            .map_err(|err| PeerError::Storage(err.to_string()))?;

        let outcome = self.ctx.assigner.stored(chunk, self.key);
        if outcome.newly_stored {
            let _ = self
                .ctx
                .registry
                .apply(self.ctx.torrent, &[Alteration::SubtractLeft(length)]);
        }
        for (peer, cancelled) in outcome.cancels {
            self.ctx
                .directory
                .send(peer, SessionCmd::Cancel(cancelled))
                .await;
        }
        if let Some(piece) = outcome.piece_complete {
            self.ctx.events.emit(SwarmEvent::PieceComplete {
                torrent: self.ctx.torrent,
                piece,
            });
            self.ctx
                .directory
                .broadcast_except(self.ctx.torrent, self.key, SessionCmd::Have(piece))
                .await;
            self.announce_have(piece).await;
        }
        self.try_fill().await;
        Ok(())
    }

    /// Sends `have` to this session's peer and drops interest if the
    /// peer has nothing we still need.
    async fn announce_have(&mut self, piece: u32) {
        self.deliver(Message::Have { piece }).await;
        if self.local_interest {
            let still_wanted = self
                .peer_pieces
                .as_ref()
                .is_some_and(|bf| self.ctx.assigner.wants_any(bf));
            if !still_wanted {
                self.local_interest = false;
                self.update_flags(|f| f.local_interest = false);
                self.deliver(Message::NotInterested).await;
            }
        }
    }

    async fn on_cmd(&mut self, cmd: SessionCmd) {
        match cmd {
            SessionCmd::Choke => {
                if !self.local_choke {
                    self.local_choke = true;
                    self.update_flags(|f| f.local_choke = true);
                    self.deliver(Message::Choke).await;
                }
            }
            SessionCmd::Unchoke => {
                if self.local_choke {
                    self.local_choke = false;
                    self.update_flags(|f| f.local_choke = false);
                    self.deliver(Message::Unchoke).await;
                }
            }
            SessionCmd::Have(piece) => self.announce_have(piece).await,
            SessionCmd::Cancel(chunk) => {
                if let Some(position) = self.outstanding.iter().position(|c| *c == chunk) {
                    self.outstanding.remove(position);
                    self.deliver(Message::Cancel {
                        index: chunk.piece,
                        begin: chunk.offset,
                        length: chunk.length,
                    })
                    .await;
                }
            }
            SessionCmd::Fill => self.try_fill().await,
            SessionCmd::Shutdown => unreachable!("handled by the main loop"),
        }
    }

    /// Keeps the request pipeline full while the peer lets us download.
    async fn try_fill(&mut self) {
        if self.remote_choke || !self.local_interest {
            return;
        }
        while self.outstanding.len() < self.ctx.pipeline_depth {
            let want = self.ctx.pipeline_depth - self.outstanding.len();
            let Some(bitfield) = self.peer_pieces.clone() else { return };
            match self.ctx.assigner.request(want, &bitfield, self.key) {
                Offer::Chunks(chunks) => {
                    for chunk in chunks {
                        self.outstanding.push(chunk);
                        self.deliver(Message::Request {
                            index: chunk.piece,
                            begin: chunk.offset,
                            length: chunk.length,
                        })
                        .await;
                    }
                }
                Offer::Endgame(chunks) => {
                    if !self.endgame_seen {
                        self.endgame_seen = true;
                        // Wake the siblings so they start duplicating too.
                        self.ctx
                            .directory
                            .broadcast_except(self.ctx.torrent, self.key, SessionCmd::Fill)
                            .await;
                    }
                    for chunk in chunks {
                        self.outstanding.push(chunk);
                        self.deliver(Message::Request {
                            index: chunk.piece,
                            begin: chunk.offset,
                            length: chunk.length,
                        })
                        .await;
                    }
                }
                Offer::None => break,
            }
        }
    }

    /// Periodic snub detection, rate decay and the keepalive watchdog.
    /// Returns false when the session should die.
    async fn housekeeping(&mut self) -> bool {
        let now = Instant::now();

        if self.local_interest && now.duration_since(self.last_piece) >= SNUB_TIMEOUT {
            self.update_flags(|f| f.snubbed = true);
        }

        let rate = self.recv_meter.update(0, self.clock());
        self.update_flags(|f| f.recv_rate = rate);

        let idle = now.duration_since(self.last_traffic);
        if idle >= KEEPALIVE_AFTER + KEEPALIVE_GRACE {
            warn!(peer = self.key, addr = %self.addr, "peer silent too long, closing");
            return false;
        }
        if idle >= KEEPALIVE_AFTER && !self.keepalive_sent {
            self.keepalive_sent = true;
            self.deliver(Message::KeepAlive).await;
        }
        true
    }

    fn update_flags(&self, apply: impl FnOnce(&mut super::state::PeerFlags)) {
        self.ctx.table.update(self.ctx.torrent, self.key, apply);
    }

    fn count_as_seeder(&mut self) {
        if self.counted_as_seeder {
            return;
        }
        self.counted_as_seeder = true;
        let _ = self.ctx.registry.apply(
            self.ctx.torrent,
            &[
                Alteration::DecConnectedLeecher,
                Alteration::IncConnectedSeeder,
            ],
        );
    }

    async fn shutdown(self) {
        // Reclaim before releasing the address slot: a reconnect must
        // observe the drop as already processed.
        self.ctx
            .assigner
            .dropped(self.key, self.peer_pieces.as_ref());
        self.ctx.table.remove(self.ctx.torrent, self.key);
        self.ctx.directory.unregister(self.key);
        let counter = if self.counted_as_seeder {
            Alteration::DecConnectedSeeder
        } else {
            Alteration::DecConnectedLeecher
        };
        let _ = self.ctx.registry.apply(self.ctx.torrent, &[counter]);
        let _ = self.send.send(SendCmd::Close).await;
        debug!(peer = self.key, addr = %self.addr, "session closed");
    }
}
