use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::pending::PendingTracker;
use crate::peer::{Bitfield, PeerKey};
use crate::registry::{Alteration, Registry, TorrentId, TorrentMode};
use crate::util::group;

/// Conventional chunk size: requests never exceed 16 KiB.
pub const CHUNK_SIZE: u32 = 16384;

/// How many peers an outstanding chunk may be duplicated to in endgame.
pub const ENDGAME_REPLICATION: usize = 2;

/// One wire-request worth of piece data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Chunk {
    pub piece: u32,
    pub offset: u32,
    pub length: u32,
}

/// Lifecycle of a chunk. The four states partition the chunk universe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    /// Not handed to any peer.
    Free,
    /// On the wire to one peer (several in endgame).
    Assigned,
    /// Bytes received, write not yet acknowledged.
    Fetched,
    /// Durably written; verified once its piece completed.
    Stored,
}

/// What a session gets back when it asks for work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Offer {
    /// Fresh chunks, exclusively assigned.
    Chunks(Vec<Chunk>),
    /// Duplicated outstanding chunks; the torrent is in endgame.
    Endgame(Vec<Chunk>),
    /// Nothing this peer can do for us right now.
    None,
}

/// Result of a `stored` report.
#[derive(Debug, Default)]
pub struct StoredOutcome {
    /// False when the chunk was already stored by another peer; in
    /// endgame two deliveries can race and only the first one counts.
    pub newly_stored: bool,
    /// Other peers still holding an assignment for the chunk; the
    /// caller owes each of them a `cancel`.
    pub cancels: Vec<(PeerKey, Chunk)>,
    /// Set when this store completed the piece.
    pub piece_complete: Option<u32>,
    /// Set when this store completed the torrent.
    pub torrent_complete: bool,
}

/// Live chunk totals, one number per state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkCounts {
    pub free: usize,
    pub assigned: usize,
    pub fetched: usize,
    pub stored: usize,
}

impl ChunkCounts {
    pub fn total(&self) -> usize {
        self.free + self.assigned + self.fetched + self.stored
    }
}

struct PieceChunks {
    wanted: bool,
    states: Vec<ChunkState>,
    stored: usize,
}

impl PieceChunks {
    fn has_free(&self) -> bool {
        self.states.iter().any(|s| *s == ChunkState::Free)
    }

    fn is_complete(&self) -> bool {
        self.wanted && self.stored == self.states.len()
    }
}

struct AssignerState {
    pieces: Vec<PieceChunks>,
    availability: Vec<u32>,
    holders: HashMap<Chunk, Vec<PeerKey>>,
    pending: PendingTracker,
    mode: TorrentMode,
    counts: ChunkCounts,
}

/// Per-torrent chunk scheduler. Single writer behind one lock; every
/// mutation happens in one critical section, reads hand out copies.
pub struct TorrentAssigner {
    torrent: TorrentId,
    piece_count: u32,
    piece_length: u32,
    total: u64,
    registry: Arc<Registry>,
    state: Mutex<AssignerState>,
}

impl TorrentAssigner {
    /// Builds the chunk map for a torrent. `wanted_pieces`, when given,
    /// deselects pieces (partial download); deselected pieces are
    /// excluded from the chunk universe.
    pub fn new(
        torrent: TorrentId,
        registry: Arc<Registry>,
        piece_count: u32,
        piece_length: u32,
        total: u64,
        wanted_pieces: Option<&[bool]>,
    ) -> Arc<Self> {
        let mut pieces = Vec::with_capacity(piece_count as usize);
        let mut free = 0;
        for index in 0..piece_count {
            let wanted =
                wanted_pieces.map_or(true, |w| w.get(index as usize).copied().unwrap_or(true));
            let chunks = if wanted {
                chunk_count(piece_size(index, piece_count, piece_length, total))
            } else {
                0
            };
            free += chunks;
            pieces.push(PieceChunks {
                wanted,
                states: vec![ChunkState::Free; chunks],
                stored: 0,
            });
        }
        Arc::new(Self {
            torrent,
            piece_count,
            piece_length,
            total,
            registry,
            state: Mutex::new(AssignerState {
                pieces,
                availability: vec![0; piece_count as usize],
                holders: HashMap::new(),
                pending: PendingTracker::new(),
                mode: TorrentMode::Progress,
                counts: ChunkCounts { free, assigned: 0, fetched: 0, stored: 0 },
            }),
        })
    }

    pub fn torrent(&self) -> TorrentId {
        self.torrent
    }

    /// Marks pieces found intact during the startup check as stored,
    /// before any peer is connected.
    pub fn prime_stored(&self, pieces: &[u32]) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        for &index in pieces {
            let Some(piece) = state.pieces.get_mut(index as usize) else { continue };
            let mut converted = 0;
            for chunk_state in piece.states.iter_mut() {
                if *chunk_state == ChunkState::Free {
                    *chunk_state = ChunkState::Stored;
                    converted += 1;
                }
            }
            piece.stored += converted;
            state.counts.free -= converted;
            state.counts.stored += converted;
        }
    }

    /// Bitfield of the pieces we have fully stored, for announcing
    /// ourselves to a fresh peer.
    pub fn our_bitfield(&self) -> Bitfield {
        let state = self.state.lock();
        let mut bitfield = Bitfield::new(state.pieces.len());
        for (i, piece) in state.pieces.iter().enumerate() {
            if piece.is_complete() {
                bitfield.set_piece(i);
            }
        }
        bitfield
    }

    /// True if the peer has any piece we still need bytes from.
    pub fn wants_any(&self, peer_pieces: &Bitfield) -> bool {
        let state = self.state.lock();
        state
            .pieces
            .iter()
            .enumerate()
            .any(|(i, p)| p.wanted && !p.is_complete() && peer_pieces.has_piece(i))
    }

    /// Folds a freshly received bitfield into the availability counts.
    pub fn peer_has_bitfield(&self, peer_pieces: &Bitfield) {
        let mut state = self.state.lock();
        for i in 0..state.availability.len() {
            if peer_pieces.has_piece(i) {
                state.availability[i] += 1;
            }
        }
    }

    /// Availability bump for a single `have`.
    pub fn peer_has_piece(&self, piece: u32) {
        let mut state = self.state.lock();
        if let Some(count) = state.availability.get_mut(piece as usize) {
            *count += 1;
        }
    }

    /// Selects up to `n` chunks for `peer`.
    ///
    /// Rarest-first: among pieces we still need that the peer has and
    /// that contain a free chunk, the one with the lowest availability
    /// wins (ties to the lower index), and chunks come out in offset
    /// order. When the free set is globally empty but the torrent is
    /// unfinished, the torrent enters endgame and outstanding chunks
    /// are duplicated instead.
    pub fn request(&self, n: usize, peer_pieces: &Bitfield, peer: PeerKey) -> Offer {
        if n == 0 {
            return Offer::None;
        }
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let candidate = {
            let availability = &state.availability;
            state
                .pieces
                .iter()
                .enumerate()
                .filter(|(i, p)| p.wanted && peer_pieces.has_piece(*i) && p.has_free())
                .map(|(i, _)| (availability[i], i as u32))
                .min()
        };

        if let Some((_, piece_index)) = candidate {
            let taken = take_free_chunks(
                state,
                piece_index,
                n,
                self.piece_len(piece_index),
            );
            for chunk in &taken {
                state.holders.insert(*chunk, vec![peer]);
            }
            state.pending.add(peer, &taken);
            return Offer::Chunks(taken);
        }

        if state.counts.free == 0
            && state.counts.stored < state.counts.total()
            && state.mode == TorrentMode::Progress
        {
            state.mode = TorrentMode::Endgame;
            debug!(torrent = self.torrent, "entering endgame");
            let _ = self
                .registry
                .apply(self.torrent, &[Alteration::SetMode(TorrentMode::Endgame)]);
        }

        if state.mode == TorrentMode::Endgame {
            let duplicates = self.pick_endgame_chunks(state, n, peer_pieces, peer);
            if !duplicates.is_empty() {
                for chunk in &duplicates {
                    state.holders.entry(*chunk).or_default().push(peer);
                }
                state.pending.add(peer, &duplicates);
                return Offer::Endgame(duplicates);
            }
        }

        Offer::None
    }

    fn pick_endgame_chunks(
        &self,
        state: &mut AssignerState,
        n: usize,
        peer_pieces: &Bitfield,
        peer: PeerKey,
    ) -> Vec<Chunk> {
        let mut eligible: Vec<(usize, Chunk)> = Vec::new();
        for (i, piece) in state.pieces.iter().enumerate() {
            if !piece.wanted || !peer_pieces.has_piece(i) {
                continue;
            }
            let piece_len = self.piece_len(i as u32);
            for (c, chunk_state) in piece.states.iter().enumerate() {
                if *chunk_state != ChunkState::Assigned {
                    continue;
                }
                let chunk = chunk_at(i as u32, c as u32, piece_len);
                let holders = state.holders.get(&chunk).map_or(&[][..], Vec::as_slice);
                if holders.len() < ENDGAME_REPLICATION && !holders.contains(&peer) {
                    eligible.push((holders.len(), chunk));
                }
            }
        }
        // Least-replicated chunks first so duplication spreads evenly.
        eligible.sort_by_key(|(holders, chunk)| (*holders, chunk.piece, chunk.offset));
        eligible.into_iter().take(n).map(|(_, chunk)| chunk).collect()
    }

    /// Marks a chunk's bytes as received from `peer`. The chunk leaves
    /// the peer's pending set; other holders are untouched.
    pub fn fetched(&self, chunk: Chunk, peer: PeerKey) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.pending.remove(peer, chunk);
        let Some(piece) = state.pieces.get_mut(chunk.piece as usize) else { return };
        let index = (chunk.offset / CHUNK_SIZE) as usize;
        if let Some(chunk_state) = piece.states.get_mut(index) {
            if *chunk_state == ChunkState::Assigned {
                *chunk_state = ChunkState::Fetched;
                state.counts.assigned -= 1;
                state.counts.fetched += 1;
            }
        }
    }

    /// Marks a chunk durably stored. Returns the cancels owed to other
    /// endgame holders and whether the piece or torrent completed.
    pub fn stored(&self, chunk: Chunk, peer: PeerKey) -> StoredOutcome {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let mut outcome = StoredOutcome::default();

        let others: Vec<PeerKey> = state
            .holders
            .remove(&chunk)
            .unwrap_or_default()
            .into_iter()
            .filter(|p| *p != peer)
            .collect();
        for other in &others {
            state.pending.remove(*other, chunk);
            outcome.cancels.push((*other, chunk));
        }
        state.pending.remove(peer, chunk);

        let Some(piece) = state.pieces.get_mut(chunk.piece as usize) else {
            return outcome;
        };
        let index = (chunk.offset / CHUNK_SIZE) as usize;
        let Some(chunk_state) = piece.states.get_mut(index) else {
            return outcome;
        };
        match *chunk_state {
            ChunkState::Assigned => state.counts.assigned -= 1,
            ChunkState::Fetched => state.counts.fetched -= 1,
            ChunkState::Free => state.counts.free -= 1,
            ChunkState::Stored => return outcome,
        }
        *chunk_state = ChunkState::Stored;
        outcome.newly_stored = true;
        state.counts.stored += 1;
        piece.stored += 1;

        if piece.is_complete() {
            outcome.piece_complete = Some(chunk.piece);
        }
        if state.counts.stored == state.counts.total() {
            outcome.torrent_complete = true;
        }
        outcome
    }

    /// Reclaims everything `peer` had outstanding and drops its pieces
    /// from the availability counts. Must run before a reconnecting
    /// peer at the same address is allowed to report anything.
    pub fn dropped(&self, peer: PeerKey, peer_pieces: Option<&Bitfield>) -> usize {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let reclaimed = reclaim(state, peer);
        if let Some(bitfield) = peer_pieces {
            for i in 0..state.availability.len() {
                if bitfield.has_piece(i) {
                    state.availability[i] = state.availability[i].saturating_sub(1);
                }
            }
        }
        reclaimed
    }

    /// Returns the peer's outstanding chunks to the pool without
    /// touching availability; used when the remote chokes us and our
    /// in-flight requests are presumed discarded.
    pub fn reclaim_pending(&self, peer: PeerKey) -> usize {
        reclaim(&mut self.state.lock(), peer)
    }

    pub fn is_endgame(&self) -> bool {
        self.state.lock().mode == TorrentMode::Endgame
    }

    pub fn counts(&self) -> ChunkCounts {
        self.state.lock().counts
    }

    /// Outstanding requests grouped by peer.
    pub fn pending_by_peer(&self) -> Vec<(PeerKey, Vec<Chunk>)> {
        self.state.lock().pending.by_peer()
    }

    /// Outstanding requests grouped by chunk.
    pub fn pending_by_chunk(&self) -> Vec<(Chunk, Vec<PeerKey>)> {
        self.state.lock().pending.by_chunk()
    }

    /// Histogram of piece availability over still-needed pieces, as
    /// `(availability, piece_count)` runs.
    pub fn availability_histogram(&self) -> Vec<(u32, usize)> {
        let state = self.state.lock();
        let mut levels: Vec<u32> = state
            .pieces
            .iter()
            .enumerate()
            .filter(|(_, p)| p.wanted && !p.is_complete())
            .map(|(i, _)| state.availability[i])
            .collect();
        levels.sort_unstable();
        group(&levels)
    }

    fn piece_len(&self, piece: u32) -> u32 {
        piece_size(piece, self.piece_count, self.piece_length, self.total)
    }
}

fn take_free_chunks(
    state: &mut AssignerState,
    piece_index: u32,
    n: usize,
    piece_len: u32,
) -> Vec<Chunk> {
    let piece = &mut state.pieces[piece_index as usize];
    let mut taken = Vec::new();
    for (i, chunk_state) in piece.states.iter_mut().enumerate() {
        if taken.len() == n {
            break;
        }
        if *chunk_state == ChunkState::Free {
            *chunk_state = ChunkState::Assigned;
            taken.push(chunk_at(piece_index, i as u32, piece_len));
        }
    }
    state.counts.free -= taken.len();
    state.counts.assigned += taken.len();
    taken
}

fn reclaim(state: &mut AssignerState, peer: PeerKey) -> usize {
    let outstanding = state.pending.take(peer);
    let reclaimed = outstanding.len();
    for chunk in outstanding {
        match state.mode {
            TorrentMode::Progress => {
                state.holders.remove(&chunk);
                let index = (chunk.offset / CHUNK_SIZE) as usize;
                if let Some(piece) = state.pieces.get_mut(chunk.piece as usize) {
                    if let Some(chunk_state) = piece.states.get_mut(index) {
                        if *chunk_state == ChunkState::Assigned {
                            *chunk_state = ChunkState::Free;
                            state.counts.assigned -= 1;
                            state.counts.free += 1;
                        }
                    }
                }
            }
            TorrentMode::Endgame => {
                if let Some(holders) = state.holders.get_mut(&chunk) {
                    holders.retain(|p| *p != peer);
                }
            }
        }
    }
    reclaimed
}

fn piece_size(piece: u32, piece_count: u32, piece_length: u32, total: u64) -> u32 {
    if piece + 1 < piece_count {
        piece_length
    } else {
        let tail = total - u64::from(piece_length) * u64::from(piece_count - 1);
        tail as u32
    }
}

fn chunk_count(piece_len: u32) -> usize {
    piece_len.div_ceil(CHUNK_SIZE) as usize
}

fn chunk_at(piece: u32, index: u32, piece_len: u32) -> Chunk {
    let offset = index * CHUNK_SIZE;
    Chunk {
        piece,
        offset,
        length: (piece_len - offset).min(CHUNK_SIZE),
    }
}
