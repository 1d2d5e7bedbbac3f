//! Torrent registry.
//!
//! The registry is the single writer of torrent attributes: byte
//! counters, swarm counts, mode and state. Mutations arrive as ordered
//! batches of [`Alteration`]s applied inside one critical section, so a
//! reader can never observe a half-applied batch. Reads are snapshots.
//!
//! State follows bytes: when the last wanted byte is stored the torrent
//! becomes `Seeding` (or `Partial` when files were deselected), and the
//! leeching-to-seeding edge is announced on the event bus.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::RwLock;
use thiserror::Error;
use tracing::error;

use crate::event::{EventBus, SwarmEvent};
use crate::rate::RateWindow;

/// Monotonically assigned torrent identifier.
pub type TorrentId = u32;

/// Download mode: normal progress, or endgame chunk duplication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TorrentMode {
    Progress,
    Endgame,
}

/// Lifecycle state of a torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TorrentState {
    Unknown,
    Leeching,
    Seeding,
    /// All wanted bytes stored, but some files were deselected.
    Partial,
    Paused,
    Checking,
    Waiting,
}

/// Everything the caller supplies when adding a torrent.
#[derive(Debug, Clone)]
pub struct TorrentParams {
    pub name: String,
    pub info_hash: [u8; 20],
    /// Size of the full torrent payload in bytes.
    pub total: u64,
    /// Bytes actually selected for download; `wanted < total` is a
    /// partial download.
    pub wanted: u64,
    pub piece_count: u32,
    pub piece_length: u32,
    pub is_private: bool,
}

/// One step of a registry mutation batch.
#[derive(Debug, Clone, Copy)]
pub enum Alteration {
    AddDownloaded(u64),
    AddUpload(u64),
    /// Subtract stored bytes from `left`; underflow poisons the batch.
    SubtractLeft(u64),
    /// Like `SubtractLeft` but tolerant of bytes that belong to
    /// deselected files, clamping at zero.
    SubtractLeftOrSkipped(u64),
    SetWanted(u64),
    TrackerReport { seeders: u32, leechers: u32 },
    SetMode(TorrentMode),
    SetPaused(bool),
    /// Resume from a paused or freshly-checked state.
    Continue,
    Unknown,
    Checking,
    Waiting,
    IncConnectedLeecher,
    DecConnectedLeecher,
    IncConnectedSeeder,
    DecConnectedSeeder,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("torrent {0} not found")]
    NotFound(TorrentId),

    #[error("torrent {id}: subtracting {amount} bytes from {left} left would underflow")]
    LeftUnderflow { id: TorrentId, left: u64, amount: u64 },

    #[error("torrent {id}: wanted {wanted} exceeds total {total}")]
    InvalidWanted { id: TorrentId, wanted: u64, total: u64 },
}

#[derive(Debug, Clone)]
struct TorrentEntry {
    name: String,
    info_hash: [u8; 20],
    total: u64,
    wanted: u64,
    left: u64,
    uploaded: u64,
    downloaded: u64,
    all_time_uploaded: u64,
    all_time_downloaded: u64,
    piece_count: u32,
    piece_length: u32,
    seeders: u32,
    leechers: u32,
    connected_seeders: u32,
    connected_leechers: u32,
    is_private: bool,
    is_paused: bool,
    mode: TorrentMode,
    state: TorrentState,
    rates: RateWindow,
}

/// Read-only copy of one registry entry.
#[derive(Debug, Clone)]
pub struct TorrentSnapshot {
    pub id: TorrentId,
    pub name: String,
    pub info_hash: [u8; 20],
    pub total: u64,
    pub wanted: u64,
    pub left: u64,
    pub uploaded: u64,
    pub downloaded: u64,
    pub all_time_uploaded: u64,
    pub all_time_downloaded: u64,
    pub piece_count: u32,
    pub piece_length: u32,
    pub seeders: u32,
    pub leechers: u32,
    pub connected_seeders: u32,
    pub connected_leechers: u32,
    pub is_private: bool,
    pub is_paused: bool,
    pub mode: TorrentMode,
    pub state: TorrentState,
    pub rate_samples: Vec<f64>,
}

/// In-memory table of all active torrents.
pub struct Registry {
    inner: RwLock<HashMap<TorrentId, TorrentEntry>>,
    next_id: AtomicU32,
    events: EventBus,
}

impl Registry {
    pub fn new(events: EventBus) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            events,
        }
    }

    /// Adds a torrent and returns its id. `all_time` carries the
    /// persistent (uploaded, downloaded) counters from the sidecar.
    pub fn insert(&self, params: TorrentParams, all_time: (u64, u64)) -> TorrentId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut entry = TorrentEntry {
            name: params.name,
            info_hash: params.info_hash,
            total: params.total,
            wanted: params.wanted,
            left: params.wanted,
            uploaded: 0,
            downloaded: 0,
            all_time_uploaded: all_time.0,
            all_time_downloaded: all_time.1,
            piece_count: params.piece_count,
            piece_length: params.piece_length,
            seeders: 0,
            leechers: 0,
            connected_seeders: 0,
            connected_leechers: 0,
            is_private: params.is_private,
            is_paused: false,
            mode: TorrentMode::Progress,
            state: TorrentState::Unknown,
            rates: RateWindow::new(),
        };
        entry.state = state_for(&entry);
        self.inner.write().insert(id, entry);
        id
    }

    /// Removes a torrent entry. Called by the engine when the torrent's
    /// component set is torn down; a dead owner must not leave a stale
    /// entry behind.
    pub fn remove(&self, id: TorrentId) -> bool {
        self.inner.write().remove(&id).is_some()
    }

    /// Applies a batch of alterations atomically, in order.
    ///
    /// A batch that would corrupt the entry (underflow, wanted > total,
    /// unknown torrent) is discarded whole and logged at error level;
    /// other torrents are unaffected.
    pub fn apply(&self, id: TorrentId, alterations: &[Alteration]) -> Result<(), RegistryError> {
        let mut pending_events = Vec::new();
        let result = {
            let mut table = self.inner.write();
            let entry = match table.get_mut(&id) {
                Some(entry) => entry,
                None => {
                    let err = RegistryError::NotFound(id);
                    error!(torrent = id, "registry batch discarded: {err}");
                    return Err(err);
                }
            };

            let mut scratch = entry.clone();
            for alteration in alterations {
                if let Err(err) = alter(id, &mut scratch, *alteration, &mut pending_events) {
                    error!(torrent = id, "registry batch discarded: {err}");
                    return Err(err);
                }
            }
            *entry = scratch;
            Ok(())
        };
        for event in pending_events {
            self.events.emit(event);
        }
        result
    }

    pub fn snapshot_all(&self) -> Vec<TorrentSnapshot> {
        let table = self.inner.read();
        let mut all: Vec<_> = table.iter().map(|(id, e)| snapshot(*id, e)).collect();
        all.sort_by_key(|s| s.id);
        all
    }

    pub fn lookup(&self, id: TorrentId) -> Option<TorrentSnapshot> {
        self.inner.read().get(&id).map(|e| snapshot(id, e))
    }

    pub fn find_by_info_hash(&self, info_hash: &[u8; 20]) -> Option<TorrentId> {
        self.inner
            .read()
            .iter()
            .find(|(_, e)| &e.info_hash == info_hash)
            .map(|(id, _)| *id)
    }

    pub fn num_pieces(&self, id: TorrentId) -> Option<u32> {
        self.inner.read().get(&id).map(|e| e.piece_count)
    }

    pub fn is_seeding(&self, id: TorrentId) -> bool {
        matches!(
            self.inner.read().get(&id).map(|e| e.state),
            Some(TorrentState::Seeding | TorrentState::Partial)
        )
    }

    pub fn get_mode(&self, id: TorrentId) -> Option<TorrentMode> {
        self.inner.read().get(&id).map(|e| e.mode)
    }

    pub fn is_endgame(&self, id: TorrentId) -> bool {
        self.get_mode(id) == Some(TorrentMode::Endgame)
    }

    /// Appends a download-rate sample to the torrent's sparkline.
    /// Driven by the engine's 60-second housekeeping tick.
    pub fn push_rate_sample(&self, id: TorrentId, rate: f64) {
        if let Some(entry) = self.inner.write().get_mut(&id) {
            entry.rates.push(rate);
        }
    }
}

fn snapshot(id: TorrentId, e: &TorrentEntry) -> TorrentSnapshot {
    TorrentSnapshot {
        id,
        name: e.name.clone(),
        info_hash: e.info_hash,
        total: e.total,
        wanted: e.wanted,
        left: e.left,
        uploaded: e.uploaded,
        downloaded: e.downloaded,
        all_time_uploaded: e.all_time_uploaded,
        all_time_downloaded: e.all_time_downloaded,
        piece_count: e.piece_count,
        piece_length: e.piece_length,
        seeders: e.seeders,
        leechers: e.leechers,
        connected_seeders: e.connected_seeders,
        connected_leechers: e.connected_leechers,
        is_private: e.is_private,
        is_paused: e.is_paused,
        mode: e.mode,
        state: e.state,
        rate_samples: e.rates.samples().to_vec(),
    }
}

/// State an entry should carry given its byte counters and pause flag.
fn state_for(e: &TorrentEntry) -> TorrentState {
    if e.is_paused {
        TorrentState::Paused
    } else if e.left > 0 {
        TorrentState::Leeching
    } else if e.wanted < e.total {
        TorrentState::Partial
    } else {
        TorrentState::Seeding
    }
}

fn alter(
    id: TorrentId,
    e: &mut TorrentEntry,
    alteration: Alteration,
    events: &mut Vec<SwarmEvent>,
) -> Result<(), RegistryError> {
    match alteration {
        Alteration::AddDownloaded(n) => {
            e.downloaded += n;
            e.all_time_downloaded += n;
        }
        Alteration::AddUpload(n) => {
            e.uploaded += n;
            e.all_time_uploaded += n;
        }
        Alteration::SubtractLeft(n) => {
            e.left = e
                .left
                .checked_sub(n)
                .ok_or(RegistryError::LeftUnderflow { id, left: e.left, amount: n })?;
            settle_completion(id, e, events);
        }
        Alteration::SubtractLeftOrSkipped(n) => {
            e.left = e.left.saturating_sub(n);
            settle_completion(id, e, events);
        }
        Alteration::SetWanted(n) => {
            if n > e.total {
                return Err(RegistryError::InvalidWanted { id, wanted: n, total: e.total });
            }
            if n > e.wanted {
                // Newly selected files: their bytes are not stored yet.
                let was_complete = e.left == 0;
                e.left += n - e.wanted;
                e.wanted = n;
                if was_complete && e.left > 0 && !e.is_paused {
                    e.state = TorrentState::Leeching;
                }
            } else {
                e.wanted = n;
                e.left = e.left.min(n);
                settle_completion(id, e, events);
            }
        }
        Alteration::TrackerReport { seeders, leechers } => {
            e.seeders = seeders;
            e.leechers = leechers;
        }
        Alteration::SetMode(mode) => e.mode = mode,
        Alteration::SetPaused(true) => {
            e.is_paused = true;
            e.state = TorrentState::Paused;
        }
        Alteration::SetPaused(false) | Alteration::Continue => {
            e.is_paused = false;
            e.state = state_for(e);
        }
        // Paused wins over transitional states until an explicit resume.
        Alteration::Unknown => {
            if !e.is_paused {
                e.state = TorrentState::Unknown;
            }
        }
        Alteration::Checking => {
            if !e.is_paused {
                e.state = TorrentState::Checking;
            }
        }
        Alteration::Waiting => {
            if !e.is_paused {
                e.state = TorrentState::Waiting;
            }
        }
        Alteration::IncConnectedLeecher => e.connected_leechers += 1,
        Alteration::DecConnectedLeecher => {
            e.connected_leechers = e.connected_leechers.saturating_sub(1)
        }
        Alteration::IncConnectedSeeder => e.connected_seeders += 1,
        Alteration::DecConnectedSeeder => {
            e.connected_seeders = e.connected_seeders.saturating_sub(1)
        }
    }
    Ok(())
}

/// Re-derives state after `left` changed, announcing the
/// leeching-to-seeding edge.
fn settle_completion(id: TorrentId, e: &mut TorrentEntry, events: &mut Vec<SwarmEvent>) {
    if e.left > 0 {
        return;
    }
    let next = state_for(e);
    if e.state == TorrentState::Leeching && next == TorrentState::Seeding {
        events.push(SwarmEvent::SeedingTorrent(id));
    }
    e.state = next;
}

#[cfg(test)]
mod tests;
