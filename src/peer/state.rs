//! Process-wide peer state.
//!
//! Two read-mostly tables live here. The [`PeerTable`] holds each
//! session's choke/interest flags, snub flag and rates; the choker reads
//! it as a snapshot without ever blocking sessions. The
//! [`SessionDirectory`] maps live sessions to their command mailboxes so
//! the choker, the assigner's endgame cancels and sibling sessions can
//! reach them, and enforces one session per `(address, torrent)`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc;

use super::error::PeerError;
use super::session::SessionCmd;
use crate::registry::TorrentId;

/// Process-unique handle for one peer session.
pub type PeerKey = u64;

static NEXT_PEER_KEY: AtomicU64 = AtomicU64::new(1);

pub fn next_peer_key() -> PeerKey {
    NEXT_PEER_KEY.fetch_add(1, Ordering::Relaxed)
}

/// Choke/interest flags and rates for one session, as the rest of the
/// engine sees them.
#[derive(Debug, Clone)]
pub struct PeerFlags {
    /// We choke them.
    pub local_choke: bool,
    /// They choke us.
    pub remote_choke: bool,
    /// We are interested in their pieces.
    pub local_interest: bool,
    /// They are interested in ours.
    pub remote_interest: bool,
    /// No piece payload received for 30 seconds while we wanted some.
    pub snubbed: bool,
    /// Bytes per second we send them.
    pub send_rate: f64,
    /// Bytes per second they send us.
    pub recv_rate: f64,
}

impl Default for PeerFlags {
    fn default() -> Self {
        // The wire protocol starts every connection choked both ways
        // and interested in nothing.
        Self {
            local_choke: true,
            remote_choke: true,
            local_interest: false,
            remote_interest: false,
            snubbed: false,
            send_rate: 0.0,
            recv_rate: 0.0,
        }
    }
}

/// Flag/rate table over all live sessions.
#[derive(Debug, Default)]
pub struct PeerTable {
    inner: DashMap<(TorrentId, PeerKey), PeerFlags>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, torrent: TorrentId, key: PeerKey) {
        self.inner.insert((torrent, key), PeerFlags::default());
    }

    pub fn remove(&self, torrent: TorrentId, key: PeerKey) {
        self.inner.remove(&(torrent, key));
    }

    pub fn get(&self, torrent: TorrentId, key: PeerKey) -> Option<PeerFlags> {
        self.inner.get(&(torrent, key)).map(|f| f.clone())
    }

    pub fn update(&self, torrent: TorrentId, key: PeerKey, apply: impl FnOnce(&mut PeerFlags)) {
        if let Some(mut flags) = self.inner.get_mut(&(torrent, key)) {
            apply(&mut flags);
        }
    }

    /// Copies the whole table. Sessions keep running while this reads.
    pub fn snapshot(&self) -> Vec<(TorrentId, PeerKey, PeerFlags)> {
        self.inner
            .iter()
            .map(|entry| {
                let (torrent, key) = *entry.key();
                (torrent, key, entry.value().clone())
            })
            .collect()
    }

    /// Aggregate receive rate over one torrent's sessions.
    pub fn torrent_recv_rate(&self, torrent: TorrentId) -> f64 {
        self.inner
            .iter()
            .filter(|entry| entry.key().0 == torrent)
            .map(|entry| entry.value().recv_rate)
            .sum()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// What the directory knows about one live session.
#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub addr: SocketAddr,
    pub torrent: TorrentId,
    pub remote_id: [u8; 20],
    pub cmd: mpsc::Sender<SessionCmd>,
}

/// Command routing to live sessions.
#[derive(Debug, Default)]
pub struct SessionDirectory {
    sessions: DashMap<PeerKey, SessionEntry>,
    connected: DashMap<(SocketAddr, TorrentId), PeerKey>,
}

impl SessionDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the `(addr, torrent)` slot for `key`. Fails if another
    /// session already holds it.
    pub fn register(&self, key: PeerKey, entry: SessionEntry) -> Result<(), PeerError> {
        match self.connected.entry((entry.addr, entry.torrent)) {
            Entry::Occupied(_) => Err(PeerError::AlreadyConnected),
            Entry::Vacant(slot) => {
                slot.insert(key);
                self.sessions.insert(key, entry);
                Ok(())
            }
        }
    }

    /// Releases the session's slot. Safe to call for a key that was
    /// never registered.
    pub fn unregister(&self, key: PeerKey) {
        if let Some((_, entry)) = self.sessions.remove(&key) {
            self.connected.remove(&(entry.addr, entry.torrent));
        }
    }

    pub fn is_connected(&self, addr: SocketAddr, torrent: TorrentId) -> bool {
        self.connected.contains_key(&(addr, torrent))
    }

    pub fn lookup(&self, key: PeerKey) -> Option<SessionEntry> {
        self.sessions.get(&key).map(|e| e.clone())
    }

    /// Delivers a command to one session. Returns false if the session
    /// is gone or shutting down.
    pub async fn send(&self, key: PeerKey, cmd: SessionCmd) -> bool {
        // Clone the sender out so no map shard is held across the await.
        let Some(tx) = self.sessions.get(&key).map(|e| e.cmd.clone()) else {
            return false;
        };
        tx.send(cmd).await.is_ok()
    }

    /// Delivers a command to every session of a torrent.
    pub async fn broadcast(&self, torrent: TorrentId, cmd: SessionCmd) {
        let targets: Vec<mpsc::Sender<SessionCmd>> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().torrent == torrent)
            .map(|entry| entry.value().cmd.clone())
            .collect();
        for tx in targets {
            let _ = tx.send(cmd.clone()).await;
        }
    }

    /// Like [`broadcast`](Self::broadcast), minus one session. A session
    /// fanning out to its torrent must not send to itself: awaiting its
    /// own full mailbox from its own control task would deadlock.
    pub async fn broadcast_except(&self, torrent: TorrentId, except: PeerKey, cmd: SessionCmd) {
        let targets: Vec<mpsc::Sender<SessionCmd>> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().torrent == torrent && *entry.key() != except)
            .map(|entry| entry.value().cmd.clone())
            .collect();
        for tx in targets {
            let _ = tx.send(cmd.clone()).await;
        }
    }

    pub fn keys_of(&self, torrent: TorrentId) -> Vec<PeerKey> {
        self.sessions
            .iter()
            .filter(|entry| entry.value().torrent == torrent)
            .map(|entry| *entry.key())
            .collect()
    }

    pub fn all_keys(&self) -> Vec<PeerKey> {
        self.sessions.iter().map(|entry| *entry.key()).collect()
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }
}
