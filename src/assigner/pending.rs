//! Per-peer bookkeeping of outstanding chunk requests.
//!
//! The pending tracker exists for one purpose: when a peer session dies
//! the assigner must know exactly which chunks that peer was fetching so
//! they can be reclaimed. It also backs the diagnostics surface, grouped
//! either by peer or by chunk.

use std::collections::HashMap;

use super::chunks::Chunk;
use crate::peer::PeerKey;

#[derive(Debug, Default)]
pub struct PendingTracker {
    per_peer: HashMap<PeerKey, Vec<Chunk>>,
}

impl PendingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records chunks handed to `peer`, preserving assignment order.
    pub fn add(&mut self, peer: PeerKey, chunks: &[Chunk]) {
        self.per_peer.entry(peer).or_default().extend_from_slice(chunks);
    }

    /// Forgets one chunk of one peer, e.g. after it was fetched.
    pub fn remove(&mut self, peer: PeerKey, chunk: Chunk) {
        if let Some(list) = self.per_peer.get_mut(&peer) {
            list.retain(|c| *c != chunk);
            if list.is_empty() {
                self.per_peer.remove(&peer);
            }
        }
    }

    /// Removes and returns everything outstanding for `peer`.
    pub fn take(&mut self, peer: PeerKey) -> Vec<Chunk> {
        self.per_peer.remove(&peer).unwrap_or_default()
    }

    pub fn outstanding(&self, peer: PeerKey) -> usize {
        self.per_peer.get(&peer).map_or(0, Vec::len)
    }

    /// Outstanding requests grouped by peer.
    pub fn by_peer(&self) -> Vec<(PeerKey, Vec<Chunk>)> {
        let mut all: Vec<_> = self
            .per_peer
            .iter()
            .map(|(peer, chunks)| (*peer, chunks.clone()))
            .collect();
        all.sort_by_key(|(peer, _)| *peer);
        all
    }

    /// Outstanding requests grouped by chunk; in endgame one chunk may
    /// list several peers.
    pub fn by_chunk(&self) -> Vec<(Chunk, Vec<PeerKey>)> {
        let mut map: HashMap<Chunk, Vec<PeerKey>> = HashMap::new();
        for (peer, chunks) in &self.per_peer {
            for chunk in chunks {
                map.entry(*chunk).or_default().push(*peer);
            }
        }
        let mut all: Vec<_> = map.into_iter().collect();
        for (_, peers) in all.iter_mut() {
            peers.sort_unstable();
        }
        all.sort_by_key(|(chunk, _)| (chunk.piece, chunk.offset));
        all
    }
}
