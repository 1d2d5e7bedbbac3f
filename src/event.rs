//! Engine event bus.
//!
//! Collaborators outside the swarm core (UI, persistence, tracker layer)
//! observe the engine through a broadcast channel. The core only ever
//! emits; it never waits for consumers.

use tokio::sync::broadcast;

use crate::registry::TorrentId;

/// Events published by the swarm core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwarmEvent {
    /// A torrent finished downloading and moved to seeding.
    SeedingTorrent(TorrentId),
    /// A piece was fully stored and verified.
    PieceComplete { torrent: TorrentId, piece: u32 },
}

/// Cloneable handle to the broadcast channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SwarmEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publishes an event. Lagging or absent subscribers are not an error.
    pub fn emit(&self, event: SwarmEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SwarmEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}
