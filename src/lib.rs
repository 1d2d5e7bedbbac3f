//! rswarm - the peer-swarm core of a BitTorrent client.
//!
//! This crate drives concurrent peer sessions over the BitTorrent peer
//! wire protocol, schedules piece-chunk downloads across them and
//! enforces the tit-for-tat choking policy. Metainfo decoding, tracker
//! announces, DHT, disk layout and user interfaces are collaborators
//! behind narrow interfaces.
//!
//! # Modules
//!
//! - [`swarm`] - The engine: wires everything below together
//! - [`registry`] - Torrent table, byte counters, state transitions
//! - [`peer`] - Wire codec, peer sessions, peer state tables
//! - [`assigner`] - Chunk assignment, rarest-first selection, endgame
//! - [`choker`] - Tit-for-tat choking and the optimistic rotation
//! - [`manager`] - Listener, connector, candidate pool, peer reputation
//! - [`tracker`] - BEP-15 UDP tracker wire codec
//! - [`rate`] / [`bandwidth`] - Rate measurement and rate limiting
//! - [`storage`] - The file I/O collaborator interface
//! - [`config`] / [`event`] - Typed configuration and the event bus

pub mod assigner;
pub mod bandwidth;
pub mod choker;
pub mod config;
pub mod constants;
pub mod event;
pub mod manager;
pub mod peer;
pub mod rate;
pub mod registry;
pub mod storage;
pub mod swarm;
pub mod tracker;
pub mod util;

pub use assigner::{Chunk, ChunkCounts, Offer, TorrentAssigner, CHUNK_SIZE};
pub use bandwidth::{BandwidthLimiter, RateGate};
pub use choker::Choker;
pub use config::{Config, ConfigError, UploadSlots};
pub use event::{EventBus, SwarmEvent};
pub use manager::{BadPeerTable, PeerManager};
pub use peer::{Bitfield, Handshake, Message, PeerError, PeerId};
pub use rate::RateMeter;
pub use registry::{
    Alteration, Registry, RegistryError, TorrentId, TorrentMode, TorrentParams, TorrentSnapshot,
    TorrentState,
};
pub use storage::{DiskCommand, DiskHandle, MemoryDisk, StorageError};
pub use swarm::Swarm;
pub use tracker::{AnnounceEvent, AnnounceRequest, TrackerError, TransactionTable};
