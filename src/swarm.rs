//! The swarm engine.
//!
//! `Swarm` wires the pieces together: the torrent registry, per-torrent
//! chunk assigners, the peer state table and session directory, the
//! choker, the listener and connector, the bad-peer sweep and the
//! housekeeping tick. Collaborators hand it decoded torrent parameters
//! and tracker peer lists; it hands back events.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::info;

use crate::assigner::TorrentAssigner;
use crate::bandwidth::BandwidthLimiter;
use crate::choker::Choker;
use crate::config::Config;
use crate::constants::{DEFAULT_PIPELINE_DEPTH, RATE_SAMPLE_INTERVAL};
use crate::event::{EventBus, SwarmEvent};
use crate::manager::{self, BadPeerTable, PeerManager};
use crate::peer::session::SessionCtx;
use crate::peer::{PeerId, PeerTable, SessionCmd, SessionDirectory};
use crate::registry::{Alteration, Registry, TorrentId, TorrentParams};
use crate::storage::DiskHandle;

/// Engine-wide shared parts, one `Arc` handed to every component.
pub struct Shared {
    pub config: Config,
    pub our_id: PeerId,
    pub registry: Arc<Registry>,
    pub table: Arc<PeerTable>,
    pub directory: Arc<SessionDirectory>,
    pub assigners: DashMap<TorrentId, Arc<TorrentAssigner>>,
    pub bad_peers: Arc<BadPeerTable>,
    pub bandwidth: Arc<BandwidthLimiter>,
    pub choker: Arc<Choker>,
    pub disk: DiskHandle,
    pub events: EventBus,
    pub pipeline_depth: usize,
}

impl Shared {
    /// Builds the context a new session needs, if the torrent is live.
    pub fn session_ctx(&self, torrent: TorrentId) -> Option<SessionCtx> {
        let assigner = self.assigners.get(&torrent)?.clone();
        Some(SessionCtx {
            torrent,
            registry: self.registry.clone(),
            table: self.table.clone(),
            directory: self.directory.clone(),
            assigner,
            bad_peers: self.bad_peers.clone(),
            disk: self.disk.clone(),
            bandwidth: self.bandwidth.clone(),
            events: self.events.clone(),
            pipeline_depth: self.pipeline_depth,
        })
    }
}

/// The peer-swarm engine.
pub struct Swarm {
    shared: Arc<Shared>,
    manager: Arc<PeerManager>,
}

impl Swarm {
    pub fn new(config: Config, disk: DiskHandle) -> Self {
        let events = EventBus::new(128);
        let registry = Arc::new(Registry::new(events.clone()));
        let table = Arc::new(PeerTable::new());
        let directory = Arc::new(SessionDirectory::new());
        let bad_peers = Arc::new(BadPeerTable::new());
        let bandwidth = Arc::new(BandwidthLimiter::from_config(&config));
        let choker = Choker::new(
            registry.clone(),
            table.clone(),
            directory.clone(),
            config.max_upload_slots,
            config.max_upload_rate,
            config.optimistic_slots,
        );
        let shared = Arc::new(Shared {
            config,
            our_id: PeerId::generate(),
            registry,
            table,
            directory,
            assigners: DashMap::new(),
            bad_peers,
            bandwidth,
            choker,
            disk,
            events,
            pipeline_depth: DEFAULT_PIPELINE_DEPTH,
        });
        let manager = PeerManager::new(shared.clone());
        Self { shared, manager }
    }

    /// Spawns the long-lived engine tasks: listener, choker, reputation
    /// sweep, rate housekeeping and the event pump.
    pub fn start(&self) {
        tokio::spawn(manager::run_listener(self.shared.clone()));
        tokio::spawn(self.shared.choker.clone().run());
        tokio::spawn(manager::run_bad_peer_sweep(self.shared.bad_peers.clone()));
        tokio::spawn(Self::housekeeping(self.shared.clone()));
        tokio::spawn(Self::event_pump(self.shared.clone()));
    }

    /// Registers a torrent and its chunk scheduler. `checked_pieces`
    /// are the pieces the startup disk check found intact; `all_time`
    /// carries the persistent transfer counters from the sidecar.
    pub fn add_torrent(
        &self,
        params: TorrentParams,
        wanted_pieces: Option<Vec<bool>>,
        checked_pieces: &[u32],
        all_time: (u64, u64),
    ) -> TorrentId {
        let id = self.shared.registry.insert(params.clone(), all_time);
        let assigner = TorrentAssigner::new(
            id,
            self.shared.registry.clone(),
            params.piece_count,
            params.piece_length,
            params.total,
            wanted_pieces.as_deref(),
        );
        if !checked_pieces.is_empty() {
            assigner.prime_stored(checked_pieces);
            let piece_len = u64::from(params.piece_length);
            let tail = params.total - piece_len * u64::from(params.piece_count - 1);
            let stored_bytes: u64 = checked_pieces
                .iter()
                .map(|&p| if p + 1 < params.piece_count { piece_len } else { tail })
                .sum();
            let _ = self
                .shared
                .registry
                .apply(id, &[Alteration::SubtractLeftOrSkipped(stored_bytes)]);
        }
        self.shared.assigners.insert(id, assigner);
        info!(torrent = id, name = %params.name, "torrent added");
        id
    }

    /// Tears a torrent down: sessions get a cooperative shutdown, then
    /// the scheduler and registry entry go away.
    pub async fn remove_torrent(&self, id: TorrentId) {
        self.shared
            .directory
            .broadcast(id, SessionCmd::Shutdown)
            .await;
        self.shared.assigners.remove(&id);
        self.shared.registry.remove(id);
        info!(torrent = id, "torrent removed");
    }

    /// Feeds tracker-discovered peers to the connector.
    pub fn add_peers(
        &self,
        source: &str,
        torrent: TorrentId,
        peers: Vec<std::net::SocketAddr>,
    ) {
        self.manager.add_peers(source, torrent, peers);
    }

    pub fn rechoke_now(&self) {
        self.shared.choker.rechoke_now();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SwarmEvent> {
        self.shared.events.subscribe()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.shared.registry
    }

    pub fn assigner(&self, id: TorrentId) -> Option<Arc<TorrentAssigner>> {
        self.shared.assigners.get(&id).map(|a| a.clone())
    }

    pub fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// 60-second tick: push each torrent's aggregate download rate onto
    /// its sparkline.
    async fn housekeeping(shared: Arc<Shared>) {
        let mut tick = tokio::time::interval(RATE_SAMPLE_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            for snapshot in shared.registry.snapshot_all() {
                let rate = shared.table.torrent_recv_rate(snapshot.id);
                shared.registry.push_rate_sample(snapshot.id, rate);
            }
        }
    }

    /// Internal event reactions: a torrent flipping to seeding changes
    /// the choker's ranking basis, so rechoke immediately.
    async fn event_pump(shared: Arc<Shared>) {
        let mut rx = shared.events.subscribe();
        loop {
            match rx.recv().await {
                Ok(SwarmEvent::SeedingTorrent(_)) => shared.choker.rechoke_now(),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}
