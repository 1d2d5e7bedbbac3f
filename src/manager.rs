//! Peer admission.
//!
//! Inbound: one listening socket (with `SO_REUSEADDR`) whose accepted
//! connections go straight to the handshake path. Outbound: candidate
//! addresses from trackers and friends are deduplicated, shuffled and
//! dialed while connection slots are free. Either way a peer with a bad
//! reputation is refused; protocol offenses accumulate in the bad-peer
//! table and age out after a grace period.

use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tokio::net::{TcpSocket, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::constants::{
    BAD_PEER_GRACE, BAD_PEER_MAX_OFFENSES, BAD_PEER_SWEEP, CONNECT_TIMEOUT,
};
use crate::peer::session;
use crate::registry::TorrentId;
use crate::swarm::Shared;

/// One reputation entry.
#[derive(Debug, Clone)]
pub struct BadPeer {
    pub offenses: u32,
    pub last_offense: Instant,
    pub peer_id: Option<[u8; 20]>,
}

/// Reputation table keyed by `(ip, port)`.
///
/// Offenses are protocol violations, not transport hiccups; a peer past
/// the offense limit is refused until its entry ages out.
#[derive(Debug, Default)]
pub struct BadPeerTable {
    inner: DashMap<(IpAddr, u16), BadPeer>,
}

impl BadPeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one more offense for the address.
    pub fn enter(&self, ip: IpAddr, port: u16, peer_id: Option<[u8; 20]>) {
        let mut entry = self.inner.entry((ip, port)).or_insert(BadPeer {
            offenses: 0,
            last_offense: Instant::now(),
            peer_id,
        });
        entry.offenses += 1;
        entry.last_offense = Instant::now();
        if peer_id.is_some() {
            entry.peer_id = peer_id;
        }
    }

    /// True once the address has used up its offense allowance.
    pub fn is_bad(&self, addr: SocketAddr) -> bool {
        self.inner
            .get(&(addr.ip(), addr.port()))
            .is_some_and(|e| e.offenses > BAD_PEER_MAX_OFFENSES)
    }

    pub fn offenses(&self, addr: SocketAddr) -> u32 {
        self.inner
            .get(&(addr.ip(), addr.port()))
            .map_or(0, |e| e.offenses)
    }

    /// Forgives entries whose last offense is older than the grace
    /// window. Runs from the engine's sweep task.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.inner
            .retain(|_, entry| now.duration_since(entry.last_offense) < BAD_PEER_GRACE);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Periodic reputation sweep.
pub async fn run_bad_peer_sweep(table: Arc<BadPeerTable>) {
    let mut tick = tokio::time::interval(BAD_PEER_SWEEP);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        table.sweep();
    }
}

/// Outbound candidate pool and connection-slot filler.
pub struct PeerManager {
    shared: Arc<Shared>,
    candidates: Mutex<VecDeque<(SocketAddr, TorrentId)>>,
}

impl PeerManager {
    pub fn new(shared: Arc<Shared>) -> Arc<Self> {
        Arc::new(Self {
            shared,
            candidates: Mutex::new(VecDeque::new()),
        })
    }

    /// Merges tracker-provided peers into the candidate pool (shuffled,
    /// deduplicated) and dials while slots are free.
    pub fn add_peers(&self, source: &str, torrent: TorrentId, peers: Vec<SocketAddr>) {
        let mut fresh: Vec<(SocketAddr, TorrentId)> = {
            let pool = self.candidates.lock();
            peers
                .into_iter()
                .map(|addr| (addr, torrent))
                .filter(|entry| !pool.contains(entry))
                .collect()
        };
        fresh.sort_unstable_by_key(|(addr, _)| *addr);
        fresh.dedup();
        fresh.shuffle(&mut rand::rng());
        debug!(source, torrent, count = fresh.len(), "new peer candidates");
        self.candidates.lock().extend(fresh);
        self.fill_slots();
    }

    /// Dials candidates until the connection budget is used up.
    pub fn fill_slots(&self) {
        loop {
            if self.shared.directory.count() >= self.shared.config.max_peers {
                return;
            }
            let Some((addr, torrent)) = self.candidates.lock().pop_front() else {
                return;
            };
            if self.shared.bad_peers.is_bad(addr) {
                debug!(%addr, "skipping bad peer");
                continue;
            }
            if self.shared.directory.is_connected(addr, torrent) {
                continue;
            }
            let shared = self.shared.clone();
            tokio::spawn(connect_peer(shared, addr, torrent));
        }
    }

    /// Number of queued outbound candidates.
    pub fn backlog(&self) -> usize {
        self.candidates.lock().len()
    }
}

/// Dials one peer: TCP connect with timeout, then handshake, then the
/// session trio.
async fn connect_peer(shared: Arc<Shared>, addr: SocketAddr, torrent: TorrentId) {
    let Some(snapshot) = shared.registry.lookup(torrent) else {
        return;
    };
    let stream = match timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            debug!(%addr, "connect failed: {err}");
            return;
        }
        Err(_) => {
            debug!(%addr, "connect timed out");
            return;
        }
    };

    match session::handshake_outbound(
        stream,
        torrent,
        snapshot.info_hash,
        &shared.our_id,
        shared.config.dht,
    )
    .await
    {
        Ok(shaken) => {
            if let Some(ctx) = shared.session_ctx(torrent) {
                match session::spawn(ctx, shaken, addr) {
                    Ok(_) => shared.choker.rechoke_now(),
                    Err(err) => debug!(%addr, "session not started: {err}"),
                }
            }
        }
        Err(err) => {
            if err.is_protocol_offense() {
                shared.bad_peers.enter(addr.ip(), addr.port(), None);
            }
            debug!(%addr, "outbound handshake failed: {err}");
        }
    }
}

/// The accept loop. Binds with `SO_REUSEADDR` so a restarted engine can
/// reclaim its port immediately.
pub async fn run_listener(shared: Arc<Shared>) -> std::io::Result<()> {
    let ip = shared
        .config
        .listen_ip
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    let addr = SocketAddr::new(ip, shared.config.listen_port);
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    let listener = socket.listen(128)?;
    info!(%addr, "listening for peers");

    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!("accept failed: {err}");
                continue;
            }
        };
        if shared.bad_peers.is_bad(peer_addr) {
            debug!(%peer_addr, "refusing bad peer");
            continue;
        }
        if shared.directory.count() >= shared.config.max_peers {
            debug!(%peer_addr, "connection budget exhausted, refusing");
            continue;
        }
        let shared = shared.clone();
        tokio::spawn(accept_peer(shared, stream, peer_addr));
    }
}

async fn accept_peer(shared: Arc<Shared>, stream: TcpStream, addr: SocketAddr) {
    match session::handshake_inbound(stream, &shared.registry, &shared.our_id, shared.config.dht)
        .await
    {
        Ok(shaken) => {
            let torrent = shaken.torrent;
            if let Some(ctx) = shared.session_ctx(torrent) {
                match session::spawn(ctx, shaken, addr) {
                    Ok(_) => shared.choker.rechoke_now(),
                    Err(err) => debug!(%addr, "session not started: {err}"),
                }
            }
        }
        Err(err) => {
            if err.is_protocol_offense() {
                shared.bad_peers.enter(addr.ip(), addr.port(), None);
            }
            debug!(%addr, "inbound handshake failed: {err}");
        }
    }
}
