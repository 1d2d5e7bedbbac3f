//! Tit-for-tat choking.
//!
//! Every ten seconds the choker snapshots the peer table, ranks peers
//! by observed rate and decides who may download from us. Peers on
//! torrents we are still leeching are ranked by what they send us
//! (reciprocation); peers on torrents we seed are ranked by how fast we
//! can push to them. On top of the rate-ranked slots, an optimistic
//! rotation grants one head-of-ring peer a slot regardless of rate so
//! new fast peers get discovered.
//!
//! The decision logic is a pure function over a snapshot; the
//! surrounding task only does plumbing.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng as _;
use tokio::sync::Notify;
use tokio::time::{interval, MissedTickBehavior};
use tracing::debug;

use crate::config::UploadSlots;
use crate::constants::{CHOKE_ROUND, OPTIMISTIC_EVERY};
use crate::peer::{PeerKey, PeerTable, SessionCmd, SessionDirectory};
use crate::registry::Registry;

/// One peer as the choker sees it.
#[derive(Debug, Clone)]
pub struct ChokeInput {
    pub key: PeerKey,
    /// We have this peer's torrent complete; they want it from us.
    pub we_seed: bool,
    /// They are interested in our pieces.
    pub interested: bool,
    /// They stopped feeding us (never preferred).
    pub snubbed: bool,
    pub recv_rate: f64,
    pub send_rate: f64,
}

/// Keys to unchoke and to choke this round.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ChokeDecision {
    pub unchoke: Vec<PeerKey>,
    pub choke: Vec<PeerKey>,
}

/// Upload slot count for `auto` mode, derived from the upload cap in
/// KB/s. Zero (unlimited) gets a fixed 7; small caps get pinned values;
/// beyond that the square-root rule applies.
pub fn auto_upload_slots(upload_rate_kbps: u64) -> usize {
    if upload_rate_kbps == 0 {
        7
    } else if upload_rate_kbps < 9 {
        2
    } else if upload_rate_kbps < 15 {
        3
    } else if upload_rate_kbps < 42 {
        4
    } else {
        (upload_rate_kbps as f64 * 0.8).sqrt().round() as usize
    }
}

/// Computes one rechoke round.
///
/// `ring` is the optimistic rotation in head-first order; it decides
/// which non-preferred interested leeching peers consume the optimistic
/// budget.
pub fn compute_rechoke(
    peers: &[ChokeInput],
    ring: &[PeerKey],
    max_slots: usize,
    min_optimistic: usize,
) -> ChokeDecision {
    let eligible: Vec<&ChokeInput> = peers
        .iter()
        .filter(|p| p.interested && !p.snubbed)
        .collect();

    let mut leechers: Vec<&ChokeInput> = eligible.iter().copied().filter(|p| !p.we_seed).collect();
    leechers.sort_by(|a, b| b.recv_rate.total_cmp(&a.recv_rate));
    let mut seeders: Vec<&ChokeInput> = eligible.iter().copied().filter(|p| p.we_seed).collect();
    seeders.sort_by(|a, b| b.send_rate.total_cmp(&a.send_rate));

    // 70/30 budget split; surpluses shuttle to whichever side has the
    // peers to use them, and the total never exceeds the slot budget.
    let leecher_budget = ((max_slots as f64) * 0.7).round().max(1.0) as usize;
    let seeder_budget = ((max_slots as f64) * 0.3).round().max(1.0) as usize;
    let mut take_leechers = leecher_budget.min(leechers.len());
    let mut take_seeders = seeder_budget.min(seeders.len());
    let mut spare =
        (leecher_budget - take_leechers) + (seeder_budget - take_seeders);
    let extra = spare.min(leechers.len() - take_leechers);
    take_leechers += extra;
    spare -= extra;
    take_seeders += spare.min(seeders.len() - take_seeders);
    if take_leechers > max_slots {
        take_leechers = max_slots;
    }
    take_seeders = take_seeders.min(max_slots - take_leechers);

    let preferred: HashSet<PeerKey> = leechers
        .iter()
        .take(take_leechers)
        .chain(seeders.iter().take(take_seeders))
        .map(|p| p.key)
        .collect();

    let mut optimistic_budget = min_optimistic.max(max_slots.saturating_sub(preferred.len()));
    let mut decision = ChokeDecision::default();
    decision.unchoke.extend(preferred.iter().copied());

    // Walk the rotation from the head: interested leeching peers that
    // missed the rate cut consume the optimistic budget in ring order,
    // which makes the head's grant unconditional on rate.
    let mut optimistic: HashSet<PeerKey> = HashSet::new();
    for key in ring {
        if optimistic_budget == 0 {
            break;
        }
        let Some(peer) = peers.iter().find(|p| p.key == *key) else { continue };
        if preferred.contains(key) || peer.we_seed || !peer.interested {
            continue;
        }
        optimistic.insert(*key);
        decision.unchoke.push(*key);
        optimistic_budget -= 1;
    }

    for peer in peers {
        if !preferred.contains(&peer.key) && !optimistic.contains(&peer.key) {
            decision.choke.push(peer.key);
        }
    }
    decision
}

/// The rotation ring: a cyclic list of sessions with a moving head.
#[derive(Debug, Default)]
struct OptimisticRing {
    order: Vec<PeerKey>,
    head: usize,
}

impl OptimisticRing {
    /// Drops dead sessions and splices new ones in at random positions.
    fn sync(&mut self, live: &[PeerKey]) {
        let live_set: HashSet<PeerKey> = live.iter().copied().collect();
        let head_key = self.order.get(self.head).copied();
        self.order.retain(|k| live_set.contains(k));

        let known: HashSet<PeerKey> = self.order.iter().copied().collect();
        let mut rng = rand::rng();
        for key in live {
            if !known.contains(key) {
                let at = rng.random_range(0..=self.order.len());
                self.order.insert(at, *key);
            }
        }

        self.head = head_key
            .and_then(|k| self.order.iter().position(|x| *x == k))
            .unwrap_or(0);
        if self.order.is_empty() {
            self.head = 0;
        }
    }

    /// Moves the head to the next eligible entry, skipping peers the
    /// predicate rejects (not interested, already unchoked).
    fn advance(&mut self, eligible: impl Fn(PeerKey) -> bool) {
        let len = self.order.len();
        if len == 0 {
            return;
        }
        for step in 1..=len {
            let index = (self.head + step) % len;
            if eligible(self.order[index]) {
                self.head = index;
                return;
            }
        }
        self.head = (self.head + 1) % len;
    }

    /// Ring contents starting at the head.
    fn from_head(&self) -> Vec<PeerKey> {
        let len = self.order.len();
        (0..len).map(|i| self.order[(self.head + i) % len]).collect()
    }
}

/// The periodic choker task.
pub struct Choker {
    registry: Arc<Registry>,
    table: Arc<PeerTable>,
    directory: Arc<SessionDirectory>,
    slots: UploadSlots,
    upload_rate_kbps: u64,
    min_optimistic: usize,
    ring: Mutex<OptimisticRing>,
    round: AtomicU32,
    kick: Notify,
}

impl Choker {
    pub fn new(
        registry: Arc<Registry>,
        table: Arc<PeerTable>,
        directory: Arc<SessionDirectory>,
        slots: UploadSlots,
        upload_rate_kbps: u64,
        min_optimistic: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            table,
            directory,
            slots,
            upload_rate_kbps,
            min_optimistic,
            ring: Mutex::new(OptimisticRing::default()),
            round: AtomicU32::new(0),
            kick: Notify::new(),
        })
    }

    /// Requests an immediate rechoke outside the timer (peer joined,
    /// torrent flipped to seeding).
    pub fn rechoke_now(&self) {
        self.kick.notify_one();
    }

    pub async fn run(self: Arc<Self>) {
        let mut tick = interval(CHOKE_ROUND);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = self.kick.notified() => {}
            }
            self.rechoke().await;
        }
    }

    /// One round: snapshot, decide, command the sessions.
    pub async fn rechoke(&self) {
        let round = self.round.fetch_add(1, Ordering::Relaxed) + 1;
        let snapshot = self.table.snapshot();

        let peers: Vec<ChokeInput> = snapshot
            .iter()
            .map(|(torrent, key, flags)| ChokeInput {
                key: *key,
                we_seed: self.registry.is_seeding(*torrent),
                interested: flags.remote_interest,
                snubbed: flags.snubbed,
                recv_rate: flags.recv_rate,
                send_rate: flags.send_rate,
            })
            .collect();

        let ring_order = {
            let live: Vec<PeerKey> = peers.iter().map(|p| p.key).collect();
            let mut ring = self.ring.lock();
            ring.sync(&live);
            if round % OPTIMISTIC_EVERY == 0 {
                ring.advance(|key| {
                    snapshot
                        .iter()
                        .find(|(_, k, _)| *k == key)
                        .is_some_and(|(_, _, f)| f.remote_interest && f.local_choke)
                });
            }
            ring.from_head()
        };

        let max_slots = match self.slots {
            UploadSlots::Fixed(n) => n,
            UploadSlots::Auto => auto_upload_slots(self.upload_rate_kbps),
        };
        let decision = compute_rechoke(&peers, &ring_order, max_slots, self.min_optimistic);
        debug!(
            round,
            unchoked = decision.unchoke.len(),
            choked = decision.choke.len(),
            "rechoke"
        );

        for key in decision.unchoke {
            self.directory.send(key, SessionCmd::Unchoke).await;
        }
        for key in decision.choke {
            self.directory.send(key, SessionCmd::Choke).await;
        }
    }
}

#[cfg(test)]
mod tests;
