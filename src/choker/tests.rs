use super::*;

fn leecher(key: PeerKey, recv_rate: f64) -> ChokeInput {
    ChokeInput {
        key,
        we_seed: false,
        interested: true,
        snubbed: false,
        recv_rate,
        send_rate: 0.0,
    }
}

fn seeder(key: PeerKey, send_rate: f64) -> ChokeInput {
    ChokeInput {
        key,
        we_seed: true,
        interested: true,
        snubbed: false,
        recv_rate: 0.0,
        send_rate,
    }
}

fn ring_of(peers: &[ChokeInput]) -> Vec<PeerKey> {
    peers.iter().map(|p| p.key).collect()
}

#[test]
fn test_auto_upload_slots() {
    assert_eq!(auto_upload_slots(0), 7); // unlimited
    assert_eq!(auto_upload_slots(5), 2);
    assert_eq!(auto_upload_slots(10), 3);
    assert_eq!(auto_upload_slots(30), 4);
    assert_eq!(auto_upload_slots(42), 6); // round(sqrt(33.6))
    assert_eq!(auto_upload_slots(500), 20); // round(sqrt(400))
}

#[test]
fn test_top_rates_win() {
    // Three leeching peers at 1 MB/s, 500 KB/s and 1 KB/s with two
    // slots: the fast pair is preferred, the slow one only gets in
    // through the optimistic budget.
    let peers = vec![
        leecher(1, 1_000_000.0),
        leecher(2, 500_000.0),
        leecher(3, 1_000.0),
    ];
    let decision = compute_rechoke(&peers, &ring_of(&peers), 2, 0);
    assert!(decision.unchoke.contains(&1));
    assert!(decision.unchoke.contains(&2));
    assert_eq!(decision.choke, vec![3]);

    // With one optimistic slot the slow peer rides along.
    let decision = compute_rechoke(&peers, &ring_of(&peers), 2, 1);
    assert!(decision.unchoke.contains(&3));
    assert!(decision.choke.is_empty());
}

#[test]
fn test_not_interested_and_snubbed_never_preferred() {
    let mut quiet = leecher(1, 9_999_999.0);
    quiet.interested = false;
    let mut snub = leecher(2, 9_999_999.0);
    snub.snubbed = true;
    let peers = vec![quiet, snub, leecher(3, 10.0)];
    let decision = compute_rechoke(&peers, &ring_of(&peers), 2, 0);
    assert_eq!(decision.unchoke, vec![3]);
    assert!(decision.choke.contains(&1));
    assert!(decision.choke.contains(&2));
}

#[test]
fn test_budget_shuttles_between_groups() {
    // Ten slots split 7/3, but only one leecher exists: seeders soak up
    // the surplus.
    let mut peers = vec![leecher(1, 100.0)];
    for key in 2..=12 {
        peers.push(seeder(key, (key * 10) as f64));
    }
    let decision = compute_rechoke(&peers, &ring_of(&peers), 10, 0);
    assert_eq!(decision.unchoke.len(), 10);
    assert!(decision.unchoke.contains(&1));
    // The fastest seeders fill the rest; the slowest two are left out.
    assert!(decision.choke.contains(&2));
    assert!(decision.choke.contains(&3));
}

#[test]
fn test_seeding_peers_never_get_optimistic_slots() {
    let peers = vec![seeder(1, 50.0), seeder(2, 40.0), seeder(3, 30.0)];
    // One slot: the budget split still caps at max_slots, and the
    // optimistic budget must not leak to seeding peers.
    let decision = compute_rechoke(&peers, &ring_of(&peers), 1, 3);
    assert_eq!(decision.unchoke.len(), 1);
    assert_eq!(decision.choke.len(), 2);
}

#[test]
fn test_unchoke_cap_property() {
    // |unchoked| <= max_slots + optimistic budget, whatever the mix.
    let peers: Vec<ChokeInput> = (1..=20)
        .map(|key| {
            if key % 3 == 0 {
                seeder(key, (key * 7 % 13) as f64)
            } else {
                leecher(key, (key * 11 % 17) as f64)
            }
        })
        .collect();
    for max_slots in 1..8 {
        for min_optimistic in 0..3 {
            let decision =
                compute_rechoke(&peers, &ring_of(&peers), max_slots, min_optimistic);
            assert!(
                decision.unchoke.len() <= max_slots + min_optimistic.max(1),
                "slots {max_slots} optimistic {min_optimistic}: {} unchoked",
                decision.unchoke.len()
            );
            assert_eq!(decision.unchoke.len() + decision.choke.len(), 20);
        }
    }
}

#[test]
fn test_optimistic_follows_ring_order() {
    let peers = vec![
        leecher(1, 5.0),
        leecher(2, 4.0),
        leecher(3, 3.0),
        leecher(4, 2.0),
    ];
    // Two preferred slots take peers 1 and 2; the ring head decides who
    // gets the single optimistic slot.
    let decision = compute_rechoke(&peers, &[4, 3, 2, 1], 2, 1);
    assert!(decision.unchoke.contains(&4));
    assert_eq!(decision.choke, vec![3]);

    let decision = compute_rechoke(&peers, &[3, 4, 2, 1], 2, 1);
    assert!(decision.unchoke.contains(&3));
    assert_eq!(decision.choke, vec![4]);
}

#[test]
fn test_ring_sync_keeps_head_and_drops_dead() {
    let mut ring = OptimisticRing::default();
    ring.sync(&[1, 2, 3]);
    assert_eq!(ring.order.len(), 3);

    // Advance somewhere deterministic, then kill that peer.
    ring.advance(|_| true);
    let head_key = ring.order[ring.head];
    let survivors: Vec<PeerKey> = ring.order.iter().copied().filter(|k| *k != head_key).collect();
    ring.sync(&survivors);
    assert_eq!(ring.order.len(), 2);
    assert!(ring.head < ring.order.len());
}

#[test]
fn test_ring_advance_skips_ineligible() {
    let mut ring = OptimisticRing::default();
    ring.sync(&[10]);
    ring.sync(&[10, 20]);
    ring.sync(&[10, 20, 30]);
    let start = ring.order[ring.head];
    // Only one eligible peer besides the head: the head lands on it no
    // matter how the ring is laid out.
    let target = *ring.order.iter().find(|k| **k != start).unwrap();
    ring.advance(|k| k == target);
    assert_eq!(ring.order[ring.head], target);
}

#[test]
fn test_ring_advance_wraps_when_nothing_eligible() {
    let mut ring = OptimisticRing::default();
    ring.sync(&[1, 2]);
    let before = ring.head;
    ring.advance(|_| false);
    assert_eq!(ring.head, (before + 1) % 2);
}
