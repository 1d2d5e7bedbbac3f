use super::*;
use crate::event::{EventBus, SwarmEvent};

fn params(total: u64, wanted: u64) -> TorrentParams {
    TorrentParams {
        name: "linux.iso".to_string(),
        info_hash: [0x41; 20],
        total,
        wanted,
        piece_count: 16,
        piece_length: 16384,
        is_private: false,
    }
}

fn registry() -> Registry {
    Registry::new(EventBus::new(16))
}

#[test]
fn test_insert_assigns_monotone_ids() {
    let reg = registry();
    let a = reg.insert(params(100, 100), (0, 0));
    let b = reg.insert(params(100, 100), (0, 0));
    assert!(b > a);
    assert_eq!(reg.snapshot_all().len(), 2);
}

#[test]
fn test_fresh_torrent_is_leeching() {
    let reg = registry();
    let id = reg.insert(params(1000, 1000), (0, 0));
    let snap = reg.lookup(id).unwrap();
    assert_eq!(snap.state, TorrentState::Leeching);
    assert_eq!(snap.left, 1000);
    assert_eq!(snap.mode, TorrentMode::Progress);
}

#[test]
fn test_subtract_left_to_zero_seeds_and_emits() {
    let events = EventBus::new(16);
    let mut rx = events.subscribe();
    let reg = Registry::new(events);
    let id = reg.insert(params(1000, 1000), (0, 0));

    reg.apply(id, &[Alteration::SubtractLeft(600)]).unwrap();
    assert_eq!(reg.lookup(id).unwrap().state, TorrentState::Leeching);

    reg.apply(id, &[Alteration::SubtractLeft(400)]).unwrap();
    let snap = reg.lookup(id).unwrap();
    assert_eq!(snap.state, TorrentState::Seeding);
    assert_eq!(snap.left, 0);
    assert!(reg.is_seeding(id));
    assert_eq!(rx.try_recv().unwrap(), SwarmEvent::SeedingTorrent(id));
}

#[test]
fn test_partial_download_completes_to_partial() {
    let reg = registry();
    let id = reg.insert(params(1000, 700), (0, 0));
    reg.apply(id, &[Alteration::SubtractLeft(700)]).unwrap();
    let snap = reg.lookup(id).unwrap();
    assert_eq!(snap.state, TorrentState::Partial);
    assert!(reg.is_seeding(id));
}

#[test]
fn test_underflow_discards_whole_batch() {
    let reg = registry();
    let id = reg.insert(params(1000, 1000), (0, 0));
    let err = reg.apply(
        id,
        &[Alteration::AddDownloaded(50), Alteration::SubtractLeft(2000)],
    );
    assert!(matches!(err, Err(RegistryError::LeftUnderflow { .. })));
    // The AddDownloaded before the bad step must not have leaked.
    let snap = reg.lookup(id).unwrap();
    assert_eq!(snap.downloaded, 0);
    assert_eq!(snap.left, 1000);
}

#[test]
fn test_subtract_left_or_skipped_clamps() {
    let reg = registry();
    let id = reg.insert(params(1000, 1000), (0, 0));
    reg.apply(id, &[Alteration::SubtractLeftOrSkipped(1500)])
        .unwrap();
    assert_eq!(reg.lookup(id).unwrap().left, 0);
}

#[test]
fn test_set_wanted_growth_resumes_leeching() {
    let reg = registry();
    let id = reg.insert(params(1000, 600), (0, 0));
    reg.apply(id, &[Alteration::SubtractLeft(600)]).unwrap();
    assert_eq!(reg.lookup(id).unwrap().state, TorrentState::Partial);

    reg.apply(id, &[Alteration::SetWanted(900)]).unwrap();
    let snap = reg.lookup(id).unwrap();
    assert_eq!(snap.wanted, 900);
    assert_eq!(snap.left, 300);
    assert_eq!(snap.state, TorrentState::Leeching);
}

#[test]
fn test_set_wanted_above_total_rejected() {
    let reg = registry();
    let id = reg.insert(params(1000, 1000), (0, 0));
    assert!(reg.apply(id, &[Alteration::SetWanted(2000)]).is_err());
}

#[test]
fn test_pause_and_continue() {
    let reg = registry();
    let id = reg.insert(params(1000, 1000), (0, 0));
    reg.apply(id, &[Alteration::SetPaused(true)]).unwrap();
    let snap = reg.lookup(id).unwrap();
    assert!(snap.is_paused);
    assert_eq!(snap.state, TorrentState::Paused);

    reg.apply(id, &[Alteration::Continue]).unwrap();
    let snap = reg.lookup(id).unwrap();
    assert!(!snap.is_paused);
    assert_eq!(snap.state, TorrentState::Leeching);
}

#[test]
fn test_completion_while_paused_stays_paused() {
    let reg = registry();
    let id = reg.insert(params(1000, 1000), (0, 0));
    reg.apply(id, &[Alteration::SetPaused(true), Alteration::SubtractLeft(1000)])
        .unwrap();
    assert_eq!(reg.lookup(id).unwrap().state, TorrentState::Paused);
    // Resuming a finished full download lands on seeding.
    reg.apply(id, &[Alteration::Continue]).unwrap();
    assert_eq!(reg.lookup(id).unwrap().state, TorrentState::Seeding);
}

#[test]
fn test_paused_ignores_transitional_states() {
    let reg = registry();
    let id = reg.insert(params(1000, 1000), (0, 0));
    reg.apply(id, &[Alteration::SetPaused(true)]).unwrap();

    for alteration in [Alteration::Checking, Alteration::Waiting, Alteration::Unknown] {
        reg.apply(id, &[alteration]).unwrap();
        let snap = reg.lookup(id).unwrap();
        assert!(snap.is_paused);
        assert_eq!(snap.state, TorrentState::Paused, "after {alteration:?}");
    }

    // Resuming restores the transition machinery.
    reg.apply(id, &[Alteration::Continue, Alteration::Checking]).unwrap();
    let snap = reg.lookup(id).unwrap();
    assert!(!snap.is_paused);
    assert_eq!(snap.state, TorrentState::Checking);
}

#[test]
fn test_connected_counters() {
    let reg = registry();
    let id = reg.insert(params(1000, 1000), (0, 0));
    reg.apply(
        id,
        &[
            Alteration::IncConnectedLeecher,
            Alteration::IncConnectedLeecher,
            Alteration::IncConnectedSeeder,
            Alteration::DecConnectedLeecher,
        ],
    )
    .unwrap();
    let snap = reg.lookup(id).unwrap();
    assert_eq!(snap.connected_leechers, 1);
    assert_eq!(snap.connected_seeders, 1);
    // Decrement below zero saturates rather than wrapping.
    reg.apply(id, &[Alteration::DecConnectedSeeder, Alteration::DecConnectedSeeder])
        .unwrap();
    assert_eq!(reg.lookup(id).unwrap().connected_seeders, 0);
}

#[test]
fn test_tracker_report_and_counters() {
    let reg = registry();
    let id = reg.insert(params(1000, 1000), (0, 0));
    reg.apply(
        id,
        &[
            Alteration::TrackerReport { seeders: 12, leechers: 34 },
            Alteration::AddDownloaded(100),
            Alteration::AddUpload(40),
        ],
    )
    .unwrap();
    let snap = reg.lookup(id).unwrap();
    assert_eq!((snap.seeders, snap.leechers), (12, 34));
    assert_eq!(snap.downloaded, 100);
    assert_eq!(snap.uploaded, 40);
    assert_eq!(snap.all_time_downloaded, 100);
}

#[test]
fn test_all_time_counters_seeded_from_sidecar() {
    let reg = registry();
    let id = reg.insert(params(1000, 1000), (500, 700));
    reg.apply(id, &[Alteration::AddUpload(10), Alteration::AddDownloaded(20)])
        .unwrap();
    let snap = reg.lookup(id).unwrap();
    assert_eq!(snap.all_time_uploaded, 510);
    assert_eq!(snap.all_time_downloaded, 720);
    assert_eq!(snap.uploaded, 10);
}

#[test]
fn test_unknown_torrent_apply_fails() {
    let reg = registry();
    assert!(matches!(
        reg.apply(99, &[Alteration::AddUpload(1)]),
        Err(RegistryError::NotFound(99))
    ));
}

#[test]
fn test_find_by_info_hash() {
    let reg = registry();
    let id = reg.insert(params(1000, 1000), (0, 0));
    assert_eq!(reg.find_by_info_hash(&[0x41; 20]), Some(id));
    assert_eq!(reg.find_by_info_hash(&[0x42; 20]), None);
}

#[test]
fn test_mode_transitions() {
    let reg = registry();
    let id = reg.insert(params(1000, 1000), (0, 0));
    assert!(!reg.is_endgame(id));
    reg.apply(id, &[Alteration::SetMode(TorrentMode::Endgame)]).unwrap();
    assert!(reg.is_endgame(id));
    assert_eq!(reg.get_mode(id), Some(TorrentMode::Endgame));
}

#[test]
fn test_rate_sparkline() {
    let reg = registry();
    let id = reg.insert(params(1000, 1000), (0, 0));
    for i in 0..30 {
        reg.push_rate_sample(id, i as f64);
    }
    let samples = reg.lookup(id).unwrap().rate_samples;
    assert!(samples.len() <= 25);
    assert_eq!(*samples.last().unwrap(), 29.0);
}

#[test]
fn test_remove() {
    let reg = registry();
    let id = reg.insert(params(1000, 1000), (0, 0));
    assert!(reg.remove(id));
    assert!(reg.lookup(id).is_none());
    assert!(!reg.remove(id));
}
