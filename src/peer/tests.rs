use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use super::session::{self, SessionCtx};
use super::*;
use crate::assigner::TorrentAssigner;
use crate::bandwidth::BandwidthLimiter;
use crate::event::{EventBus, SwarmEvent};
use crate::manager::BadPeerTable;
use crate::registry::{Registry, TorrentId, TorrentParams};
use crate::storage::MemoryDisk;

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

#[test]
fn test_peer_id_generate() {
    let a = PeerId::generate();
    let b = PeerId::generate();
    assert_ne!(a.0, b.0);
    assert_eq!(a.client_id(), Some("RS0001"));
}

#[test]
fn test_bitfield_bits() {
    let mut bf = Bitfield::new(100);
    assert!(!bf.has_piece(0));
    bf.set_piece(0);
    bf.set_piece(99);
    assert!(bf.has_piece(0));
    assert!(bf.has_piece(99));
    assert!(!bf.has_piece(100));
    bf.clear_piece(0);
    assert_eq!(bf.count(), 1);
}

#[test]
fn test_bitfield_from_bytes_and_spare_bits() {
    let bf = Bitfield::from_bytes(Bytes::from_static(&[0b1100_0000]), 8);
    assert!(bf.has_piece(0));
    assert!(bf.has_piece(1));
    assert!(!bf.has_piece(2));

    // Spare bits past the piece count are cleared.
    let bf = Bitfield::from_bytes(Bytes::from_static(&[0xFF]), 5);
    assert_eq!(bf.count(), 5);
    assert_eq!(bf.as_bytes(), &[0b1111_1000]);

    let full = Bitfield::full(5);
    assert!(full.is_complete());
}

#[test]
fn test_handshake_round_trip() {
    let handshake = Handshake::new([1; 20], [2; 20], true);
    let decoded = Handshake::decode(&handshake.encode()).unwrap();
    assert_eq!(decoded.info_hash, [1; 20]);
    assert_eq!(decoded.peer_id, [2; 20]);
    assert_eq!(decoded.reserved[7] & 0x01, 0x01);
}

#[test]
fn test_handshake_rejects_garbage() {
    assert!(Handshake::decode(&[0u8; 67]).is_err());
    let mut bad = Handshake::new([1; 20], [2; 20], false).encode().to_vec();
    bad[1] = b'X';
    assert!(Handshake::decode(&bad).is_err());
}

#[test]
fn test_capabilities_are_ored_across_sides() {
    let mut ours = [0u8; 8];
    ours[7] = 0x01; // dht
    let mut theirs = [0u8; 8];
    theirs[5] = 0x10; // extension protocol
    let caps = Capabilities::combine(&ours, &theirs);
    assert!(caps.dht());
    assert!(caps.extension_protocol());
}

#[test]
fn test_message_round_trip() {
    let messages = vec![
        Message::KeepAlive,
        Message::Choke,
        Message::Unchoke,
        Message::Interested,
        Message::NotInterested,
        Message::Have { piece: 42 },
        Message::Bitfield(Bytes::from_static(&[0xC0])),
        Message::Request { index: 1, begin: 16384, length: 16384 },
        Message::Piece { index: 1, begin: 0, data: Bytes::from_static(b"payload") },
        Message::Cancel { index: 1, begin: 16384, length: 16384 },
    ];
    for message in messages {
        let decoded = Message::decode(message.encode()).unwrap();
        assert_eq!(decoded, message);
    }
}

#[test]
fn test_unknown_message_id_is_skipped() {
    // Type 20 (extension protocol) with a payload we don't understand.
    let mut frame = Vec::new();
    frame.extend_from_slice(&5u32.to_be_bytes());
    frame.push(20);
    frame.extend_from_slice(&[1, 2, 3, 4]);
    let decoded = Message::decode(Bytes::from(frame)).unwrap();
    assert_eq!(decoded, Message::Unknown { id: 20 });
}

#[test]
fn test_malformed_messages_rejected() {
    // Truncated have payload.
    let mut frame = Vec::new();
    frame.extend_from_slice(&3u32.to_be_bytes());
    frame.push(4);
    frame.extend_from_slice(&[0, 0]);
    assert!(Message::decode(Bytes::from(frame)).is_err());

    // Length prefix promising more than the frame holds.
    let mut frame = Vec::new();
    frame.extend_from_slice(&100u32.to_be_bytes());
    frame.push(0);
    assert!(Message::decode(Bytes::from(frame)).is_err());
}

// ---------------------------------------------------------------------------
// Session directory
// ---------------------------------------------------------------------------

fn dummy_entry(addr: SocketAddr, torrent: TorrentId) -> SessionEntry {
    let (tx, _rx) = tokio::sync::mpsc::channel(1);
    SessionEntry { addr, torrent, remote_id: [0; 20], cmd: tx }
}

#[test]
fn test_directory_rejects_duplicate_address() {
    let directory = SessionDirectory::new();
    let addr: SocketAddr = "10.0.0.1:6881".parse().unwrap();
    directory.register(1, dummy_entry(addr, 7)).unwrap();
    assert!(matches!(
        directory.register(2, dummy_entry(addr, 7)),
        Err(PeerError::AlreadyConnected)
    ));
    // Same address on another torrent is a different slot.
    directory.register(3, dummy_entry(addr, 8)).unwrap();
    assert!(directory.is_connected(addr, 7));

    directory.unregister(1);
    assert!(!directory.is_connected(addr, 7));
    directory.register(2, dummy_entry(addr, 7)).unwrap();
}

// ---------------------------------------------------------------------------
// Session scenarios over localhost sockets
// ---------------------------------------------------------------------------

const PIECE_LEN: u32 = 32768; // two chunks

struct Harness {
    ctx: SessionCtx,
    torrent: TorrentId,
    info_hash: [u8; 20],
}

fn harness(piece_count: u32, wanted_pieces: Option<Vec<bool>>, depth: usize) -> Harness {
    let events = EventBus::new(64);
    let registry = Arc::new(Registry::new(events.clone()));
    let total = u64::from(piece_count) * u64::from(PIECE_LEN);
    let wanted = match &wanted_pieces {
        Some(flags) => flags.iter().filter(|w| **w).count() as u64 * u64::from(PIECE_LEN),
        None => total,
    };
    let info_hash = [0x5A; 20];
    let torrent = registry.insert(
        TorrentParams {
            name: "session-test".to_string(),
            info_hash,
            total,
            wanted,
            piece_count,
            piece_length: PIECE_LEN,
            is_private: false,
        },
        (0, 0),
    );
    let assigner = TorrentAssigner::new(
        torrent,
        registry.clone(),
        piece_count,
        PIECE_LEN,
        total,
        wanted_pieces.as_deref(),
    );
    let ctx = SessionCtx {
        torrent,
        registry,
        table: Arc::new(PeerTable::new()),
        directory: Arc::new(SessionDirectory::new()),
        assigner,
        bad_peers: Arc::new(BadPeerTable::new()),
        disk: MemoryDisk::spawn(),
        bandwidth: Arc::new(BandwidthLimiter::unlimited()),
        events,
        pipeline_depth: depth,
    };
    Harness { ctx, torrent, info_hash }
}

/// The scripted remote end of one session.
struct RemotePeer {
    reader: FrameReader,
    writer: FrameWriter,
}

impl RemotePeer {
    async fn send(&mut self, message: Message) {
        self.writer.write_frame(&message).await.unwrap();
    }

    async fn recv(&mut self) -> Message {
        timeout(Duration::from_secs(5), self.reader.next_frame())
            .await
            .expect("timed out waiting for a frame")
            .expect("session hung up")
            .0
    }
}

/// Dials a session into the harness engine and returns its peer key
/// together with the scripted remote side.
async fn spawn_session(harness: &Harness) -> (PeerKey, RemotePeer) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let remote_addr = listener.local_addr().unwrap();

    let info_hash = harness.info_hash;
    let torrent = harness.torrent;
    let engine_side = tokio::spawn(async move {
        let stream = TcpStream::connect(remote_addr).await.unwrap();
        let our_id = PeerId::generate();
        session::handshake_outbound(stream, torrent, info_hash, &our_id, false)
            .await
            .unwrap()
    });

    let (stream, _) = listener.accept().await.unwrap();
    let mut transport = PeerTransport::new(stream);
    let theirs = transport.receive_handshake().await.unwrap();
    assert_eq!(theirs.info_hash, info_hash);
    let reply = Handshake::new(info_hash, *PeerId::generate().as_bytes(), false);
    transport.send_handshake(&reply).await.unwrap();

    let shaken = engine_side.await.unwrap();
    let key = session::spawn(harness.ctx.clone(), shaken, remote_addr).unwrap();
    let (reader, writer) = transport.split();
    (key, RemotePeer { reader, writer })
}

#[tokio::test]
async fn test_bitfield_triggers_interest() {
    // Eight pieces, we want only piece 1; the peer has pieces 0 and 1.
    let mut wanted = vec![false; 8];
    wanted[1] = true;
    let harness = harness(8, Some(wanted), 2);
    let (key, mut remote) = spawn_session(&harness).await;

    remote.send(Message::Bitfield(Bytes::from_static(&[0b1100_0000]))).await;
    assert_eq!(remote.recv().await, Message::Interested);

    let flags = harness.ctx.table.get(harness.torrent, key).unwrap();
    assert!(flags.local_interest);
}

#[tokio::test]
async fn test_unchoke_yields_pipelined_requests() {
    let mut wanted = vec![false; 8];
    wanted[1] = true;
    let harness = harness(8, Some(wanted), 2);
    let (_key, mut remote) = spawn_session(&harness).await;

    remote.send(Message::Bitfield(Bytes::from_static(&[0b1100_0000]))).await;
    assert_eq!(remote.recv().await, Message::Interested);

    remote.send(Message::Unchoke).await;
    assert_eq!(
        remote.recv().await,
        Message::Request { index: 1, begin: 0, length: 16384 }
    );
    assert_eq!(
        remote.recv().await,
        Message::Request { index: 1, begin: 16384, length: 16384 }
    );
}

#[tokio::test]
async fn test_piece_completion_broadcasts_have() {
    let harness = harness(1, None, 4);
    let mut events = harness.ctx.events.subscribe();

    let (_key_a, mut peer_a) = spawn_session(&harness).await;
    let (_key_b, mut peer_b) = spawn_session(&harness).await;

    peer_a.send(Message::Bitfield(Bytes::from_static(&[0b1000_0000]))).await;
    assert_eq!(peer_a.recv().await, Message::Interested);
    peer_a.send(Message::Unchoke).await;
    assert_eq!(
        peer_a.recv().await,
        Message::Request { index: 0, begin: 0, length: 16384 }
    );
    assert_eq!(
        peer_a.recv().await,
        Message::Request { index: 0, begin: 16384, length: 16384 }
    );

    peer_a
        .send(Message::Piece { index: 0, begin: 0, data: Bytes::from(vec![1u8; 16384]) })
        .await;
    peer_a
        .send(Message::Piece { index: 0, begin: 16384, data: Bytes::from(vec![2u8; 16384]) })
        .await;

    // Every session of the torrent announces the piece; the idle peer
    // sees it as its first frame.
    assert_eq!(peer_b.recv().await, Message::Have { piece: 0 });

    // Completing the last chunk both finishes the piece and empties
    // bytes-left, so the bus carries a piece event and a seeding event.
    let mut seen = Vec::new();
    for _ in 0..2 {
        seen.push(timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap());
    }
    assert!(seen.contains(&SwarmEvent::PieceComplete { torrent: harness.torrent, piece: 0 }));
    assert!(seen.contains(&SwarmEvent::SeedingTorrent(harness.torrent)));
}

#[tokio::test]
async fn test_endgame_store_cancels_the_slower_peer() {
    // One piece of one chunk; the piece length must fit a single chunk.
    let events = EventBus::new(64);
    let registry = Arc::new(Registry::new(events.clone()));
    let info_hash = [0x5B; 20];
    let torrent = registry.insert(
        TorrentParams {
            name: "endgame-test".to_string(),
            info_hash,
            total: 16384,
            wanted: 16384,
            piece_count: 1,
            piece_length: 16384,
            is_private: false,
        },
        (0, 0),
    );
    let assigner = TorrentAssigner::new(torrent, registry.clone(), 1, 16384, 16384, None);
    let harness = Harness {
        ctx: SessionCtx {
            torrent,
            registry,
            table: Arc::new(PeerTable::new()),
            directory: Arc::new(SessionDirectory::new()),
            assigner,
            bad_peers: Arc::new(BadPeerTable::new()),
            disk: MemoryDisk::spawn(),
            bandwidth: Arc::new(BandwidthLimiter::unlimited()),
            events,
            pipeline_depth: 2,
        },
        torrent,
        info_hash,
    };

    let (_key_a, mut peer_a) = spawn_session(&harness).await;
    let (_key_b, mut peer_b) = spawn_session(&harness).await;

    // Peer A gets the only chunk assigned.
    peer_a.send(Message::Bitfield(Bytes::from_static(&[0b1000_0000]))).await;
    assert_eq!(peer_a.recv().await, Message::Interested);
    peer_a.send(Message::Unchoke).await;
    assert_eq!(
        peer_a.recv().await,
        Message::Request { index: 0, begin: 0, length: 16384 }
    );

    // Peer B finds no free chunks, which flips the torrent to endgame
    // and duplicates the outstanding chunk.
    peer_b.send(Message::Bitfield(Bytes::from_static(&[0b1000_0000]))).await;
    assert_eq!(peer_b.recv().await, Message::Interested);
    peer_b.send(Message::Unchoke).await;
    assert_eq!(
        peer_b.recv().await,
        Message::Request { index: 0, begin: 0, length: 16384 }
    );
    assert!(harness.ctx.assigner.is_endgame());

    // B wins the race; A must be told to stop.
    peer_b
        .send(Message::Piece { index: 0, begin: 0, data: Bytes::from(vec![7u8; 16384]) })
        .await;
    let mut saw_cancel = false;
    for _ in 0..3 {
        match peer_a.recv().await {
            Message::Cancel { index: 0, begin: 0, length: 16384 } => {
                saw_cancel = true;
                break;
            }
            Message::Have { .. } | Message::NotInterested => continue,
            other => panic!("unexpected frame for peer A: {other:?}"),
        }
    }
    assert!(saw_cancel);
}

#[tokio::test]
async fn test_serving_a_request_when_unchoked() {
    let harness = harness(1, None, 2);
    // Seed side: the piece is already on disk and marked stored.
    let chunk0 = crate::assigner::Chunk { piece: 0, offset: 0, length: 16384 };
    let chunk1 = crate::assigner::Chunk { piece: 0, offset: 16384, length: 16384 };
    harness.ctx.disk.write_chunk(harness.torrent, chunk0, Bytes::from(vec![3u8; 16384])).await.unwrap();
    harness.ctx.disk.write_chunk(harness.torrent, chunk1, Bytes::from(vec![4u8; 16384])).await.unwrap();
    harness.ctx.assigner.prime_stored(&[0]);

    let (key, mut remote) = spawn_session(&harness).await;

    // A fresh session advertises what we have.
    assert_eq!(
        remote.recv().await,
        Message::Bitfield(Bytes::from_static(&[0b1000_0000]))
    );

    remote.send(Message::Interested).await;
    // The choker normally decides this; drive it directly.
    assert!(harness.ctx.directory.send(key, SessionCmd::Unchoke).await);
    assert_eq!(remote.recv().await, Message::Unchoke);

    remote.send(Message::Request { index: 0, begin: 0, length: 16384 }).await;
    match remote.recv().await {
        Message::Piece { index: 0, begin: 0, data } => {
            assert_eq!(data.len(), 16384);
            assert!(data.iter().all(|b| *b == 3));
        }
        other => panic!("expected piece, got {other:?}"),
    }

    let uploaded = harness.ctx.registry.lookup(harness.torrent).unwrap().uploaded;
    assert_eq!(uploaded, 16384);
}

#[tokio::test]
async fn test_session_death_reclaims_assignments() {
    let harness = harness(2, None, 4);
    let (key, mut remote) = spawn_session(&harness).await;

    remote.send(Message::Bitfield(Bytes::from_static(&[0b1100_0000]))).await;
    assert_eq!(remote.recv().await, Message::Interested);
    remote.send(Message::Unchoke).await;
    // Depth 4 pulls both chunks of the rarer piece, then the other.
    let mut requested = 0;
    while requested < 4 {
        match remote.recv().await {
            Message::Request { .. } => requested += 1,
            other => panic!("expected request, got {other:?}"),
        }
    }
    assert_eq!(harness.ctx.assigner.counts().assigned, 4);

    // Hard disconnect.
    drop(remote);
    timeout(Duration::from_secs(5), async {
        loop {
            if harness.ctx.assigner.counts().assigned == 0
                && harness.ctx.directory.count() == 0
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("drop was never reclaimed");

    assert_eq!(harness.ctx.assigner.counts().free, 4);
    assert!(harness.ctx.table.get(harness.torrent, key).is_none());
}

#[tokio::test]
async fn test_choke_returns_outstanding_chunks() {
    let harness = harness(1, None, 2);
    let (_key, mut remote) = spawn_session(&harness).await;

    remote.send(Message::Bitfield(Bytes::from_static(&[0b1000_0000]))).await;
    assert_eq!(remote.recv().await, Message::Interested);
    remote.send(Message::Unchoke).await;
    assert_eq!(
        remote.recv().await,
        Message::Request { index: 0, begin: 0, length: 16384 }
    );
    assert_eq!(
        remote.recv().await,
        Message::Request { index: 0, begin: 16384, length: 16384 }
    );

    // Choking us discards our in-flight requests on the remote side;
    // the chunks must come back to the free pool.
    remote.send(Message::Choke).await;
    timeout(Duration::from_secs(5), async {
        while harness.ctx.assigner.counts().free != 2 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("choke did not reclaim chunks");

    // Unchoking again re-requests the same chunks.
    remote.send(Message::Unchoke).await;
    assert_eq!(
        remote.recv().await,
        Message::Request { index: 0, begin: 0, length: 16384 }
    );
}
