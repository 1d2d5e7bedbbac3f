//! Chunk assignment.
//!
//! Every piece is partitioned into 16 KiB chunks, the unit of wire
//! requests. The assigner is the single writer of chunk state: each
//! chunk is `free`, `assigned`, `fetched` or `stored`, and the four
//! sets always partition the torrent's chunk universe. Outside endgame
//! a chunk is assigned to at most one peer; once every chunk is out on
//! the wire the torrent flips to endgame and outstanding chunks may be
//! duplicated across peers, the first store winning and cancelling the
//! rest.
//!
//! Sessions drive the assigner: they ask for work, report fetched and
//! stored chunks, and report themselves dropped so their pending set
//! can be reclaimed.

mod chunks;
mod pending;

pub use chunks::{
    Chunk, ChunkCounts, ChunkState, Offer, StoredOutcome, TorrentAssigner, CHUNK_SIZE,
    ENDGAME_REPLICATION,
};
pub use pending::PendingTracker;
