//! UDP tracker wire protocol ([BEP-15]).
//!
//! Announce I/O lives in the tracker collaborator; this module is the
//! codec it shares with the core: connect/announce/scrape/error packet
//! encode and decode, the transaction table that routes responses, and
//! the compact peer-list formats ([BEP-23] and its IPv6 variant).
//!
//! [BEP-15]: http://bittorrent.org/beps/bep_0015.html
//! [BEP-23]: http://bittorrent.org/beps/bep_0023.html

mod error;
mod response;
mod wire;

pub use error::TrackerError;
pub use response::{
    decode_peers_v4, decode_peers_v6, encode_peers_v4, encode_peers_v6, AnnounceEvent,
};
pub use wire::{
    decode_packet, AnnounceRequest, AnnounceResponse, ConnectRequest, ConnectResponse,
    ErrorResponse, PendingKind, ScrapeResponse, ScrapeStats, TrackerPacket, TransactionTable,
    PROTOCOL_MAGIC,
};
