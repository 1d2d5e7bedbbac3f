use std::collections::HashMap;
use std::net::SocketAddr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::Rng as _;
use tracing::debug;

use super::error::TrackerError;
use super::response::{decode_peers_v4, AnnounceEvent};

/// The magic constant every connect request opens with.
pub const PROTOCOL_MAGIC: u64 = 0x0417_2710_1980;

const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_SCRAPE: u32 = 2;
const ACTION_ERROR: u32 = 3;

/// Opens a tracker conversation; the response carries the connection id
/// the announce must echo.
#[derive(Debug, Clone, Copy)]
pub struct ConnectRequest {
    pub transaction: u32,
}

impl ConnectRequest {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16);
        buf.put_u64(PROTOCOL_MAGIC);
        buf.put_u32(ACTION_CONNECT);
        buf.put_u32(self.transaction);
        buf.freeze()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectResponse {
    pub transaction: u32,
    pub connection_id: u64,
}

/// A full announce, 98 bytes on the wire.
#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    pub connection_id: u64,
    pub transaction: u32,
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub downloaded: u64,
    pub left: u64,
    pub uploaded: u64,
    pub event: AnnounceEvent,
    /// Explicit source address override; 0 lets the tracker use the
    /// datagram's source.
    pub ip: u32,
    /// Random key so the tracker can match announces across changing
    /// source ports.
    pub key: u32,
    /// How many peers we want back; -1 for the tracker's default.
    pub num_want: i32,
    pub port: u16,
}

impl AnnounceRequest {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(98);
        buf.put_u64(self.connection_id);
        buf.put_u32(ACTION_ANNOUNCE);
        buf.put_u32(self.transaction);
        buf.put_slice(&self.info_hash);
        buf.put_slice(&self.peer_id);
        buf.put_u64(self.downloaded);
        buf.put_u64(self.left);
        buf.put_u64(self.uploaded);
        buf.put_u32(self.event.to_wire());
        buf.put_u32(self.ip);
        buf.put_u32(self.key);
        buf.put_i32(self.num_want);
        buf.put_u16(self.port);
        buf.freeze()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceResponse {
    pub transaction: u32,
    pub interval: u32,
    pub leechers: u32,
    pub seeders: u32,
    pub peers: Vec<SocketAddr>,
}

/// One torrent's worth of scrape statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrapeStats {
    pub seeders: u32,
    pub completed: u32,
    pub leechers: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapeResponse {
    pub transaction: u32,
    pub stats: Vec<ScrapeStats>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorResponse {
    pub transaction: u32,
    pub message: String,
}

/// Any datagram a tracker can send us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerPacket {
    Connect(ConnectResponse),
    Announce(AnnounceResponse),
    Scrape(ScrapeResponse),
    Error(ErrorResponse),
}

impl TrackerPacket {
    pub fn transaction(&self) -> u32 {
        match self {
            TrackerPacket::Connect(r) => r.transaction,
            TrackerPacket::Announce(r) => r.transaction,
            TrackerPacket::Scrape(r) => r.transaction,
            TrackerPacket::Error(r) => r.transaction,
        }
    }
}

/// Decodes one tracker datagram.
///
/// Returns `Ok(None)` for action codes we don't speak; those are logged
/// and dropped rather than treated as hostile.
pub fn decode_packet(data: &[u8]) -> Result<Option<TrackerPacket>, TrackerError> {
    if data.len() < 8 {
        return Err(TrackerError::Truncated(data.len()));
    }
    let mut buf = data;
    let action = buf.get_u32();
    let transaction = buf.get_u32();

    match action {
        ACTION_CONNECT => {
            if buf.remaining() < 8 {
                return Err(TrackerError::Truncated(data.len()));
            }
            Ok(Some(TrackerPacket::Connect(ConnectResponse {
                transaction,
                connection_id: buf.get_u64(),
            })))
        }
        ACTION_ANNOUNCE => {
            if buf.remaining() < 12 {
                return Err(TrackerError::Truncated(data.len()));
            }
            let interval = buf.get_u32();
            let leechers = buf.get_u32();
            let seeders = buf.get_u32();
            Ok(Some(TrackerPacket::Announce(AnnounceResponse {
                transaction,
                interval,
                leechers,
                seeders,
                peers: decode_peers_v4(buf),
            })))
        }
        ACTION_SCRAPE => {
            let stats = buf
                .chunks_exact(12)
                .map(|entry| ScrapeStats {
                    seeders: u32::from_be_bytes([entry[0], entry[1], entry[2], entry[3]]),
                    completed: u32::from_be_bytes([entry[4], entry[5], entry[6], entry[7]]),
                    leechers: u32::from_be_bytes([entry[8], entry[9], entry[10], entry[11]]),
                })
                .collect();
            Ok(Some(TrackerPacket::Scrape(ScrapeResponse { transaction, stats })))
        }
        ACTION_ERROR => Ok(Some(TrackerPacket::Error(ErrorResponse {
            transaction,
            message: String::from_utf8_lossy(buf).into_owned(),
        }))),
        unknown => {
            debug!(action = unknown, "dropping unknown tracker action");
            Ok(None)
        }
    }
}

/// What a transaction id was issued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingKind {
    Connect,
    Announce,
    Scrape,
}

/// Routes responses back to their requests by transaction id.
///
/// Ids are four random bytes; a response whose id we never issued is
/// logged and dropped.
#[derive(Debug, Default)]
pub struct TransactionTable {
    pending: HashMap<u32, PendingKind>,
}

impl TransactionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues a fresh transaction id for a request of the given kind.
    pub fn register(&mut self, kind: PendingKind) -> u32 {
        let mut rng = rand::rng();
        loop {
            let transaction: u32 = rng.random();
            if !self.pending.contains_key(&transaction) {
                self.pending.insert(transaction, kind);
                return transaction;
            }
        }
    }

    /// Matches a decoded packet to its pending request, consuming the
    /// id. `None` means nobody asked for this response.
    pub fn dispatch(&mut self, packet: &TrackerPacket) -> Option<PendingKind> {
        let transaction = packet.transaction();
        let kind = self.pending.remove(&transaction);
        if kind.is_none() {
            debug!(transaction, "dropping response for unknown transaction");
        }
        kind
    }

    /// Abandons a request, e.g. after a timeout.
    pub fn forget(&mut self, transaction: u32) {
        self.pending.remove(&transaction);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
