use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Announce event codes.
///
/// `Paused` deliberately shares wire value 0 with `None`: BEP-21 keeps
/// paused announces compatible with trackers that don't know the
/// event, so the distinction exists only on the encode side and a
/// decoder never produces `Paused`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    None,
    Completed,
    Started,
    Stopped,
    Paused,
}

impl AnnounceEvent {
    pub fn to_wire(self) -> u32 {
        match self {
            AnnounceEvent::None | AnnounceEvent::Paused => 0,
            AnnounceEvent::Completed => 1,
            AnnounceEvent::Started => 2,
            AnnounceEvent::Stopped => 3,
        }
    }

    pub fn from_wire(value: u32) -> Option<Self> {
        match value {
            0 => Some(AnnounceEvent::None),
            1 => Some(AnnounceEvent::Completed),
            2 => Some(AnnounceEvent::Started),
            3 => Some(AnnounceEvent::Stopped),
            _ => None,
        }
    }
}

/// Decodes a compact IPv4 peer list: concatenated `(ip:4, port:2)`.
///
/// Some trackers emit a malformed tail; trailing bytes that don't make
/// a full entry are dropped, not an error.
pub fn decode_peers_v4(data: &[u8]) -> Vec<SocketAddr> {
    data.chunks_exact(6)
        .map(|entry| {
            let ip = Ipv4Addr::new(entry[0], entry[1], entry[2], entry[3]);
            let port = u16::from_be_bytes([entry[4], entry[5]]);
            SocketAddr::new(IpAddr::V4(ip), port)
        })
        .collect()
}

/// Decodes a compact IPv6 peer list: concatenated `(ip:16, port:2)`.
pub fn decode_peers_v6(data: &[u8]) -> Vec<SocketAddr> {
    data.chunks_exact(18)
        .map(|entry| {
            let mut ip = [0u8; 16];
            ip.copy_from_slice(&entry[..16]);
            let port = u16::from_be_bytes([entry[16], entry[17]]);
            SocketAddr::new(IpAddr::V6(Ipv6Addr::from(ip)), port)
        })
        .collect()
}

/// Encodes IPv4 peers compactly; non-IPv4 addresses are skipped.
pub fn encode_peers_v4(peers: &[SocketAddr]) -> Vec<u8> {
    let mut out = Vec::with_capacity(peers.len() * 6);
    for peer in peers {
        if let IpAddr::V4(ip) = peer.ip() {
            out.extend_from_slice(&ip.octets());
            out.extend_from_slice(&peer.port().to_be_bytes());
        }
    }
    out
}

/// Encodes IPv6 peers compactly; non-IPv6 addresses are skipped.
pub fn encode_peers_v6(peers: &[SocketAddr]) -> Vec<u8> {
    let mut out = Vec::with_capacity(peers.len() * 18);
    for peer in peers {
        if let IpAddr::V6(ip) = peer.ip() {
            out.extend_from_slice(&ip.octets());
            out.extend_from_slice(&peer.port().to_be_bytes());
        }
    }
    out
}
