use thiserror::Error;

/// Errors that end a peer session.
///
/// Protocol violations feed the bad-peer table; transient transport
/// failures do not, and the peer may reconnect.
#[derive(Debug, Error)]
pub enum PeerError {
    /// Network I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer sent an invalid handshake.
    #[error("invalid handshake")]
    InvalidHandshake,

    /// The peer's info hash doesn't match the torrent we dialed.
    #[error("info hash mismatch")]
    InfoHashMismatch,

    /// An inbound handshake named a torrent we don't serve.
    #[error("unknown torrent")]
    UnknownTorrent,

    /// Received a malformed protocol message.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// The connection was closed by the peer.
    #[error("connection closed")]
    ConnectionClosed,

    /// Operation timed out.
    #[error("timeout")]
    Timeout,

    /// Protocol violation by the peer.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A session already exists for this address and torrent.
    #[error("already connected")]
    AlreadyConnected,

    /// The file I/O collaborator failed underneath the session.
    #[error("storage error: {0}")]
    Storage(String),
}

impl PeerError {
    /// True for violations that should count against the peer's
    /// reputation, as opposed to transient transport failures.
    pub fn is_protocol_offense(&self) -> bool {
        matches!(
            self,
            PeerError::InvalidHandshake
                | PeerError::InfoHashMismatch
                | PeerError::InvalidMessage(_)
                | PeerError::Protocol(_)
        )
    }
}
