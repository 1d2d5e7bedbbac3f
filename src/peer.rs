//! Peer wire protocol and sessions ([BEP-3]).
//!
//! The codec lives in [`message`](self::Message) types, framing in
//! [`transport`](self::PeerTransport), per-peer flag state in
//! [`PeerTable`], command routing in [`SessionDirectory`], and the
//! control/send/receive task trio in [`session`].
//!
//! [BEP-3]: http://bittorrent.org/beps/bep_0003.html

mod bitfield;
mod error;
mod message;
mod peer_id;
pub mod session;
mod state;
mod transport;

pub use bitfield::Bitfield;
pub use error::PeerError;
pub use message::{Capabilities, Handshake, Message, MessageId, HANDSHAKE_LEN, PROTOCOL};
pub use peer_id::PeerId;
pub use session::{SessionCmd, SessionCtx};
pub use state::{next_peer_key, PeerFlags, PeerKey, PeerTable, SessionDirectory, SessionEntry};
pub use transport::{FrameReader, FrameWriter, PeerTransport};

#[cfg(test)]
mod tests;
