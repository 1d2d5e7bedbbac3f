//! Protocol constants and tuning parameters.
//!
//! Timeouts and budgets used across the swarm engine. Values follow the
//! conventions of mainstream clients (libtorrent, Transmission) where
//! the protocol does not pin them.

use std::time::Duration;

// ============================================================================
// Client identification
// ============================================================================

/// Client ID prefix for peer ID generation (Azureus-style).
pub const CLIENT_PREFIX: &str = "-RS0001-";

/// Default BitTorrent listen port.
pub const DEFAULT_PORT: u16 = 6881;

// ============================================================================
// Chunks and requests
// ============================================================================

/// Wire request size: chunks never exceed 16 KiB.
pub const CHUNK_SIZE: u32 = 16384;

/// Requests larger than this are a protocol violation (BEP-3 allows up
/// to 128 KiB; anything bigger is hostile).
pub const MAX_REQUEST_LENGTH: u32 = 131072;

/// Outstanding requests a session keeps on the wire.
pub const DEFAULT_PIPELINE_DEPTH: usize = 6;

// ============================================================================
// Session timing
// ============================================================================

/// No piece payload for this long flags the peer as snubbed.
pub const SNUB_TIMEOUT: Duration = Duration::from_secs(30);

/// Quiet-wire threshold after which a session sends a keepalive.
pub const KEEPALIVE_AFTER: Duration = Duration::from_secs(150);

/// Further silence after the keepalive before the session gives up.
pub const KEEPALIVE_GRACE: Duration = Duration::from_secs(120);

/// Cadence of the session housekeeping tick (snub + watchdog checks).
pub const SESSION_TICK: Duration = Duration::from_secs(5);

/// Outbound TCP connect timeout.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Choker
// ============================================================================

/// Length of one choke round.
pub const CHOKE_ROUND: Duration = Duration::from_secs(10);

/// The optimistic rotation advances every this many rounds.
pub const OPTIMISTIC_EVERY: u32 = 3;

// ============================================================================
// Peer reputation
// ============================================================================

/// Offense count beyond which a peer is refused.
pub const BAD_PEER_MAX_OFFENSES: u32 = 2;

/// Offense entries older than this are forgiven.
pub const BAD_PEER_GRACE: Duration = Duration::from_secs(900);

/// Cadence of the bad-peer sweep.
pub const BAD_PEER_SWEEP: Duration = Duration::from_secs(120);

// ============================================================================
// Housekeeping
// ============================================================================

/// Cadence of the registry rate-sparkline tick.
pub const RATE_SAMPLE_INTERVAL: Duration = Duration::from_secs(60);

// ============================================================================
// Mailbox capacities
// ============================================================================

/// Session command mailbox (choker, sibling sessions).
pub const SESSION_CMD_CAPACITY: usize = 64;

/// Receive-task to control-task frame mailbox. Small on purpose: when
/// control stalls on disk backpressure, the receive task stops pulling
/// from the socket and TCP pushes back on the remote.
pub const SESSION_EVENT_CAPACITY: usize = 16;

/// Control-task to send-task mailbox.
pub const SESSION_SEND_CAPACITY: usize = 256;

/// Disk collaborator command mailbox.
pub const DISK_QUEUE_CAPACITY: usize = 128;
