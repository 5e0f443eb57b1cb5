//! Protocol constants and tuning parameters.
//!
//! Timeouts, buffer sizes, protocol values and the defaults behind
//! [`TorrentConfig`](crate::torrent::TorrentConfig).
//!
//! These values follow the defaults of popular clients like qBittorrent,
//! Transmission and libtorrent.

use std::time::Duration;

// ============================================================================
// Client identification
// ============================================================================

/// Client ID prefix for peer ID generation (Azureus-style)
pub const CLIENT_PREFIX: &[u8; 8] = b"-PM0001-";

// ============================================================================
// Protocol
// ============================================================================

/// Protocol identifier sent in the handshake
pub const PROTOCOL_STRING: &[u8; 19] = b"BitTorrent protocol";

/// Total handshake length: pstrlen + pstr + reserved + info hash + peer id
pub const HANDSHAKE_LEN: usize = 68;

/// Reserved handshake bytes; no extensions are advertised
pub const RESERVED_BYTES: [u8; 8] = [0; 8];

/// Standard block size (16 KiB); most clients refuse larger requests
pub const BLOCK_SIZE: u32 = 16384;

/// Largest block we serve to a peer (128 KiB)
pub const MAX_REQUEST_LENGTH: u32 = 131072;

/// Largest frame accepted from the wire (16 MiB)
pub const MAX_MESSAGE_SIZE: usize = 16777216;

// ============================================================================
// Connection limits
// ============================================================================

/// Maximum peers per torrent (qBittorrent default: 100, Transmission: 60)
pub const MAX_PEERS_PER_TORRENT: usize = 100;

/// Maximum peers we keep unchoked for uploads, not counting the optimistic slot
/// (qBittorrent: 4, libtorrent: 8)
pub const MAX_UNCHOKED_PEERS: usize = 4;

/// Maximum outstanding block requests per peer for request pipelining
pub const PIPELINE_DEPTH: usize = 16;

/// Endgame starts when fewer than this many pieces are missing. `None` in the
/// config means "fewer than the number of connected peers".
pub const ENDGAME_PIECES_THRESHOLD: usize = 10;

/// Maximum number of peers holding a request for the same block in endgame
pub const MAX_DUPLICATE_REQUESTS: usize = 3;

/// Queued uploads kept per peer before further requests are ignored
pub const MAX_UPLOAD_QUEUE: usize = 256;

/// Capacity of the session → coordinator event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Capacity of the observability broadcast channel
pub const OBSERVER_CHANNEL_CAPACITY: usize = 1024;

// ============================================================================
// Timeouts
// ============================================================================

/// Timeout for establishing a TCP connection
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for completing the handshake once connected
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// A peer that sends nothing (not even a keep-alive) for this long is dropped
pub const PEER_READ_TIMEOUT: Duration = Duration::from_secs(180);

/// Timeout for a single socket write
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Time to wait for a block before it is released and re-selected
pub const BLOCK_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Grace period for sessions to exit during torrent shutdown
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// ============================================================================
// Intervals
// ============================================================================

/// Interval between choke algorithm runs
pub const CHOKING_INTERVAL: Duration = Duration::from_secs(10);

/// Number of choke rounds an optimistic unchoke is kept (3 × 10 s = 30 s)
pub const OPTIMISTIC_UNCHOKE_ROUNDS: u32 = 3;

/// Interval for sending keep-alive messages
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(120);

/// Window of the exponential moving average used for transfer rates
pub const RATE_CALC_WINDOW: Duration = Duration::from_secs(5);

/// Session housekeeping tick: rate reports, keep-alives, idle checks
pub const SESSION_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Coordinator housekeeping tick: request expiry and pipeline refills
pub const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(1);
