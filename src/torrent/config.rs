use std::time::Duration;

use crate::constants::{
    BLOCK_REQUEST_TIMEOUT, CHOKING_INTERVAL, CONNECTION_TIMEOUT, ENDGAME_PIECES_THRESHOLD,
    HANDSHAKE_TIMEOUT, KEEPALIVE_INTERVAL, MAX_DUPLICATE_REQUESTS, MAX_PEERS_PER_TORRENT,
    MAX_UNCHOKED_PEERS, OPTIMISTIC_UNCHOKE_ROUNDS, PEER_READ_TIMEOUT, PIPELINE_DEPTH,
};

/// When the selector switches to endgame and starts duplicating requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndgameTrigger {
    /// Fewer pieces remain than there are connected peers.
    PeerCount,
    /// Fewer than this many pieces remain.
    Pieces(usize),
}

/// Tuning knobs for one torrent.
#[derive(Debug, Clone)]
pub struct TorrentConfig {
    /// Outstanding block requests per peer.
    pub pipeline_depth: usize,
    pub endgame: EndgameTrigger,
    /// Most peers one block may be requested from during endgame.
    pub max_duplicate_requests: usize,
    /// Regular upload slots; one optimistic slot comes on top.
    pub max_unchoked: usize,
    /// Choke rounds between optimistic unchoke rotations.
    pub optimistic_unchoke_rounds: u32,
    pub choke_interval: Duration,
    /// How long a block request may stay unanswered before it is reissued.
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Silence after which a peer is dropped.
    pub peer_read_timeout: Duration,
    pub keepalive_interval: Duration,
    pub max_peers: usize,
}

impl Default for TorrentConfig {
    fn default() -> Self {
        Self {
            pipeline_depth: PIPELINE_DEPTH,
            endgame: EndgameTrigger::Pieces(ENDGAME_PIECES_THRESHOLD),
            max_duplicate_requests: MAX_DUPLICATE_REQUESTS,
            max_unchoked: MAX_UNCHOKED_PEERS,
            optimistic_unchoke_rounds: OPTIMISTIC_UNCHOKE_ROUNDS,
            choke_interval: CHOKING_INTERVAL,
            request_timeout: BLOCK_REQUEST_TIMEOUT,
            connect_timeout: CONNECTION_TIMEOUT,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            peer_read_timeout: PEER_READ_TIMEOUT,
            keepalive_interval: KEEPALIVE_INTERVAL,
            max_peers: MAX_PEERS_PER_TORRENT,
        }
    }
}

impl TorrentConfig {
    pub fn with_pipeline_depth(mut self, depth: usize) -> Self {
        self.pipeline_depth = depth.max(1);
        self
    }

    pub fn with_endgame(mut self, trigger: EndgameTrigger) -> Self {
        self.endgame = trigger;
        self
    }

    pub fn with_max_duplicate_requests(mut self, max: usize) -> Self {
        self.max_duplicate_requests = max.max(1);
        self
    }

    pub fn with_max_unchoked(mut self, max: usize) -> Self {
        self.max_unchoked = max;
        self
    }

    pub fn with_choke_interval(mut self, interval: Duration) -> Self {
        self.choke_interval = interval;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_max_peers(mut self, max: usize) -> Self {
        self.max_peers = max;
        self
    }
}
