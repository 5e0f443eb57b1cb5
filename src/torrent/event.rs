use std::net::SocketAddr;

use crate::peer::{BlockRequest, PeerId, SessionId};

/// Notable things that happen to a torrent, published to subscribers of
/// [`TorrentHandle::subscribe`](super::TorrentHandle::subscribe).
///
/// Delivery is best effort: a subscriber that falls behind misses events and
/// never slows the engine down.
#[derive(Debug, Clone, PartialEq)]
pub enum TorrentEvent {
    PeerConnected {
        id: SessionId,
        addr: SocketAddr,
        peer_id: PeerId,
    },
    PeerDisconnected {
        id: SessionId,
        addr: SocketAddr,
        /// Block claims returned to the pool.
        released: usize,
        reason: Option<String>,
    },
    PeerChoked {
        id: SessionId,
    },
    PeerUnchoked {
        id: SessionId,
    },
    RequestTimedOut {
        id: SessionId,
        block: BlockRequest,
    },
    EndgameStarted {
        remaining: usize,
    },
    PieceCompleted {
        piece: u32,
    },
    HashFailed {
        piece: u32,
        peers: Vec<SessionId>,
    },
    StorageFailed {
        piece: u32,
        reason: String,
    },
    /// Every piece is verified and committed.
    Completed,
}
