use thiserror::Error;

/// Errors that can occur during peer communication.
///
/// Every variant except [`PeerError::Incomplete`] is fatal to the connection
/// that produced it, never to the torrent.
#[derive(Debug, Error)]
pub enum PeerError {
    /// Network I/O error.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Not enough bytes buffered to decode the next frame. This is a
    /// streaming signal: keep the buffer and retry once more bytes arrive.
    #[error("incomplete frame: need {needed} more bytes")]
    Incomplete { needed: usize },

    /// Unknown message type, or a length that does not match the type.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// A valid message at the wrong time, e.g. a second handshake.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The peer's info hash doesn't match ours.
    #[error("info hash mismatch")]
    InfoHashMismatch,

    /// The coordinator refused the session after the handshake.
    #[error("peer rejected: {0}")]
    Rejected(&'static str),

    /// The connection was closed by the peer.
    #[error("connection closed")]
    ConnectionClosed,

    /// The torrent this session belonged to has shut down.
    #[error("torrent coordinator is gone")]
    Detached,

    /// Operation timed out.
    #[error("timeout")]
    Timeout,
}

impl PeerError {
    pub fn is_incomplete(&self) -> bool {
        matches!(self, PeerError::Incomplete { .. })
    }
}
