use thiserror::Error;

use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum TorrentError {
    #[error("invalid torrent descriptor: {0}")]
    InvalidDescriptor(String),

    /// The assembled piece does not match its recorded hash. Fatal to the
    /// piece only: it is reset and downloaded again.
    #[error("hash mismatch for piece {piece}")]
    HashMismatch { piece: u32 },

    /// The verified piece could not be committed. Fatal to the commit only.
    #[error("storage write failed for piece {piece}: {source}")]
    StorageWrite {
        piece: u32,
        #[source]
        source: StorageError,
    },

    /// A piece buffer could not be allocated. Fatal to the torrent.
    #[error("cannot allocate {bytes} bytes for piece {piece}")]
    OutOfMemory { piece: u32, bytes: usize },

    #[error("torrent has shut down")]
    Shutdown,
}
