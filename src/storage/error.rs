use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid piece index: {0}")]
    InvalidPieceIndex(u32),

    #[error("invalid block: piece {piece}, offset {offset}, length {length}")]
    InvalidBlock { piece: u32, offset: u32, length: u32 },

    #[error("piece {piece} is {actual} bytes, expected {expected}")]
    InvalidLength {
        piece: u32,
        expected: u64,
        actual: usize,
    },

    #[error("piece {0} has not been written")]
    PieceNotFound(u32),

    #[error("invalid file layout: {0}")]
    InvalidLayout(String),

    #[error("path traversal detected in file path: {0}")]
    PathTraversal(String),
}
