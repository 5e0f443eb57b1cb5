use super::error::StorageError;
use super::PieceStore;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Keeps committed pieces in memory. Useful for tests and for torrents that
/// are streamed elsewhere once complete.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    pieces: RwLock<HashMap<u32, Bytes>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the store with an already complete piece.
    pub fn insert(&self, piece: u32, data: Bytes) {
        self.pieces.write().insert(piece, data);
    }

    pub fn piece(&self, piece: u32) -> Option<Bytes> {
        self.pieces.read().get(&piece).cloned()
    }

    pub fn len(&self) -> usize {
        self.pieces.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pieces.read().is_empty()
    }
}

impl PieceStore for MemoryStorage {
    async fn write_piece(&self, piece: u32, data: Bytes) -> Result<(), StorageError> {
        self.pieces.write().insert(piece, data);
        Ok(())
    }

    async fn read_block(&self, piece: u32, offset: u32, length: u32) -> Result<Bytes, StorageError> {
        let data = self.piece(piece).ok_or(StorageError::PieceNotFound(piece))?;
        let start = offset as usize;
        let end = start + length as usize;
        if length == 0 || end > data.len() {
            return Err(StorageError::InvalidBlock {
                piece,
                offset,
                length,
            });
        }
        Ok(data.slice(start..end))
    }
}
