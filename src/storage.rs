//! Piece persistence.
//!
//! The engine only ever hands storage whole, verified pieces and reads back
//! arbitrary blocks of pieces it has completed. Both operations go through
//! the [`PieceStore`] trait so the coordinator never knows where bytes land.
//!
//! # Components
//!
//! - [`PieceStore`] - The write/read interface the engine depends on
//! - [`FileStorage`] - Pieces mapped onto the torrent's files on disk
//! - [`MemoryStorage`] - Pieces kept in a map, for tests and streaming
//! - [`FileEntry`] - A file's path, length and offset in the torrent
//!
//! # Examples
//!
//! ```no_run
//! use piecemeal::storage::{FileEntry, FileStorage};
//! use piecemeal::torrent::{InfoHash, TorrentDescriptor};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let descriptor = TorrentDescriptor::new(InfoHash([0u8; 20]), 1024, 1500, vec![[0u8; 20]; 2])?;
//! let files = FileEntry::sequence([("a.txt", 1000), ("b.txt", 500)]);
//! let storage = FileStorage::new("./downloads", files, &descriptor)?;
//!
//! // Pieces already on disk, for resuming
//! let have = storage.verify_all(&descriptor).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Security
//!
//! File paths containing `..` or absolute paths are rejected.

mod disk;
mod error;
mod file;
mod memory;

use bytes::Bytes;
use std::future::Future;

pub use disk::FileStorage;
pub use error::StorageError;
pub use file::{file_spans, AllocationMode, FileEntry, FileSpan};
pub use memory::MemoryStorage;

/// Where verified pieces are committed and uploads are read from.
///
/// A successful `write_piece` means the piece is durable as far as the
/// engine is concerned; a failed one is assumed to have written nothing.
pub trait PieceStore: Send + Sync + 'static {
    fn write_piece(
        &self,
        piece: u32,
        data: Bytes,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    fn read_block(
        &self,
        piece: u32,
        offset: u32,
        length: u32,
    ) -> impl Future<Output = Result<Bytes, StorageError>> + Send;
}
