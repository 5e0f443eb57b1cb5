//! piecemeal - A BitTorrent download engine
//!
//! This library implements the peer-facing half of a BitTorrent client:
//! the BEP-3 peer wire protocol, per-connection sessions, rarest-first piece
//! selection with endgame, tit-for-tat choking, and piece verification and
//! commit. Finding peers and parsing `.torrent` files are left to the caller,
//! which hands the engine a [`TorrentDescriptor`] and peer addresses.
//!
//! # Modules
//!
//! - [`peer`] - BEP-3 wire codec, transport, sessions and choking
//! - [`picker`] - Piece table, availability and block selection
//! - [`storage`] - Where verified pieces are written and uploads read
//! - [`torrent`] - The per-torrent coordinator and its public handle
//! - [`constants`] - Protocol constants and default limits
//!
//! # Example
//!
//! ```no_run
//! use piecemeal::{FileStorage, InfoHash, TorrentConfig, TorrentContext, TorrentDescriptor, TorrentEvent, TorrentHandle};
//! use std::sync::Arc;
//!
//! # async fn example(pieces: Vec<u8>) -> Result<(), Box<dyn std::error::Error>> {
//! let info_hash = InfoHash::from_hex("0123456789abcdef0123456789abcdef01234567")?;
//! let descriptor = TorrentDescriptor::from_pieces_field(info_hash, 262144, 10_000_000, &pieces)?;
//!
//! let storage = FileStorage::single_file("./downloads", "file.bin", &descriptor)?;
//! let have = storage.verify_all(&descriptor).await?;
//!
//! let ctx = TorrentContext::new(descriptor, TorrentConfig::default());
//! let torrent = TorrentHandle::spawn_with_resume(ctx, Arc::new(storage), have);
//! let mut events = torrent.subscribe();
//! torrent.add_peer("198.51.100.7:51413".parse()?);
//!
//! while let Ok(event) = events.recv().await {
//!     if event == TorrentEvent::Completed {
//!         break;
//!     }
//! }
//! torrent.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod constants;
pub mod peer;
pub mod picker;
pub mod storage;
pub mod torrent;

pub use peer::{
    Bitfield, Block, BlockRequest, Handshake, Message, PeerCommand, PeerError, PeerId, SessionId,
};
pub use picker::{PieceSelector, PieceStatus, PieceTable};
pub use storage::{FileEntry, FileStorage, MemoryStorage, PieceStore, StorageError};
pub use torrent::{
    EndgameTrigger, InfoHash, TorrentConfig, TorrentContext, TorrentDescriptor, TorrentError,
    TorrentEvent, TorrentHandle, TorrentStats,
};
