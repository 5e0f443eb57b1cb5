//! Per-torrent coordination.
//!
//! One coordinator task owns a torrent's piece table and peer records.
//! Peer sessions report to it over a bounded channel and receive commands
//! back; nothing else mutates download state.
//!
//! # Components
//!
//! - [`TorrentHandle`] - Starts the coordinator and talks to it
//! - [`TorrentDescriptor`] - Piece geometry and hashes
//! - [`TorrentConfig`] - Pipeline, endgame, choking and timeout settings
//! - [`TorrentEvent`] - Observability stream
//!
//! # Examples
//!
//! ```no_run
//! use piecemeal::storage::MemoryStorage;
//! use piecemeal::torrent::{InfoHash, TorrentConfig, TorrentContext, TorrentDescriptor, TorrentHandle};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let descriptor = TorrentDescriptor::new(InfoHash([7u8; 20]), 262144, 1 << 20, vec![[0u8; 20]; 4])?;
//! let ctx = TorrentContext::new(descriptor, TorrentConfig::default());
//! let handle = TorrentHandle::spawn(ctx, Arc::new(MemoryStorage::new()));
//!
//! let mut events = handle.subscribe();
//! handle.add_peer("192.0.2.1:6881".parse()?);
//!
//! while let Ok(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! handle.shutdown().await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod coordinator;
mod descriptor;
mod error;
mod event;
mod swarm;

use std::sync::Arc;

use crate::peer::PeerId;

pub use config::{EndgameTrigger, TorrentConfig};
pub use coordinator::TorrentHandle;
pub use descriptor::{InfoHash, TorrentDescriptor};
pub use error::TorrentError;
pub use event::TorrentEvent;
pub use swarm::TorrentStats;

/// Read-only state shared by the coordinator and every peer session.
#[derive(Debug)]
pub struct TorrentContext {
    pub descriptor: TorrentDescriptor,
    pub config: TorrentConfig,
    pub peer_id: PeerId,
}

impl TorrentContext {
    /// Creates a context with a freshly generated local peer id.
    pub fn new(descriptor: TorrentDescriptor, config: TorrentConfig) -> Arc<Self> {
        Self::with_peer_id(descriptor, config, PeerId::generate())
    }

    pub fn with_peer_id(descriptor: TorrentDescriptor, config: TorrentConfig, peer_id: PeerId) -> Arc<Self> {
        Arc::new(Self {
            descriptor,
            config,
            peer_id,
        })
    }
}
