//! Peer wire protocol (BEP-3)
//!
//! Framing and codec for the base protocol, per-connection state, and the
//! session task that drives one connection on behalf of a torrent.

mod bitfield;
mod choking;
mod error;
mod message;
mod peer_id;
mod piece;
mod rate;
mod session;
mod transport;

pub use bitfield::Bitfield;
pub use choking::{ChokeDecision, ChokingAlgorithm, ChokingState, PeerStats};
pub use error::PeerError;
pub use message::{Handshake, Message, MessageId};
pub use peer_id::PeerId;
pub use piece::{compute_block_count, compute_block_length, Block, BlockRequest};
pub use rate::RateEstimator;
pub use session::{PeerCommand, SessionId, SessionState};
pub use transport::{BoxedStream, PeerStream, PeerTransport};

pub(crate) use session::{spawn, spawn_outbound, Direction, SessionEvent, SessionHandle};

#[cfg(test)]
mod tests;
