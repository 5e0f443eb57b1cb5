//! Piece and block bookkeeping, and the choice of what to request next.
//!
//! - [`PieceTable`] - Status of every piece and block
//! - [`Availability`] - Swarm-wide count of peers per piece
//! - [`PieceSelector`] - Rarest-first selection with endgame duplication

mod availability;
mod selector;
mod table;

pub use availability::Availability;
pub use selector::PieceSelector;
pub use table::{BlockState, Claim, PieceStatus, PieceTable, Receipt};

#[cfg(test)]
mod tests;
