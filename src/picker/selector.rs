use super::availability::Availability;
use super::table::{BlockState, PieceTable};
use crate::peer::{Bitfield, BlockRequest, SessionId};
use crate::torrent::EndgameTrigger;

/// Rarest-first block selection with an endgame mode.
///
/// Candidate pieces are those the peer has and we still want, ordered by
/// availability with ties broken by piece index, so the same inputs always
/// produce the same picks. Within a piece the lowest unrequested block comes
/// first. Once endgame is active a second pass may pick blocks already
/// requested from other peers, up to `max_duplicates` claims per block.
#[derive(Debug, Clone)]
pub struct PieceSelector {
    trigger: EndgameTrigger,
    max_duplicates: usize,
}

impl PieceSelector {
    pub fn new(trigger: EndgameTrigger, max_duplicates: usize) -> Self {
        Self {
            trigger,
            max_duplicates: max_duplicates.max(1),
        }
    }

    pub fn endgame_active(&self, wanted: usize, peers: usize) -> bool {
        if wanted == 0 {
            return false;
        }
        match self.trigger {
            EndgameTrigger::PeerCount => wanted < peers,
            EndgameTrigger::Pieces(threshold) => wanted < threshold,
        }
    }

    /// Picks up to `capacity` blocks to request from `peer`.
    pub fn select(
        &self,
        table: &PieceTable,
        availability: &Availability,
        peer: SessionId,
        has: &Bitfield,
        capacity: usize,
        endgame: bool,
    ) -> Vec<BlockRequest> {
        let mut picks = Vec::new();
        if capacity == 0 {
            return picks;
        }

        let mut candidates: Vec<u32> = has
            .iter()
            .map(|p| p as u32)
            .filter(|&p| table.is_wanted(p))
            .collect();
        candidates.sort_by_key(|&p| (availability.get(p), p));

        for &piece in &candidates {
            for (block, state) in table.blocks(piece).iter().enumerate() {
                if matches!(state, BlockState::NotRequested) {
                    if let Some(request) = table.block_request(piece, block) {
                        picks.push(request);
                        if picks.len() == capacity {
                            return picks;
                        }
                    }
                }
            }
        }

        if !endgame {
            return picks;
        }

        for &piece in &candidates {
            for (block, state) in table.blocks(piece).iter().enumerate() {
                let BlockState::Requested(claims) = state else {
                    continue;
                };
                if claims.len() >= self.max_duplicates || claims.iter().any(|c| c.peer == peer) {
                    continue;
                }
                if let Some(request) = table.block_request(piece, block) {
                    picks.push(request);
                    if picks.len() == capacity {
                        return picks;
                    }
                }
            }
        }

        picks
    }
}
