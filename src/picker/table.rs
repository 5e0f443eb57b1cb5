use std::time::{Duration, Instant};

use crate::peer::{BlockRequest, SessionId};
use crate::torrent::TorrentDescriptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceStatus {
    Missing,
    /// At least one block requested or received.
    Partial,
    /// All blocks received; the hash check is pending.
    Verifying,
    Complete,
}

/// One peer's outstanding request for a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Claim {
    pub peer: SessionId,
    pub requested_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockState {
    NotRequested,
    /// Outstanding with one peer, or with several during endgame.
    Requested(Vec<Claim>),
    Received,
}

/// The outcome of [`PieceTable::receive`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Receipt {
    /// First copy of the block. `others` still have it requested and should
    /// be cancelled.
    Accepted {
        others: Vec<SessionId>,
        piece_done: bool,
    },
    /// The block was already received, or its piece is no longer wanted.
    Duplicate,
}

#[derive(Debug, Clone)]
struct PieceEntry {
    status: PieceStatus,
    blocks: Vec<BlockState>,
    received: usize,
}

impl PieceEntry {
    fn new(block_count: u32) -> Self {
        Self {
            status: PieceStatus::Missing,
            blocks: vec![BlockState::NotRequested; block_count as usize],
            received: 0,
        }
    }
}

/// Per-piece, per-block download state for one torrent.
///
/// The table only records state; it never decides what to request. Every
/// method takes block geometry from the descriptor it was built with and
/// ignores requests that do not name one of its blocks.
pub struct PieceTable {
    pieces: Vec<PieceEntry>,
    geometry: Vec<Vec<BlockRequest>>,
    block_size: u32,
    complete: usize,
}

impl PieceTable {
    pub fn new(descriptor: &TorrentDescriptor) -> Self {
        let count = descriptor.piece_count() as u32;
        let geometry: Vec<Vec<BlockRequest>> = (0..count)
            .map(|piece| {
                (0..descriptor.block_count(piece))
                    .map(|block| descriptor.block_request(piece, block))
                    .collect()
            })
            .collect();
        let pieces = geometry
            .iter()
            .map(|blocks| PieceEntry::new(blocks.len() as u32))
            .collect();

        Self {
            pieces,
            geometry,
            block_size: descriptor.block_size(),
            complete: 0,
        }
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    pub fn status(&self, piece: u32) -> Option<PieceStatus> {
        self.pieces.get(piece as usize).map(|p| p.status)
    }

    /// Missing or partial: blocks of this piece may still be requested.
    pub fn is_wanted(&self, piece: u32) -> bool {
        matches!(
            self.status(piece),
            Some(PieceStatus::Missing | PieceStatus::Partial)
        )
    }

    pub fn blocks(&self, piece: u32) -> &[BlockState] {
        self.pieces
            .get(piece as usize)
            .map(|p| p.blocks.as_slice())
            .unwrap_or(&[])
    }

    pub fn block_request(&self, piece: u32, block: usize) -> Option<BlockRequest> {
        self.geometry.get(piece as usize)?.get(block).copied()
    }

    pub fn block_state(&self, request: &BlockRequest) -> Option<&BlockState> {
        let block = self.locate(request)?;
        self.pieces[request.piece as usize].blocks.get(block)
    }

    pub fn has_unrequested(&self, piece: u32) -> bool {
        self.is_wanted(piece)
            && self
                .blocks(piece)
                .iter()
                .any(|b| matches!(b, BlockState::NotRequested))
    }

    /// Pieces not yet fully received.
    pub fn wanted_count(&self) -> usize {
        self.pieces
            .iter()
            .filter(|p| matches!(p.status, PieceStatus::Missing | PieceStatus::Partial))
            .count()
    }

    pub fn complete_count(&self) -> usize {
        self.complete
    }

    pub fn is_complete(&self) -> bool {
        self.complete == self.pieces.len()
    }

    fn locate(&self, request: &BlockRequest) -> Option<usize> {
        let block = (request.offset / self.block_size) as usize;
        let expected = self.geometry.get(request.piece as usize)?.get(block)?;
        (expected == request).then_some(block)
    }

    /// Records that `peer` was asked for `request`.
    pub fn claim(&mut self, request: &BlockRequest, peer: SessionId, now: Instant) -> bool {
        let Some(block) = self.locate(request) else {
            return false;
        };
        let entry = &mut self.pieces[request.piece as usize];
        if !matches!(entry.status, PieceStatus::Missing | PieceStatus::Partial) {
            return false;
        }

        let claim = Claim {
            peer,
            requested_at: now,
        };
        let state = &mut entry.blocks[block];
        match state {
            BlockState::NotRequested => *state = BlockState::Requested(vec![claim]),
            BlockState::Requested(claims) => {
                if claims.iter().any(|c| c.peer == peer) {
                    return false;
                }
                claims.push(claim);
            }
            BlockState::Received => return false,
        }
        entry.status = PieceStatus::Partial;
        true
    }

    /// Drops `peer`'s claim on `request`. Returns true if a claim was removed.
    pub fn release(&mut self, request: &BlockRequest, peer: SessionId) -> bool {
        let Some(block) = self.locate(request) else {
            return false;
        };
        let blocks = &mut self.pieces[request.piece as usize].blocks;
        let BlockState::Requested(claims) = &mut blocks[block] else {
            return false;
        };

        let before = claims.len();
        claims.retain(|c| c.peer != peer);
        let removed = claims.len() < before;
        if claims.is_empty() {
            blocks[block] = BlockState::NotRequested;
        }
        removed
    }

    /// Marks `request` received from `from`.
    pub fn receive(&mut self, request: &BlockRequest, from: SessionId) -> Receipt {
        let Some(block) = self.locate(request) else {
            return Receipt::Duplicate;
        };
        let entry = &mut self.pieces[request.piece as usize];
        if !matches!(entry.status, PieceStatus::Missing | PieceStatus::Partial) {
            return Receipt::Duplicate;
        }

        let others = match std::mem::replace(&mut entry.blocks[block], BlockState::Received) {
            BlockState::Received => return Receipt::Duplicate,
            BlockState::NotRequested => Vec::new(),
            BlockState::Requested(claims) => claims
                .into_iter()
                .map(|c| c.peer)
                .filter(|p| *p != from)
                .collect(),
        };

        entry.received += 1;
        entry.status = PieceStatus::Partial;
        let piece_done = entry.received == entry.blocks.len();
        if piece_done {
            entry.status = PieceStatus::Verifying;
        }

        Receipt::Accepted { others, piece_done }
    }

    /// Verifying to complete. Returns false if the piece was not verifying.
    pub fn complete(&mut self, piece: u32) -> bool {
        match self.pieces.get_mut(piece as usize) {
            Some(entry) if entry.status == PieceStatus::Verifying => {
                entry.status = PieceStatus::Complete;
                self.complete += 1;
                true
            }
            _ => false,
        }
    }

    /// Marks a piece complete without downloading it, for resumed data.
    pub fn mark_complete(&mut self, piece: u32) {
        if let Some(entry) = self.pieces.get_mut(piece as usize) {
            if entry.status != PieceStatus::Complete {
                entry.blocks.fill(BlockState::Received);
                entry.received = entry.blocks.len();
                entry.status = PieceStatus::Complete;
                self.complete += 1;
            }
        }
    }

    /// Discards every block of a piece that failed verification or could
    /// not be stored. The piece goes back to `Partial`.
    pub fn reset(&mut self, piece: u32) {
        if let Some(entry) = self.pieces.get_mut(piece as usize) {
            if entry.status == PieceStatus::Complete {
                return;
            }
            entry.blocks.fill(BlockState::NotRequested);
            entry.received = 0;
            entry.status = PieceStatus::Partial;
        }
    }

    /// Claims older than `timeout`, oldest first.
    pub fn expired(&self, now: Instant, timeout: Duration) -> Vec<(BlockRequest, SessionId)> {
        let mut expired = Vec::new();
        for (piece, entry) in self.pieces.iter().enumerate() {
            if !matches!(entry.status, PieceStatus::Partial) {
                continue;
            }
            for (block, state) in entry.blocks.iter().enumerate() {
                if let BlockState::Requested(claims) = state {
                    for claim in claims {
                        if now.saturating_duration_since(claim.requested_at) >= timeout {
                            expired.push((claim.requested_at, self.geometry[piece][block], claim.peer));
                        }
                    }
                }
            }
        }
        expired.sort_by_key(|(at, request, _)| (*at, *request));
        expired.into_iter().map(|(_, r, p)| (r, p)).collect()
    }
}
