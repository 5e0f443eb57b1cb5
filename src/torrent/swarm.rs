use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::broadcast;

use super::error::TorrentError;
use super::event::TorrentEvent;
use super::TorrentContext;
use crate::peer::{
    Bitfield, Block, BlockRequest, ChokeDecision, ChokingAlgorithm, ChokingState, PeerCommand,
    PeerError, PeerId, PeerStats, SessionId,
};
use crate::picker::{Availability, BlockState, PieceSelector, PieceTable, Receipt};

/// Commands produced while handling one input, addressed by session.
pub(crate) type Outbox = Vec<(SessionId, PeerCommand)>;

/// The coordinator's view of one admitted peer.
#[derive(Debug)]
pub(crate) struct PeerRecord {
    pub addr: SocketAddr,
    pub peer_id: PeerId,
    pub bitfield: Bitfield,
    pub flags: ChokingState,
    /// Blocks this peer currently holds a claim on.
    pub assigned: HashSet<BlockRequest>,
    pub download_rate: f64,
    pub upload_rate: f64,
    pub hash_failures: u32,
}

/// A fully received piece, ready for verification and commit.
#[derive(Debug)]
pub(crate) struct PieceReady {
    pub piece: u32,
    pub data: Bytes,
    pub contributors: Vec<SessionId>,
}

struct PieceBuffer {
    data: Vec<u8>,
    contributors: Vec<SessionId>,
}

impl PieceBuffer {
    fn allocate(piece: u32, length: usize) -> Result<Self, TorrentError> {
        let mut data = Vec::new();
        data.try_reserve_exact(length)
            .map_err(|_| TorrentError::OutOfMemory {
                piece,
                bytes: length,
            })?;
        data.resize(length, 0);
        Ok(Self {
            data,
            contributors: Vec::new(),
        })
    }
}

/// Snapshot of a torrent's progress.
#[derive(Debug, Clone, PartialEq)]
pub struct TorrentStats {
    pub pieces_total: usize,
    pub pieces_complete: usize,
    pub peers: usize,
    pub unchoked_peers: usize,
    pub endgame: bool,
    pub download_rate: f64,
    pub upload_rate: f64,
}

/// All download state of one torrent, mutated only by the coordinator.
///
/// Every handler is synchronous and takes the current time explicitly.
/// Commands for sessions are appended to the caller's [`Outbox`] rather than
/// sent, so the coordinator decides when they go out and tests can inspect
/// them directly.
pub(crate) struct Swarm {
    ctx: Arc<TorrentContext>,
    table: PieceTable,
    availability: Availability,
    selector: PieceSelector,
    choker: ChokingAlgorithm,
    have: Bitfield,
    peers: BTreeMap<SessionId, PeerRecord>,
    buffers: HashMap<u32, PieceBuffer>,
    observer: broadcast::Sender<TorrentEvent>,
    endgame: bool,
    retired: bool,
}

impl Swarm {
    pub fn new(
        ctx: Arc<TorrentContext>,
        resume: Option<Bitfield>,
        observer: broadcast::Sender<TorrentEvent>,
    ) -> Self {
        let descriptor = &ctx.descriptor;
        let config = &ctx.config;
        let piece_count = descriptor.piece_count();

        let mut table = PieceTable::new(descriptor);
        let mut have = Bitfield::new(piece_count);
        if let Some(resume) = resume.filter(|r| r.piece_count() == piece_count) {
            for piece in resume.iter() {
                table.mark_complete(piece as u32);
                have.set(piece);
            }
            tracing::info!(pieces = have.count(), "resuming with existing pieces");
        }

        Self {
            table,
            availability: Availability::new(piece_count),
            selector: PieceSelector::new(config.endgame, config.max_duplicate_requests),
            choker: ChokingAlgorithm::new(config.max_unchoked, config.optimistic_unchoke_rounds),
            have,
            peers: BTreeMap::new(),
            buffers: HashMap::new(),
            observer,
            endgame: false,
            retired: false,
            ctx,
        }
    }

    fn emit(&self, event: TorrentEvent) {
        let _ = self.observer.send(event);
    }

    /// Decides whether a handshaken peer may join. On success returns the
    /// bitfield the session should announce.
    pub fn admit(
        &mut self,
        id: SessionId,
        addr: SocketAddr,
        peer_id: PeerId,
        info_hash: &[u8; 20],
    ) -> Result<Bitfield, PeerError> {
        if self.retired {
            return Err(PeerError::Rejected("torrent shutting down"));
        }
        if info_hash != self.ctx.descriptor.info_hash().as_bytes() {
            return Err(PeerError::InfoHashMismatch);
        }
        if peer_id == self.ctx.peer_id {
            return Err(PeerError::Rejected("connected to ourselves"));
        }
        if self.peers.values().any(|p| p.peer_id == peer_id) {
            return Err(PeerError::Rejected("duplicate peer id"));
        }
        if self.peers.len() >= self.ctx.config.max_peers {
            return Err(PeerError::Rejected("peer limit reached"));
        }

        self.peers.insert(
            id,
            PeerRecord {
                addr,
                peer_id,
                bitfield: Bitfield::new(self.ctx.descriptor.piece_count()),
                flags: ChokingState::default(),
                assigned: HashSet::new(),
                download_rate: 0.0,
                upload_rate: 0.0,
                hash_failures: 0,
            },
        );
        tracing::info!(peer = %id, %addr, client = ?peer_id.client_id(), "peer connected");
        self.emit(TorrentEvent::PeerConnected { id, addr, peer_id });
        Ok(self.have.clone())
    }

    pub fn peer_bitfield(&mut self, id: SessionId, bitfield: Bitfield, now: Instant, out: &mut Outbox) {
        let Some(record) = self.peers.get_mut(&id) else {
            return;
        };
        self.availability.remove_bitfield(&record.bitfield);
        self.availability.add_bitfield(&bitfield);
        record.bitfield = bitfield;

        self.update_interest(id, out);
        self.refill(id, now, out);
    }

    pub fn peer_have(&mut self, id: SessionId, piece: u32, now: Instant, out: &mut Outbox) {
        let Some(record) = self.peers.get_mut(&id) else {
            return;
        };
        if record.bitfield.set(piece as usize) {
            self.availability.increment(piece);
        }

        self.update_interest(id, out);
        self.refill(id, now, out);
    }

    /// The peer choked us; every claim it held goes back to the pool.
    pub fn peer_choked(&mut self, id: SessionId, now: Instant, out: &mut Outbox) {
        let Some(record) = self.peers.get_mut(&id) else {
            return;
        };
        record.flags.peer_choking = true;
        let assigned: Vec<BlockRequest> = record.assigned.drain().collect();

        let released = assigned
            .iter()
            .filter(|request| self.table.release(request, id))
            .count();
        tracing::debug!(peer = %id, released, "choked by peer");
        self.emit(TorrentEvent::PeerChoked { id });

        self.refill_all(now, &[id], out);
    }

    pub fn peer_unchoked(&mut self, id: SessionId, now: Instant, out: &mut Outbox) {
        let Some(record) = self.peers.get_mut(&id) else {
            return;
        };
        record.flags.peer_choking = false;
        tracing::debug!(peer = %id, "unchoked by peer");
        self.emit(TorrentEvent::PeerUnchoked { id });
        self.refill(id, now, out);
    }

    pub fn peer_interest(&mut self, id: SessionId, interested: bool) {
        if let Some(record) = self.peers.get_mut(&id) {
            record.flags.peer_interested = interested;
        }
    }

    pub fn peer_rates(&mut self, id: SessionId, download: f64, upload: f64) {
        if let Some(record) = self.peers.get_mut(&id) {
            record.download_rate = download;
            record.upload_rate = upload;
        }
    }

    /// Stores a received block. Returns the assembled piece once its last
    /// block arrives; the piece is then `Verifying` until
    /// [`piece_verified`](Self::piece_verified) reports back.
    pub fn block_received(
        &mut self,
        id: SessionId,
        block: Block,
        now: Instant,
        out: &mut Outbox,
    ) -> Result<Option<PieceReady>, TorrentError> {
        let request = block.request();
        if let Some(record) = self.peers.get_mut(&id) {
            record.assigned.remove(&request);
        }

        if self.retired || !self.ctx.descriptor.is_block(&request) {
            tracing::debug!(peer = %id, piece = request.piece, offset = request.offset, "discarding block");
            return Ok(None);
        }

        let wanted = self.table.is_wanted(request.piece)
            && !matches!(
                self.table.block_state(&request),
                Some(BlockState::Received) | None
            );
        if !wanted {
            tracing::trace!(peer = %id, piece = request.piece, offset = request.offset, "duplicate block");
            self.refill(id, now, out);
            return Ok(None);
        }

        let buffer = match self.buffers.entry(request.piece) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let length = self.ctx.descriptor.piece_len(request.piece) as usize;
                entry.insert(PieceBuffer::allocate(request.piece, length)?)
            }
        };
        let start = request.offset as usize;
        buffer.data[start..start + block.data.len()].copy_from_slice(&block.data);
        if !buffer.contributors.contains(&id) {
            buffer.contributors.push(id);
        }

        let mut ready = None;
        if let Receipt::Accepted { others, piece_done } = self.table.receive(&request, id) {
            for other in others {
                if let Some(record) = self.peers.get_mut(&other) {
                    record.assigned.remove(&request);
                }
                tracing::trace!(peer = %other, piece = request.piece, offset = request.offset, "cancelling duplicate request");
                out.push((other, PeerCommand::Cancel(request)));
            }

            if piece_done {
                if let Some(buffer) = self.buffers.remove(&request.piece) {
                    tracing::debug!(piece = request.piece, "piece assembled");
                    ready = Some(PieceReady {
                        piece: request.piece,
                        data: Bytes::from(buffer.data),
                        contributors: buffer.contributors,
                    });
                }
            }
        }

        self.refill(id, now, out);
        Ok(ready)
    }

    /// Applies the outcome of verifying and committing a piece.
    pub fn piece_verified(
        &mut self,
        piece: u32,
        contributors: &[SessionId],
        result: Result<(), TorrentError>,
        now: Instant,
        out: &mut Outbox,
    ) {
        if self.retired {
            return;
        }

        match result {
            Ok(()) => {
                if !self.table.complete(piece) {
                    return;
                }
                self.have.set(piece as usize);
                for &id in self.peers.keys() {
                    out.push((id, PeerCommand::Have(piece)));
                }
                tracing::info!(
                    piece,
                    complete = self.table.complete_count(),
                    total = self.table.piece_count(),
                    "piece completed"
                );
                self.emit(TorrentEvent::PieceCompleted { piece });

                if self.table.is_complete() {
                    tracing::info!("torrent complete");
                    self.emit(TorrentEvent::Completed);
                }
            }
            Err(TorrentError::HashMismatch { .. }) => {
                self.table.reset(piece);
                for id in contributors {
                    if let Some(record) = self.peers.get_mut(id) {
                        record.hash_failures += 1;
                    }
                }
                tracing::warn!(piece, peers = ?contributors, "piece failed hash check");
                self.emit(TorrentEvent::HashFailed {
                    piece,
                    peers: contributors.to_vec(),
                });
            }
            Err(e) => {
                self.table.reset(piece);
                tracing::error!(piece, error = %e, "failed to store piece");
                self.emit(TorrentEvent::StorageFailed {
                    piece,
                    reason: e.to_string(),
                });
            }
        }

        self.refill_all(now, &[], out);
    }

    /// Returns requests outstanding longer than the request timeout to the
    /// pool and cancels them with the slow peer.
    pub fn expire_requests(&mut self, now: Instant, out: &mut Outbox) -> usize {
        if self.retired {
            return 0;
        }

        let expired = self.table.expired(now, self.ctx.config.request_timeout);
        if expired.is_empty() {
            return 0;
        }

        let mut slow = Vec::new();
        for (request, id) in &expired {
            self.table.release(request, *id);
            if let Some(record) = self.peers.get_mut(id) {
                record.assigned.remove(request);
            }
            tracing::debug!(peer = %id, piece = request.piece, offset = request.offset, "block request timed out");
            out.push((*id, PeerCommand::Cancel(*request)));
            self.emit(TorrentEvent::RequestTimedOut {
                id: *id,
                block: *request,
            });
            if !slow.contains(id) {
                slow.push(*id);
            }
        }

        self.refill_all(now, &slow, out);
        expired.len()
    }

    /// Forgets a session. Returns how many block claims were released.
    pub fn peer_closed(
        &mut self,
        id: SessionId,
        reason: Option<&PeerError>,
        now: Instant,
        out: &mut Outbox,
    ) -> usize {
        let Some(record) = self.peers.remove(&id) else {
            return 0;
        };
        self.availability.remove_bitfield(&record.bitfield);
        self.choker.remove_peer(id);

        let released = record
            .assigned
            .iter()
            .filter(|request| self.table.release(request, id))
            .count();

        tracing::info!(peer = %id, addr = %record.addr, released, reason = ?reason.map(|e| e.to_string()), "peer disconnected");
        self.emit(TorrentEvent::PeerDisconnected {
            id,
            addr: record.addr,
            released,
            reason: reason.map(|e| e.to_string()),
        });

        if !self.retired {
            self.refill_all(now, &[], out);
        }
        released
    }

    /// Runs one round of the choke algorithm.
    pub fn choke_cycle(&mut self, out: &mut Outbox) {
        if self.retired || self.peers.is_empty() {
            return;
        }

        let stats: Vec<PeerStats> = self
            .peers
            .iter()
            .map(|(&id, record)| PeerStats {
                id,
                download_rate: record.download_rate,
                upload_rate: record.upload_rate,
                interested: record.flags.peer_interested,
                am_choking: record.flags.am_choking,
            })
            .collect();

        let seeding = self.have.is_complete();
        for (id, decision) in self.choker.run(&stats, seeding) {
            let Some(record) = self.peers.get_mut(&id) else {
                continue;
            };
            let command = match decision {
                ChokeDecision::Choke => {
                    record.flags.am_choking = true;
                    PeerCommand::Choke
                }
                ChokeDecision::Unchoke => {
                    record.flags.am_choking = false;
                    PeerCommand::Unchoke
                }
            };
            tracing::debug!(peer = %id, ?decision, "choke decision");
            out.push((id, command));
        }
    }

    /// Stops all scheduling, releases every claim and tells every session to
    /// shut down. Returns how many claims were released.
    pub fn retire(&mut self, out: &mut Outbox) -> usize {
        self.retired = true;
        self.buffers.clear();

        let mut released = 0;
        for (&id, record) in self.peers.iter_mut() {
            for request in record.assigned.drain() {
                if self.table.release(&request, id) {
                    released += 1;
                }
            }
            out.push((id, PeerCommand::Shutdown));
        }
        released
    }

    pub fn stats(&self) -> TorrentStats {
        TorrentStats {
            pieces_total: self.table.piece_count(),
            pieces_complete: self.table.complete_count(),
            peers: self.peers.len(),
            unchoked_peers: self.peers.values().filter(|p| !p.flags.am_choking).count(),
            endgame: self.endgame,
            download_rate: self.peers.values().map(|p| p.download_rate).sum(),
            upload_rate: self.peers.values().map(|p| p.upload_rate).sum(),
        }
    }

    /// Returns true only on the transition into endgame.
    fn update_endgame(&mut self) -> bool {
        let wanted = self.table.wanted_count();
        let active = self.selector.endgame_active(wanted, self.peers.len());
        let entered = active && !self.endgame;
        if entered {
            tracing::info!(remaining = wanted, "entering endgame");
            self.emit(TorrentEvent::EndgameStarted { remaining: wanted });
        }
        self.endgame = active;
        entered
    }

    /// Pipeline depth for a peer, halved for each piece it helped corrupt.
    fn pipeline_share(&self, hash_failures: u32) -> usize {
        (self.ctx.config.pipeline_depth >> hash_failures.min(31)).max(1)
    }

    fn refill(&mut self, id: SessionId, now: Instant, out: &mut Outbox) {
        if self.retired {
            return;
        }
        if self.update_endgame() {
            // peers that had nothing left to offer may now serve duplicates
            self.refill_all(now, &[], out);
            return;
        }
        let endgame = self.endgame;

        let Some(record) = self.peers.get(&id) else {
            return;
        };
        if record.flags.peer_choking || !record.flags.am_interested {
            return;
        }

        let capacity = self
            .pipeline_share(record.hash_failures)
            .saturating_sub(record.assigned.len());
        let picks = self.selector.select(
            &self.table,
            &self.availability,
            id,
            &record.bitfield,
            capacity,
            endgame,
        );
        if picks.is_empty() {
            return;
        }

        for request in &picks {
            self.table.claim(request, id, now);
        }
        if let Some(record) = self.peers.get_mut(&id) {
            record.assigned.extend(picks.iter().copied());
        }
        tracing::trace!(peer = %id, count = picks.len(), "assigned blocks");

        let mut drained: Vec<u32> = picks
            .iter()
            .map(|request| request.piece)
            .filter(|&piece| !self.table.has_unrequested(piece))
            .collect();
        drained.sort_unstable();
        drained.dedup();
        out.push((id, PeerCommand::Request(picks)));

        if !endgame && !drained.is_empty() {
            self.update_interest_holding(&drained, id, out);
        }
    }

    /// Re-evaluates interest in the peers, other than `except`, that have
    /// any of `pieces`.
    fn update_interest_holding(&mut self, pieces: &[u32], except: SessionId, out: &mut Outbox) {
        let holders: Vec<SessionId> = self
            .peers
            .iter()
            .filter(|(&other, record)| {
                other != except
                    && record.flags.am_interested
                    && pieces.iter().any(|&piece| record.bitfield.has(piece as usize))
            })
            .map(|(&other, _)| other)
            .collect();
        for other in holders {
            self.update_interest(other, out);
        }
    }

    /// Re-evaluates interest in every peer, then tops up all but `skip`.
    /// Called whenever claims return to the pool.
    fn refill_all(&mut self, now: Instant, skip: &[SessionId], out: &mut Outbox) {
        let ids: Vec<SessionId> = self.peers.keys().copied().collect();
        for id in ids {
            self.update_interest(id, out);
            if !skip.contains(&id) {
                self.refill(id, now, out);
            }
        }
    }

    /// We are interested in a peer while it has something we could request
    /// or still owes us blocks.
    fn update_interest(&mut self, id: SessionId, out: &mut Outbox) {
        let endgame = self.endgame;
        let Some(record) = self.peers.get(&id) else {
            return;
        };
        let wants = !record.assigned.is_empty()
            || record.bitfield.iter().any(|piece| {
                let piece = piece as u32;
                self.table.is_wanted(piece) && (endgame || self.table.has_unrequested(piece))
            });

        if wants == record.flags.am_interested {
            return;
        }
        if let Some(record) = self.peers.get_mut(&id) {
            record.flags.am_interested = wants;
        }
        out.push((
            id,
            if wants {
                PeerCommand::Interested
            } else {
                PeerCommand::NotInterested
            },
        ));
    }
}

#[cfg(test)]
impl Swarm {
    pub fn table(&self) -> &PieceTable {
        &self.table
    }

    pub fn have(&self) -> &Bitfield {
        &self.have
    }

    pub fn peer(&self, id: SessionId) -> Option<&PeerRecord> {
        self.peers.get(&id)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn is_endgame(&self) -> bool {
        self.endgame
    }
}
