use rand::seq::IndexedRandom as _;
use std::cmp::Ordering;
use std::collections::HashSet;

use super::session::SessionId;
use crate::constants::{MAX_UNCHOKED_PEERS, OPTIMISTIC_UNCHOKE_ROUNDS};

/// The four interest/choke flags of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChokingState {
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
}

impl Default for ChokingState {
    /// Both sides of the connection start off as choked and not interested.
    fn default() -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}

/// What the choke algorithm knows about one established peer.
#[derive(Debug, Clone)]
pub struct PeerStats {
    pub id: SessionId,
    /// Bytes per second the peer sends us.
    pub download_rate: f64,
    /// Bytes per second we send the peer.
    pub upload_rate: f64,
    pub interested: bool,
    pub am_choking: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChokeDecision {
    Choke,
    Unchoke,
}

/// Tit-for-tat upload slot allocation with one optimistic unchoke.
///
/// Each [`run`](Self::run) ranks peers by the rate they give us (or, once
/// seeding, the rate we give them), unchokes the top `max_unchoked` and keeps
/// one more peer unchoked regardless of rate. The optimistic slot rotates every
/// `optimistic_rounds` runs. Only transitions are returned, so a run over
/// unchanged rankings yields nothing.
pub struct ChokingAlgorithm {
    max_unchoked: usize,
    optimistic_rounds: u32,
    round: u32,
    optimistic_peer: Option<SessionId>,
    optimistic_since: u32,
}

impl ChokingAlgorithm {
    pub fn new(max_unchoked: usize, optimistic_rounds: u32) -> Self {
        Self {
            max_unchoked,
            optimistic_rounds: optimistic_rounds.max(1),
            round: 0,
            optimistic_peer: None,
            optimistic_since: 0,
        }
    }

    pub fn remove_peer(&mut self, id: SessionId) {
        if self.optimistic_peer == Some(id) {
            self.optimistic_peer = None;
        }
    }

    pub fn optimistic_peer(&self) -> Option<SessionId> {
        self.optimistic_peer
    }

    pub fn run(&mut self, peers: &[PeerStats], seeding: bool) -> Vec<(SessionId, ChokeDecision)> {
        if peers.is_empty() {
            return Vec::new();
        }
        self.round += 1;

        let rate = |p: &PeerStats| {
            if seeding {
                p.upload_rate
            } else {
                p.download_rate
            }
        };

        let mut ranked: Vec<&PeerStats> = peers.iter().collect();
        ranked.sort_by(|a, b| {
            b.interested
                .cmp(&a.interested)
                .then_with(|| rate(b).partial_cmp(&rate(a)).unwrap_or(Ordering::Equal))
                .then_with(|| a.id.cmp(&b.id))
        });

        let regular: HashSet<SessionId> = ranked
            .iter()
            .take(self.max_unchoked)
            .map(|p| p.id)
            .collect();
        let rest: Vec<&PeerStats> = ranked.iter().skip(self.max_unchoked).copied().collect();

        let current = self
            .optimistic_peer
            .filter(|id| rest.iter().any(|p| p.id == *id));
        let expired = self.round.saturating_sub(self.optimistic_since) >= self.optimistic_rounds;

        if current.is_none() || expired {
            self.optimistic_peer = Self::pick_optimistic(&rest);
            self.optimistic_since = self.round;
            if let Some(id) = self.optimistic_peer {
                tracing::debug!(peer = %id, "rotated optimistic unchoke");
            }
        }

        peers
            .iter()
            .filter_map(|p| {
                let unchoke = regular.contains(&p.id) || self.optimistic_peer == Some(p.id);
                match (p.am_choking, unchoke) {
                    (true, true) => Some((p.id, ChokeDecision::Unchoke)),
                    (false, false) => Some((p.id, ChokeDecision::Choke)),
                    _ => None,
                }
            })
            .collect()
    }

    fn pick_optimistic(rest: &[&PeerStats]) -> Option<SessionId> {
        let interested: Vec<SessionId> = rest.iter().filter(|p| p.interested).map(|p| p.id).collect();
        let pool: Vec<SessionId> = if interested.is_empty() {
            rest.iter().map(|p| p.id).collect()
        } else {
            interested
        };
        pool.choose(&mut rand::rng()).copied()
    }
}

impl Default for ChokingAlgorithm {
    fn default() -> Self {
        Self::new(MAX_UNCHOKED_PEERS, OPTIMISTIC_UNCHOKE_ROUNDS)
    }
}
