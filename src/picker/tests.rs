use super::*;
use crate::peer::{Bitfield, BlockRequest, SessionId};
use crate::torrent::{EndgameTrigger, InfoHash, TorrentDescriptor};
use std::time::{Duration, Instant};

const BLOCK: u32 = 16384;

fn descriptor(pieces: usize, piece_length: u64) -> TorrentDescriptor {
    TorrentDescriptor::new(
        InfoHash([0u8; 20]),
        piece_length,
        pieces as u64 * piece_length,
        vec![[0u8; 20]; pieces],
    )
    .unwrap()
}

fn bitfield(pieces: usize, have: &[usize]) -> Bitfield {
    let mut bf = Bitfield::new(pieces);
    for &p in have {
        bf.set(p);
    }
    bf
}

fn selector() -> PieceSelector {
    PieceSelector::new(EndgameTrigger::Pieces(0), 3)
}

#[test]
fn test_table_initial_state() {
    let table = PieceTable::new(&descriptor(4, 2 * BLOCK as u64));
    assert_eq!(table.piece_count(), 4);
    assert_eq!(table.wanted_count(), 4);
    assert_eq!(table.status(0), Some(PieceStatus::Missing));
    assert_eq!(table.blocks(0).len(), 2);
    assert!(!table.is_complete());
    assert_eq!(table.status(4), None);
}

#[test]
fn test_table_short_last_piece() {
    let desc = TorrentDescriptor::new(
        InfoHash([0u8; 20]),
        2 * BLOCK as u64,
        2 * BLOCK as u64 + 100,
        vec![[0u8; 20]; 2],
    )
    .unwrap();
    let table = PieceTable::new(&desc);

    assert_eq!(table.blocks(1).len(), 1);
    assert_eq!(table.block_request(1, 0), Some(BlockRequest::new(1, 0, 100)));
}

#[test]
fn test_claim_and_release() {
    let mut table = PieceTable::new(&descriptor(2, 2 * BLOCK as u64));
    let now = Instant::now();
    let req = BlockRequest::new(0, 0, BLOCK);

    assert!(table.claim(&req, SessionId(1), now));
    assert_eq!(table.status(0), Some(PieceStatus::Partial));
    // the same peer cannot claim twice
    assert!(!table.claim(&req, SessionId(1), now));

    assert!(table.release(&req, SessionId(1)));
    assert_eq!(table.block_state(&req), Some(&BlockState::NotRequested));
    assert!(!table.release(&req, SessionId(1)));
}

#[test]
fn test_claim_rejects_foreign_geometry() {
    let mut table = PieceTable::new(&descriptor(2, 2 * BLOCK as u64));
    let now = Instant::now();

    assert!(!table.claim(&BlockRequest::new(0, 100, BLOCK), SessionId(1), now));
    assert!(!table.claim(&BlockRequest::new(0, 0, 100), SessionId(1), now));
    assert!(!table.claim(&BlockRequest::new(5, 0, BLOCK), SessionId(1), now));
}

#[test]
fn test_receive_reports_other_claimants() {
    let mut table = PieceTable::new(&descriptor(1, 2 * BLOCK as u64));
    let now = Instant::now();
    let req = BlockRequest::new(0, BLOCK, BLOCK);

    table.claim(&req, SessionId(1), now);
    table.claim(&req, SessionId(2), now);
    table.claim(&req, SessionId(3), now);

    assert_eq!(
        table.receive(&req, SessionId(2)),
        Receipt::Accepted {
            others: vec![SessionId(1), SessionId(3)],
            piece_done: false
        }
    );
    assert_eq!(table.receive(&req, SessionId(1)), Receipt::Duplicate);
}

#[test]
fn test_receive_completes_piece() {
    let mut table = PieceTable::new(&descriptor(1, 2 * BLOCK as u64));
    let first = BlockRequest::new(0, 0, BLOCK);
    let second = BlockRequest::new(0, BLOCK, BLOCK);

    table.receive(&first, SessionId(1));
    assert_eq!(
        table.receive(&second, SessionId(1)),
        Receipt::Accepted {
            others: vec![],
            piece_done: true
        }
    );
    assert_eq!(table.status(0), Some(PieceStatus::Verifying));
    assert_eq!(table.wanted_count(), 0);

    assert!(table.complete(0));
    assert!(!table.complete(0));
    assert!(table.is_complete());
}

#[test]
fn test_reset_returns_blocks() {
    let mut table = PieceTable::new(&descriptor(1, 2 * BLOCK as u64));
    table.receive(&BlockRequest::new(0, 0, BLOCK), SessionId(1));
    table.receive(&BlockRequest::new(0, BLOCK, BLOCK), SessionId(2));

    table.reset(0);
    assert_eq!(table.status(0), Some(PieceStatus::Partial));
    assert!(table
        .blocks(0)
        .iter()
        .all(|b| *b == BlockState::NotRequested));
}

#[test]
fn test_mark_complete() {
    let mut table = PieceTable::new(&descriptor(3, BLOCK as u64));
    table.mark_complete(1);
    table.mark_complete(1);

    assert_eq!(table.complete_count(), 1);
    assert_eq!(table.status(1), Some(PieceStatus::Complete));
    assert!(!table.is_wanted(1));
}

#[test]
fn test_expired_claims() {
    let mut table = PieceTable::new(&descriptor(6, 2 * BLOCK as u64));
    let start = Instant::now();
    let old = BlockRequest::new(5, 0, BLOCK);
    let fresh = BlockRequest::new(2, 0, BLOCK);

    table.claim(&old, SessionId(1), start);
    table.claim(&fresh, SessionId(1), start + Duration::from_secs(20));

    let expired = table.expired(start + Duration::from_secs(31), Duration::from_secs(30));
    assert_eq!(expired, vec![(old, SessionId(1))]);
}

#[test]
fn test_availability_tracking() {
    let mut availability = Availability::new(5);
    availability.add_bitfield(&bitfield(5, &[0, 2, 4]));
    availability.add_bitfield(&bitfield(5, &[2]));
    availability.increment(1);

    assert_eq!(availability.get(0), 1);
    assert_eq!(availability.get(1), 1);
    assert_eq!(availability.get(2), 2);
    assert_eq!(availability.get(3), 0);

    availability.remove_bitfield(&bitfield(5, &[0, 2, 4]));
    assert_eq!(availability.get(0), 0);
    assert_eq!(availability.get(2), 1);
    // never underflows
    availability.decrement(3);
    assert_eq!(availability.get(3), 0);
}

#[test]
fn test_select_rarest_first() {
    let table = PieceTable::new(&descriptor(4, 2 * BLOCK as u64));
    let mut availability = Availability::new(4);
    availability.add_bitfield(&bitfield(4, &[0, 1, 2, 3]));
    availability.add_bitfield(&bitfield(4, &[0, 1, 3]));
    availability.add_bitfield(&bitfield(4, &[0, 3]));

    let picks = selector().select(
        &table,
        &availability,
        SessionId(1),
        &Bitfield::full(4),
        3,
        false,
    );

    // piece 2 is rarest, then 1, lowest offset first within a piece
    assert_eq!(
        picks,
        vec![
            BlockRequest::new(2, 0, BLOCK),
            BlockRequest::new(2, BLOCK, BLOCK),
            BlockRequest::new(1, 0, BLOCK),
        ]
    );
}

#[test]
fn test_select_breaks_ties_by_index() {
    let table = PieceTable::new(&descriptor(5, BLOCK as u64));
    let availability = Availability::new(5);

    let picks = selector().select(
        &table,
        &availability,
        SessionId(1),
        &bitfield(5, &[4, 1, 3]),
        10,
        false,
    );
    let pieces: Vec<u32> = picks.iter().map(|r| r.piece).collect();
    assert_eq!(pieces, vec![1, 3, 4]);
}

#[test]
fn test_select_is_deterministic() {
    let table = PieceTable::new(&descriptor(20, 2 * BLOCK as u64));
    let mut availability = Availability::new(20);
    availability.add_bitfield(&bitfield(20, &[1, 5, 7, 9, 11]));
    availability.add_bitfield(&bitfield(20, &[5, 9]));
    let has = bitfield(20, &[1, 3, 5, 7, 9, 11, 13]);

    let first = selector().select(&table, &availability, SessionId(1), &has, 8, false);
    for _ in 0..10 {
        assert_eq!(
            selector().select(&table, &availability, SessionId(1), &has, 8, false),
            first
        );
    }
}

#[test]
fn test_select_skips_claimed_and_received() {
    let mut table = PieceTable::new(&descriptor(2, 2 * BLOCK as u64));
    let now = Instant::now();
    table.claim(&BlockRequest::new(0, 0, BLOCK), SessionId(2), now);
    table.receive(&BlockRequest::new(0, BLOCK, BLOCK), SessionId(2));

    let picks = selector().select(
        &table,
        &Availability::new(2),
        SessionId(1),
        &Bitfield::full(2),
        10,
        false,
    );
    assert_eq!(
        picks,
        vec![BlockRequest::new(1, 0, BLOCK), BlockRequest::new(1, BLOCK, BLOCK)]
    );
}

#[test]
fn test_select_only_pieces_peer_has() {
    let table = PieceTable::new(&descriptor(4, BLOCK as u64));
    let picks = selector().select(
        &table,
        &Availability::new(4),
        SessionId(1),
        &bitfield(4, &[2]),
        10,
        false,
    );
    assert_eq!(picks, vec![BlockRequest::new(2, 0, BLOCK)]);

    let none = selector().select(
        &table,
        &Availability::new(4),
        SessionId(1),
        &Bitfield::new(4),
        10,
        false,
    );
    assert!(none.is_empty());
}

#[test]
fn test_select_zero_capacity() {
    let table = PieceTable::new(&descriptor(4, BLOCK as u64));
    let picks = selector().select(
        &table,
        &Availability::new(4),
        SessionId(1),
        &Bitfield::full(4),
        0,
        true,
    );
    assert!(picks.is_empty());
}

#[test]
fn test_select_exclusive_outside_endgame() {
    let mut table = PieceTable::new(&descriptor(3, 2 * BLOCK as u64));
    let availability = Availability::new(3);
    let now = Instant::now();
    let all = Bitfield::full(3);

    for peer in 1..=3 {
        let picks = selector().select(&table, &availability, SessionId(peer), &all, 2, false);
        for req in &picks {
            assert!(table.claim(req, SessionId(peer), now));
        }
    }

    for piece in 0..3 {
        for state in table.blocks(piece) {
            match state {
                BlockState::Requested(claims) => assert_eq!(claims.len(), 1),
                other => panic!("unexpected state {other:?}"),
            }
        }
    }
}

#[test]
fn test_select_endgame_duplicates_up_to_cap() {
    let mut table = PieceTable::new(&descriptor(1, BLOCK as u64));
    let availability = Availability::new(1);
    let now = Instant::now();
    let has = Bitfield::full(1);
    let req = BlockRequest::new(0, 0, BLOCK);
    table.claim(&req, SessionId(1), now);

    // not in endgame: nothing left to pick
    assert!(selector()
        .select(&table, &availability, SessionId(2), &has, 4, false)
        .is_empty());

    // the claimant itself never gets a duplicate
    assert!(selector()
        .select(&table, &availability, SessionId(1), &has, 4, true)
        .is_empty());

    for peer in 2..=3 {
        let picks = selector().select(&table, &availability, SessionId(peer), &has, 4, true);
        assert_eq!(picks, vec![req]);
        table.claim(&req, SessionId(peer), now);
    }

    // three claims is the cap
    assert!(selector()
        .select(&table, &availability, SessionId(4), &has, 4, true)
        .is_empty());
}

#[test]
fn test_endgame_prefers_unrequested_blocks() {
    let mut table = PieceTable::new(&descriptor(2, BLOCK as u64));
    let now = Instant::now();
    table.claim(&BlockRequest::new(0, 0, BLOCK), SessionId(1), now);

    let picks = selector().select(
        &table,
        &Availability::new(2),
        SessionId(2),
        &Bitfield::full(2),
        1,
        true,
    );
    assert_eq!(picks, vec![BlockRequest::new(1, 0, BLOCK)]);
}

#[test]
fn test_endgame_trigger() {
    let by_peers = PieceSelector::new(EndgameTrigger::PeerCount, 3);
    assert!(by_peers.endgame_active(5, 8));
    assert!(!by_peers.endgame_active(8, 8));
    assert!(!by_peers.endgame_active(0, 8));

    let by_pieces = PieceSelector::new(EndgameTrigger::Pieces(10), 3);
    assert!(by_pieces.endgame_active(9, 1));
    assert!(!by_pieces.endgame_active(10, 100));
}
