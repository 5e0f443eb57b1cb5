use super::*;
use crate::storage::{MemoryStorage, PieceStore};
use crate::torrent::{InfoHash, TorrentConfig, TorrentContext, TorrentDescriptor};
use bytes::{BufMut, Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

fn frame(bytes: &[u8]) -> BytesMut {
    BytesMut::from(bytes)
}

fn stats(id: u64, rate: f64, interested: bool, am_choking: bool) -> PeerStats {
    PeerStats {
        id: SessionId(id),
        download_rate: rate,
        upload_rate: 0.0,
        interested,
        am_choking,
    }
}

#[test]
fn test_peer_id_generate() {
    let id1 = PeerId::generate();
    let id2 = PeerId::generate();
    assert_ne!(id1.0, id2.0);
    assert_eq!(id1.client_id(), Some("PM0001"));
}

#[test]
fn test_bitfield() {
    let mut bf = Bitfield::new(100);
    assert!(!bf.has(0));
    assert!(bf.is_empty());

    assert!(bf.set(0));
    assert!(!bf.set(0));
    assert!(bf.has(0));

    bf.set(99);
    assert!(bf.has(99));
    assert!(!bf.has(100));

    bf.clear(0);
    assert!(!bf.has(0));
    assert_eq!(bf.count(), 1);
    assert_eq!(bf.iter().collect::<Vec<_>>(), vec![99]);
}

#[test]
fn test_bitfield_from_payload() {
    let bf = Bitfield::from_payload(&Bytes::from_static(&[0b1010_1000, 0x00]), 10).unwrap();
    assert_eq!(bf.iter().collect::<Vec<_>>(), vec![0, 2, 4]);
    assert_eq!(bf.to_bytes(), Bytes::from_static(&[0b1010_1000, 0x00]));
}

#[test]
fn test_bitfield_rejects_wrong_length() {
    let err = Bitfield::from_payload(&Bytes::from_static(&[0xFF]), 10).unwrap_err();
    assert!(matches!(err, PeerError::MalformedMessage(_)));
}

#[test]
fn test_bitfield_rejects_spare_bits() {
    // 10 pieces leave the low 6 bits of the second byte unused
    let err = Bitfield::from_payload(&Bytes::from_static(&[0xFF, 0b1100_0001]), 10).unwrap_err();
    assert!(matches!(err, PeerError::MalformedMessage(_)));
}

#[test]
fn test_bitfield_full() {
    let bf = Bitfield::full(10);
    assert!(bf.is_complete());
    assert_eq!(bf.count(), 10);
    assert_eq!(bf.as_bytes(), &[0xFF, 0xC0]);
}

#[test]
fn test_handshake_encode_decode() {
    let handshake = Handshake::new([1u8; 20], [2u8; 20]);
    let encoded = handshake.encode();
    assert_eq!(encoded.len(), 68);
    assert_eq!(encoded[0], 19);
    assert_eq!(&encoded[1..20], b"BitTorrent protocol");

    let decoded = Handshake::decode(&encoded).unwrap();
    assert_eq!(decoded, handshake);
}

#[test]
fn test_handshake_partial() {
    let encoded = Handshake::new([1u8; 20], [2u8; 20]).encode();
    let err = Handshake::decode(&encoded[..40]).unwrap_err();
    assert!(matches!(err, PeerError::Incomplete { needed: 28 }));
}

#[test]
fn test_handshake_wrong_protocol() {
    let mut data = Handshake::new([1u8; 20], [2u8; 20]).encode().to_vec();
    data[5] = b'X';
    let err = Handshake::decode(&data).unwrap_err();
    assert!(matches!(err, PeerError::ProtocolViolation(_)));

    // rejected before all 68 bytes arrive
    let err = Handshake::decode(&[0, 0, 0, 5, 4]).unwrap_err();
    assert!(matches!(err, PeerError::ProtocolViolation(_)));
}

#[test]
fn test_message_encode_decode() {
    let messages = vec![
        Message::KeepAlive,
        Message::Choke,
        Message::Unchoke,
        Message::Interested,
        Message::NotInterested,
        Message::Have { piece: 42 },
        Message::Bitfield(Bytes::from_static(&[0xA0])),
        Message::Request {
            index: 1,
            begin: 0,
            length: 16384,
        },
        Message::Piece {
            index: 3,
            begin: 16384,
            data: Bytes::from_static(b"hello world"),
        },
        Message::Cancel {
            index: 1,
            begin: 0,
            length: 16384,
        },
    ];

    let mut buf = BytesMut::new();
    for msg in &messages {
        msg.encode_into(&mut buf);
    }

    for msg in messages {
        assert_eq!(Message::decode(&mut buf).unwrap(), msg);
    }
    assert!(buf.is_empty());
}

#[test]
fn test_message_wire_format() {
    let encoded = Message::Have { piece: 7 }.encode();
    assert_eq!(encoded.as_ref(), &[0, 0, 0, 5, 4, 0, 0, 0, 7]);

    let encoded = Message::KeepAlive.encode();
    assert_eq!(encoded.as_ref(), &[0, 0, 0, 0]);
}

#[test]
fn test_decode_incomplete_leaves_buffer() {
    let encoded = Message::Request {
        index: 1,
        begin: 2,
        length: 3,
    }
    .encode();

    let mut buf = frame(&encoded[..10]);
    let err = Message::decode(&mut buf).unwrap_err();
    assert!(err.is_incomplete());
    assert_eq!(buf.len(), 10);

    buf.extend_from_slice(&encoded[10..]);
    assert_eq!(
        Message::decode(&mut buf).unwrap(),
        Message::Request {
            index: 1,
            begin: 2,
            length: 3
        }
    );
}

#[test]
fn test_decode_byte_at_a_time() {
    let encoded = Message::Piece {
        index: 9,
        begin: 0,
        data: Bytes::from_static(&[1, 2, 3, 4]),
    }
    .encode();

    let mut buf = BytesMut::new();
    for (i, byte) in encoded.iter().enumerate() {
        buf.put_u8(*byte);
        let result = Message::decode(&mut buf);
        if i + 1 < encoded.len() {
            assert!(result.unwrap_err().is_incomplete());
        } else {
            assert!(matches!(result.unwrap(), Message::Piece { index: 9, .. }));
        }
    }
}

#[test]
fn test_decode_rejects_bad_lengths() {
    // have with a 3-byte payload
    let mut buf = frame(&[0, 0, 0, 4, 4, 0, 0, 0]);
    assert!(matches!(
        Message::decode(&mut buf),
        Err(PeerError::MalformedMessage(_))
    ));

    // choke with a payload
    let mut buf = frame(&[0, 0, 0, 2, 0, 0]);
    assert!(matches!(
        Message::decode(&mut buf),
        Err(PeerError::MalformedMessage(_))
    ));

    // request one byte short
    let mut buf = BytesMut::new();
    buf.put_u32(12);
    buf.put_u8(6);
    buf.put_slice(&[0u8; 11]);
    assert!(matches!(
        Message::decode(&mut buf),
        Err(PeerError::MalformedMessage(_))
    ));

    // piece without a full header
    let mut buf = frame(&[0, 0, 0, 5, 7, 0, 0, 0, 1]);
    assert!(matches!(
        Message::decode(&mut buf),
        Err(PeerError::MalformedMessage(_))
    ));
}

#[test]
fn test_decode_rejects_unknown_id() {
    let mut buf = frame(&[0, 0, 0, 1, 20]);
    assert!(matches!(
        Message::decode(&mut buf),
        Err(PeerError::MalformedMessage(_))
    ));
}

#[test]
fn test_decode_rejects_oversized_frame() {
    let mut buf = frame(&[0x7F, 0xFF, 0xFF, 0xFF, 7]);
    assert!(matches!(
        Message::decode(&mut buf),
        Err(PeerError::MalformedMessage(_))
    ));
}

#[test]
fn test_block_request() {
    let req = BlockRequest::new(2, 16384, 16384);
    assert_eq!(req.end(), 32768);
    assert_eq!(req.to_string(), "2@16384+16384");
    assert_eq!(
        req.to_request(),
        Message::Request {
            index: 2,
            begin: 16384,
            length: 16384
        }
    );
    assert_eq!(
        req.to_cancel(),
        Message::Cancel {
            index: 2,
            begin: 16384,
            length: 16384
        }
    );

    let block = Block::new(2, 16384, Bytes::from(vec![0u8; 16384]));
    assert_eq!(block.request(), req);
    assert!(matches!(
        block.into_message(),
        Message::Piece { index: 2, begin: 16384, ref data } if data.len() == 16384
    ));
}

#[test]
fn test_block_requests_order_by_piece_then_offset() {
    let mut requests = vec![
        BlockRequest::new(1, 0, 16384),
        BlockRequest::new(0, 16384, 16384),
        BlockRequest::new(0, 0, 16384),
    ];
    requests.sort();
    assert_eq!(
        requests,
        vec![
            BlockRequest::new(0, 0, 16384),
            BlockRequest::new(0, 16384, 16384),
            BlockRequest::new(1, 0, 16384),
        ]
    );
}

#[test]
fn test_block_geometry() {
    assert_eq!(compute_block_count(262144, 16384), 16);
    assert_eq!(compute_block_count(20000, 16384), 2);
    assert_eq!(compute_block_length(20000, 0, 16384), 16384);
    assert_eq!(compute_block_length(20000, 1, 16384), 3616);
    assert_eq!(compute_block_length(20000, 2, 16384), 0);
}

#[test]
fn test_choking_state_default() {
    let state = ChokingState::default();
    assert!(state.am_choking);
    assert!(!state.am_interested);
    assert!(state.peer_choking);
    assert!(!state.peer_interested);
}

#[test]
fn test_choking_unchokes_fastest() {
    let mut choker = ChokingAlgorithm::new(2, 3);
    let peers = vec![
        stats(1, 10.0, true, true),
        stats(2, 500.0, true, true),
        stats(3, 300.0, true, true),
        stats(4, 50.0, true, true),
    ];

    let decisions = choker.run(&peers, false);
    let unchoked: Vec<SessionId> = decisions
        .iter()
        .filter(|(_, d)| *d == ChokeDecision::Unchoke)
        .map(|(id, _)| *id)
        .collect();

    assert!(unchoked.contains(&SessionId(2)));
    assert!(unchoked.contains(&SessionId(3)));
    // two regular slots plus one optimistic
    assert_eq!(unchoked.len(), 3);
    let optimistic = choker.optimistic_peer().unwrap();
    assert!(optimistic == SessionId(1) || optimistic == SessionId(4));
}

#[test]
fn test_choking_is_idempotent() {
    let mut choker = ChokingAlgorithm::new(4, 3);
    let peers = vec![stats(1, 100.0, true, true), stats(2, 200.0, true, true)];

    let decisions = choker.run(&peers, false);
    assert_eq!(decisions.len(), 2);

    let settled: Vec<PeerStats> = peers
        .iter()
        .map(|p| PeerStats {
            am_choking: false,
            ..p.clone()
        })
        .collect();
    assert!(choker.run(&settled, false).is_empty());
}

#[test]
fn test_choking_keeps_optimistic_until_rotation() {
    let mut choker = ChokingAlgorithm::new(1, 100);
    let peers = vec![stats(1, 100.0, true, false), stats(2, 900.0, true, true)];

    let decisions = choker.run(&peers, false);
    assert!(decisions.contains(&(SessionId(2), ChokeDecision::Unchoke)));
    // peer 1 keeps the optimistic slot, the only one left
    assert_eq!(choker.optimistic_peer(), Some(SessionId(1)));
    assert!(!decisions.contains(&(SessionId(1), ChokeDecision::Choke)));

    let peers = vec![
        stats(1, 100.0, true, false),
        stats(2, 900.0, true, false),
        stats(3, 500.0, true, true),
    ];
    // the optimistic slot holds until its rounds are up, even against a faster peer
    assert!(choker.run(&peers, false).is_empty());
    assert_eq!(choker.optimistic_peer(), Some(SessionId(1)));
}

#[test]
fn test_choking_uses_upload_rate_when_seeding() {
    let mut choker = ChokingAlgorithm::new(1, 3);
    let peers = vec![
        PeerStats {
            id: SessionId(1),
            download_rate: 1000.0,
            upload_rate: 10.0,
            interested: true,
            am_choking: true,
        },
        PeerStats {
            id: SessionId(2),
            download_rate: 0.0,
            upload_rate: 800.0,
            interested: true,
            am_choking: true,
        },
    ];

    let decisions = choker.run(&peers, true);
    assert!(decisions.contains(&(SessionId(2), ChokeDecision::Unchoke)));
}

#[test]
fn test_choking_empty() {
    let mut choker = ChokingAlgorithm::default();
    assert!(choker.run(&[], false).is_empty());
}

#[test]
fn test_rate_estimator() {
    let start = Instant::now();
    let mut rate = RateEstimator::starting_at(Duration::from_secs(1), start);
    rate.record(1000);

    let r = rate.update(start + Duration::from_secs(1));
    assert!((r - 1000.0).abs() < 1e-6);

    // a quiet second decays the estimate toward zero
    let r = rate.update(start + Duration::from_millis(1500));
    assert!(r < 1000.0 && r > 0.0);
    assert_eq!(rate.total(), 1000);
}

#[tokio::test]
async fn test_transport_handshake_and_messages() {
    let (a, b) = tokio::io::duplex(1024);
    let mut left = PeerTransport::new(a);
    let mut right = PeerTransport::new(b);

    let handshake = Handshake::new([3u8; 20], [4u8; 20]);
    left.send_handshake(&handshake).await.unwrap();
    left.send_message(&Message::Interested).await.unwrap();
    left.send_message(&Message::Have { piece: 5 }).await.unwrap();

    assert_eq!(right.receive_handshake().await.unwrap(), handshake);
    assert_eq!(right.receive_message().await.unwrap(), Message::Interested);
    assert_eq!(
        right.receive_message().await.unwrap(),
        Message::Have { piece: 5 }
    );
}

#[tokio::test]
async fn test_transport_rejects_second_handshake() {
    let (a, b) = tokio::io::duplex(1024);
    let mut left = PeerTransport::new(a);
    let mut right = PeerTransport::new(b);

    let handshake = Handshake::new([3u8; 20], [4u8; 20]);
    left.send_handshake(&handshake).await.unwrap();
    left.send_handshake(&handshake).await.unwrap();

    right.receive_handshake().await.unwrap();
    let err = right.receive_message().await.unwrap_err();
    assert!(matches!(err, PeerError::ProtocolViolation(_)));
}

#[tokio::test]
async fn test_transport_reports_closed() {
    let (a, b) = tokio::io::duplex(1024);
    let mut right = PeerTransport::new(b);
    drop(a);

    let err = right.receive_message().await.unwrap_err();
    assert!(matches!(err, PeerError::ConnectionClosed));
}

const SESSION_HASH: [u8; 20] = [7u8; 20];
const BLOCK: u32 = 16384;

/// The remote end of a session under test.
struct Remote {
    transport: PeerTransport<DuplexStream>,
    events: mpsc::Receiver<SessionEvent>,
    handle: SessionHandle,
}

fn session_context(config: TorrentConfig) -> Arc<TorrentContext> {
    let descriptor = TorrentDescriptor::new(
        InfoHash(SESSION_HASH),
        2 * BLOCK as u64,
        8 * BLOCK as u64,
        vec![[0u8; 20]; 4],
    )
    .unwrap();
    TorrentContext::with_peer_id(descriptor, config, PeerId([0xAA; 20]))
}

fn start_session(config: TorrentConfig, storage: Arc<MemoryStorage>) -> Remote {
    let (local, remote) = tokio::io::duplex(1 << 20);
    let (tx, rx) = mpsc::channel(64);
    let handle = spawn(
        SocketAddr::from(([10, 0, 0, 1], 6881)),
        local,
        Direction::Outbound,
        session_context(config),
        storage,
        tx,
    );
    Remote {
        transport: PeerTransport::new(remote),
        events: rx,
        handle,
    }
}

/// Skips rate reports, which arrive on every tick.
async fn next_event(events: &mut mpsc::Receiver<SessionEvent>) -> SessionEvent {
    loop {
        match events.recv().await {
            Some(SessionEvent::Rates { .. }) => continue,
            Some(event) => return event,
            None => panic!("session dropped its event channel"),
        }
    }
}

async fn next_message(transport: &mut PeerTransport<DuplexStream>) -> Message {
    loop {
        match transport.receive_message().await.unwrap() {
            Message::KeepAlive => continue,
            message => return message,
        }
    }
}

/// Completes the handshake and admits the session with `have` as our pieces.
async fn establish(config: TorrentConfig, storage: Arc<MemoryStorage>, have: Bitfield) -> Remote {
    let mut remote = start_session(config, storage);
    let ours = remote.transport.receive_handshake().await.unwrap();
    assert_eq!(ours.info_hash, SESSION_HASH);
    remote
        .transport
        .send_handshake(&Handshake::new(SESSION_HASH, [9u8; 20]))
        .await
        .unwrap();

    match next_event(&mut remote.events).await {
        SessionEvent::Handshake { peer_id, reply, .. } => {
            assert_eq!(peer_id, PeerId([9u8; 20]));
            let _ = reply.send(Ok(have));
        }
        other => panic!("expected handshake, got {other:?}"),
    }
    remote
}

#[tokio::test]
async fn test_session_drops_requests_while_choking() {
    let storage = Arc::new(MemoryStorage::new());
    let data: Vec<u8> = (0..2 * BLOCK).map(|i| (i % 251) as u8).collect();
    storage.write_piece(0, Bytes::from(data.clone())).await.unwrap();
    let mut have = Bitfield::new(4);
    have.set(0);

    let mut remote = establish(TorrentConfig::default(), storage, have.clone()).await;
    assert_eq!(
        next_message(&mut remote.transport).await,
        Message::Bitfield(have.to_bytes())
    );

    // asked while we still choke the peer
    let early = Message::Request {
        index: 0,
        begin: 0,
        length: 100,
    };
    remote.transport.send_message(&early).await.unwrap();
    remote.transport.send_message(&Message::Interested).await.unwrap();
    assert!(matches!(
        next_event(&mut remote.events).await,
        SessionEvent::Interest {
            interested: true,
            ..
        }
    ));

    remote.handle.send(PeerCommand::Unchoke);
    assert_eq!(next_message(&mut remote.transport).await, Message::Unchoke);

    let late = Message::Request {
        index: 0,
        begin: 100,
        length: 50,
    };
    remote.transport.send_message(&late).await.unwrap();
    assert_eq!(
        next_message(&mut remote.transport).await,
        Message::Piece {
            index: 0,
            begin: 100,
            data: Bytes::copy_from_slice(&data[100..150]),
        }
    );

    remote.handle.send(PeerCommand::Shutdown);
    assert!(matches!(
        next_event(&mut remote.events).await,
        SessionEvent::Closed { error: None, .. }
    ));
}

#[tokio::test]
async fn test_session_rejects_late_bitfield() {
    let mut remote = establish(
        TorrentConfig::default(),
        Arc::new(MemoryStorage::new()),
        Bitfield::new(4),
    )
    .await;

    remote
        .transport
        .send_message(&Message::Have { piece: 1 })
        .await
        .unwrap();
    remote
        .transport
        .send_message(&Message::Bitfield(Bitfield::full(4).to_bytes()))
        .await
        .unwrap();

    assert!(matches!(
        next_event(&mut remote.events).await,
        SessionEvent::Have { piece: 1, .. }
    ));
    assert!(matches!(
        next_event(&mut remote.events).await,
        SessionEvent::Closed {
            error: Some(PeerError::ProtocolViolation(_)),
            ..
        }
    ));
}

#[tokio::test]
async fn test_session_accepts_bitfield_after_keepalive() {
    let mut remote = establish(
        TorrentConfig::default(),
        Arc::new(MemoryStorage::new()),
        Bitfield::new(4),
    )
    .await;

    remote.transport.send_message(&Message::KeepAlive).await.unwrap();
    remote
        .transport
        .send_message(&Message::Bitfield(Bitfield::full(4).to_bytes()))
        .await
        .unwrap();

    match next_event(&mut remote.events).await {
        SessionEvent::Bitfield { bitfield, .. } => assert_eq!(bitfield, Bitfield::full(4)),
        other => panic!("expected bitfield, got {other:?}"),
    }

    remote.handle.send(PeerCommand::Shutdown);
    assert!(matches!(
        next_event(&mut remote.events).await,
        SessionEvent::Closed { error: None, .. }
    ));
}

#[tokio::test]
async fn test_session_queues_requests_beyond_pipeline() {
    let config = TorrentConfig::default().with_pipeline_depth(2);
    let mut remote = establish(config, Arc::new(MemoryStorage::new()), Bitfield::new(4)).await;

    remote.transport.send_message(&Message::Unchoke).await.unwrap();
    assert!(matches!(
        next_event(&mut remote.events).await,
        SessionEvent::Unchoked { .. }
    ));

    let requests: Vec<BlockRequest> = (0..2)
        .flat_map(|piece| {
            [
                BlockRequest::new(piece, 0, BLOCK),
                BlockRequest::new(piece, BLOCK, BLOCK),
            ]
        })
        .collect();
    remote.handle.send(PeerCommand::Request(requests.clone()));
    // commands are handled in order, so this marks the end of the first flush
    remote.handle.send(PeerCommand::Interested);

    assert_eq!(next_message(&mut remote.transport).await, requests[0].to_request());
    assert_eq!(next_message(&mut remote.transport).await, requests[1].to_request());
    assert_eq!(next_message(&mut remote.transport).await, Message::Interested);

    // each answered block frees one pipeline slot
    for (answered, next) in [(0, 2), (1, 3)] {
        let request = requests[answered];
        let data = Bytes::from(vec![1u8; BLOCK as usize]);
        let block = Block::new(request.piece, request.offset, data);
        remote
            .transport
            .send_message(&block.into_message())
            .await
            .unwrap();
        assert_eq!(next_message(&mut remote.transport).await, requests[next].to_request());
        match next_event(&mut remote.events).await {
            SessionEvent::Block { block, .. } => assert_eq!(block.request(), request),
            other => panic!("expected block, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_session_handshake_timeout() {
    tokio::time::pause();
    let config = TorrentConfig::default().with_handshake_timeout(Duration::from_secs(5));
    let mut remote = start_session(config, Arc::new(MemoryStorage::new()));
    let started = tokio::time::Instant::now();

    // read our handshake but never answer it
    remote.transport.receive_handshake().await.unwrap();

    match next_event(&mut remote.events).await {
        SessionEvent::Closed { error, .. } => assert!(matches!(error, Some(PeerError::Timeout))),
        other => panic!("expected close, got {other:?}"),
    }
    assert!(started.elapsed() >= Duration::from_secs(5));
}
