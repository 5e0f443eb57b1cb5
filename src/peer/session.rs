use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::Instrument;

use super::bitfield::Bitfield;
use super::choking::ChokingState;
use super::error::PeerError;
use super::message::{Handshake, Message};
use super::peer_id::PeerId;
use super::piece::{Block, BlockRequest};
use super::rate::RateEstimator;
use super::transport::{PeerStream, PeerTransport};
use crate::constants::{MAX_UPLOAD_QUEUE, RATE_CALC_WINDOW, SESSION_TICK_INTERVAL, WRITE_TIMEOUT};
use crate::storage::PieceStore;
use crate::torrent::TorrentContext;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies one peer connection for its whole lifetime. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl SessionId {
    pub fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Handshaking,
    Established,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

/// Instructions from the coordinator to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerCommand {
    Request(Vec<BlockRequest>),
    Cancel(BlockRequest),
    Have(u32),
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Shutdown,
}

/// Reports from a session to the coordinator.
#[derive(Debug)]
pub enum SessionEvent {
    /// The peer completed the handshake. The session waits on `reply` for
    /// admission, which carries our current bitfield.
    Handshake {
        id: SessionId,
        peer_id: PeerId,
        info_hash: [u8; 20],
        reply: oneshot::Sender<Result<Bitfield, PeerError>>,
    },
    Bitfield {
        id: SessionId,
        bitfield: Bitfield,
    },
    Have {
        id: SessionId,
        piece: u32,
    },
    /// The peer choked us. Everything we had requested is void.
    Choked {
        id: SessionId,
    },
    Unchoked {
        id: SessionId,
    },
    Interest {
        id: SessionId,
        interested: bool,
    },
    Block {
        id: SessionId,
        block: Block,
    },
    Rates {
        id: SessionId,
        download: f64,
        upload: f64,
    },
    Closed {
        id: SessionId,
        error: Option<PeerError>,
    },
}

/// The coordinator's side of a running session.
pub struct SessionHandle {
    pub id: SessionId,
    pub addr: SocketAddr,
    commands: mpsc::UnboundedSender<PeerCommand>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    /// Queues a command. A session that has already exited ignores it.
    pub fn send(&self, command: PeerCommand) {
        let _ = self.commands.send(command);
    }

    /// Waits up to `grace` for the task to finish, then aborts it.
    pub async fn join(mut self, grace: Duration) {
        if timeout(grace, &mut self.task).await.is_err() {
            tracing::debug!(peer = %self.id, "session did not exit in time, aborting");
            self.task.abort();
        }
    }
}

/// Connects to `addr` and runs a session over the new connection.
pub fn spawn_outbound<T: PieceStore>(
    addr: SocketAddr,
    ctx: Arc<TorrentContext>,
    storage: Arc<T>,
    events: mpsc::Sender<SessionEvent>,
) -> SessionHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let id = SessionId::next();
    let span = tracing::debug_span!("peer", %addr, id = %id);
    let connect_timeout = ctx.config.connect_timeout;
    let session = Session::new(id, Direction::Outbound, ctx, storage, events, rx);

    let task = tokio::spawn(
        async move {
            match timeout(connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    let _ = stream.set_nodelay(true);
                    session.run(stream).await
                }
                Ok(Err(e)) => session.abort(PeerError::Transport(e)).await,
                Err(_) => session.abort(PeerError::Timeout).await,
            }
        }
        .instrument(span),
    );

    SessionHandle {
        id,
        addr,
        commands: tx,
        task,
    }
}

/// Runs a session over an already established stream.
pub fn spawn<S: PeerStream, T: PieceStore>(
    addr: SocketAddr,
    stream: S,
    direction: Direction,
    ctx: Arc<TorrentContext>,
    storage: Arc<T>,
    events: mpsc::Sender<SessionEvent>,
) -> SessionHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let id = SessionId::next();
    let span = tracing::debug_span!("peer", %addr, id = %id);
    let session = Session::new(id, direction, ctx, storage, events, rx);
    let task = tokio::spawn(session.run(stream).instrument(span));

    SessionHandle {
        id,
        addr,
        commands: tx,
        task,
    }
}

enum Step {
    Message(Message),
    Command(Option<PeerCommand>),
    Upload,
    Tick,
}

/// One peer connection: handshake, then the message loop.
///
/// A session owns its socket and nothing else. It tracks the flags and
/// request pipeline the wire protocol needs locally, and leaves every
/// download decision to the coordinator.
struct Session<T> {
    id: SessionId,
    direction: Direction,
    ctx: Arc<TorrentContext>,
    storage: Arc<T>,
    events: mpsc::Sender<SessionEvent>,
    commands: mpsc::UnboundedReceiver<PeerCommand>,
    state: SessionState,
    flags: ChokingState,
    /// Pieces the peer has.
    bitfield: Bitfield,
    /// Pieces we have, as far as this peer has been told.
    ours: Bitfield,
    /// Requests assigned by the coordinator but not yet sent.
    queued: VecDeque<BlockRequest>,
    in_flight: HashSet<BlockRequest>,
    uploads: VecDeque<BlockRequest>,
    download: RateEstimator,
    upload: RateEstimator,
    messages_received: u64,
    last_received: Instant,
    last_sent: Instant,
}

impl<T: PieceStore> Session<T> {
    fn new(
        id: SessionId,
        direction: Direction,
        ctx: Arc<TorrentContext>,
        storage: Arc<T>,
        events: mpsc::Sender<SessionEvent>,
        commands: mpsc::UnboundedReceiver<PeerCommand>,
    ) -> Self {
        let piece_count = ctx.descriptor.piece_count();
        let now = Instant::now();
        Self {
            id,
            direction,
            ctx,
            storage,
            events,
            commands,
            state: SessionState::Connecting,
            flags: ChokingState::default(),
            bitfield: Bitfield::new(piece_count),
            ours: Bitfield::new(piece_count),
            queued: VecDeque::new(),
            in_flight: HashSet::new(),
            uploads: VecDeque::new(),
            download: RateEstimator::starting_at(RATE_CALC_WINDOW, now.into_std()),
            upload: RateEstimator::starting_at(RATE_CALC_WINDOW, now.into_std()),
            messages_received: 0,
            last_received: now,
            last_sent: now,
        }
    }

    async fn run<S: PeerStream>(mut self, stream: S) {
        let mut transport = PeerTransport::new(stream);
        let result = self.drive(&mut transport).await;

        self.transition(SessionState::Closing);
        let _ = timeout(WRITE_TIMEOUT, transport.shutdown()).await;
        match &result {
            Ok(()) => tracing::debug!("session closed"),
            Err(e) => tracing::debug!(error = %e, "session closed"),
        }
        self.finish(result.err()).await;
    }

    async fn abort(mut self, error: PeerError) {
        tracing::debug!(error = %error, "connect failed");
        self.finish(Some(error)).await;
    }

    async fn finish(&mut self, error: Option<PeerError>) {
        self.transition(SessionState::Closed);
        let _ = self
            .events
            .send(SessionEvent::Closed { id: self.id, error })
            .await;
    }

    fn transition(&mut self, state: SessionState) {
        tracing::trace!(from = ?self.state, to = ?state, "session state");
        if state == SessionState::Established {
            tracing::debug!("session established");
        }
        self.state = state;
    }

    async fn drive<S: PeerStream>(&mut self, transport: &mut PeerTransport<S>) -> Result<(), PeerError> {
        self.transition(SessionState::Handshaking);
        let handshake_timeout = self.ctx.config.handshake_timeout;
        self.ours = timeout(handshake_timeout, self.handshake(transport))
            .await
            .map_err(|_| PeerError::Timeout)??;

        self.transition(SessionState::Established);
        if !self.ours.is_empty() {
            self.send(transport, Message::Bitfield(self.ours.to_bytes())).await?;
        }

        self.established(transport).await
    }

    async fn handshake<S: PeerStream>(
        &mut self,
        transport: &mut PeerTransport<S>,
    ) -> Result<Bitfield, PeerError> {
        let ours = Handshake::new(
            *self.ctx.descriptor.info_hash().as_bytes(),
            *self.ctx.peer_id.as_bytes(),
        );

        if self.direction == Direction::Outbound {
            transport.send_handshake(&ours).await?;
        }

        let theirs = transport.receive_handshake().await?;
        if theirs.info_hash != ours.info_hash {
            return Err(PeerError::InfoHashMismatch);
        }

        let (reply, admitted) = oneshot::channel();
        self.emit(SessionEvent::Handshake {
            id: self.id,
            peer_id: PeerId(theirs.peer_id),
            info_hash: theirs.info_hash,
            reply,
        })
        .await?;
        let have = admitted.await.map_err(|_| PeerError::Detached)??;

        if self.direction == Direction::Inbound {
            transport.send_handshake(&ours).await?;
        }

        Ok(have)
    }

    async fn established<S: PeerStream>(
        &mut self,
        transport: &mut PeerTransport<S>,
    ) -> Result<(), PeerError> {
        let mut ticker = interval(SESSION_TICK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let can_upload = !self.uploads.is_empty() && !self.flags.am_choking;
            let step = tokio::select! {
                message = transport.receive_message() => Step::Message(message?),
                command = self.commands.recv() => Step::Command(command),
                _ = std::future::ready(()), if can_upload => Step::Upload,
                _ = ticker.tick() => Step::Tick,
            };

            match step {
                Step::Message(message) => {
                    self.last_received = Instant::now();
                    self.handle_message(transport, message).await?;
                }
                Step::Command(None) | Step::Command(Some(PeerCommand::Shutdown)) => return Ok(()),
                Step::Command(Some(command)) => self.handle_command(transport, command).await?,
                Step::Upload => self.serve_upload(transport).await?,
                Step::Tick => self.tick(transport).await?,
            }
        }
    }

    async fn handle_message<S: PeerStream>(
        &mut self,
        transport: &mut PeerTransport<S>,
        message: Message,
    ) -> Result<(), PeerError> {
        // keep-alives do not count towards the bitfield-first rule
        let first = self.messages_received == 0;
        if message != Message::KeepAlive {
            self.messages_received += 1;
        }

        match message {
            Message::KeepAlive => {}
            Message::Choke => {
                if !self.flags.peer_choking {
                    self.flags.peer_choking = true;
                    self.in_flight.clear();
                    self.queued.clear();
                    self.emit(SessionEvent::Choked { id: self.id }).await?;
                }
            }
            Message::Unchoke => {
                if self.flags.peer_choking {
                    self.flags.peer_choking = false;
                    self.emit(SessionEvent::Unchoked { id: self.id }).await?;
                }
            }
            Message::Interested | Message::NotInterested => {
                let interested = matches!(message, Message::Interested);
                if self.flags.peer_interested != interested {
                    self.flags.peer_interested = interested;
                    self.emit(SessionEvent::Interest {
                        id: self.id,
                        interested,
                    })
                    .await?;
                }
            }
            Message::Have { piece } => {
                if piece as usize >= self.bitfield.piece_count() {
                    return Err(PeerError::ProtocolViolation(format!(
                        "have for piece {piece} out of range"
                    )));
                }
                if self.bitfield.set(piece as usize) {
                    self.emit(SessionEvent::Have { id: self.id, piece }).await?;
                }
            }
            Message::Bitfield(payload) => {
                if !first {
                    return Err(PeerError::ProtocolViolation(
                        "bitfield after first message".into(),
                    ));
                }
                let bitfield = Bitfield::from_payload(&payload, self.bitfield.piece_count())?;
                self.bitfield = bitfield.clone();
                self.emit(SessionEvent::Bitfield {
                    id: self.id,
                    bitfield,
                })
                .await?;
            }
            Message::Request {
                index,
                begin,
                length,
            } => self.queue_upload(BlockRequest::new(index, begin, length)),
            Message::Piece { index, begin, data } => {
                let block = Block::new(index, begin, data);
                if !self.in_flight.remove(&block.request()) {
                    tracing::trace!(piece = index, offset = begin, "unrequested block");
                }
                self.download.record(block.data.len());
                self.emit(SessionEvent::Block {
                    id: self.id,
                    block,
                })
                .await?;
                self.flush_requests(transport).await?;
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => {
                let request = BlockRequest::new(index, begin, length);
                self.uploads.retain(|r| *r != request);
            }
        }

        Ok(())
    }

    async fn handle_command<S: PeerStream>(
        &mut self,
        transport: &mut PeerTransport<S>,
        command: PeerCommand,
    ) -> Result<(), PeerError> {
        match command {
            PeerCommand::Request(requests) => {
                if self.flags.peer_choking {
                    tracing::trace!(count = requests.len(), "dropping requests while choked");
                    return Ok(());
                }
                for request in requests {
                    if !self.in_flight.contains(&request) && !self.queued.contains(&request) {
                        self.queued.push_back(request);
                    }
                }
                self.flush_requests(transport).await?;
            }
            PeerCommand::Cancel(request) => {
                if let Some(pos) = self.queued.iter().position(|r| *r == request) {
                    self.queued.remove(pos);
                } else if self.in_flight.remove(&request) {
                    self.send(transport, request.to_cancel()).await?;
                    self.flush_requests(transport).await?;
                }
            }
            PeerCommand::Have(piece) => {
                if self.ours.set(piece as usize) {
                    self.send(transport, Message::Have { piece }).await?;
                }
            }
            PeerCommand::Choke => {
                if !self.flags.am_choking {
                    self.flags.am_choking = true;
                    self.uploads.clear();
                    self.send(transport, Message::Choke).await?;
                }
            }
            PeerCommand::Unchoke => {
                if self.flags.am_choking {
                    self.flags.am_choking = false;
                    self.send(transport, Message::Unchoke).await?;
                }
            }
            PeerCommand::Interested => {
                if !self.flags.am_interested {
                    self.flags.am_interested = true;
                    self.send(transport, Message::Interested).await?;
                }
            }
            PeerCommand::NotInterested => {
                if self.flags.am_interested {
                    self.flags.am_interested = false;
                    self.send(transport, Message::NotInterested).await?;
                }
            }
            PeerCommand::Shutdown => {}
        }

        Ok(())
    }

    fn queue_upload(&mut self, request: BlockRequest) {
        if self.flags.am_choking {
            tracing::trace!(piece = request.piece, "ignoring request while choking");
            return;
        }
        if !self.ours.has(request.piece as usize) || !self.ctx.descriptor.is_servable(&request) {
            tracing::debug!(
                piece = request.piece,
                offset = request.offset,
                length = request.length,
                "ignoring request we cannot serve"
            );
            return;
        }
        if self.uploads.len() >= MAX_UPLOAD_QUEUE || self.uploads.contains(&request) {
            return;
        }
        self.uploads.push_back(request);
    }

    async fn serve_upload<S: PeerStream>(
        &mut self,
        transport: &mut PeerTransport<S>,
    ) -> Result<(), PeerError> {
        let Some(request) = self.uploads.pop_front() else {
            return Ok(());
        };

        let data = match self
            .storage
            .read_block(request.piece, request.offset, request.length)
            .await
        {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(piece = request.piece, error = %e, "failed to read block for upload");
                return Ok(());
            }
        };

        self.upload.record(data.len());
        let block = Block::new(request.piece, request.offset, data);
        self.send(transport, block.into_message()).await
    }

    async fn flush_requests<S: PeerStream>(
        &mut self,
        transport: &mut PeerTransport<S>,
    ) -> Result<(), PeerError> {
        while !self.flags.peer_choking && self.in_flight.len() < self.ctx.config.pipeline_depth {
            let Some(request) = self.queued.pop_front() else {
                break;
            };
            self.in_flight.insert(request);
            self.send(transport, request.to_request()).await?;
        }
        Ok(())
    }

    async fn tick<S: PeerStream>(&mut self, transport: &mut PeerTransport<S>) -> Result<(), PeerError> {
        let now = Instant::now();
        if now.duration_since(self.last_received) >= self.ctx.config.peer_read_timeout {
            return Err(PeerError::Timeout);
        }
        if now.duration_since(self.last_sent) >= self.ctx.config.keepalive_interval {
            self.send(transport, Message::KeepAlive).await?;
        }

        let download = self.download.update(now.into_std());
        let upload = self.upload.update(now.into_std());
        self.emit(SessionEvent::Rates {
            id: self.id,
            download,
            upload,
        })
        .await
    }

    async fn send<S: PeerStream>(
        &mut self,
        transport: &mut PeerTransport<S>,
        message: Message,
    ) -> Result<(), PeerError> {
        transport.send_message(&message).await?;
        self.last_sent = Instant::now();
        Ok(())
    }

    async fn emit(&self, event: SessionEvent) -> Result<(), PeerError> {
        self.events.send(event).await.map_err(|_| PeerError::Detached)
    }
}
