use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::Instrument;

use super::error::TorrentError;
use super::event::TorrentEvent;
use super::swarm::{Outbox, PieceReady, Swarm, TorrentStats};
use super::TorrentContext;
use crate::constants::{
    EVENT_CHANNEL_CAPACITY, HOUSEKEEPING_INTERVAL, OBSERVER_CHANNEL_CAPACITY, SHUTDOWN_GRACE,
};
use crate::peer::{
    self, Bitfield, BoxedStream, Direction, PeerError, PeerStream, SessionEvent, SessionHandle,
    SessionId,
};
use crate::storage::PieceStore;

enum TorrentCommand {
    AddPeer(SocketAddr),
    AddConnection { addr: SocketAddr, stream: BoxedStream },
    Stats(oneshot::Sender<TorrentStats>),
    Shutdown,
}

struct CommitResult {
    piece: u32,
    contributors: Vec<SessionId>,
    result: Result<(), TorrentError>,
}

/// Handle to a running torrent.
///
/// Dropping the handle does not stop the torrent; call
/// [`shutdown`](Self::shutdown).
pub struct TorrentHandle {
    commands: mpsc::UnboundedSender<TorrentCommand>,
    observer: broadcast::Sender<TorrentEvent>,
    peer_count: Arc<AtomicUsize>,
    task: JoinHandle<Result<(), TorrentError>>,
}

impl TorrentHandle {
    /// Starts a torrent with nothing downloaded.
    pub fn spawn<T: PieceStore>(ctx: Arc<TorrentContext>, storage: Arc<T>) -> Self {
        Self::start(ctx, storage, None)
    }

    /// Starts a torrent that already has the pieces in `have`, typically
    /// from [`FileStorage::verify_all`](crate::storage::FileStorage::verify_all).
    pub fn spawn_with_resume<T: PieceStore>(
        ctx: Arc<TorrentContext>,
        storage: Arc<T>,
        have: Bitfield,
    ) -> Self {
        Self::start(ctx, storage, Some(have))
    }

    fn start<T: PieceStore>(ctx: Arc<TorrentContext>, storage: Arc<T>, resume: Option<Bitfield>) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (observer, _) = broadcast::channel(OBSERVER_CHANNEL_CAPACITY);
        let peer_count = Arc::new(AtomicUsize::new(0));

        let span = tracing::info_span!("torrent", info_hash = %ctx.descriptor.info_hash());
        let coordinator = Coordinator::new(
            ctx,
            storage,
            resume,
            commands_rx,
            observer.clone(),
            peer_count.clone(),
        );
        let task = tokio::spawn(coordinator.run().instrument(span));

        Self {
            commands: commands_tx,
            observer,
            peer_count,
            task,
        }
    }

    /// Connects to a peer. Ignored if already connected to `addr` or at the
    /// peer limit.
    pub fn add_peer(&self, addr: SocketAddr) {
        let _ = self.commands.send(TorrentCommand::AddPeer(addr));
    }

    /// Runs a session over a connection accepted elsewhere. The remote side
    /// is expected to send its handshake first.
    pub fn add_connection<S: PeerStream>(&self, addr: SocketAddr, stream: S) {
        let _ = self.commands.send(TorrentCommand::AddConnection {
            addr,
            stream: Box::new(stream),
        });
    }

    /// Live sessions, including those still connecting.
    pub fn peer_count(&self) -> usize {
        self.peer_count.load(Ordering::Relaxed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TorrentEvent> {
        self.observer.subscribe()
    }

    pub async fn stats(&self) -> Result<TorrentStats, TorrentError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(TorrentCommand::Stats(tx))
            .map_err(|_| TorrentError::Shutdown)?;
        rx.await.map_err(|_| TorrentError::Shutdown)
    }

    /// Stops every session and waits for the coordinator to exit.
    pub async fn shutdown(self) -> Result<(), TorrentError> {
        let _ = self.commands.send(TorrentCommand::Shutdown);
        self.task.await.map_err(|_| TorrentError::Shutdown)?
    }
}

struct Coordinator<T> {
    ctx: Arc<TorrentContext>,
    storage: Arc<T>,
    swarm: Swarm,
    sessions: HashMap<SessionId, SessionHandle>,
    connected_addrs: HashSet<SocketAddr>,
    peer_count: Arc<AtomicUsize>,
    commands: mpsc::UnboundedReceiver<TorrentCommand>,
    events_tx: mpsc::Sender<SessionEvent>,
    events_rx: mpsc::Receiver<SessionEvent>,
    commit_tx: mpsc::UnboundedSender<PieceReady>,
    commit_results: mpsc::UnboundedReceiver<CommitResult>,
    outbox: Outbox,
}

impl<T: PieceStore> Coordinator<T> {
    fn new(
        ctx: Arc<TorrentContext>,
        storage: Arc<T>,
        resume: Option<Bitfield>,
        commands: mpsc::UnboundedReceiver<TorrentCommand>,
        observer: broadcast::Sender<TorrentEvent>,
        peer_count: Arc<AtomicUsize>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (commit_tx, commit_rx) = mpsc::unbounded_channel();
        let (results_tx, commit_results) = mpsc::unbounded_channel();

        tokio::spawn(commit_worker(ctx.clone(), storage.clone(), commit_rx, results_tx));

        Self {
            swarm: Swarm::new(ctx.clone(), resume, observer),
            ctx,
            storage,
            sessions: HashMap::new(),
            connected_addrs: HashSet::new(),
            peer_count,
            commands,
            events_tx,
            events_rx,
            commit_tx,
            commit_results,
            outbox: Vec::new(),
        }
    }

    async fn run(mut self) -> Result<(), TorrentError> {
        let mut choke = interval(self.ctx.config.choke_interval);
        choke.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut housekeeping = interval(HOUSEKEEPING_INTERVAL);
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            pieces = self.ctx.descriptor.piece_count(),
            length = self.ctx.descriptor.total_length(),
            "torrent started"
        );

        let result = loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(TorrentCommand::Shutdown) | None => break Ok(()),
                    Some(command) => self.handle_command(command),
                },
                Some(event) = self.events_rx.recv() => {
                    if let Err(e) = self.handle_event(event) {
                        tracing::error!(error = %e, "torrent failed");
                        break Err(e);
                    }
                }
                Some(commit) = self.commit_results.recv() => {
                    self.swarm.piece_verified(
                        commit.piece,
                        &commit.contributors,
                        commit.result,
                        Instant::now(),
                        &mut self.outbox,
                    );
                }
                _ = choke.tick() => self.swarm.choke_cycle(&mut self.outbox),
                _ = housekeeping.tick() => {
                    self.swarm.expire_requests(Instant::now(), &mut self.outbox);
                }
            }
            self.flush();
        };

        self.teardown().await;
        result
    }

    fn handle_command(&mut self, command: TorrentCommand) {
        match command {
            TorrentCommand::AddPeer(addr) => {
                if self.accepting(addr) {
                    let handle = peer::spawn_outbound(
                        addr,
                        self.ctx.clone(),
                        self.storage.clone(),
                        self.events_tx.clone(),
                    );
                    self.register(handle);
                }
            }
            TorrentCommand::AddConnection { addr, stream } => {
                if self.accepting(addr) {
                    let handle = peer::spawn(
                        addr,
                        stream,
                        Direction::Inbound,
                        self.ctx.clone(),
                        self.storage.clone(),
                        self.events_tx.clone(),
                    );
                    self.register(handle);
                }
            }
            TorrentCommand::Stats(reply) => {
                let _ = reply.send(self.swarm.stats());
            }
            TorrentCommand::Shutdown => {}
        }
    }

    fn accepting(&self, addr: SocketAddr) -> bool {
        if self.connected_addrs.contains(&addr) {
            tracing::debug!(%addr, "already connected");
            return false;
        }
        if self.sessions.len() >= self.ctx.config.max_peers {
            tracing::debug!(%addr, "peer limit reached");
            return false;
        }
        true
    }

    fn register(&mut self, handle: SessionHandle) {
        self.connected_addrs.insert(handle.addr);
        self.sessions.insert(handle.id, handle);
        self.peer_count.store(self.sessions.len(), Ordering::Relaxed);
    }

    fn handle_event(&mut self, event: SessionEvent) -> Result<(), TorrentError> {
        let now = Instant::now();
        let out = &mut self.outbox;

        match event {
            SessionEvent::Handshake {
                id,
                peer_id,
                info_hash,
                reply,
            } => {
                let result = match self.sessions.get(&id) {
                    Some(handle) => self.swarm.admit(id, handle.addr, peer_id, &info_hash),
                    None => Err(PeerError::Rejected("unknown session")),
                };
                if let Err(e) = &result {
                    tracing::debug!(peer = %id, error = %e, "peer refused");
                }
                let _ = reply.send(result);
            }
            SessionEvent::Bitfield { id, bitfield } => self.swarm.peer_bitfield(id, bitfield, now, out),
            SessionEvent::Have { id, piece } => self.swarm.peer_have(id, piece, now, out),
            SessionEvent::Choked { id } => self.swarm.peer_choked(id, now, out),
            SessionEvent::Unchoked { id } => self.swarm.peer_unchoked(id, now, out),
            SessionEvent::Interest { id, interested } => self.swarm.peer_interest(id, interested),
            SessionEvent::Rates {
                id,
                download,
                upload,
            } => self.swarm.peer_rates(id, download, upload),
            SessionEvent::Block { id, block } => {
                if let Some(ready) = self.swarm.block_received(id, block, now, out)? {
                    self.commit_tx
                        .send(ready)
                        .map_err(|_| TorrentError::Shutdown)?;
                }
            }
            SessionEvent::Closed { id, error } => {
                if let Some(handle) = self.sessions.remove(&id) {
                    self.connected_addrs.remove(&handle.addr);
                }
                self.peer_count.store(self.sessions.len(), Ordering::Relaxed);
                self.swarm.peer_closed(id, error.as_ref(), now, out);
            }
        }

        Ok(())
    }

    fn flush(&mut self) {
        for (id, command) in self.outbox.drain(..) {
            if let Some(session) = self.sessions.get(&id) {
                session.send(command);
            }
        }
    }

    async fn teardown(mut self) {
        let released = self.swarm.retire(&mut self.outbox);
        self.flush();
        self.events_rx.close();

        let sessions: Vec<SessionHandle> = self.sessions.drain().map(|(_, s)| s).collect();
        let count = sessions.len();
        futures::future::join_all(sessions.into_iter().map(|s| s.join(SHUTDOWN_GRACE))).await;

        self.peer_count.store(0, Ordering::Relaxed);
        tracing::info!(sessions = count, released, "torrent stopped");
    }
}

/// Verifies and stores pieces one at a time, in arrival order.
async fn commit_worker<T: PieceStore>(
    ctx: Arc<TorrentContext>,
    storage: Arc<T>,
    mut pieces: mpsc::UnboundedReceiver<PieceReady>,
    results: mpsc::UnboundedSender<CommitResult>,
) {
    while let Some(ready) = pieces.recv().await {
        let result = commit(&ctx, storage.as_ref(), ready.piece, ready.data).await;
        let done = CommitResult {
            piece: ready.piece,
            contributors: ready.contributors,
            result,
        };
        if results.send(done).is_err() {
            break;
        }
    }
}

async fn commit<T: PieceStore>(
    ctx: &Arc<TorrentContext>,
    storage: &T,
    piece: u32,
    data: Bytes,
) -> Result<(), TorrentError> {
    let hashed = data.clone();
    let ctx = ctx.clone();
    tokio::task::spawn_blocking(move || ctx.descriptor.verify(piece, &hashed))
        .await
        .map_err(|_| TorrentError::Shutdown)??;

    storage
        .write_piece(piece, data)
        .await
        .map_err(|source| TorrentError::StorageWrite { piece, source })
}
