//! The per-torrent engine: one torrent's pieces, peers, trackers and state.
//!
//! Each torrent runs as its own task. The task first waits for the disk
//! allocation and resume check, then drives everything on a handful of
//! timers and channels: commands from the engine, alerts from the disk
//! task, the announce schedule, peer dialing and the block scheduler.

use std::{
    collections::{BinaryHeap, HashMap},
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};

use tokio::{
    net::TcpStream,
    sync::{
        mpsc::{UnboundedReceiver, UnboundedSender},
        oneshot, OwnedSemaphorePermit,
    },
    time::{interval, timeout},
};
use tokio_util::sync::CancellationToken;

use crate::{
    bitmap::Bitmap,
    conf::{CryptoMode, TorrentConf},
    counter::ThruputCounters,
    disk::{DiskHandle, TorrentAlert, TorrentAlertReceiver, TorrentAlertSender},
    engine::EngineContext,
    error::{Error, Result},
    mse::{self, MseStream},
    peer::{codec::Handshake, PeerHandle, PeerSession, SessionCommand},
    scheduler,
    storage_info::StorageInfo,
    tracker::{Announce, Event, TrackerTier},
    BlockInfo, PeerId, PieceIndex, Sha1Hash, TorrentId,
};

/// How long a TCP connect to a peer may take.
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
/// How long the encrypted handshake may take on outgoing connections.
const CRYPTO_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
/// How often announce schedules are polled. The real cadence comes from the
/// per-tracker intervals.
const ANNOUNCE_POLL: Duration = Duration::from_secs(5);

/// The lifecycle state of a torrent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// On-disk data is being hash checked.
    Checking,
    /// The torrent is incomplete and connected peers are being asked for
    /// missing pieces.
    Downloading,
    /// All pieces verified; the torrent only serves other peers now.
    Seeding,
    /// Nothing is happening; background work is parked.
    Stopped,
    /// The torrent's files are being relocated.
    Moving,
    /// An unrecoverable storage error occurred; see the torrent's error
    /// slot.
    Error,
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            State::Checking => "checking",
            State::Downloading => "downloading",
            State::Seeding => "seeding",
            State::Stopped => "stopped",
            State::Moving => "moving",
            State::Error => "error",
        };
        f.write_str(name)
    }
}

/// The health of one announce URL, as shown on the status surface.
#[derive(Clone, Debug)]
pub struct TrackerStatus {
    pub url: String,
    /// Peers returned by the last successful announce.
    pub peer_count: usize,
    pub last_error: Option<String>,
}

/// A point-in-time snapshot of a torrent for the status surface.
#[derive(Clone, Debug)]
pub struct TorrentStats {
    pub name: String,
    pub tags: Vec<String>,
    pub info_hash: Sha1Hash,
    pub state: State,
    pub piece_count: usize,
    pub pieces_have: usize,
    /// The wire-format view of the verified pieces.
    pub bitfield: Vec<u8>,
    pub downloaded: u64,
    pub uploaded: u64,
    pub corrupted: u64,
    /// Bytes per second, averaged over the last few seconds.
    pub download_rate: u64,
    pub upload_rate: u64,
    pub peer_count: usize,
    pub download_dir: PathBuf,
    pub error: Option<String>,
    /// Per-tracker health, flattened across the announce tiers.
    pub trackers: Vec<TrackerStatus>,
}

pub(crate) type Sender = UnboundedSender<TorrentCommand>;

pub(crate) enum TorrentCommand {
    Start,
    Stop,
    Recheck,
    Move {
        dest: PathBuf,
        tx: oneshot::Sender<Result<()>>,
    },
    /// Queue a peer address for dialing.
    AddPeer(SocketAddr),
    /// Attach an incoming connection whose handshake named this torrent.
    PeerConnected {
        socket: MseStream<TcpStream>,
        addr: SocketAddr,
        handshake: Handshake,
        permit: OwnedSemaphorePermit,
    },
}

/// A piece claimed by the scheduler for one session. Blocks that did not
/// fit the session's request queue wait in `unplaced`.
pub(crate) struct PieceAssignment {
    pub owner: SocketAddr,
    pub unplaced: Vec<BlockInfo>,
}

/// The parts of a torrent shared between its task, its peer sessions, the
/// scheduler and the engine's status surface.
pub(crate) struct TorrentContext {
    pub id: TorrentId,
    pub info_hash: Sha1Hash,
    pub client_id: PeerId,
    pub name: String,
    pub tags: Vec<String>,
    pub storage: StorageInfo,
    /// The verified-and-persisted pieces.
    pub own_pieces: Bitmap,
    pub disk: DiskHandle,
    /// All connected peer sessions. Sessions insert and remove themselves.
    pub peers: RwLock<HashMap<SocketAddr, Arc<PeerHandle>>>,
    /// The scheduler's piece claims, keyed by piece index.
    pub assignments: Mutex<HashMap<PieceIndex, PieceAssignment>>,
    pub counters: ThruputCounters,
    state: RwLock<State>,
    error: Mutex<Option<String>>,
    /// The directory the torrent's data lives under; changes on move.
    pub download_dir: RwLock<PathBuf>,
    /// Tracker health as of the last announce pass.
    tracker_status: Mutex<Vec<TrackerStatus>>,
    /// Cancelled when the torrent is removed; every suspension point in the
    /// torrent's tasks honors it.
    pub cancel: CancellationToken,
    /// Whether pieces are picked sequentially rather than rarest first.
    pub sequential: bool,
}

impl TorrentContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: TorrentId,
        info_hash: Sha1Hash,
        client_id: PeerId,
        name: String,
        tags: Vec<String>,
        storage: StorageInfo,
        disk: DiskHandle,
        sequential: bool,
    ) -> Self {
        let piece_count = storage.piece_count;
        let download_dir = storage.download_dir.clone();
        Self {
            id,
            info_hash,
            client_id,
            name,
            tags,
            storage,
            own_pieces: Bitmap::new(piece_count),
            disk,
            peers: RwLock::new(HashMap::new()),
            assignments: Mutex::new(HashMap::new()),
            counters: ThruputCounters::default(),
            state: RwLock::new(State::Checking),
            error: Mutex::new(None),
            download_dir: RwLock::new(download_dir),
            tracker_status: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            sequential,
        }
    }

    pub fn state(&self) -> State {
        *self.state.read().unwrap()
    }

    pub fn set_state(&self, state: State) {
        let mut slot = self.state.write().unwrap();
        if *slot != state {
            log::info!("torrent {} state: {} -> {}", self.id, *slot, state);
            *slot = state;
        }
    }

    /// Enters the error state; the torrent stops scheduling work and
    /// accepting peers but stays observable.
    pub fn set_error(&self, e: &Error) {
        log::error!("torrent {}: {}", self.id, e);
        *self.error.lock().unwrap() = Some(e.to_string());
        self.set_state(State::Error);
    }

    pub fn error(&self) -> Option<String> {
        self.error.lock().unwrap().clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), State::Downloading | State::Seeding)
    }

    /// The number of content bytes of the verified pieces.
    pub fn completed_bytes(&self) -> u64 {
        let have = self.own_pieces.count() as u64;
        if have == 0 {
            return 0;
        }
        let piece_len = self.storage.piece_len as u64;
        let last_index = self.storage.piece_count - 1;
        if self.own_pieces.get(last_index).unwrap_or_default() {
            (have - 1) * piece_len + self.storage.last_piece_len as u64
        } else {
            have * piece_len
        }
    }

    pub fn register_peer(&self, addr: SocketAddr, handle: Arc<PeerHandle>) {
        self.peers.write().unwrap().insert(addr, handle);
    }

    /// Drops the session's handle from the peer map, unless a newer session
    /// for the same address already replaced it, and frees its piece
    /// claims.
    pub fn remove_peer(&self, addr: SocketAddr, handle: &Arc<PeerHandle>) {
        let mut peers = self.peers.write().unwrap();
        if let Some(current) = peers.get(&addr) {
            if Arc::ptr_eq(current, handle) {
                peers.remove(&addr);
            }
        }
        drop(peers);
        self.assignments
            .lock()
            .unwrap()
            .retain(|_, assignment| assignment.owner != addr);
    }

    /// Returns blocks a session could not (or will not) request to their
    /// piece's assignment so the scheduler can place them again.
    pub fn give_back_blocks(&self, addr: SocketAddr, blocks: &[BlockInfo]) {
        let mut assignments = self.assignments.lock().unwrap();
        for block in blocks {
            if let Some(assignment) = assignments.get_mut(&block.piece_index) {
                if assignment.owner == addr && !assignment.unplaced.contains(block) {
                    assignment.unplaced.push(*block);
                }
            }
        }
    }

    /// Announces a freshly verified piece to every connected session.
    pub fn broadcast_have(&self, index: PieceIndex) {
        for handle in self.peers.read().unwrap().values() {
            let _ = handle.cmd.send(SessionCommand::Have(index));
        }
    }

    /// Withdraws now-stale requests for the piece from all sessions,
    /// following each removal with a best-effort cancel message.
    pub fn cancel_requests_for_piece(&self, index: PieceIndex) {
        for handle in self.peers.read().unwrap().values() {
            let stale: Vec<BlockInfo> = {
                let mut pending = handle.pending.lock().unwrap();
                let stale: Vec<BlockInfo> = pending
                    .iter()
                    .filter(|block| block.piece_index == index)
                    .copied()
                    .collect();
                for block in &stale {
                    pending.remove(block);
                }
                stale
            };
            for block in stale {
                let _ = handle.cmd.send(SessionCommand::Cancel(block));
            }
        }
    }

    pub fn shutdown_sessions(&self) {
        for handle in self.peers.read().unwrap().values() {
            let _ = handle.cmd.send(SessionCommand::Shutdown);
        }
    }

    pub fn stats(&self) -> TorrentStats {
        TorrentStats {
            name: self.name.clone(),
            tags: self.tags.clone(),
            info_hash: self.info_hash,
            state: self.state(),
            piece_count: self.storage.piece_count,
            pieces_have: self.own_pieces.count(),
            bitfield: self.own_pieces.bitfield_bytes(),
            downloaded: self.counters.down.total(),
            uploaded: self.counters.up.total(),
            corrupted: self.counters.corrupted.total(),
            download_rate: self.counters.down.avg(),
            upload_rate: self.counters.up.avg(),
            peer_count: self.peers.read().unwrap().len(),
            download_dir: self.download_dir.read().unwrap().clone(),
            error: self.error(),
            trackers: self.tracker_status.lock().unwrap().clone(),
        }
    }

    fn set_tracker_status(&self, status: Vec<TrackerStatus>) {
        *self.tracker_status.lock().unwrap() = status;
    }
}

/// A dial candidate in the peer pool, ordered by its BEP 40 priority.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct PeerCandidate {
    priority: u32,
    addr: SocketAddr,
}

impl Ord for PeerCandidate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| self.addr.cmp(&other.addr))
    }
}

impl PartialOrd for PeerCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

pub(crate) struct Torrent {
    ctx: Arc<TorrentContext>,
    conf: TorrentConf,
    engine: Arc<EngineContext>,
    trackers: Vec<TrackerTier>,
    /// Peers learned from trackers (or added manually), not yet connected.
    candidates: BinaryHeap<PeerCandidate>,
    cmd_port: UnboundedReceiver<TorrentCommand>,
    alert_chan: TorrentAlertSender,
    alert_port: TorrentAlertReceiver,
    piece_hashes: Vec<Sha1Hash>,
    /// Whether any tracker accepted the `started` event yet.
    sent_started: bool,
    /// Set on completion until a tracker accepts the `completed` event.
    pending_completed: bool,
}

impl Torrent {
    pub fn new(
        ctx: Arc<TorrentContext>,
        conf: TorrentConf,
        engine: Arc<EngineContext>,
        announce_tiers: Vec<Vec<String>>,
        piece_hashes: Vec<Sha1Hash>,
        cmd_port: UnboundedReceiver<TorrentCommand>,
    ) -> Self {
        let (alert_chan, alert_port) = tokio::sync::mpsc::unbounded_channel();
        Self {
            ctx,
            conf,
            engine,
            trackers: announce_tiers.into_iter().map(TrackerTier::new).collect(),
            candidates: BinaryHeap::new(),
            cmd_port,
            alert_chan,
            alert_port,
            piece_hashes,
            sent_started: false,
            pending_completed: false,
        }
    }

    /// The torrent's main task.
    pub async fn run(mut self) {
        if let Err(e) = self.allocate().await {
            self.ctx.set_error(&e);
        }

        let mut tick = interval(Duration::from_secs(1));
        let mut announce_tick = interval(ANNOUNCE_POLL);

        loop {
            tokio::select! {
                _ = self.ctx.cancel.cancelled() => {
                    self.cleanup().await;
                    return;
                }
                Some(cmd) = self.cmd_port.recv() => {
                    self.handle_cmd(cmd).await;
                }
                Some(alert) = self.alert_port.recv() => {
                    self.handle_alert(alert).await;
                }
                _ = tick.tick() => {
                    self.ctx.counters.tick();
                    if self.ctx.is_running() {
                        self.dial_peers();
                        if self.ctx.state() == State::Downloading {
                            scheduler::schedule(&self.ctx);
                        }
                    }
                }
                _ = announce_tick.tick() => {
                    if self.ctx.is_running() {
                        self.announce().await;
                    }
                }
            }
        }
    }

    /// Sets up the torrent on disk and applies the resume check result.
    async fn allocate(&mut self) -> Result<()> {
        debug_assert_eq!(self.ctx.state(), State::Checking);
        let resume = tokio::select! {
            _ = self.ctx.cancel.cancelled() => return Err(Error::Shutdown),
            resume = self.ctx.disk.allocate_new_torrent(
                self.ctx.id,
                self.ctx.storage.clone(),
                self.piece_hashes.clone(),
                self.conf.preallocate,
                self.alert_chan.clone(),
            ) => resume?,
        };
        self.ctx.own_pieces.assign(resume);
        self.enter_running_state();
        Ok(())
    }

    fn enter_running_state(&mut self) {
        if self.ctx.own_pieces.is_complete() {
            self.ctx.set_state(State::Seeding);
        } else {
            self.ctx.set_state(State::Downloading);
        }
    }

    async fn handle_cmd(&mut self, cmd: TorrentCommand) {
        match cmd {
            TorrentCommand::Start => {
                if self.ctx.state() == State::Stopped {
                    self.enter_running_state();
                }
            }
            TorrentCommand::Stop => {
                if self.ctx.is_running() {
                    self.ctx.set_state(State::Stopped);
                    self.ctx.shutdown_sessions();
                    self.announce_event(Event::Stopped).await;
                    self.sent_started = false;
                }
            }
            TorrentCommand::Recheck => {
                if matches!(self.ctx.state(), State::Checking | State::Moving) {
                    return;
                }
                self.ctx.set_state(State::Checking);
                self.ctx.shutdown_sessions();
                self.ctx.own_pieces.clear();
                let checked = tokio::select! {
                    _ = self.ctx.cancel.cancelled() => return,
                    checked = self.ctx.disk.recheck(self.ctx.id) => checked,
                };
                match checked {
                    Ok(pieces) => {
                        self.ctx.own_pieces.assign(pieces);
                        self.enter_running_state();
                    }
                    Err(e) => self.ctx.set_error(&e),
                }
            }
            TorrentCommand::Move { dest, tx } => {
                let result = self.handle_move(dest).await;
                let _ = tx.send(result);
            }
            TorrentCommand::AddPeer(addr) => {
                self.candidates.push(PeerCandidate {
                    priority: self.engine.peer_priority(&addr),
                    addr,
                });
            }
            TorrentCommand::PeerConnected {
                socket,
                addr,
                handshake,
                permit,
            } => {
                self.attach_inbound_peer(socket, addr, handshake, permit);
            }
        }
    }

    async fn handle_move(&mut self, dest: PathBuf) -> Result<()> {
        if !matches!(self.ctx.state(), State::Downloading | State::Seeding | State::Stopped) {
            return Err(Error::Config(format!(
                "cannot move a torrent while {}",
                self.ctx.state()
            )));
        }
        let resume_to = self.ctx.state();
        self.ctx.set_state(State::Moving);
        self.ctx.shutdown_sessions();

        let moved = tokio::select! {
            _ = self.ctx.cancel.cancelled() => return Err(Error::Shutdown),
            moved = self.ctx.disk.move_torrent(self.ctx.id, dest) => moved,
        };
        match moved {
            Ok(new_dir) => {
                *self.ctx.download_dir.write().unwrap() = new_dir;
                self.ctx.set_state(resume_to);
                Ok(())
            }
            Err(e) => {
                self.ctx.set_error(&e);
                Err(e)
            }
        }
    }

    async fn handle_alert(&mut self, alert: TorrentAlert) {
        match alert {
            TorrentAlert::PieceCompletion { index, is_valid } => {
                if is_valid {
                    if self.ctx.own_pieces.set(index).is_err() {
                        return;
                    }
                    self.ctx.assignments.lock().unwrap().remove(&index);
                    // requests for the piece still outstanding on other
                    // sessions are stale now
                    self.ctx.cancel_requests_for_piece(index);
                    self.ctx.broadcast_have(index);
                    log::debug!(
                        "torrent {} piece {} done ({}/{})",
                        self.ctx.id,
                        index,
                        self.ctx.own_pieces.count(),
                        self.ctx.storage.piece_count
                    );
                    if self.ctx.own_pieces.is_complete()
                        && self.ctx.state() == State::Downloading
                    {
                        log::info!("torrent {} complete, seeding", self.ctx.id);
                        self.ctx.set_state(State::Seeding);
                        self.pending_completed = true;
                        self.announce().await;
                    }
                } else {
                    // the piece's assembly was discarded; the scheduler will
                    // pick it again. Who contributed bad data is not tracked.
                    let piece_len = self
                        .ctx
                        .storage
                        .piece_len(index)
                        .unwrap_or(self.ctx.storage.piece_len);
                    self.ctx.counters.corrupted.add(piece_len as u64);
                    self.ctx.assignments.lock().unwrap().remove(&index);
                }
            }
            TorrentAlert::StorageError(e) => {
                self.ctx.set_error(&e);
                self.ctx.shutdown_sessions();
            }
        }
    }

    /// Announces to every tier whose schedule is due, with the bookkeeping
    /// for the started/completed events.
    async fn announce(&mut self) {
        let event = if !self.sent_started {
            Some(Event::Started)
        } else if self.pending_completed {
            Some(Event::Completed)
        } else {
            None
        };

        let params = self.announce_params(event);
        let mut any_success = false;
        for tier in &mut self.trackers {
            if let Some(addrs) = tier.announce(&self.engine.http, &params).await {
                any_success = true;
                for addr in addrs {
                    self.candidates.push(PeerCandidate {
                        priority: self.engine.peer_priority(&addr),
                        addr,
                    });
                }
            }
        }
        if any_success {
            match event {
                Some(Event::Started) => self.sent_started = true,
                Some(Event::Completed) => self.pending_completed = false,
                _ => {}
            }
        }

        let status: Vec<TrackerStatus> = self
            .trackers
            .iter()
            .flat_map(|tier| tier.trackers.iter())
            .map(|tracker| TrackerStatus {
                url: tracker.url().to_string(),
                peer_count: tracker.peer_count,
                last_error: tracker.last_error.clone(),
            })
            .collect();
        self.ctx.set_tracker_status(status);
    }

    /// Sends a one-off event announce to every tier, best effort.
    async fn announce_event(&mut self, event: Event) {
        let params = self.announce_params(Some(event));
        for tier in &self.trackers {
            tier.announce_stop(&self.engine.http, &params).await;
        }
    }

    fn announce_params(&self, event: Option<Event>) -> Announce {
        Announce {
            info_hash: self.ctx.info_hash,
            peer_id: self.ctx.client_id,
            port: self.engine.listen_port,
            downloaded: self.ctx.counters.down.total(),
            uploaded: self.ctx.counters.up.total(),
            left: self
                .ctx
                .storage
                .download_len
                .saturating_sub(self.ctx.completed_bytes()),
            event,
        }
    }

    /// Pops candidates off the peer pool and dials them until the torrent's
    /// peer limit or the global connection semaphore pushes back.
    fn dial_peers(&mut self) {
        let connected = self.ctx.peers.read().unwrap().len();
        let mut slots = self
            .conf
            .max_connected_peer_count
            .saturating_sub(connected);

        while slots > 0 {
            let candidate = match self.candidates.pop() {
                Some(candidate) => candidate,
                None => return,
            };
            if self.ctx.peers.read().unwrap().contains_key(&candidate.addr) {
                continue;
            }
            if self.engine.should_skip_dial(&candidate.addr) {
                continue;
            }
            let permit = match Arc::clone(&self.engine.sem).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    // no global slots; try again once sessions close
                    self.candidates.push(candidate);
                    return;
                }
            };
            slots -= 1;

            let ctx = Arc::clone(&self.ctx);
            let engine = Arc::clone(&self.engine);
            tokio::spawn(async move {
                dial_peer(ctx, engine, candidate.addr, permit).await;
            });
        }
    }

    fn attach_inbound_peer(
        &mut self,
        socket: MseStream<TcpStream>,
        addr: SocketAddr,
        handshake: Handshake,
        permit: OwnedSemaphorePermit,
    ) {
        if !self.ctx.is_running() {
            log::debug!(
                "torrent {} is {}, rejecting peer {}",
                self.ctx.id,
                self.ctx.state(),
                addr
            );
            return;
        }
        if self.ctx.peers.read().unwrap().len() >= self.conf.max_connected_peer_count {
            log::debug!("torrent {} peer limit reached, rejecting {}", self.ctx.id, addr);
            return;
        }
        let (session, _handle) = PeerSession::new(Arc::clone(&self.ctx), addr, permit);
        tokio::spawn(session.start_inbound(socket, handshake));
    }

    /// Runs when the torrent is removed or the engine shuts down.
    async fn cleanup(&mut self) {
        log::info!("torrent {} shutting down", self.ctx.id);
        self.ctx.shutdown_sessions();
        if self.sent_started {
            self.announce_event(Event::Stopped).await;
        }
        let _ = self.ctx.disk.remove_torrent(self.ctx.id);
    }
}

/// Dials, optionally encrypts and runs one outbound peer connection,
/// recording the outcome for the engine's attempt cache.
async fn dial_peer(
    ctx: Arc<TorrentContext>,
    engine: Arc<EngineContext>,
    addr: SocketAddr,
    permit: OwnedSemaphorePermit,
) {
    log::debug!("dialing peer {}", addr);
    let stream = match timeout(DIAL_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            log::debug!("failed to connect to {}: {}", addr, e);
            engine.record_dial_error(addr);
            return;
        }
        Err(_) => {
            log::debug!("connecting to {} timed out", addr);
            engine.record_dial_timeout(addr);
            return;
        }
    };

    let socket = if engine.crypto == CryptoMode::Disable {
        MseStream::plaintext(stream)
    } else {
        match timeout(
            CRYPTO_HANDSHAKE_TIMEOUT,
            mse::initiate(stream, &ctx.info_hash, engine.crypto),
        )
        .await
        {
            Ok(Ok(socket)) => socket,
            Ok(Err(e)) => {
                log::debug!("encryption handshake with {} failed: {}", addr, e);
                engine.record_dial_error(addr);
                return;
            }
            Err(_) => {
                log::debug!("encryption handshake with {} timed out", addr);
                engine.record_dial_timeout(addr);
                return;
            }
        }
    };

    engine.record_dial_success(addr);
    let (session, _handle) = PeerSession::new(ctx, addr, permit);
    session.start_outbound(socket).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        disk::Command as DiskCommand,
        peer::PeerHandle,
        storage_info::FileInfo,
        Bitfield, BLOCK_LEN,
    };
    use tokio::sync::mpsc;

    fn test_storage(piece_count: usize, piece_len: u32, last_piece_len: u32) -> StorageInfo {
        let download_len =
            piece_len as u64 * (piece_count as u64 - 1) + last_piece_len as u64;
        StorageInfo {
            piece_count,
            piece_len,
            last_piece_len,
            download_len,
            download_dir: PathBuf::from("/nonexistent"),
            files: vec![FileInfo {
                path: PathBuf::from("data"),
                len: download_len,
                torrent_offset: 0,
            }],
            is_archive: false,
        }
    }

    fn test_ctx(
        storage: StorageInfo,
    ) -> (Arc<TorrentContext>, mpsc::UnboundedReceiver<DiskCommand>) {
        let (disk_chan, disk_port) = mpsc::unbounded_channel();
        let ctx = Arc::new(TorrentContext::new(
            0,
            [0xab; 20],
            *b"-TY0100-aaaaaaaaaaaa",
            "test".into(),
            Vec::new(),
            storage,
            DiskHandle(disk_chan),
            false,
        ));
        (ctx, disk_port)
    }

    fn test_torrent(ctx: Arc<TorrentContext>, tiers: Vec<Vec<String>>) -> Torrent {
        let piece_count = ctx.storage.piece_count;
        // commands are injected by calling the handlers directly
        let (_cmd_chan, cmd_port) = mpsc::unbounded_channel();
        let engine = Arc::new(EngineContext::new(
            crate::gen_peer_id(),
            50_413,
            CryptoMode::Disable,
            8,
            reqwest::Client::new(),
            None,
            None,
        ));
        Torrent::new(
            ctx,
            TorrentConf::new("/nonexistent"),
            engine,
            tiers,
            vec![[0u8; 20]; piece_count],
            cmd_port,
        )
    }

    fn peer(
        ctx: &TorrentContext,
        addr: &str,
    ) -> (SocketAddr, Arc<PeerHandle>, mpsc::UnboundedReceiver<SessionCommand>) {
        let addr: SocketAddr = addr.parse().unwrap();
        let (cmd, cmd_port) = mpsc::unbounded_channel();
        let handle = Arc::new(PeerHandle::new(cmd, ctx.storage.piece_count));
        ctx.register_peer(addr, Arc::clone(&handle));
        (addr, handle, cmd_port)
    }

    fn block(piece_index: PieceIndex, offset: u32) -> BlockInfo {
        BlockInfo {
            piece_index,
            offset,
            len: BLOCK_LEN,
        }
    }

    #[test]
    fn test_completed_bytes_counts_the_last_piece_short() {
        // 3 pieces of 4 bytes, except the last one which is 2
        let (ctx, _disk) = test_ctx(test_storage(3, 4, 2));
        assert_eq!(ctx.completed_bytes(), 0);

        ctx.own_pieces.set(0).unwrap();
        ctx.own_pieces.set(1).unwrap();
        assert_eq!(ctx.completed_bytes(), 8);

        ctx.own_pieces.set(2).unwrap();
        assert_eq!(ctx.completed_bytes(), 10);

        // only the short last piece
        let (ctx, _disk) = test_ctx(test_storage(3, 4, 2));
        ctx.own_pieces.set(2).unwrap();
        assert_eq!(ctx.completed_bytes(), 2);
    }

    #[test]
    fn test_peer_candidates_pop_by_priority_then_addr() {
        let mut heap = BinaryHeap::new();
        for (priority, addr) in [
            (1, "10.0.0.1:1"),
            (9, "10.0.0.2:1"),
            (9, "10.0.0.3:1"),
        ] {
            heap.push(PeerCandidate {
                priority,
                addr: addr.parse().unwrap(),
            });
        }

        let order: Vec<PeerCandidate> = std::iter::from_fn(|| heap.pop()).collect();
        assert_eq!(order[0].priority, 9);
        assert_eq!(order[0].addr, "10.0.0.3:1".parse::<SocketAddr>().unwrap());
        assert_eq!(order[1].priority, 9);
        assert_eq!(order[1].addr, "10.0.0.2:1".parse::<SocketAddr>().unwrap());
        assert_eq!(order[2].priority, 1);
    }

    #[test]
    fn test_give_back_blocks_only_to_the_owner() {
        let (ctx, _disk) = test_ctx(test_storage(4, 2 * BLOCK_LEN, 2 * BLOCK_LEN));
        let owner: SocketAddr = "10.0.0.1:1".parse().unwrap();
        let stranger: SocketAddr = "10.0.0.2:1".parse().unwrap();
        ctx.assignments.lock().unwrap().insert(
            1,
            PieceAssignment {
                owner,
                unplaced: Vec::new(),
            },
        );

        // another session's blocks don't end up in the owner's assignment
        ctx.give_back_blocks(stranger, &[block(1, 0)]);
        assert!(ctx.assignments.lock().unwrap()[&1].unplaced.is_empty());

        ctx.give_back_blocks(owner, &[block(1, 0)]);
        assert_eq!(
            ctx.assignments.lock().unwrap()[&1].unplaced,
            vec![block(1, 0)]
        );

        // giving the same block back twice doesn't duplicate it
        ctx.give_back_blocks(owner, &[block(1, 0)]);
        assert_eq!(ctx.assignments.lock().unwrap()[&1].unplaced.len(), 1);

        // blocks of unclaimed pieces are simply dropped
        ctx.give_back_blocks(owner, &[block(2, 0)]);
        assert!(!ctx.assignments.lock().unwrap().contains_key(&2));
    }

    #[test]
    fn test_cancel_requests_for_piece_notifies_all_sessions() {
        let (ctx, _disk) = test_ctx(test_storage(4, 2 * BLOCK_LEN, 2 * BLOCK_LEN));
        let (_, first, mut first_port) = peer(&ctx, "10.0.0.1:1");
        let (_, second, mut second_port) = peer(&ctx, "10.0.0.2:1");
        first.pending.lock().unwrap().extend([block(1, 0), block(2, 0)]);
        second
            .pending
            .lock()
            .unwrap()
            .insert(block(1, BLOCK_LEN));

        ctx.cancel_requests_for_piece(1);

        let first_pending = first.pending.lock().unwrap().clone();
        assert_eq!(first_pending.len(), 1);
        assert!(first_pending.contains(&block(2, 0)));
        assert!(second.pending.lock().unwrap().is_empty());

        match first_port.try_recv().unwrap() {
            SessionCommand::Cancel(cancelled) => assert_eq!(cancelled, block(1, 0)),
            _ => panic!("expected a cancel"),
        }
        match second_port.try_recv().unwrap() {
            SessionCommand::Cancel(cancelled) => {
                assert_eq!(cancelled, block(1, BLOCK_LEN))
            }
            _ => panic!("expected a cancel"),
        }
        // piece 2's request was left alone
        assert!(first_port.try_recv().is_err());
    }

    #[test]
    fn test_broadcast_have_reaches_every_session() {
        let (ctx, _disk) = test_ctx(test_storage(4, 2 * BLOCK_LEN, 2 * BLOCK_LEN));
        let (_, _first, mut first_port) = peer(&ctx, "10.0.0.1:1");
        let (_, _second, mut second_port) = peer(&ctx, "10.0.0.2:1");

        ctx.broadcast_have(3);

        for port in [&mut first_port, &mut second_port] {
            match port.try_recv().unwrap() {
                SessionCommand::Have(index) => assert_eq!(index, 3),
                _ => panic!("expected a have"),
            }
        }
    }

    #[tokio::test]
    async fn test_move_is_rejected_while_checking() {
        let (ctx, mut disk_port) = test_ctx(test_storage(1, BLOCK_LEN, BLOCK_LEN));
        let mut torrent = test_torrent(Arc::clone(&ctx), Vec::new());
        assert_eq!(ctx.state(), State::Checking);

        let result = torrent.handle_move(PathBuf::from("/new/base")).await;
        assert!(matches!(result, Err(Error::Config(_))));
        assert_eq!(ctx.state(), State::Checking);
        // the disk task was never asked to do anything
        assert!(disk_port.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_move_updates_dir_and_restores_state() {
        let (ctx, mut disk_port) = test_ctx(test_storage(1, BLOCK_LEN, BLOCK_LEN));
        let mut torrent = test_torrent(Arc::clone(&ctx), Vec::new());
        ctx.set_state(State::Stopped);

        let ctx_mid_move = Arc::clone(&ctx);
        let responder = tokio::spawn(async move {
            match disk_port.recv().await.expect("a move command") {
                DiskCommand::Move { dest, tx, .. } => {
                    // the torrent is parked while its files are in motion
                    assert_eq!(ctx_mid_move.state(), State::Moving);
                    let _ = tx.send(Ok(dest));
                }
                _ => panic!("expected a move command"),
            }
        });

        torrent
            .handle_move(PathBuf::from("/new/base"))
            .await
            .unwrap();
        responder.await.unwrap();

        assert_eq!(
            *ctx.download_dir.read().unwrap(),
            PathBuf::from("/new/base")
        );
        assert_eq!(ctx.state(), State::Stopped);
    }

    #[tokio::test]
    async fn test_recheck_is_ignored_while_checking() {
        let (ctx, mut disk_port) = test_ctx(test_storage(1, BLOCK_LEN, BLOCK_LEN));
        let mut torrent = test_torrent(Arc::clone(&ctx), Vec::new());
        assert_eq!(ctx.state(), State::Checking);

        torrent.handle_cmd(TorrentCommand::Recheck).await;
        assert_eq!(ctx.state(), State::Checking);
        assert!(disk_port.try_recv().is_err());

        // same while the files are being moved
        ctx.set_state(State::Moving);
        torrent.handle_cmd(TorrentCommand::Recheck).await;
        assert_eq!(ctx.state(), State::Moving);
        assert!(disk_port.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_recheck_rebuilds_the_bitmap() {
        let (ctx, mut disk_port) = test_ctx(test_storage(2, BLOCK_LEN, BLOCK_LEN));
        let mut torrent = test_torrent(Arc::clone(&ctx), Vec::new());
        ctx.set_state(State::Downloading);
        ctx.own_pieces.set(0).unwrap();

        let responder = tokio::spawn(async move {
            match disk_port.recv().await.expect("a recheck command") {
                DiskCommand::Recheck { tx, .. } => {
                    let _ = tx.send(Ok(Bitfield::repeat(true, 2)));
                }
                _ => panic!("expected a recheck command"),
            }
        });

        torrent.handle_cmd(TorrentCommand::Recheck).await;
        responder.await.unwrap();

        assert!(ctx.own_pieces.is_complete());
        assert_eq!(ctx.state(), State::Seeding);
    }

    #[tokio::test]
    async fn test_announce_event_sequencing() {
        let mut server = mockito::Server::new_async().await;
        let plain_body = b"d8:intervali0e5:peers0:e".to_vec();
        let started_body =
            b"d8:intervali0e5:peers6:\x7f\x00\x00\x01\x1a\xe1e".to_vec();
        // the catch-all is created first so the event mocks match first
        let plain = server
            .mock("GET", mockito::Matcher::Regex("^/announce".into()))
            .with_body(plain_body.clone())
            .expect_at_least(1)
            .create_async()
            .await;
        let started = server
            .mock("GET", mockito::Matcher::Regex("^/announce".into()))
            .match_query(mockito::Matcher::UrlEncoded(
                "event".into(),
                "started".into(),
            ))
            .with_body(started_body)
            .expect(1)
            .create_async()
            .await;
        let completed = server
            .mock("GET", mockito::Matcher::Regex("^/announce".into()))
            .match_query(mockito::Matcher::UrlEncoded(
                "event".into(),
                "completed".into(),
            ))
            .with_body(plain_body)
            .expect(1)
            .create_async()
            .await;

        let (ctx, _disk) = test_ctx(test_storage(1, BLOCK_LEN, BLOCK_LEN));
        let mut torrent = test_torrent(
            Arc::clone(&ctx),
            vec![vec![format!("{}/announce", server.url())]],
        );

        // the first announce carries `started` and feeds the peer pool
        torrent.announce().await;
        assert!(torrent.sent_started);
        assert_eq!(torrent.candidates.len(), 1);

        // completion is announced once and then cleared
        torrent.pending_completed = true;
        torrent.announce().await;
        assert!(!torrent.pending_completed);

        // steady-state announces carry no event at all
        torrent.announce().await;

        started.assert_async().await;
        completed.assert_async().await;
        plain.assert_async().await;
    }
}
