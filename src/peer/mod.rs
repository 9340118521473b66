pub(crate) mod codec;

use std::{
    collections::HashSet,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use futures::{SinkExt, StreamExt};
use tokio::{
    net::TcpStream,
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        OwnedSemaphorePermit,
    },
    time::{interval, timeout},
};
use tokio_util::codec::{Framed, FramedParts};

use crate::{
    bitmap::Bitmap,
    error::{Error, Result},
    mse::MseStream,
    torrent::TorrentContext,
    Bitfield, BlockInfo, PieceIndex, MAX_REQUEST_LEN,
};
use codec::{
    ExtendedHandshake, Handshake, HandshakeCodec, Message, PeerCodec, EXTENDED_HANDSHAKE_ID,
};

/// The cap on our outstanding requests to a single peer; a peer advertising
/// a smaller queue through the extension handshake lowers it.
pub(crate) const MAX_REQUEST_QUEUE_LEN: usize = 250;

/// The peer has to send something within this window or the session is
/// considered dead.
const READ_TIMEOUT: Duration = Duration::from_secs(4 * 60);
/// A single message write must complete within this window.
const WRITE_TIMEOUT: Duration = Duration::from_secs(3 * 60);
/// A keep-alive is sent when nothing was written for this long.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(2 * 60);
/// How long the handshake roundtrip may take.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// The channel on which the torrent and the disk task send commands to the
/// session.
pub(crate) type Sender = UnboundedSender<SessionCommand>;
type Receiver = UnboundedReceiver<SessionCommand>;

pub(crate) enum SessionCommand {
    /// Send these block requests. The scheduler has already placed them in
    /// the session's pending set.
    Request(Vec<BlockInfo>),
    /// Announce a completed piece to the peer.
    Have(PieceIndex),
    /// Withdraw an outstanding request, best effort.
    Cancel(BlockInfo),
    /// A block read from disk, to be served in response to a peer request.
    Block { info: BlockInfo, data: Vec<u8> },
    /// Close the connection.
    Shutdown,
}

/// The shared view of a connected peer: what it has, what we asked of it
/// and how to talk to its session. Registered in the torrent's peer map and
/// read by the scheduler.
pub(crate) struct PeerHandle {
    pub cmd: Sender,
    /// The pieces the peer claims to have.
    pub pieces: Bitmap,
    /// Whether the peer is choking us (initially true).
    pub peer_choking: AtomicBool,
    /// Whether the peer wants our pieces.
    pub peer_interested: AtomicBool,
    /// The requests we sent to this peer that have not been answered.
    pub pending: Mutex<HashSet<BlockInfo>>,
    /// How many outstanding requests the peer accepts.
    pub request_queue_len: AtomicUsize,
    /// The peer's user agent, when it told us through the extension
    /// protocol.
    pub client: Mutex<Option<String>>,
}

impl PeerHandle {
    pub(crate) fn new(cmd: Sender, piece_count: usize) -> Self {
        Self {
            cmd,
            pieces: Bitmap::new(piece_count),
            peer_choking: AtomicBool::new(true),
            peer_interested: AtomicBool::new(false),
            pending: Mutex::new(HashSet::new()),
            request_queue_len: AtomicUsize::new(MAX_REQUEST_QUEUE_LEN),
            client: Mutex::new(None),
        }
    }

    pub fn is_choking_us(&self) -> bool {
        self.peer_choking.load(Ordering::Relaxed)
    }
}

/// At any given time, a connection with a peer is in one of the below
/// states.
#[derive(Clone, Copy, Debug, PartialEq)]
enum Phase {
    /// The BitTorrent handshakes are being exchanged.
    Handshaking,
    /// The handshakes are done; the peer's first message decides its piece
    /// set. A bitfield is only valid here.
    BitfieldExchange,
    /// The normal state of a session, in which any message but a bitfield
    /// may be exchanged.
    Steady,
    /// The connection is closed or about to be.
    Disconnected,
}

pub(crate) struct PeerSession {
    torrent: Arc<TorrentContext>,
    /// The session's entry in the torrent's peer map.
    handle: Arc<PeerHandle>,
    cmd_port: Receiver,
    addr: SocketAddr,
    phase: Phase,
    /// Whether we are letting the peer download from us (initially not).
    am_choking: bool,
    /// Whether the peer has a piece we lack.
    am_interested: bool,
    /// Whether both sides advertised the Fast Extension.
    fast: bool,
    /// Whether both sides advertised the extension protocol.
    extended: bool,
    /// The peer's DHT port, if it sent one. Recorded only.
    dht_port: Option<u16>,
    last_send: Instant,
    last_recv: Instant,
    /// Holds the global connection slot until the session is dropped.
    _permit: OwnedSemaphorePermit,
}

impl PeerSession {
    /// Creates a session and its shared handle. The handle is registered in
    /// the torrent's peer map so the torrent immediately counts the
    /// connection.
    pub fn new(
        torrent: Arc<TorrentContext>,
        addr: SocketAddr,
        permit: OwnedSemaphorePermit,
    ) -> (Self, Arc<PeerHandle>) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        let handle = Arc::new(PeerHandle::new(
            cmd_chan,
            torrent.storage.piece_count,
        ));
        let session = Self {
            torrent,
            handle: Arc::clone(&handle),
            cmd_port,
            addr,
            phase: Phase::Handshaking,
            am_choking: true,
            am_interested: false,
            fast: false,
            extended: false,
            dht_port: None,
            last_send: Instant::now(),
            last_recv: Instant::now(),
            _permit: permit,
        };
        (session, handle)
    }

    /// Runs an outbound session on a freshly established connection: sends
    /// our handshake, waits for the peer's, then enters the message loop.
    pub async fn start_outbound(mut self, socket: MseStream<TcpStream>) {
        log::info!("starting outbound session with {}", self.addr);
        let result = self.handshake_and_run(socket, None).await;
        self.close(result);
    }

    /// Runs an inbound session; the peer's handshake was already consumed
    /// by the engine to route the connection here.
    pub async fn start_inbound(
        mut self,
        socket: MseStream<TcpStream>,
        peer_handshake: Handshake,
    ) {
        log::info!("starting inbound session with {}", self.addr);
        let result = self.handshake_and_run(socket, Some(peer_handshake)).await;
        self.close(result);
    }

    async fn handshake_and_run(
        &mut self,
        socket: MseStream<TcpStream>,
        peer_handshake: Option<Handshake>,
    ) -> Result<()> {
        let mut socket = Framed::new(socket, HandshakeCodec);

        let ours = Handshake::new(self.torrent.info_hash, self.torrent.client_id);
        socket.send(ours).await?;

        let theirs = match peer_handshake {
            Some(handshake) => handshake,
            None => {
                let handshake = timeout(HANDSHAKE_TIMEOUT, socket.next())
                    .await?
                    .ok_or(Error::HandshakeMismatch)??;
                if handshake.info_hash != self.torrent.info_hash {
                    log::info!("peer {} handshake has wrong info hash", self.addr);
                    return Err(Error::InfoHashUnknown);
                }
                handshake
            }
        };
        log::debug!("peer {} handshake: {:?}", self.addr, theirs);

        self.fast = theirs.supports_fast();
        self.extended = theirs.supports_extension_protocol();

        // switch to the message codec, keeping the buffers as the peer may
        // have pipelined messages right after its handshake
        let old_parts = socket.into_parts();
        let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let mut socket = Framed::from_parts(new_parts);

        self.phase = Phase::BitfieldExchange;
        self.register();

        self.send_initial_piece_set(&mut socket).await?;
        if self.extended {
            let payload = serde_bencode::to_bytes(&ExtendedHandshake::ours())?;
            self.send(
                &mut socket,
                Message::Extended {
                    id: EXTENDED_HANDSHAKE_ID,
                    payload,
                },
            )
            .await?;
        }

        self.run(&mut socket).await
    }

    /// Announces our piece set right after the handshake: `HaveAll` or
    /// `HaveNone` when the Fast Extension is mutual, a plain bitfield
    /// otherwise.
    async fn send_initial_piece_set(
        &mut self,
        socket: &mut Framed<MseStream<TcpStream>, PeerCodec>,
    ) -> Result<()> {
        let own = &self.torrent.own_pieces;
        let msg = if self.fast && own.is_complete() {
            Message::HaveAll
        } else if self.fast && own.is_empty() {
            Message::HaveNone
        } else {
            Message::Bitfield(Bitfield::from_vec(own.bitfield_bytes()))
        };
        self.send(socket, msg).await
    }

    /// The main message loop: peer messages, commands from the torrent and
    /// the disk task, and the once-a-second deadline tick.
    async fn run(
        &mut self,
        socket: &mut Framed<MseStream<TcpStream>, PeerCodec>,
    ) -> Result<()> {
        let mut tick = interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                maybe_msg = socket.next() => {
                    let msg = match maybe_msg {
                        Some(msg) => msg?,
                        None => {
                            log::info!("peer {} closed the connection", self.addr);
                            return Ok(());
                        }
                    };
                    self.last_recv = Instant::now();
                    self.handle_msg(socket, msg).await?;
                }
                maybe_cmd = self.cmd_port.recv() => {
                    let cmd = maybe_cmd.ok_or(Error::Shutdown)?;
                    if !self.handle_cmd(socket, cmd).await? {
                        return Ok(());
                    }
                }
                _ = tick.tick() => {
                    if self.last_recv.elapsed() > READ_TIMEOUT {
                        log::info!("peer {} timed out", self.addr);
                        return Err(Error::Timeout);
                    }
                    if self.last_send.elapsed() > KEEP_ALIVE_INTERVAL {
                        self.send(socket, Message::KeepAlive).await?;
                    }
                }
                _ = self.torrent.cancel.cancelled() => {
                    return Ok(());
                }
            }
        }
    }

    async fn handle_msg(
        &mut self,
        socket: &mut Framed<MseStream<TcpStream>, PeerCodec>,
        msg: Message,
    ) -> Result<()> {
        // a bitfield is only valid as the very first message after the
        // handshake
        let first = self.phase == Phase::BitfieldExchange;
        if first {
            self.phase = Phase::Steady;
        }

        match msg {
            Message::KeepAlive => {}
            Message::Bitfield(bitfield) => {
                if !first {
                    log::warn!("peer {} sent a bitfield mid-session", self.addr);
                    return Err(Error::ProtocolViolation);
                }
                return self.handle_bitfield(socket, bitfield).await;
            }
            Message::Choke => {
                if !self.handle.is_choking_us() {
                    log::debug!("peer {} choked us", self.addr);
                    self.handle.peer_choking.store(true, Ordering::Relaxed);
                    // outstanding requests won't be answered while choked
                    let unanswered: Vec<BlockInfo> =
                        self.handle.pending.lock().unwrap().drain().collect();
                    self.torrent.give_back_blocks(self.addr, &unanswered);
                }
            }
            Message::Unchoke => {
                if self.handle.is_choking_us() {
                    log::debug!("peer {} unchoked us", self.addr);
                    self.handle.peer_choking.store(false, Ordering::Relaxed);
                    // the scheduler picks this up on its next pass
                }
            }
            Message::Interested => {
                if !self.handle.peer_interested.swap(true, Ordering::Relaxed)
                {
                    log::debug!("peer {} is interested", self.addr);
                    // reciprocal unchoke; there is no rotation policy
                    if self.am_choking {
                        self.am_choking = false;
                        self.send(socket, Message::Unchoke).await?;
                    }
                }
            }
            Message::NotInterested => {
                if self.handle.peer_interested.swap(false, Ordering::Relaxed)
                {
                    log::debug!("peer {} is no longer interested", self.addr);
                    if !self.am_choking {
                        self.am_choking = true;
                        self.send(socket, Message::Choke).await?;
                    }
                }
            }
            Message::Have { piece_index } => {
                if self.handle.pieces.set(piece_index).is_err() {
                    return Err(Error::ProtocolViolation);
                }
                self.update_interest(socket).await?;
            }
            Message::HaveAll => {
                self.handle.pieces.fill();
                self.update_interest(socket).await?;
            }
            Message::HaveNone => {
                self.handle.pieces.clear();
                self.update_interest(socket).await?;
            }
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                self.handle_block(piece_index, offset, data)?;
            }
            Message::Request(block) => {
                self.handle_request(socket, block).await?;
            }
            Message::Cancel(block) => {
                // reads are dispatched to the disk task immediately, so
                // there is no queue to cancel from; the loss is acceptable
                log::trace!("peer {} cancelled {}", self.addr, block);
            }
            Message::Reject(block) => {
                // semantically cancels our matching pending request
                if self.handle.pending.lock().unwrap().remove(&block) {
                    self.torrent.give_back_blocks(self.addr, &[block]);
                } else {
                    log::debug!("peer {} rejected unknown request {}", self.addr, block);
                }
            }
            Message::Suggest { piece_index } => {
                log::trace!("peer {} suggests piece {}", self.addr, piece_index);
            }
            Message::AllowedFast { piece_index } => {
                log::trace!("peer {} allows fast piece {}", self.addr, piece_index);
            }
            Message::Port(port) => {
                if self.dht_port != Some(port) {
                    log::trace!("peer {} has a dht node on port {}", self.addr, port);
                    self.dht_port = Some(port);
                }
            }
            Message::Extended { id, payload } => {
                if id == EXTENDED_HANDSHAKE_ID {
                    self.handle_extended_handshake(&payload);
                } else {
                    log::trace!("peer {} sent extended message {}", self.addr, id);
                }
            }
            Message::Unknown { id } => {
                log::trace!("peer {} sent unknown message id {}", self.addr, id);
            }
        }
        Ok(())
    }

    async fn handle_bitfield(
        &mut self,
        socket: &mut Framed<MseStream<TcpStream>, PeerCodec>,
        bitfield: Bitfield,
    ) -> Result<()> {
        let piece_count = self.torrent.storage.piece_count;
        let expected = (piece_count + 7) / 8;
        let actual = bitfield.len() / 8;
        if actual != expected {
            log::warn!(
                "peer {} bitfield is {} bytes, expected {}",
                self.addr,
                actual,
                expected
            );
            return Err(Error::BitfieldSizeMismatch { expected, actual });
        }

        let mut bitfield = bitfield;
        bitfield.truncate(piece_count);
        self.handle.pieces.assign(bitfield);
        log::debug!(
            "peer {} has {}/{} pieces",
            self.addr,
            self.handle.pieces.count(),
            piece_count
        );
        self.update_interest(socket).await
    }

    /// Registers an incoming block against our pending requests and hands
    /// it to the disk task for assembly.
    fn handle_block(
        &mut self,
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    ) -> Result<()> {
        let info = BlockInfo {
            piece_index,
            offset,
            len: data.len() as u32,
        };
        if !self.handle.pending.lock().unwrap().remove(&info) {
            // blocks we didn't ask for are dropped; a peer could otherwise
            // feed us garbage for pieces we never scheduled
            log::warn!("peer {} sent unrequested block {}", self.addr, info);
            return Ok(());
        }

        self.torrent.counters.down.add(info.len as u64);
        self.torrent.disk.write_block(self.torrent.id, info, data)?;
        Ok(())
    }

    /// Answers a peer's block request if we are allowed and able to.
    async fn handle_request(
        &mut self,
        socket: &mut Framed<MseStream<TcpStream>, PeerCodec>,
        block: BlockInfo,
    ) -> Result<()> {
        if block.len > MAX_REQUEST_LEN {
            log::warn!("peer {} requested {} bytes", self.addr, block.len);
            return Err(Error::ProtocolViolation);
        }

        let valid = match self.torrent.storage.piece_len(block.piece_index) {
            Ok(piece_len) => block.offset.saturating_add(block.len) <= piece_len,
            Err(_) => false,
        };
        if !valid {
            log::warn!("peer {} requested invalid block {}", self.addr, block);
            return Err(Error::ProtocolViolation);
        }

        let have = self
            .torrent
            .own_pieces
            .get(block.piece_index)
            .unwrap_or_default();
        if self.am_choking || !have {
            if self.fast {
                self.send(socket, Message::Reject(block)).await?;
            }
            return Ok(());
        }

        // the disk task sends the block bytes back through our command
        // channel once read
        self.torrent
            .disk
            .read_block(self.torrent.id, block, self.handle.cmd.clone())?;
        Ok(())
    }

    fn handle_extended_handshake(&mut self, payload: &[u8]) {
        match serde_bencode::from_bytes::<ExtendedHandshake>(payload) {
            Ok(theirs) => {
                if let Some(reqq) = theirs.reqq {
                    let cap = (reqq as usize).min(MAX_REQUEST_QUEUE_LEN).max(1);
                    self.handle.request_queue_len.store(cap, Ordering::Relaxed);
                }
                if let Some(v) = theirs.v {
                    log::debug!("peer {} client: {}", self.addr, v);
                    *self.handle.client.lock().unwrap() = Some(v);
                }
            }
            Err(e) => {
                log::debug!("peer {} extended handshake undecodable: {}", self.addr, e);
            }
        }
    }

    /// Handles a command from the torrent or the disk task. Returns false
    /// when the session should shut down.
    async fn handle_cmd(
        &mut self,
        socket: &mut Framed<MseStream<TcpStream>, PeerCodec>,
        cmd: SessionCommand,
    ) -> Result<bool> {
        match cmd {
            SessionCommand::Request(blocks) => {
                if self.handle.is_choking_us() {
                    // the choke arrived between the scheduler's check and
                    // now; give the blocks back instead of wasting them
                    let mut pending = self.handle.pending.lock().unwrap();
                    for block in &blocks {
                        pending.remove(block);
                    }
                    drop(pending);
                    self.torrent.give_back_blocks(self.addr, &blocks);
                } else {
                    for block in blocks {
                        self.send(socket, Message::Request(block)).await?;
                    }
                }
            }
            SessionCommand::Have(piece_index) => {
                self.send(socket, Message::Have { piece_index }).await?;
                self.update_interest(socket).await?;
            }
            SessionCommand::Cancel(block) => {
                self.send(socket, Message::Cancel(block)).await?;
            }
            SessionCommand::Block { info, data } => {
                if !self.am_choking {
                    self.torrent.counters.up.add(data.len() as u64);
                    self.send(
                        socket,
                        Message::Block {
                            piece_index: info.piece_index,
                            offset: info.offset,
                            data,
                        },
                    )
                    .await?;
                }
            }
            SessionCommand::Shutdown => {
                log::debug!("shutting down session with {}", self.addr);
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Sends `Interested`/`NotInterested` when our interest in the peer
    /// changed: we are interested exactly while the peer has a piece we
    /// lack.
    async fn update_interest(
        &mut self,
        socket: &mut Framed<MseStream<TcpStream>, PeerCodec>,
    ) -> Result<()> {
        let interested = self
            .handle
            .pieces
            .and_not(&self.torrent.own_pieces)
            .count()
            > 0;
        if interested != self.am_interested {
            self.am_interested = interested;
            let msg = if interested {
                log::debug!("interested in peer {}", self.addr);
                Message::Interested
            } else {
                log::debug!("no longer interested in peer {}", self.addr);
                Message::NotInterested
            };
            self.send(socket, msg).await?;
        }
        Ok(())
    }

    async fn send(
        &mut self,
        socket: &mut Framed<MseStream<TcpStream>, PeerCodec>,
        msg: Message,
    ) -> Result<()> {
        timeout(WRITE_TIMEOUT, socket.send(msg)).await??;
        self.last_send = Instant::now();
        Ok(())
    }

    fn register(&self) {
        self.torrent
            .register_peer(self.addr, Arc::clone(&self.handle));
    }

    /// Tears the session down. Idempotent: the torrent only drops the
    /// handle if it is still ours, and the connection permit is released
    /// exactly once when the session is dropped.
    fn close(&mut self, result: Result<()>) {
        if let Err(e) = &result {
            log::info!("session with {} closed: {}", self.addr, e);
        }
        if self.phase == Phase::Disconnected {
            return;
        }
        self.phase = Phase::Disconnected;
        let unanswered: Vec<BlockInfo> =
            self.handle.pending.lock().unwrap().drain().collect();
        self.torrent.give_back_blocks(self.addr, &unanswered);
        self.torrent.remove_peer(self.addr, &self.handle);
    }
}
