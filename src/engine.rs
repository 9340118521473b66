//! The process-wide engine: the accept listener, the global connection
//! semaphore, peer ranking, and the lifecycle API over all torrents.

use std::{
    collections::HashMap,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6},
    path::PathBuf,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex, RwLock,
    },
    time::{Duration, Instant},
};

use bytes::BytesMut;
use rand::Rng;
use tokio::{
    io::AsyncReadExt,
    net::{TcpListener, TcpStream},
    sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore},
    task::JoinHandle,
    time::timeout,
};
use tokio_util::{codec::Decoder, sync::CancellationToken};

use crate::{
    conf::{Conf, CryptoMode},
    disk::{self, DiskHandle},
    error::{Error, Result},
    gen_peer_id,
    metainfo::Metainfo,
    mse::{self, MseStream},
    peer::codec::{HandshakeCodec, PROTOCOL_STRING},
    priority,
    storage_info::StorageInfo,
    torrent::{self, Torrent, TorrentCommand, TorrentContext, TorrentStats},
    PeerId, Sha1Hash, TorrentId,
};

/// How long a failed dial keeps an address out of rotation.
const DIAL_ATTEMPT_TTL: Duration = Duration::from_secs(60 * 60);
/// How long an incoming connection gets to finish its handshakes.
const INBOUND_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Engine state shared with torrent tasks and the accept loop.
pub(crate) struct EngineContext {
    pub client_id: PeerId,
    pub listen_port: u16,
    pub crypto: CryptoMode,
    /// Bounds the total number of peer connections, inbound and outbound.
    pub sem: Arc<Semaphore>,
    /// The HTTP client shared by all tracker announces.
    pub http: reqwest::Client,
    /// The key of the fallback peer ranking, generated at engine start.
    rand_key: [u8; 32],
    local_v4: Option<Ipv4Addr>,
    local_v6: Option<Ipv6Addr>,
    /// Recent dial outcomes; addresses that just failed are not redialed
    /// for an hour.
    attempts: Mutex<HashMap<SocketAddr, DialAttempt>>,
}

struct DialAttempt {
    at: Instant,
    outcome: DialOutcome,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum DialOutcome {
    Timeout,
    Error,
    Connected,
}

impl EngineContext {
    pub fn new(
        client_id: PeerId,
        listen_port: u16,
        crypto: CryptoMode,
        max_connections: usize,
        http: reqwest::Client,
        local_v4: Option<Ipv4Addr>,
        local_v6: Option<Ipv6Addr>,
    ) -> Self {
        let mut rand_key = [0u8; 32];
        rand::thread_rng().fill(&mut rand_key);
        Self {
            client_id,
            listen_port,
            crypto,
            sem: Arc::new(Semaphore::new(max_connections)),
            http,
            rand_key,
            local_v4,
            local_v6,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Ranks a candidate peer (BEP 40). Without a known local address the
    /// ranking falls back to a keyed checksum of the peer alone.
    pub fn peer_priority(&self, peer: &SocketAddr) -> u32 {
        match peer {
            SocketAddr::V4(peer4) => match self.local_v4 {
                Some(local) => priority::priority4(
                    &SocketAddrV4::new(local, self.listen_port),
                    peer4,
                ),
                None => priority::simple_priority(&self.rand_key, &peer.to_string()),
            },
            SocketAddr::V6(peer6) => match self.local_v6 {
                Some(local) => priority::priority6(
                    &SocketAddrV6::new(local, self.listen_port, 0, 0),
                    peer6,
                ),
                None => priority::simple_priority(&self.rand_key, &peer.to_string()),
            },
        }
    }

    /// Whether the address failed recently enough to not be worth another
    /// dial yet.
    pub fn should_skip_dial(&self, addr: &SocketAddr) -> bool {
        let mut attempts = self.attempts.lock().unwrap();
        attempts.retain(|_, attempt| attempt.at.elapsed() < DIAL_ATTEMPT_TTL);
        matches!(
            attempts.get(addr),
            Some(attempt) if attempt.outcome != DialOutcome::Connected
        )
    }

    pub fn record_dial_timeout(&self, addr: SocketAddr) {
        self.record(addr, DialOutcome::Timeout);
    }

    pub fn record_dial_error(&self, addr: SocketAddr) {
        self.record(addr, DialOutcome::Error);
    }

    pub fn record_dial_success(&self, addr: SocketAddr) {
        self.record(addr, DialOutcome::Connected);
    }

    fn record(&self, addr: SocketAddr, outcome: DialOutcome) {
        self.attempts.lock().unwrap().insert(
            addr,
            DialAttempt {
                at: Instant::now(),
                outcome,
            },
        );
    }
}

struct TorrentEntry {
    id: TorrentId,
    ctx: Arc<TorrentContext>,
    cmd: torrent::Sender,
    join: Mutex<Option<JoinHandle<()>>>,
}

type TorrentMap = Arc<RwLock<HashMap<Sha1Hash, TorrentEntry>>>;

/// The top level entry point to the library: adds, runs and serves
/// torrents.
pub struct Engine {
    conf: Conf,
    ctx: Arc<EngineContext>,
    disk: DiskHandle,
    disk_join: Mutex<Option<JoinHandle<()>>>,
    torrents: TorrentMap,
    next_torrent_id: AtomicU32,
    /// Cancels the accept loop on shutdown.
    cancel: CancellationToken,
    accept_join: Mutex<Option<JoinHandle<()>>>,
    listen_addr: Mutex<Option<SocketAddr>>,
}

impl Engine {
    /// Creates the engine. No sockets are opened until [`start`](Self::start).
    pub fn new(conf: Conf) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(format!("tycho/{}", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::none())
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Config(format!("http client: {}", e)))?;

        let (disk_join, disk) = disk::spawn();

        let ctx = Arc::new(EngineContext::new(
            gen_peer_id(),
            conf.engine.listen_port,
            conf.engine.crypto,
            conf.engine.max_connections,
            http,
            conf.engine.local_v4,
            conf.engine.local_v6,
        ));

        Ok(Self {
            conf,
            ctx,
            disk,
            disk_join: Mutex::new(Some(disk_join)),
            torrents: Arc::new(RwLock::new(HashMap::new())),
            next_torrent_id: AtomicU32::new(0),
            cancel: CancellationToken::new(),
            accept_join: Mutex::new(None),
            listen_addr: Mutex::new(None),
        })
    }

    /// Binds the p2p listener and starts accepting incoming peers.
    pub async fn start(&self) -> Result<()> {
        let listener =
            TcpListener::bind(("0.0.0.0", self.conf.engine.listen_port)).await?;
        let addr = listener.local_addr()?;
        log::info!("listening for peers on {}", addr);
        *self.listen_addr.lock().unwrap() = Some(addr);

        let ctx = Arc::clone(&self.ctx);
        let torrents = Arc::clone(&self.torrents);
        let cancel = self.cancel.clone();
        let join = tokio::spawn(accept_loop(listener, ctx, torrents, cancel));
        *self.accept_join.lock().unwrap() = Some(join);
        Ok(())
    }

    /// The address the engine accepts peers on, once started.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        *self.listen_addr.lock().unwrap()
    }

    /// The peer id this engine announces and handshakes with.
    pub fn client_id(&self) -> PeerId {
        self.ctx.client_id
    }

    /// Adds a torrent and starts it. Returns its info hash, the key for
    /// all other torrent operations.
    pub fn add_torrent(
        &self,
        metainfo: Metainfo,
        base_dir: Option<PathBuf>,
        tags: Vec<String>,
    ) -> Result<Sha1Hash> {
        let info_hash = metainfo.create_info_hash()?;
        {
            let torrents = self.torrents.read().unwrap();
            if torrents.contains_key(&info_hash) {
                return Err(Error::TorrentExists);
            }
        }

        let id = self.next_torrent_id.fetch_add(1, Ordering::Relaxed);
        let base_dir = base_dir.unwrap_or_else(|| self.conf.torrent.download_dir.clone());
        let storage = StorageInfo::new(&metainfo, base_dir);
        log::info!(
            "adding torrent {} ({}, {} pieces) as id {}",
            hex::encode(info_hash),
            metainfo.info.name,
            storage.piece_count,
            id
        );

        let ctx = Arc::new(TorrentContext::new(
            id,
            info_hash,
            self.ctx.client_id,
            metainfo.info.name.clone(),
            tags,
            storage,
            self.disk.clone(),
            self.conf.torrent.sequential_download,
        ));

        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        let torrent = Torrent::new(
            Arc::clone(&ctx),
            self.conf.torrent.clone(),
            Arc::clone(&self.ctx),
            metainfo.announce_tiers(),
            metainfo.info.piece_hashes(),
            cmd_port,
        );
        let join = tokio::spawn(torrent.run());

        self.torrents.write().unwrap().insert(
            info_hash,
            TorrentEntry {
                id,
                ctx,
                cmd: cmd_chan,
                join: Mutex::new(Some(join)),
            },
        );
        Ok(info_hash)
    }

    /// A snapshot of the torrent's state and statistics.
    pub fn get_torrent(&self, info_hash: &Sha1Hash) -> Result<TorrentStats> {
        let torrents = self.torrents.read().unwrap();
        let entry = torrents.get(info_hash).ok_or(Error::TorrentNotFound)?;
        Ok(entry.ctx.stats())
    }

    pub fn start_torrent(&self, info_hash: &Sha1Hash) -> Result<()> {
        self.send_cmd(info_hash, TorrentCommand::Start)
    }

    pub fn stop_torrent(&self, info_hash: &Sha1Hash) -> Result<()> {
        self.send_cmd(info_hash, TorrentCommand::Stop)
    }

    /// Re-verifies all on-disk data of the torrent.
    pub fn recheck(&self, info_hash: &Sha1Hash) -> Result<()> {
        self.send_cmd(info_hash, TorrentCommand::Recheck)
    }

    /// Moves the torrent's data under a new base directory.
    pub async fn move_torrent(
        &self,
        info_hash: &Sha1Hash,
        dest: impl Into<PathBuf>,
    ) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send_cmd(
            info_hash,
            TorrentCommand::Move {
                dest: dest.into(),
                tx,
            },
        )?;
        rx.await?
    }

    /// Queues a known peer address for the torrent to dial, bypassing
    /// tracker discovery.
    pub fn add_peer(&self, info_hash: &Sha1Hash, addr: SocketAddr) -> Result<()> {
        self.send_cmd(info_hash, TorrentCommand::AddPeer(addr))
    }

    /// Removes the torrent from the engine. Downloaded data stays on disk.
    pub async fn remove(&self, info_hash: &Sha1Hash) -> Result<()> {
        let entry = self
            .torrents
            .write()
            .unwrap()
            .remove(info_hash)
            .ok_or(Error::TorrentNotFound)?;
        entry.ctx.cancel.cancel();
        let join = entry.join.lock().unwrap().take();
        if let Some(join) = join {
            let _ = join.await;
        }
        log::info!("removed torrent {}", entry.id);
        Ok(())
    }

    /// Stops every torrent (with their stop announces), the accept loop and
    /// the disk task.
    pub async fn shutdown(&self) -> Result<()> {
        log::info!("shutting down engine");
        self.cancel.cancel();
        if let Some(join) = self.accept_join.lock().unwrap().take() {
            join.abort();
        }

        let info_hashes: Vec<Sha1Hash> =
            self.torrents.read().unwrap().keys().copied().collect();
        for info_hash in info_hashes {
            let _ = self.remove(&info_hash).await;
        }

        let _ = self.disk.shutdown();
        let join = self.disk_join.lock().unwrap().take();
        if let Some(join) = join {
            let _ = join.await;
        }
        Ok(())
    }

    fn send_cmd(&self, info_hash: &Sha1Hash, cmd: TorrentCommand) -> Result<()> {
        let torrents = self.torrents.read().unwrap();
        let entry = torrents.get(info_hash).ok_or(Error::TorrentNotFound)?;
        entry.cmd.send(cmd).map_err(|_| Error::Shutdown)
    }
}

/// Accepts incoming peer connections and routes each to the torrent its
/// handshake names.
async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<EngineContext>,
    torrents: TorrentMap,
    cancel: CancellationToken,
) {
    loop {
        let (stream, addr) = tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::warn!("accept error: {}", e);
                    continue;
                }
            },
        };

        // the permit is tried, not awaited: at capacity new peers are
        // turned away rather than queued
        let permit = match Arc::clone(&ctx.sem).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                log::debug!("connection limit reached, dropping peer {}", addr);
                continue;
            }
        };

        log::debug!("incoming connection from {}", addr);
        let ctx = Arc::clone(&ctx);
        let torrents = Arc::clone(&torrents);
        tokio::spawn(async move {
            match timeout(
                INBOUND_HANDSHAKE_TIMEOUT,
                handle_incoming(stream, addr, &ctx, &torrents, permit),
            )
            .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::debug!("incoming peer {} rejected: {}", addr, e),
                Err(_) => log::debug!("incoming peer {} handshake timed out", addr),
            }
        });
    }
}

/// Performs the receive side handshakes of one incoming connection and
/// hands it to the right torrent.
///
/// The first 20 bytes decide whether the peer starts with the plain
/// BitTorrent handshake or the encrypted one; the odds of an encrypted
/// key exchange starting with exactly the protocol string are negligible.
async fn handle_incoming(
    mut stream: TcpStream,
    addr: SocketAddr,
    ctx: &EngineContext,
    torrents: &TorrentMap,
    permit: OwnedSemaphorePermit,
) -> Result<()> {
    let mut head = vec![0u8; 20];
    stream.read_exact(&mut head).await?;
    let plain_start =
        head[0] as usize == PROTOCOL_STRING.len() && head[1..] == PROTOCOL_STRING.as_bytes()[..19];

    let mut socket = if plain_start {
        if ctx.crypto == CryptoMode::Force {
            return Err(Error::Encryption("plaintext peer refused".into()));
        }
        MseStream::plaintext_with_leftover(stream, head)
    } else {
        if ctx.crypto == CryptoMode::Disable {
            return Err(Error::HandshakeMismatch);
        }
        let served: Vec<Sha1Hash> = torrents.read().unwrap().keys().copied().collect();
        let (socket, _matched) = mse::accept(stream, &served, ctx.crypto, head).await?;
        socket
    };

    // now the regular BitTorrent handshake, used to route the connection
    let mut handshake_bytes = BytesMut::zeroed(68);
    socket.read_exact(&mut handshake_bytes[..]).await?;
    let handshake = HandshakeCodec
        .decode(&mut handshake_bytes)?
        .ok_or(Error::HandshakeMismatch)?;

    let torrents = torrents.read().unwrap();
    let entry = torrents
        .get(&handshake.info_hash)
        .ok_or(Error::InfoHashUnknown)?;
    entry
        .cmd
        .send(TorrentCommand::PeerConnected {
            socket,
            addr,
            handshake,
            permit,
        })
        .map_err(|_| Error::Shutdown)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_ctx(local_v4: Option<Ipv4Addr>) -> EngineContext {
        EngineContext {
            client_id: crate::gen_peer_id(),
            listen_port: 50413,
            crypto: CryptoMode::Disable,
            sem: Arc::new(Semaphore::new(10)),
            http: reqwest::Client::new(),
            rand_key: [7; 32],
            local_v4,
            local_v6: None,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    #[test]
    fn test_failed_dials_are_skipped_for_a_while() {
        let ctx = test_ctx(None);
        let addr: SocketAddr = "1.2.3.4:6881".parse().unwrap();

        assert!(!ctx.should_skip_dial(&addr));
        ctx.record_dial_error(addr);
        assert!(ctx.should_skip_dial(&addr));

        // a successful connection clears the penalty
        ctx.record_dial_success(addr);
        assert!(!ctx.should_skip_dial(&addr));

        ctx.record_dial_timeout(addr);
        assert!(ctx.should_skip_dial(&addr));
    }

    #[test]
    fn test_peer_priority_with_known_local_address() {
        let ctx = test_ctx(Some("123.213.32.10".parse().unwrap()));
        let peer: SocketAddr = "98.76.54.32:0".parse().unwrap();
        assert_eq!(ctx.peer_priority(&peer), 0xec2d7224);
    }

    #[test]
    fn test_peer_priority_fallback_is_stable_per_key() {
        let ctx = test_ctx(None);
        let peer: SocketAddr = "98.76.54.32:1234".parse().unwrap();
        let other: SocketAddr = "98.76.54.33:1234".parse().unwrap();
        assert_eq!(ctx.peer_priority(&peer), ctx.peer_priority(&peer));
        assert_ne!(ctx.peer_priority(&peer), ctx.peer_priority(&other));
    }
}
