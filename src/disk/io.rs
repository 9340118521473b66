use std::{
    collections::{HashMap, HashSet},
    fs::{self, File, OpenOptions},
    num::NonZeroUsize,
    path::PathBuf,
    sync::{Arc, Mutex, RwLock},
    time::{Duration, Instant},
};

use lru::LruCache;
use sha1::{Digest, Sha1};
use tokio::task;

use super::{Command, CommandReceiver, TorrentAlert, TorrentAlertSender};
use crate::{
    block_count,
    error::{Error, Result},
    peer,
    storage_info::StorageInfo,
    Bitfield, BlockInfo, FileIndex, PieceIndex, Sha1Hash, TorrentId, BLOCK_LEN,
};

/// How long an unused file descriptor is kept open.
const FILE_POOL_TTL: Duration = Duration::from_secs(10 * 60);
/// The upper bound on simultaneously open torrent files.
const FILE_POOL_CAP: usize = 128;

/// The entity responsible for saving downloaded file blocks to disk and
/// verifying whether downloaded pieces are valid.
pub(super) struct Disk {
    /// Each torrent in engine has a corresponding entry in this hashmap.
    torrents: HashMap<TorrentId, Torrent>,
    /// Port on which disk IO commands are received.
    cmd_port: CommandReceiver,
}

impl Disk {
    pub(super) fn new(cmd_port: CommandReceiver) -> Self {
        Self {
            torrents: HashMap::new(),
            cmd_port,
        }
    }

    /// Runs the disk command loop until shutdown.
    pub(super) async fn start(mut self) {
        log::info!("starting disk IO task");
        while let Some(cmd) = self.cmd_port.recv().await {
            match cmd {
                Command::NewTorrent {
                    id,
                    storage,
                    piece_hashes,
                    preallocate,
                    torrent_chan,
                    tx,
                } => {
                    if self.torrents.contains_key(&id) {
                        let _ = tx.send(Err(Error::TorrentExists));
                        continue;
                    }
                    // allocation stats files and may hash large amounts of
                    // resumed data, none of which belongs on the event loop
                    let result = task::spawn_blocking(move || {
                        Torrent::new(storage, piece_hashes, preallocate, torrent_chan)
                    })
                    .await
                    .expect("disk allocation task panicked");
                    match result {
                        Ok((torrent, resume)) => {
                            log::info!("torrent {} allocated on disk", id);
                            self.torrents.insert(id, torrent);
                            let _ = tx.send(Ok(resume));
                        }
                        Err(e) => {
                            log::warn!("torrent {} allocation failure: {}", id, e);
                            let _ = tx.send(Err(e));
                        }
                    }
                }
                Command::WriteBlock { id, info, data } => {
                    if let Some(torrent) = self.torrents.get_mut(&id) {
                        torrent.write_block(info, data);
                    } else {
                        log::warn!("write for unknown torrent {}", id);
                    }
                }
                Command::ReadBlock { id, block, chan } => {
                    if let Some(torrent) = self.torrents.get(&id) {
                        torrent.read_block(block, chan);
                    } else {
                        log::warn!("read for unknown torrent {}", id);
                    }
                }
                Command::Recheck { id, tx } => {
                    match self.torrents.get(&id) {
                        Some(torrent) => {
                            let ctx = Arc::clone(&torrent.ctx);
                            // long hash pass, run it off the loop so other
                            // torrents' writes keep flowing
                            task::spawn_blocking(move || {
                                let _ = tx.send(check_pieces(&ctx, &stat_sizes(&ctx)));
                            });
                        }
                        None => {
                            let _ = tx.send(Err(Error::TorrentNotFound));
                        }
                    }
                }
                Command::Move { id, dest, tx } => {
                    match self.torrents.get(&id) {
                        Some(torrent) => {
                            let ctx = Arc::clone(&torrent.ctx);
                            task::spawn_blocking(move || {
                                let _ = tx.send(move_torrent(&ctx, dest));
                            });
                        }
                        None => {
                            let _ = tx.send(Err(Error::TorrentNotFound));
                        }
                    }
                }
                Command::RemoveTorrent { id } => {
                    if let Some(torrent) = self.torrents.remove(&id) {
                        log::debug!(
                            "torrent {} removed from disk task ({} bytes written, {} read)",
                            id,
                            torrent.ctx.stats.write_count(),
                            torrent.ctx.stats.read_count(),
                        );
                    }
                }
                Command::Shutdown => {
                    log::info!("shutting down disk IO task");
                    break;
                }
            }
        }
    }
}

/// Torrent state related to disk IO.
///
/// Contains the in-progress pieces (i.e. the write buffer), the file pool
/// and everything the blocking IO workers need.
struct Torrent {
    /// The in-progress piece downloads. This is the torrent's disk write
    /// buffer. Each piece is mapped to its index for faster lookups.
    write_buf: HashMap<PieceIndex, Piece>,
    /// Pieces currently being hashed and flushed by a blocking worker.
    /// Duplicate completions of the same piece are coalesced through this.
    flushing: Arc<Mutex<HashSet<PieceIndex>>>,
    /// Fields shared with the blocking IO workers.
    ctx: Arc<ThreadContext>,
}

/// Fields commonly accessed by the torrent's blocking IO workers. Keeping
/// them behind a single arc means one refcount bump per spawned worker.
struct ThreadContext {
    /// The channel used to alert the torrent of piece completions and
    /// storage failures.
    chan: TorrentAlertSender,
    storage: StorageInfo,
    /// The expected hash of each piece.
    piece_hashes: Vec<Sha1Hash>,
    files: FilePool,
    /// Whole pieces read from disk for serving, mapped by piece index. If a
    /// peer requests one block of a piece it will likely request the rest,
    /// so the whole piece is pulled in at once.
    read_cache: Mutex<LruCache<PieceIndex, Arc<Vec<u8>>>>,
    stats: Stats,
}

impl Torrent {
    /// Creates the file system structure of the torrent, opening (and, if
    /// configured, preallocating) all files, and runs the resume hash check
    /// over the pieces that may already be on disk.
    fn new(
        storage: StorageInfo,
        piece_hashes: Vec<Sha1Hash>,
        preallocate: bool,
        chan: TorrentAlertSender,
    ) -> Result<(Self, Bitfield)> {
        fs::create_dir_all(&storage.download_dir)?;

        // sizes of the files as they were before this allocation; only
        // pieces that fit entirely in pre-existing bytes are worth hashing
        let mut existing = vec![None; storage.files.len()];
        for (index, file) in storage.files.iter().enumerate() {
            let path = storage.download_dir.join(&file.path);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            match fs::metadata(&path) {
                Ok(meta) => {
                    if meta.len() > 0 {
                        existing[index] = Some(meta.len());
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            let handle = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)?;
            if preallocate && handle.metadata()?.len() != file.len {
                allocate_file(&handle, file.len)?;
            }
        }

        let ctx = Arc::new(ThreadContext {
            chan,
            files: FilePool::new(&storage),
            storage,
            piece_hashes,
            read_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(64).expect("nonzero cache size"),
            )),
            stats: Stats::default(),
        });

        let resume = check_pieces(&ctx, &existing)?;

        Ok((
            Self {
                write_buf: HashMap::new(),
                flushing: Arc::new(Mutex::new(HashSet::new())),
                ctx,
            },
            resume,
        ))
    }

    /// Places the block in its piece's write buffer. If this was the last
    /// missing block, the piece is hashed and, when valid, persisted on
    /// a blocking worker.
    fn write_block(&mut self, info: BlockInfo, data: Vec<u8>) {
        let piece_index = info.piece_index;
        if self.flushing.lock().unwrap().contains(&piece_index) {
            log::debug!("piece {} already being flushed, dropping block", piece_index);
            return;
        }

        let piece = match self.write_buf.entry(piece_index) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                let piece_len = match self.ctx.storage.piece_len(piece_index) {
                    Ok(len) => len,
                    Err(e) => {
                        log::warn!("dropping block {}: {}", info, e);
                        return;
                    }
                };
                let expected_hash = self.ctx.piece_hashes[piece_index];
                entry.insert(Piece {
                    expected_hash,
                    len: piece_len,
                    blocks: vec![None; block_count(piece_len)],
                })
            }
        };

        if let Err(e) = piece.place_block(info, data) {
            log::warn!("rejecting block {}: {}", info, e);
            return;
        }
        if !piece.is_complete() {
            return;
        }

        let piece = self.write_buf.remove(&piece_index).expect("piece buffered");
        self.flushing.lock().unwrap().insert(piece_index);
        let flushing = Arc::clone(&self.flushing);
        let ctx = Arc::clone(&self.ctx);

        // don't block the event loop with the potentially expensive hashing
        // and sync file writing
        task::spawn_blocking(move || {
            let expected_hash = piece.expected_hash;
            let data = piece.assemble();
            let is_valid = Sha1Hash::from(Sha1::digest(&data)) == expected_hash;

            if is_valid {
                if let Err(e) = write_piece(&ctx, piece_index, &data) {
                    log::error!("error writing piece {} to disk: {}", piece_index, e);
                    ctx.stats.write_failure();
                    flushing.lock().unwrap().remove(&piece_index);
                    let _ = ctx.chan.send(TorrentAlert::StorageError(e));
                    return;
                }
                ctx.stats.wrote(data.len() as u64);
            } else {
                log::warn!("piece {} failed its hash check", piece_index);
            }

            flushing.lock().unwrap().remove(&piece_index);
            let _ = ctx.chan.send(TorrentAlert::PieceCompletion {
                index: piece_index,
                is_valid,
            });
        });
    }

    /// Reads a block for serving, from the read cache when possible. The
    /// result is delivered directly to the requesting session.
    fn read_block(&self, block: BlockInfo, chan: peer::Sender) {
        let piece_index = block.piece_index;

        if let Some(data) = self.ctx.read_cache.lock().unwrap().get(&piece_index) {
            send_block_slice(data, block, &chan);
            return;
        }

        let ctx = Arc::clone(&self.ctx);
        task::spawn_blocking(move || match read_piece(&ctx, piece_index) {
            Ok(data) => {
                let data = Arc::new(data);
                ctx.stats.read(data.len() as u64);
                ctx.read_cache
                    .lock()
                    .unwrap()
                    .put(piece_index, Arc::clone(&data));
                send_block_slice(&data, block, &chan);
            }
            Err(e) => {
                // a failed read only means this peer isn't served; the
                // torrent's own data was verified when the piece completed
                log::warn!("error reading piece {} from disk: {}", piece_index, e);
                ctx.stats.read_failure();
            }
        });
    }
}

fn send_block_slice(piece: &Arc<Vec<u8>>, block: BlockInfo, chan: &peer::Sender) {
    let start = block.offset as usize;
    let end = start + block.len as usize;
    if end > piece.len() {
        log::warn!("block {} is out of piece bounds", block);
        return;
    }
    let _ = chan.send(peer::SessionCommand::Block {
        info: block,
        data: piece[start..end].to_vec(),
    });
}

/// An in-progress piece download that keeps the so far downloaded blocks in
/// memory, slotted by their offset.
struct Piece {
    /// The expected hash of the whole piece.
    expected_hash: Sha1Hash,
    /// The length of the piece, in bytes.
    len: u32,
    /// The so far downloaded blocks, slot `n` holding the block at offset
    /// `n * 16 KiB`.
    blocks: Vec<Option<Vec<u8>>>,
}

impl Piece {
    fn place_block(&mut self, info: BlockInfo, data: Vec<u8>) -> Result<()> {
        if info.offset % BLOCK_LEN != 0
            || info.len as usize != data.len()
            || info.offset + info.len > self.len
        {
            return Err(Error::UnexpectedBlock(info));
        }
        let slot = info.index_in_piece();
        match &self.blocks[slot] {
            // a duplicate of the same block is harmless, a different length
            // for the same slot is not
            Some(existing) if existing.len() == data.len() => Ok(()),
            Some(_) => Err(Error::UnexpectedBlock(info)),
            None => {
                self.blocks[slot] = Some(data);
                Ok(())
            }
        }
    }

    fn is_complete(&self) -> bool {
        self.blocks.iter().all(Option::is_some)
    }

    /// Concatenates the blocks into the piece's contiguous bytes.
    fn assemble(self) -> Vec<u8> {
        let mut data = Vec::with_capacity(self.len as usize);
        for block in self.blocks {
            data.extend_from_slice(&block.expect("assembling incomplete piece"));
        }
        data
    }
}

/// A TTL'd pool of the torrent's open file descriptors.
///
/// Handles are shared out as arcs, so an eviction never invalidates a
/// descriptor a blocking worker is still writing through; the file is
/// closed when the last user drops it.
struct FilePool {
    /// The relative path of each torrent file.
    paths: Vec<PathBuf>,
    /// The directory the paths are relative to. Changes on move.
    dir: RwLock<PathBuf>,
    handles: Mutex<LruCache<FileIndex, PooledFile>>,
}

struct PooledFile {
    file: Arc<File>,
    last_used: Instant,
}

impl FilePool {
    fn new(storage: &StorageInfo) -> Self {
        Self {
            paths: storage.files.iter().map(|f| f.path.clone()).collect(),
            dir: RwLock::new(storage.download_dir.clone()),
            handles: Mutex::new(LruCache::new(
                NonZeroUsize::new(FILE_POOL_CAP).expect("nonzero pool size"),
            )),
        }
    }

    fn path(&self, index: FileIndex) -> PathBuf {
        self.dir.read().unwrap().join(&self.paths[index])
    }

    fn get(&self, index: FileIndex) -> Result<Arc<File>> {
        let mut handles = self.handles.lock().unwrap();

        // evict handles nobody has touched within the TTL
        let now = Instant::now();
        let stale: Vec<FileIndex> = handles
            .iter()
            .filter(|(_, pooled)| now - pooled.last_used > FILE_POOL_TTL)
            .map(|(index, _)| *index)
            .collect();
        for index in stale {
            handles.pop(&index);
        }

        if let Some(pooled) = handles.get_mut(&index) {
            pooled.last_used = now;
            return Ok(Arc::clone(&pooled.file));
        }

        let path = self.path(index);
        let file = Arc::new(
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)?,
        );
        handles.put(
            index,
            PooledFile {
                file: Arc::clone(&file),
                last_used: now,
            },
        );
        Ok(file)
    }

    fn clear(&self) {
        self.handles.lock().unwrap().clear();
    }

    fn set_dir(&self, dir: PathBuf) {
        *self.dir.write().unwrap() = dir;
    }
}

#[derive(Default)]
struct Stats {
    /// The number of bytes successfully written to disk.
    write_count: std::sync::atomic::AtomicU64,
    /// The number of times we failed to write to disk.
    write_failure_count: std::sync::atomic::AtomicU64,
    /// The number of bytes successfully read from disk.
    read_count: std::sync::atomic::AtomicU64,
    /// The number of times we failed to read from disk.
    read_failure_count: std::sync::atomic::AtomicU64,
}

impl Stats {
    fn wrote(&self, n: u64) {
        self.write_count
            .fetch_add(n, std::sync::atomic::Ordering::Relaxed);
    }
    fn write_failure(&self) {
        self.write_failure_count
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }
    fn read(&self, n: u64) {
        self.read_count
            .fetch_add(n, std::sync::atomic::Ordering::Relaxed);
    }
    fn read_failure(&self) {
        self.read_failure_count
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }
    fn write_count(&self) -> u64 {
        self.write_count.load(std::sync::atomic::Ordering::Relaxed)
    }
    fn read_count(&self) -> u64 {
        self.read_count.load(std::sync::atomic::Ordering::Relaxed)
    }
}

/// Writes the piece's bytes to all files it intersects, at their offsets.
fn write_piece(ctx: &ThreadContext, index: PieceIndex, data: &[u8]) -> Result<()> {
    let mut piece_offset = 0usize;
    for chunk in ctx.storage.piece_chunks(index)? {
        let file = ctx.files.get(chunk.file_index)?;
        pwrite_all(
            &file,
            &data[piece_offset..piece_offset + chunk.len as usize],
            chunk.offset,
        )?;
        piece_offset += chunk.len as usize;
    }
    debug_assert_eq!(piece_offset, data.len());
    Ok(())
}

/// Reads the piece's bytes from all files it intersects.
fn read_piece(ctx: &ThreadContext, index: PieceIndex) -> Result<Vec<u8>> {
    let piece_len = ctx.storage.piece_len(index)? as usize;
    let mut data = vec![0u8; piece_len];
    let mut piece_offset = 0usize;
    for chunk in ctx.storage.piece_chunks(index)? {
        let file = ctx.files.get(chunk.file_index)?;
        pread_exact(
            &file,
            &mut data[piece_offset..piece_offset + chunk.len as usize],
            chunk.offset,
        )?;
        piece_offset += chunk.len as usize;
    }
    Ok(data)
}

fn pwrite_all(file: &File, mut buf: &[u8], mut offset: u64) -> Result<()> {
    while !buf.is_empty() {
        let n = nix::sys::uio::pwrite(file, buf, offset as i64)
            .map_err(|e| Error::Io(e.into()))?;
        if n == 0 {
            return Err(Error::Io(std::io::ErrorKind::WriteZero.into()));
        }
        buf = &buf[n..];
        offset += n as u64;
    }
    Ok(())
}

fn pread_exact(file: &File, mut buf: &mut [u8], mut offset: u64) -> Result<()> {
    while !buf.is_empty() {
        let n = nix::sys::uio::pread(file, buf, offset as i64)
            .map_err(|e| Error::Io(e.into()))?;
        if n == 0 {
            return Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into()));
        }
        let rest = buf;
        buf = &mut rest[n..];
        offset += n as u64;
    }
    Ok(())
}

/// Reserves the file's full length on disk.
fn allocate_file(file: &File, len: u64) -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        use nix::fcntl::{fallocate, FallocateFlags};
        use std::os::unix::io::AsRawFd;
        if fallocate(file.as_raw_fd(), FallocateFlags::empty(), 0, len as i64).is_ok() {
            return Ok(());
        }
        // not every file system supports fallocate; fall through and leave
        // a hole instead
    }
    file.set_len(len)?;
    Ok(())
}

/// Stats the current size of every torrent file.
fn stat_sizes(ctx: &ThreadContext) -> Vec<Option<u64>> {
    ctx.storage
        .files
        .iter()
        .enumerate()
        .map(|(index, _)| {
            fs::metadata(ctx.files.path(index))
                .ok()
                .map(|meta| meta.len())
                .filter(|len| *len > 0)
        })
        .collect()
}

/// Hashes every piece whose chunks all lie within the given file sizes and
/// returns the bitfield of pieces that matched their expected hash.
fn check_pieces(ctx: &ThreadContext, file_sizes: &[Option<u64>]) -> Result<Bitfield> {
    let mut resume = Bitfield::repeat(false, ctx.storage.piece_count);
    if file_sizes.iter().all(Option::is_none) {
        return Ok(resume);
    }

    'pieces: for index in 0..ctx.storage.piece_count {
        for chunk in ctx.storage.piece_chunks(index)? {
            match file_sizes[chunk.file_index] {
                Some(size) if chunk.offset + chunk.len <= size => {}
                _ => continue 'pieces,
            }
        }
        let data = read_piece(ctx, index)?;
        if Sha1Hash::from(Sha1::digest(&data)) == ctx.piece_hashes[index] {
            resume.set(index, true);
        }
    }

    log::debug!(
        "resume check found {}/{} pieces",
        resume.count_ones(),
        ctx.storage.piece_count
    );
    Ok(resume)
}

/// Moves every torrent file under the new base directory and returns the
/// torrent's new download directory.
fn move_torrent(ctx: &ThreadContext, dest: PathBuf) -> Result<PathBuf> {
    let old_dir = ctx.files.dir.read().unwrap().clone();
    let new_dir = if ctx.storage.is_archive {
        match old_dir.file_name() {
            Some(name) => dest.join(name),
            None => dest.clone(),
        }
    } else {
        dest.clone()
    };

    // no descriptor may point at the old paths once files start moving
    ctx.files.clear();
    fs::create_dir_all(&new_dir)?;

    for file in &ctx.storage.files {
        let from = old_dir.join(&file.path);
        let to = new_dir.join(&file.path);
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        if fs::rename(&from, &to).is_err() {
            // the destination is on another file system
            fs::copy(&from, &to)?;
            fs::remove_file(&from)?;
        }
    }

    ctx.files.set_dir(new_dir.clone());
    ctx.read_cache.lock().unwrap().clear();
    Ok(new_dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage_info::FileInfo;
    use tokio::sync::mpsc;

    fn storage(dir: PathBuf, file_lens: &[u64], piece_len: u32) -> StorageInfo {
        let mut offset = 0;
        let files: Vec<FileInfo> = file_lens
            .iter()
            .enumerate()
            .map(|(i, len)| {
                let file = FileInfo {
                    path: PathBuf::from(format!("file-{}", i)),
                    len: *len,
                    torrent_offset: offset,
                };
                offset += len;
                file
            })
            .collect();
        let piece_count = ((offset + piece_len as u64 - 1) / piece_len as u64) as usize;
        StorageInfo {
            piece_count,
            piece_len,
            last_piece_len: (offset - piece_len as u64 * (piece_count as u64 - 1)) as u32,
            download_len: offset,
            download_dir: dir,
            files,
            is_archive: false,
        }
    }

    fn piece_bytes(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(seed)).collect()
    }

    #[tokio::test]
    async fn test_write_verify_persist() {
        let dir = tempfile::tempdir().unwrap();
        // one file, two pieces of two blocks each
        let piece_len = 2 * BLOCK_LEN;
        let storage = storage(dir.path().to_path_buf(), &[2 * piece_len as u64], piece_len);

        let content = piece_bytes(piece_len as usize, 3);
        let hash: Sha1Hash = Sha1::digest(&content).into();
        let bad_hash = [0u8; 20];

        let (chan, mut alerts) = mpsc::unbounded_channel();
        let (mut torrent, resume) =
            Torrent::new(storage.clone(), vec![hash, bad_hash], false, chan).unwrap();
        assert_eq!(resume.count_ones(), 0);

        // deliver piece 0 in two blocks, out of order
        torrent.write_block(
            BlockInfo {
                piece_index: 0,
                offset: BLOCK_LEN,
                len: BLOCK_LEN,
            },
            content[BLOCK_LEN as usize..].to_vec(),
        );
        assert!(alerts.try_recv().is_err());
        torrent.write_block(
            BlockInfo {
                piece_index: 0,
                offset: 0,
                len: BLOCK_LEN,
            },
            content[..BLOCK_LEN as usize].to_vec(),
        );

        match alerts.recv().await.unwrap() {
            TorrentAlert::PieceCompletion { index, is_valid } => {
                assert_eq!(index, 0);
                assert!(is_valid);
            }
            other => panic!("unexpected alert {:?}", other),
        }

        let on_disk = fs::read(dir.path().join("file-0")).unwrap();
        assert_eq!(&on_disk[..piece_len as usize], &content[..]);
    }

    #[tokio::test]
    async fn test_hash_mismatch_discards_piece() {
        let dir = tempfile::tempdir().unwrap();
        let piece_len = BLOCK_LEN;
        let storage = storage(dir.path().to_path_buf(), &[piece_len as u64], piece_len);

        let (chan, mut alerts) = mpsc::unbounded_channel();
        let (mut torrent, _) =
            Torrent::new(storage, vec![[0u8; 20]], false, chan).unwrap();

        torrent.write_block(
            BlockInfo {
                piece_index: 0,
                offset: 0,
                len: BLOCK_LEN,
            },
            piece_bytes(BLOCK_LEN as usize, 7),
        );

        match alerts.recv().await.unwrap() {
            TorrentAlert::PieceCompletion { index, is_valid } => {
                assert_eq!(index, 0);
                assert!(!is_valid);
            }
            other => panic!("unexpected alert {:?}", other),
        }
        // the buffer was dropped, so the piece can be delivered again
        assert!(torrent.write_buf.is_empty());
    }

    #[test]
    fn test_place_block_rejects_conflicting_slot() {
        let mut piece = Piece {
            expected_hash: [0; 20],
            len: 2 * BLOCK_LEN,
            blocks: vec![None; 2],
        };
        let info = BlockInfo {
            piece_index: 0,
            offset: 0,
            len: BLOCK_LEN,
        };
        piece.place_block(info, vec![0; BLOCK_LEN as usize]).unwrap();
        // same block again is fine
        piece.place_block(info, vec![1; BLOCK_LEN as usize]).unwrap();
        // same slot with a different length is not
        let short = BlockInfo {
            piece_index: 0,
            offset: 0,
            len: 100,
        };
        assert!(matches!(
            piece.place_block(short, vec![0; 100]),
            Err(Error::UnexpectedBlock(_))
        ));
    }

    #[tokio::test]
    async fn test_resume_check_finds_existing_pieces() {
        let dir = tempfile::tempdir().unwrap();
        let piece_len = BLOCK_LEN;
        let storage = storage(
            dir.path().to_path_buf(),
            &[2 * piece_len as u64],
            piece_len,
        );

        // pre-write piece 1's bytes at its offset, leave piece 0 a hole
        let piece1 = piece_bytes(piece_len as usize, 11);
        let path = dir.path().join("file-0");
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(&path)
            .unwrap();
        file.set_len(2 * piece_len as u64).unwrap();
        pwrite_all(&file, &piece1, piece_len as u64).unwrap();

        let hashes = vec![[0xaa; 20], Sha1Hash::from(Sha1::digest(&piece1))];
        let (chan, _alerts) = mpsc::unbounded_channel();
        let (_torrent, resume) = Torrent::new(storage, hashes, false, chan).unwrap();
        assert!(!resume[0]);
        assert!(resume[1]);
    }

    #[tokio::test]
    async fn test_read_block_serves_written_data() {
        let dir = tempfile::tempdir().unwrap();
        let piece_len = BLOCK_LEN;
        let storage = storage(dir.path().to_path_buf(), &[piece_len as u64], piece_len);

        let content = piece_bytes(piece_len as usize, 5);
        let hash: Sha1Hash = Sha1::digest(&content).into();
        let (chan, mut alerts) = mpsc::unbounded_channel();
        let (mut torrent, _) = Torrent::new(storage, vec![hash], false, chan).unwrap();

        torrent.write_block(
            BlockInfo {
                piece_index: 0,
                offset: 0,
                len: BLOCK_LEN,
            },
            content.clone(),
        );
        alerts.recv().await.unwrap();

        let (peer_chan, mut peer_port) = mpsc::unbounded_channel();
        let request = BlockInfo {
            piece_index: 0,
            offset: 100,
            len: 200,
        };
        torrent.read_block(request, peer_chan);
        match peer_port.recv().await.unwrap() {
            peer::SessionCommand::Block { info, data } => {
                assert_eq!(info, request);
                assert_eq!(data, &content[100..300]);
            }
            _ => panic!("expected a block"),
        }
    }

    #[tokio::test]
    async fn test_move_torrent_relocates_files() {
        let dir = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let piece_len = BLOCK_LEN;
        let storage = storage(dir.path().to_path_buf(), &[piece_len as u64], piece_len);

        let content = piece_bytes(piece_len as usize, 9);
        let hash: Sha1Hash = Sha1::digest(&content).into();
        let (chan, mut alerts) = mpsc::unbounded_channel();
        let (mut torrent, _) = Torrent::new(storage, vec![hash], false, chan).unwrap();
        torrent.write_block(
            BlockInfo {
                piece_index: 0,
                offset: 0,
                len: BLOCK_LEN,
            },
            content.clone(),
        );
        alerts.recv().await.unwrap();

        let new_dir = move_torrent(&torrent.ctx, dest.path().to_path_buf()).unwrap();
        assert_eq!(new_dir, dest.path());
        assert!(!dir.path().join("file-0").exists());
        assert_eq!(fs::read(dest.path().join("file-0")).unwrap(), content);
    }
}
