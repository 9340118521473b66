//! The disk task: the single owner of a torrent's files.
//!
//! All persistence flows through here: allocating a torrent's file system
//! structure on add (with the resume hash check), buffering downloaded
//! blocks until their piece verifies, serving block reads for upload, and
//! moving a torrent's data. The task itself only routes commands; hashing
//! and file I/O run on the blocking thread pool.

mod io;

use std::path::PathBuf;

use tokio::{
    sync::{mpsc, oneshot},
    task,
};

use crate::{
    error::{Error, Result},
    peer,
    storage_info::StorageInfo,
    Bitfield, BlockInfo, PieceIndex, Sha1Hash, TorrentId,
};

pub(crate) type CommandSender = mpsc::UnboundedSender<Command>;
type CommandReceiver = mpsc::UnboundedReceiver<Command>;

pub(crate) type TorrentAlertSender = mpsc::UnboundedSender<TorrentAlert>;
pub(crate) type TorrentAlertReceiver = mpsc::UnboundedReceiver<TorrentAlert>;

/// Spawns the disk task and returns a handle for issuing commands to it.
pub(crate) fn spawn() -> (task::JoinHandle<()>, DiskHandle) {
    let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
    let disk = io::Disk::new(cmd_port);
    let join = task::spawn(disk.start());
    (join, DiskHandle(cmd_chan))
}

/// The channel through which the rest of the engine talks to the disk task.
#[derive(Clone)]
pub(crate) struct DiskHandle(pub(crate) CommandSender);

impl DiskHandle {
    /// Sets up the torrent's file system structure and runs the resume hash
    /// check. Returns the bitfield of pieces already present on disk.
    pub async fn allocate_new_torrent(
        &self,
        id: TorrentId,
        storage: StorageInfo,
        piece_hashes: Vec<Sha1Hash>,
        preallocate: bool,
        torrent_chan: TorrentAlertSender,
    ) -> Result<Bitfield> {
        let (tx, rx) = oneshot::channel();
        self.0.send(Command::NewTorrent {
            id,
            storage,
            piece_hashes,
            preallocate,
            torrent_chan,
            tx,
        })?;
        rx.await?
    }

    /// Queues a downloaded block for writing. Verification and persistence
    /// results arrive on the torrent's alert channel.
    pub fn write_block(&self, id: TorrentId, info: BlockInfo, data: Vec<u8>) -> Result<()> {
        self.0.send(Command::WriteBlock { id, info, data })?;
        Ok(())
    }

    /// Reads a block for serving to a peer; the block is delivered directly
    /// to the session's command channel.
    pub fn read_block(&self, id: TorrentId, block: BlockInfo, chan: peer::Sender) -> Result<()> {
        self.0.send(Command::ReadBlock { id, block, chan })?;
        Ok(())
    }

    /// Re-runs the full hash check pass and returns the new piece bitfield.
    pub async fn recheck(&self, id: TorrentId) -> Result<Bitfield> {
        let (tx, rx) = oneshot::channel();
        self.0.send(Command::Recheck { id, tx })?;
        rx.await?
    }

    /// Moves the torrent's files under a new base directory and returns the
    /// torrent's new download directory.
    pub async fn move_torrent(&self, id: TorrentId, dest: PathBuf) -> Result<PathBuf> {
        let (tx, rx) = oneshot::channel();
        self.0.send(Command::Move { id, dest, tx })?;
        rx.await?
    }

    /// Drops the torrent's disk state, closing its file handles.
    pub fn remove_torrent(&self, id: TorrentId) -> Result<()> {
        self.0.send(Command::RemoveTorrent { id })?;
        Ok(())
    }

    pub fn shutdown(&self) -> Result<()> {
        self.0.send(Command::Shutdown)?;
        Ok(())
    }
}

pub(crate) enum Command {
    NewTorrent {
        id: TorrentId,
        storage: StorageInfo,
        piece_hashes: Vec<Sha1Hash>,
        preallocate: bool,
        torrent_chan: TorrentAlertSender,
        tx: oneshot::Sender<Result<Bitfield>>,
    },
    WriteBlock {
        id: TorrentId,
        info: BlockInfo,
        data: Vec<u8>,
    },
    ReadBlock {
        id: TorrentId,
        block: BlockInfo,
        chan: peer::Sender,
    },
    Recheck {
        id: TorrentId,
        tx: oneshot::Sender<Result<Bitfield>>,
    },
    Move {
        id: TorrentId,
        dest: PathBuf,
        tx: oneshot::Sender<Result<PathBuf>>,
    },
    RemoveTorrent {
        id: TorrentId,
    },
    Shutdown,
}

/// What the disk task reports back to a torrent.
#[derive(Debug)]
pub(crate) enum TorrentAlert {
    /// A piece gathered all its blocks and was hashed; if the hash matched
    /// it is on disk by the time this alert is observed.
    PieceCompletion {
        index: PieceIndex,
        is_valid: bool,
    },
    /// Writing a verified piece failed. Fatal to the torrent.
    StorageError(Error),
}
