//! Storage: buffers downloaded blocks in memory, verifies and flushes
//! complete pieces to disk, and serves reads back out of the file tree.
//!
//! Disk access runs on its own task (the [`Disk`] event loop) so that
//! hashing and syscalls never block a peer session's executor thread;
//! callers talk to it through the cheaply-clonable [`Storage`] handle,
//! which sends a command and awaits a one-shot reply.

mod io;

use tokio::sync::{mpsc, oneshot};

use crate::{
    error::{Error, Result},
    storage_info::StorageInfo,
    BlockInfo, PieceIndex, Sha1Hash, TorrentId,
};

pub(crate) use io::Disk;

/// A request sent to the [`Disk`] task, each carrying the one-shot channel
/// its result is returned on.
pub(crate) enum Command {
    NewTorrent {
        id: TorrentId,
        info: StorageInfo,
        reply: oneshot::Sender<Result<()>>,
    },
    BufferBlock {
        id: TorrentId,
        info: BlockInfo,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<()>>,
    },
    FlushPiece {
        id: TorrentId,
        piece_index: PieceIndex,
        expected_hash: Sha1Hash,
        reply: oneshot::Sender<Result<bool>>,
    },
    ReadStreamAt {
        id: TorrentId,
        offset: u64,
        len: u32,
        reply: oneshot::Sender<Result<Vec<u8>>>,
    },
    RecheckPiece {
        id: TorrentId,
        piece_index: PieceIndex,
        expected_hash: Sha1Hash,
        reply: oneshot::Sender<Result<bool>>,
    },
    RemoveTorrent {
        id: TorrentId,
    },
    Shutdown,
}

pub(crate) type CommandSender = mpsc::UnboundedSender<Command>;
pub(crate) type CommandReceiver = mpsc::UnboundedReceiver<Command>;

/// A cheaply-clonable handle to the disk IO task.
#[derive(Clone)]
pub(crate) struct Storage {
    cmd_chan: CommandSender,
}

impl Storage {
    /// Spawns the disk IO task and returns a handle to it.
    pub(crate) fn spawn() -> Self {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        let mut disk = Disk::new(cmd_port);
        tokio::task::spawn(async move {
            if let Err(e) = disk.start().await {
                log::error!("Disk task exited with error: {}", e);
            }
        });
        Self { cmd_chan }
    }

    /// Registers a new torrent's file layout, creating/truncating its
    /// backing files.
    pub(crate) async fn new_torrent(
        &self,
        id: TorrentId,
        info: StorageInfo,
    ) -> Result<()> {
        let (reply, recv) = oneshot::channel();
        self.cmd_chan
            .send(Command::NewTorrent { id, info, reply })?;
        recv.await.map_err(|_| Error::ChannelClosed("disk reply"))?
    }

    /// Buffers a downloaded block in memory.
    pub(crate) async fn buffer_block(
        &self,
        id: TorrentId,
        info: BlockInfo,
        data: Vec<u8>,
    ) -> Result<()> {
        let (reply, recv) = oneshot::channel();
        self.cmd_chan.send(Command::BufferBlock {
            id,
            info,
            data,
            reply,
        })?;
        recv.await.map_err(|_| Error::ChannelClosed("disk reply"))?
    }

    /// Hashes a piece's buffered blocks; on match, writes them to disk and
    /// returns `Ok(true)`, otherwise drops the buffer and returns
    /// `Ok(false)`. Errors if the buffer is missing or incomplete.
    pub(crate) async fn flush_piece(
        &self,
        id: TorrentId,
        piece_index: PieceIndex,
        expected_hash: Sha1Hash,
    ) -> Result<bool> {
        let (reply, recv) = oneshot::channel();
        self.cmd_chan.send(Command::FlushPiece {
            id,
            piece_index,
            expected_hash,
            reply,
        })?;
        recv.await.map_err(|_| Error::ChannelClosed("disk reply"))?
    }

    /// Gather-reads `len` bytes starting at torrent-relative `offset`
    /// across however many files that range spans.
    pub(crate) async fn read_stream_at(
        &self,
        id: TorrentId,
        offset: u64,
        len: u32,
    ) -> Result<Vec<u8>> {
        let (reply, recv) = oneshot::channel();
        self.cmd_chan.send(Command::ReadStreamAt {
            id,
            offset,
            len,
            reply,
        })?;
        recv.await.map_err(|_| Error::ChannelClosed("disk reply"))?
    }

    /// Reads a piece already on disk and checks it against `expected_hash`,
    /// for resuming a partially downloaded torrent.
    pub(crate) async fn recheck_piece(
        &self,
        id: TorrentId,
        piece_index: PieceIndex,
        expected_hash: Sha1Hash,
    ) -> Result<bool> {
        let (reply, recv) = oneshot::channel();
        self.cmd_chan.send(Command::RecheckPiece {
            id,
            piece_index,
            expected_hash,
            reply,
        })?;
        recv.await.map_err(|_| Error::ChannelClosed("disk reply"))?
    }

    /// Drops a torrent's in-memory state. Already-written file contents are
    /// left on disk.
    pub(crate) fn remove_torrent(&self, id: TorrentId) -> Result<()> {
        self.cmd_chan.send(Command::RemoveTorrent { id })?;
        Ok(())
    }

    /// Tells the disk task to stop after draining any queued commands.
    pub(crate) fn shutdown(&self) -> Result<()> {
        self.cmd_chan.send(Command::Shutdown)?;
        Ok(())
    }
}
