use std::{
    collections::{BTreeMap, HashMap},
    fs::{self, OpenOptions},
    ops::Range,
    os::unix::io::AsRawFd,
};

use nix::sys::uio::{preadv, pwritev};
use sha1::{Digest, Sha1};
use std::fs::File as StdFile;
use std::sync::{Arc, Mutex};

use super::{Command, CommandReceiver};
use crate::{
    block_count,
    error::{Error, Result},
    iovecs::{IoVec, IoVecs},
    storage_info::{FsStructure, StorageInfo},
    BlockInfo, FileIndex, FileInfo, PieceIndex, Sha1Hash, TorrentId,
};

/// The disk IO event loop: owns every torrent's write buffers and file
/// handles, and processes [`Command`]s sent to it one at a time.
pub(crate) struct Disk {
    torrents: HashMap<TorrentId, Torrent>,
    cmd_port: CommandReceiver,
}

impl Disk {
    pub(super) fn new(cmd_port: CommandReceiver) -> Self {
        Self {
            torrents: HashMap::new(),
            cmd_port,
        }
    }

    /// Runs the disk event loop until the channel closes or [`Command::Shutdown`]
    /// is received.
    pub(super) async fn start(&mut self) -> Result<()> {
        log::info!("Starting disk IO event loop");
        while let Some(cmd) = self.cmd_port.recv().await {
            match cmd {
                Command::NewTorrent { id, info, reply } => {
                    let result = self.new_torrent(id, info);
                    let _ = reply.send(result);
                }
                Command::BufferBlock {
                    id,
                    info,
                    data,
                    reply,
                } => {
                    let result = self.buffer_block(id, info, data);
                    let _ = reply.send(result);
                }
                Command::FlushPiece {
                    id,
                    piece_index,
                    expected_hash,
                    reply,
                } => {
                    let result = self.flush_piece(id, piece_index, expected_hash).await;
                    let _ = reply.send(result);
                }
                Command::ReadStreamAt {
                    id,
                    offset,
                    len,
                    reply,
                } => {
                    let result = self.read_stream_at(id, offset, len);
                    let _ = reply.send(result);
                }
                Command::RecheckPiece {
                    id,
                    piece_index,
                    expected_hash,
                    reply,
                } => {
                    let result = self.recheck_piece(id, piece_index, expected_hash);
                    let _ = reply.send(result);
                }
                Command::RemoveTorrent { id } => {
                    self.torrents.remove(&id);
                }
                Command::Shutdown => {
                    log::info!("Shutting down disk event loop");
                    break;
                }
            }
        }
        Ok(())
    }

    fn torrent(&self, id: TorrentId) -> Result<&Torrent> {
        self.torrents.get(&id).ok_or(Error::InvalidTorrentId)
    }

    fn torrent_mut(&mut self, id: TorrentId) -> Result<&mut Torrent> {
        self.torrents.get_mut(&id).ok_or(Error::InvalidTorrentId)
    }

    fn new_torrent(&mut self, id: TorrentId, info: StorageInfo) -> Result<()> {
        if self.torrents.contains_key(&id) {
            log::warn!("Torrent {} already allocated", id);
            return Ok(());
        }
        let torrent = Torrent::new(info)?;
        log::info!("Torrent {} successfully allocated", id);
        self.torrents.insert(id, torrent);
        Ok(())
    }

    fn buffer_block(
        &mut self,
        id: TorrentId,
        info: BlockInfo,
        data: Vec<u8>,
    ) -> Result<()> {
        self.torrent_mut(id)?.buffer_block(info, data)
    }

    async fn flush_piece(
        &mut self,
        id: TorrentId,
        piece_index: PieceIndex,
        expected_hash: Sha1Hash,
    ) -> Result<bool> {
        let piece_len = self.torrent(id)?.info.piece_len(piece_index)?;
        let torrent = self.torrent_mut(id)?;
        let piece = torrent
            .pieces
            .get(&piece_index)
            .ok_or(Error::InvalidWrite("flush of unbuffered piece"))?;
        if piece.blocks.len() != block_count(piece_len) {
            return Err(Error::InvalidWrite("flush of incomplete piece"));
        }

        let files = Arc::clone(&torrent.files);
        let piece = torrent.pieces.remove(&piece_index).unwrap();
        let matches = tokio::task::spawn_blocking(move || piece.matches_hash(&expected_hash))
            .await
            .map_err(|_| Error::InvalidWrite("hashing task panicked"))?;

        if !matches.0 {
            log::warn!("Piece {} failed verification", piece_index);
            return Ok(false);
        }
        log::info!("Piece {} verified, flushing to disk", piece_index);
        let piece = matches.1;
        let piece_torrent_offset = piece_index as u64 * piece_len as u64;
        tokio::task::spawn_blocking(move || piece.write(piece_torrent_offset, &files))
            .await
            .map_err(|_| Error::InvalidWrite("disk write task panicked"))??;
        Ok(true)
    }

    fn read_stream_at(
        &self,
        id: TorrentId,
        offset: u64,
        len: u32,
    ) -> Result<Vec<u8>> {
        let torrent = self.torrent(id)?;
        let end = offset + len as u64;
        let file_range = torrent.info.structure.files_intersecting_bytes(offset..end);
        let mut out = Vec::with_capacity(len as usize);
        for file in &torrent.files[file_range] {
            let file = file.lock().expect("torrent file mutex poisoned");
            let slice = file.info.get_slice(offset.max(file.info.torrent_offset), len as u64);
            let mut buf = vec![0u8; slice.len as usize];
            file.read_vectored_at(&mut buf, slice.offset)?;
            out.extend_from_slice(&buf);
        }
        Ok(out)
    }

    fn recheck_piece(
        &self,
        id: TorrentId,
        piece_index: PieceIndex,
        expected_hash: Sha1Hash,
    ) -> Result<bool> {
        let torrent = self.torrent(id)?;
        let piece_len = torrent.info.piece_len(piece_index)?;
        let offset = piece_index as u64 * torrent.info.piece_len as u64;
        let bytes = self.read_stream_at(id, offset, piece_len)?;
        let digest = Sha1::digest(&bytes);
        Ok(digest.as_slice() == expected_hash)
    }
}

/// Per-torrent disk state: its file layout, open file handles, and the
/// in-progress write buffer of pieces that haven't yet been hashed/flushed.
struct Torrent {
    info: StorageInfo,
    pieces: HashMap<PieceIndex, Piece>,
    files: Arc<Vec<Mutex<TorrentFile>>>,
}

impl Torrent {
    /// Creates the file system structure of the torrent and opens the file
    /// handles, truncating any existing content to the declared length.
    fn new(info: StorageInfo) -> Result<Self> {
        let open_file = |file_info: FileInfo| -> Result<Mutex<TorrentFile>> {
            if let Some(parent) = file_info.path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    fs::create_dir_all(parent)?;
                }
            }
            let handle = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&file_info.path)?;
            handle.set_len(file_info.len)?;
            Ok(Mutex::new(TorrentFile {
                info: file_info,
                handle,
            }))
        };

        let files = match &info.structure {
            FsStructure::File(file) => {
                let mut file = file.clone();
                file.path = info.download_dir.join(&file.path);
                vec![open_file(file)?]
            }
            FsStructure::Archive { files } => {
                let mut torrent_files = Vec::with_capacity(files.len());
                for file in files.iter() {
                    let mut file = file.clone();
                    file.path = info.download_dir.join(&file.path);
                    torrent_files.push(open_file(file)?);
                }
                torrent_files
            }
        };

        Ok(Self {
            info,
            pieces: HashMap::new(),
            files: Arc::new(files),
        })
    }

    fn buffer_block(&mut self, info: BlockInfo, data: Vec<u8>) -> Result<()> {
        let piece_index = info.piece_index;
        if !self.pieces.contains_key(&piece_index) {
            self.start_new_piece(piece_index)?;
        }
        let piece = self
            .pieces
            .get_mut(&piece_index)
            .expect("newly inserted piece is missing");
        piece.enqueue_block(info.offset, data);
        Ok(())
    }

    fn start_new_piece(&mut self, piece_index: PieceIndex) -> Result<()> {
        let len = self.info.piece_len(piece_index)?;
        let files = self.info.files_intersecting_piece(piece_index)?;
        self.pieces.insert(
            piece_index,
            Piece {
                len,
                blocks: BTreeMap::new(),
                files,
            },
        );
        Ok(())
    }
}

pub(crate) struct TorrentFile {
    info: FileInfo,
    handle: StdFile,
}

impl TorrentFile {
    fn write_vectored_at(
        &self,
        iovecs: &mut IoVecs<'_>,
        offset: u64,
    ) -> Result<usize> {
        let mut total_write_count = 0;
        while !iovecs.buffers().is_empty() {
            let write_count =
                pwritev(self.handle.as_raw_fd(), iovecs.buffers(), offset as i64)
                    .map_err(|e| {
                        log::warn!("File {:?} write error: {}", self.info.path, e);
                        Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
                    })?;
            iovecs.advance(write_count);
            total_write_count += write_count;
        }
        Ok(total_write_count)
    }

    fn read_vectored_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let iov = [nix::sys::uio::IoVec::from_mut_slice(buf)];
        preadv(self.handle.as_raw_fd(), &iov, offset as i64).map_err(|e| {
            log::warn!("File {:?} read error: {}", self.info.path, e);
            Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
        })
    }
}

/// An in-progress piece download that keeps in memory the so-far
/// downloaded blocks. The expected hash isn't stored here: it is passed in
/// by the caller at flush/recheck time.
struct Piece {
    len: u32,
    /// Blocks keyed by their byte offset within the piece, kept sorted so
    /// hashing/writing can walk them in order.
    blocks: BTreeMap<u32, Vec<u8>>,
    /// The files this piece overlaps with, as a range into `Torrent::files`.
    files: Range<FileIndex>,
}

impl Piece {
    fn enqueue_block(&mut self, offset: u32, data: Vec<u8>) {
        if self.blocks.contains_key(&offset) {
            log::warn!("Duplicate piece block at offset {}", offset);
        } else {
            self.blocks.insert(offset, data);
        }
    }

    /// Hashes the concatenation of this piece's blocks and compares it to
    /// `expected_hash`. Returns the outcome alongside `self` so the caller
    /// can reuse it for the subsequent disk write without re-buffering.
    fn matches_hash(self, expected_hash: &Sha1Hash) -> (bool, Self) {
        debug_assert_eq!(self.blocks.len(), block_count(self.len));
        let mut hasher = Sha1::new();
        for block in self.blocks.values() {
            hasher.update(block);
        }
        let hash = hasher.finalize();
        let matches = hash.as_slice() == expected_hash;
        (matches, self)
    }

    /// Writes this piece's blocks to the files it overlaps with.
    fn write(
        &self,
        piece_torrent_offset: u64,
        files: &[Mutex<TorrentFile>],
    ) -> Result<usize> {
        let mut total_write_count = 0;

        let mut blocks: Vec<_> =
            self.blocks.values().map(|b| IoVec::from_slice(b)).collect();
        let mut bufs = blocks.as_mut_slice();
        let mut write_torrent_offset = piece_torrent_offset;

        let files = &files[self.files.clone()];
        debug_assert!(!files.is_empty());
        if files.len() == 1 {
            let file = files.first().unwrap().lock().expect("mutex poisoned");
            let slice = file.info.get_slice(write_torrent_offset, self.len as u64);
            let mut iovecs = IoVecs::unbounded(bufs);
            total_write_count += file.write_vectored_at(&mut iovecs, slice.offset)?;
            bufs = iovecs.into_tail();
        } else {
            for file in files.iter() {
                let file = file.lock().expect("mutex poisoned");
                let slice = file.info.get_slice(write_torrent_offset, self.len as u64);
                debug_assert!(slice.len > 0);
                debug_assert!(!bufs.is_empty());

                let mut iovecs = IoVecs::bounded(bufs, slice.len as usize);
                let write_count = file.write_vectored_at(&mut iovecs, slice.offset)?;
                bufs = iovecs.into_tail();

                write_torrent_offset += write_count as u64;
                total_write_count += write_count;
            }
        }

        debug_assert!(bufs.is_empty());
        Ok(total_write_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::Content;

    fn storage_info(dir: &std::path::Path) -> StorageInfo {
        let content = Content::Single { length: 10 };
        let structure = FsStructure::from_content(&content, "demo.bin");
        StorageInfo {
            piece_count: 1,
            piece_len: 10,
            last_piece_len: 10,
            download_len: 10,
            download_dir: dir.to_path_buf(),
            structure,
        }
    }

    #[test]
    fn buffer_then_flush_roundtrip() {
        let dir = std::env::temp_dir().join(format!(
            "torrent_core_disk_test_{}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();

        let info = storage_info(&dir);
        let mut torrent = Torrent::new(info).unwrap();
        torrent
            .buffer_block(
                BlockInfo {
                    piece_index: 0,
                    offset: 0,
                    len: 10,
                },
                b"abcdefghij".to_vec(),
            )
            .unwrap();

        let piece = torrent.pieces.get(&0).unwrap();
        assert_eq!(piece.blocks.len(), 1);

        let expected = {
            let digest = Sha1::digest(b"abcdefghij");
            let mut h = [0u8; 20];
            h.copy_from_slice(&digest);
            h
        };
        let piece = torrent.pieces.remove(&0).unwrap();
        let (matches, piece) = piece.matches_hash(&expected);
        assert!(matches);
        piece.write(0, &torrent.files).unwrap();

        let written = fs::read(dir.join("demo.bin")).unwrap();
        assert_eq!(written, b"abcdefghij");

        let _ = fs::remove_dir_all(&dir);
    }
}
