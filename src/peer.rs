//! Per-peer state machine implementing the BitTorrent wire protocol:
//! handshake, choke/interest, bitfield/have, and the request/piece/cancel
//! block exchange, running as two concurrent loops (one per socket half)
//! joined on exit.

mod codec;

use std::{sync::Arc, time::Instant};

use futures::{SinkExt, StreamExt};
use tokio::{
    net::TcpStream,
    sync::{
        mpsc::{self, Receiver, Sender, UnboundedReceiver, UnboundedSender},
        oneshot, RwLock,
    },
    time,
};
use tokio_util::codec::{Framed, FramedParts};

use crate::{
    bitfield::Bitfield,
    conf::TorrentConf,
    counter::Stats,
    disk::Storage,
    error::*,
    piece_picker::{Cancel, PeerView, Picker},
    storage_info::StorageInfo,
    PeerId as ClientId, PieceIndex, Sha1Hash, TorrentId,
};
use codec::{Handshake, HandshakeCodec, Message, PeerCodec, PROTOCOL_STRING};

pub(crate) type PeerAddr = std::net::SocketAddr;

/// Commands the manager sends down to a running session.
pub(crate) enum Command {
    /// Relay a Have to the peer; the manager is responsible for excluding
    /// the peer that delivered the completing block.
    Have { piece_index: PieceIndex },
    /// Withdraw an outstanding request the picker has declared redundant
    /// (endgame duplicate whose block another peer already delivered).
    Cancel { piece_index: PieceIndex, begin: u32 },
    Shutdown,
}

/// Events a session reports up to the manager. Only the cross-peer
/// broadcast needs the manager's help;
/// everything else (picker, storage) the session reaches directly through
/// its shared handles.
pub(crate) enum Event {
    /// `addr` is whichever peer delivered the block that completed the
    /// piece, so the manager can exclude it from the resulting broadcast
    /// Have -- it already knows it has the piece.
    PieceVerified { addr: PeerAddr, piece_index: PieceIndex },
    Stats { addr: PeerAddr, stats: Stats },
    /// An endgame duplicate became redundant; the manager relays a Cancel
    /// command to whichever peer still owns the now-unneeded request.
    CancelDuplicate(Cancel),
    /// The session's task is about to exit; the manager drops it from its
    /// registry. Sent regardless of whether the session ended in error.
    SessionEnded(PeerAddr),
}

pub(crate) type CommandSender = UnboundedSender<Command>;
type CommandReceiver = UnboundedReceiver<Command>;

/// Everything a session needs that's shared with the rest of the torrent.
pub(crate) struct SharedCtx {
    pub torrent_id: TorrentId,
    pub info_hash: Sha1Hash,
    pub client_id: ClientId,
    pub conf: Arc<TorrentConf>,
    pub storage_info: Arc<StorageInfo>,
    pub piece_picker: Arc<RwLock<Picker>>,
    pub storage: Storage,
    pub events: UnboundedSender<Event>,
}

pub(crate) struct PeerSession {
    ctx: Arc<SharedCtx>,
    addr: PeerAddr,
    cmd_port: CommandReceiver,
    status: Status,
    stats: Stats,
    /// When `stats.downloaded`/`uploaded` were last folded into the EWMA
    /// rate; feeding `Instant::now().elapsed()` (always near zero) would
    /// keep the rate pinned at zero, so each sample needs the time since
    /// the *previous* one.
    last_throughput_sample: Instant,
    peer_bitfield: Bitfield,
    outgoing_requests: Vec<crate::BlockInfo>,
}

impl PeerSession {
    /// Creates a new outbound session, returning it alongside the command
    /// channel the manager uses to reach it.
    pub(crate) fn outbound(ctx: Arc<SharedCtx>, addr: PeerAddr) -> (Self, CommandSender) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        let piece_count = ctx.storage_info.piece_count;
        (
            Self {
                ctx,
                addr,
                cmd_port,
                status: Status::new(),
                stats: Stats::new(),
                last_throughput_sample: Instant::now(),
                peer_bitfield: Bitfield::new(piece_count),
                outgoing_requests: Vec::new(),
            },
            cmd_chan,
        )
    }

    /// Dials, handshakes, and runs the session to completion. `handshake_done`,
    /// if given, fires right after a successful handshake so the peer
    /// manager can perform its post-handshake saturation/duplicate recheck
    /// before counting this session as registered.
    pub(crate) async fn start(&mut self, handshake_done: Option<oneshot::Sender<()>>) -> Result<()> {
        log::info!("Connecting to peer {}", self.addr);
        let socket = time::timeout(self.ctx.conf.dial_timeout, TcpStream::connect(self.addr))
            .await
            .map_err(|_| Error::PeerTimedOut)??;
        log::info!("Connected to peer {}", self.addr);

        let mut socket = Framed::new(socket, HandshakeCodec);
        let handshake = Handshake::new(self.ctx.info_hash, self.ctx.client_id);
        socket.send(handshake.clone()).await?;

        let peer_handshake = match time::timeout(self.ctx.conf.dial_timeout, socket.next()).await
        {
            Ok(Some(hs)) => hs?,
            Ok(None) => return Err(Error::ChannelClosed("peer socket")),
            Err(_) => return Err(Error::PeerTimedOut),
        };
        debug_assert_eq!(&peer_handshake.prot, PROTOCOL_STRING.as_bytes());
        if peer_handshake.info_hash != self.ctx.info_hash {
            log::info!("Peer {} handshake invalid info hash", self.addr);
            return Err(Error::InvalidPeerInfoHash);
        }

        if let Some(tx) = handshake_done {
            // best-effort notification; the manager may no longer be
            // listening (e.g. it shut down), which isn't this session's
            // problem to report.
            tx.send(()).ok();
        }

        let old_parts = socket.into_parts();
        let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let socket = Framed::from_parts(new_parts);

        let result = self.run(socket).await;
        if result.is_err() {
            let mut picker = self.ctx.piece_picker.write().await;
            picker.on_peer_gone(self.addr, &self.peer_bitfield);
        }
        result
    }

    /// Runs the read and write loops concurrently until either exits.
    async fn run(&mut self, socket: Framed<TcpStream, PeerCodec>) -> Result<()> {
        let (sink, stream) = socket.split();
        let (out_tx, out_rx) = mpsc::channel(self.ctx.conf.peer_outbound_queue_backlog);

        let write_loop = Self::run_write_loop(
            sink,
            out_rx,
            self.ctx.conf.keep_alive_interval,
            self.ctx.conf.write_timeout,
        );
        let write_task = tokio::spawn(write_loop);

        let read_result = self.run_read_loop(stream, out_tx.clone()).await;
        drop(out_tx);
        let _ = write_task.await;

        self.ctx
            .events
            .send(Event::Stats {
                addr: self.addr,
                stats: self.stats,
            })
            .ok();

        read_result
    }

    /// Sends queued outbound messages and keep-alives; exits when the
    /// sender half is dropped or a write fails.
    async fn run_write_loop(
        mut sink: futures::stream::SplitSink<Framed<TcpStream, PeerCodec>, Message>,
        mut out_rx: Receiver<Message>,
        keep_alive_interval: std::time::Duration,
        write_timeout: std::time::Duration,
    ) -> Result<()> {
        let mut ticker = time::interval(keep_alive_interval);
        loop {
            tokio::select! {
                msg = out_rx.recv() => {
                    match msg {
                        Some(msg) => time::timeout(write_timeout, sink.send(msg))
                            .await
                            .map_err(|_| Error::PeerTimedOut)??,
                        None => break,
                    }
                }
                _ = ticker.tick() => {
                    time::timeout(write_timeout, sink.send(Message::KeepAlive))
                        .await
                        .map_err(|_| Error::PeerTimedOut)??;
                }
            }
        }
        Ok(())
    }

    /// Reads messages, dispatches them, and drives the block request
    /// pipeline; exits on idle timeout or a fatal I/O error.
    async fn run_read_loop(
        &mut self,
        mut stream: futures::stream::SplitStream<Framed<TcpStream, PeerCodec>>,
        out_tx: Sender<Message>,
    ) -> Result<()> {
        let mut last_active = Instant::now();
        let mut availability_exchange_done = false;
        // Periodic snapshot so the manager can sample rates and detect a
        // gone-quiet peer without polling each session directly.
        let mut heartbeat = time::interval(self.ctx.conf.peer_heartbeat_interval);

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    self.ctx
                        .events
                        .send(Event::Stats { addr: self.addr, stats: self.stats })
                        .ok();
                }
                cmd = self.cmd_port.recv() => {
                    match cmd {
                        Some(Command::Shutdown) | None => {
                            log::info!("Shutting down peer {} session", self.addr);
                            return Ok(());
                        }
                        Some(Command::Have { piece_index }) => {
                            out_tx
                                .send(Message::Have { piece_index })
                                .await
                                .map_err(|_| Error::ChannelClosed("peer outbound"))?;
                        }
                        Some(Command::Cancel { piece_index, begin }) => {
                            if let Some(pos) = self
                                .outgoing_requests
                                .iter()
                                .position(|b| b.piece_index == piece_index && b.offset == begin)
                            {
                                let block = self.outgoing_requests.remove(pos);
                                out_tx
                                    .send(Message::Cancel(block))
                                    .await
                                    .map_err(|_| Error::ChannelClosed("peer outbound"))?;
                            }
                        }
                    }
                }
                msg = time::timeout(self.ctx.conf.read_timeout, stream.next()) => {
                    let msg = match msg {
                        Ok(Some(msg)) => msg?,
                        Ok(None) => return Ok(()),
                        Err(_) => {
                            if last_active.elapsed() > self.ctx.conf.peer_idle_timeout {
                                return Err(Error::PeerTimedOut);
                            }
                            continue;
                        }
                    };
                    last_active = Instant::now();

                    if !availability_exchange_done {
                        availability_exchange_done = true;
                        if let Message::Bitfield(bf) = msg {
                            self.handle_bitfield(bf, &out_tx).await?;
                        } else {
                            self.handle_message(msg, &out_tx).await?;
                        }
                    } else {
                        self.handle_message(msg, &out_tx).await?;
                    }
                }
            }
        }
    }

    async fn handle_bitfield(&mut self, mut bf: Bitfield, out_tx: &Sender<Message>) -> Result<()> {
        bf.resize(self.ctx.storage_info.piece_count, false);
        log::debug!("Peer {} bitfield: {:?}", self.addr, bf);

        {
            let mut picker = self.ctx.piece_picker.write().await;
            picker.on_peer_bitfield(&bf);
        }
        self.peer_bitfield = bf;

        self.update_interest(out_tx).await?;
        self.make_requests(out_tx).await
    }

    async fn handle_message(&mut self, msg: Message, out_tx: &Sender<Message>) -> Result<()> {
        match msg {
            Message::KeepAlive => {}
            Message::Bitfield(_) => {
                return Err(Error::BitfieldNotAfterHandshake);
            }
            Message::Choke => {
                if !self.status.peer_choking {
                    log::info!("Peer {} choked us", self.addr);
                    self.status.peer_choking = true;
                    self.outgoing_requests.clear();
                }
            }
            Message::Unchoke => {
                if self.status.peer_choking {
                    log::info!("Peer {} unchoked us", self.addr);
                    self.status.peer_choking = false;
                    self.make_requests(out_tx).await?;
                }
            }
            Message::Interested => {
                self.status.peer_interested = true;
            }
            Message::NotInterested => {
                self.status.peer_interested = false;
            }
            Message::Have { piece_index } => {
                self.peer_bitfield.set(piece_index);
                {
                    let mut picker = self.ctx.piece_picker.write().await;
                    picker.on_peer_have(piece_index);
                }
                self.update_interest(out_tx).await?;
                self.make_requests(out_tx).await?;
            }
            Message::Request(_) => {
                // acceptable to no-op: this core only leeches.
            }
            Message::Cancel(_) => {}
            Message::Piece { piece_index, offset, data } => {
                self.handle_piece(piece_index, offset, data).await?;
                self.make_requests(out_tx).await?;
            }
        }
        Ok(())
    }

    async fn update_interest(&mut self, out_tx: &Sender<Message>) -> Result<()> {
        let want_something = {
            let picker = self.ctx.piece_picker.read().await;
            picker.has_any_wanted_piece(&self.peer_bitfield)
        };
        if want_something && !self.status.am_interested {
            self.status.am_interested = true;
            out_tx
                .send(Message::Interested)
                .await
                .map_err(|_| Error::ChannelClosed("peer outbound"))?;
        } else if !want_something && self.status.am_interested {
            self.status.am_interested = false;
            out_tx
                .send(Message::NotInterested)
                .await
                .map_err(|_| Error::ChannelClosed("peer outbound"))?;
        }
        Ok(())
    }

    /// Asks the picker for more block assignments and sends out Requests
    /// until the pipeline is full or nothing more is eligible.
    async fn make_requests(&mut self, out_tx: &Sender<Message>) -> Result<()> {
        if self.status.peer_choking || !self.status.am_interested {
            return Ok(());
        }
        let requests = {
            let mut picker = self.ctx.piece_picker.write().await;
            picker.next_for_peer(PeerView {
                peer: self.addr,
                has: &self.peer_bitfield,
                unchoked: !self.status.peer_choking,
            })
        };
        if requests.is_empty() {
            return Ok(());
        }
        self.outgoing_requests.extend_from_slice(&requests);
        for req in requests {
            out_tx
                .send(Message::Request(req))
                .await
                .map_err(|_| Error::ChannelClosed("peer outbound"))?;
        }
        Ok(())
    }

    /// Validates a received block against our own request queue, hands it
    /// to storage, and on piece completion verifies and reports upward.
    async fn handle_piece(
        &mut self,
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    ) -> Result<()> {
        let block_info = crate::BlockInfo {
            piece_index,
            offset,
            len: data.len() as u32,
        };

        let pos = self
            .outgoing_requests
            .iter()
            .position(|b| *b == block_info);
        let pos = match pos {
            Some(pos) => pos,
            None => {
                log::warn!("Peer {} sent unrequested block {:?}", self.addr, block_info);
                return Ok(());
            }
        };
        self.outgoing_requests.remove(pos);
        self.stats.blocks_received += 1;

        let (piece_complete, cancels) = {
            let mut picker = self.ctx.piece_picker.write().await;
            picker.on_block_received(self.addr, piece_index, offset)
        };
        for cancel in cancels {
            // endgame duplicates owned by other peers; this session has no
            // direct handle to them, the manager relays the cancel.
            log::debug!(
                "Endgame duplicate of piece {} block {} now redundant for {}",
                cancel.piece_index,
                cancel.begin,
                cancel.peer
            );
            self.ctx.events.send(Event::CancelDuplicate(cancel)).ok();
        }

        self.ctx
            .storage
            .buffer_block(self.ctx.torrent_id, block_info, data)
            .await?;
        let now = Instant::now();
        self.stats
            .downloaded
            .update(block_info.len as u64, now.duration_since(self.last_throughput_sample));
        self.last_throughput_sample = now;

        if piece_complete {
            self.verify_piece(piece_index).await?;
        }

        Ok(())
    }

    async fn verify_piece(&mut self, piece_index: PieceIndex) -> Result<()> {
        let expected_hash = {
            let picker = self.ctx.piece_picker.read().await;
            picker.piece_states()[piece_index].expected_hash
        };
        let ok = self
            .ctx
            .storage
            .flush_piece(self.ctx.torrent_id, piece_index, expected_hash)
            .await?;

        {
            let mut picker = self.ctx.piece_picker.write().await;
            picker.mark_piece_verified(piece_index, ok);
        }

        if ok {
            self.stats.pieces_verified += 1;
            self.ctx
                .events
                .send(Event::PieceVerified {
                    addr: self.addr,
                    piece_index,
                })
                .map_err(|_| Error::ChannelClosed("session events"))?;
        } else {
            self.stats.pieces_failed += 1;
            log::warn!("Piece {} failed verification", piece_index);
        }
        Ok(())
    }
}

/// A peer session's negotiated state. All four flags start at their
/// conventional defaults (am_choking=true, am_interested=false,
/// peer_choking=true, peer_interested=false).
#[derive(Clone, Copy, Debug)]
struct Status {
    am_choking: bool,
    am_interested: bool,
    peer_choking: bool,
    peer_interested: bool,
}

impl Status {
    fn new() -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_starts_choking_and_disinterested() {
        let status = Status::new();
        assert!(status.am_choking);
        assert!(!status.am_interested);
        assert!(status.peer_choking);
        assert!(!status.peer_interested);
    }

    #[test]
    fn command_have_and_cancel_carry_piece_coordinates() {
        let have = Command::Have { piece_index: 3 };
        assert!(matches!(have, Command::Have { piece_index: 3 }));

        let cancel = Command::Cancel { piece_index: 1, begin: 16384 };
        assert!(matches!(
            cancel,
            Command::Cancel { piece_index: 1, begin: 16384 }
        ));
    }
}
