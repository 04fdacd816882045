//! The peer manager: admits candidate addresses discovered by
//! tracker announces, dials them with bounded concurrency, registers live
//! sessions, purges inactive ones, samples aggregate throughput, and relays
//! cross-session broadcasts (Have, endgame cancels) that a lone
//! [`PeerSession`] has no way to reach on its own.
//!
//! Runs as its own task, the same actor shape as [`crate::disk::Disk`]: a
//! handle sends it work over channels, the loop in [`PeerManager::run`]
//! processes one event at a time.

use std::{collections::HashMap, sync::Arc, time::Duration, time::Instant};

use tokio::sync::{mpsc, oneshot, RwLock, Semaphore};

use crate::{
    conf::TorrentConf,
    counter::Stats,
    disk::Storage,
    peer::{Command, CommandSender, Event, PeerAddr, PeerSession, SharedCtx},
    piece_picker::Picker,
    storage_info::StorageInfo,
    PeerId as ClientId, PieceIndex, Sha1Hash, TorrentId,
};

const RATE_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);
const REFILL_CHECK_INTERVAL: Duration = Duration::from_secs(5);
/// How often the manager asks the picker for requests that have been
/// outstanding longer than `request_timeout`, reassigning them the same way
/// an explicit peer timeout would.
const TIMEOUT_SCAN_INTERVAL: Duration = Duration::from_secs(5);

/// A live session's bookkeeping, as seen by the manager.
struct PeerEntry {
    cmd: CommandSender,
    stats: Stats,
    last_active: Instant,
}

enum Msg {
    /// A dialing task's handshake completed; re-check saturation/dup now
    /// that the connection is live.
    HandshakeDone(PeerAddr),
    SessionEvent(Event),
}

/// A cheap handle callers outside the manager's task use to feed it work.
#[derive(Clone)]
pub(crate) struct PeerManagerHandle {
    admit_tx: mpsc::Sender<PeerAddr>,
    stats_tx: mpsc::UnboundedSender<oneshot::Sender<(Stats, usize)>>,
}

impl PeerManagerHandle {
    /// Pushes candidate addresses (e.g. from a tracker announce) into the
    /// bounded admission channel; an address is silently dropped if the
    /// channel is full.
    pub(crate) fn admit_peers(&self, addrs: Vec<PeerAddr>) {
        for addr in addrs {
            if self.admit_tx.try_send(addr).is_err() {
                log::debug!("Peer admission channel full, dropping {}", addr);
            }
        }
    }

    /// Asks the manager's loop for its current aggregate stats and live peer
    /// count, for the torrent's tracker announce parameters. Returns zeroed
    /// defaults if the manager has already shut down.
    pub(crate) async fn stats(&self) -> (Stats, usize) {
        let (tx, rx) = oneshot::channel();
        if self.stats_tx.send(tx).is_err() {
            return (Stats::new(), 0);
        }
        rx.await.unwrap_or_else(|_| (Stats::new(), 0))
    }
}

/// Owns every peer session of a single torrent and the shared state needed
/// to dial, register, purge, and broadcast to them.
pub(crate) struct PeerManager {
    ctx: Arc<SharedCtx>,
    conf: Arc<TorrentConf>,
    dial_semaphore: Arc<Semaphore>,
    registry: HashMap<PeerAddr, PeerEntry>,
    admit_rx: mpsc::Receiver<PeerAddr>,
    msg_tx: mpsc::UnboundedSender<Msg>,
    msg_rx: mpsc::UnboundedReceiver<Msg>,
    /// Signalled (capacity 1, lossy) whenever live peer count drops below
    /// `peer_refill_watermark`; the torrent's announce loop listens on this
    /// to trigger an out-of-band tracker announce.
    refill_tx: mpsc::Sender<()>,
    torrent_stats: Stats,
    last_sample_totals: (u64, u64),
    stats_rx: mpsc::UnboundedReceiver<oneshot::Sender<(Stats, usize)>>,
}

impl PeerManager {
    /// Builds the manager, the shared session context every dialed peer
    /// will clone a handle to, and the lightweight handle callers use to
    /// feed it admitted addresses.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        torrent_id: TorrentId,
        info_hash: Sha1Hash,
        client_id: ClientId,
        conf: Arc<TorrentConf>,
        storage_info: Arc<StorageInfo>,
        piece_picker: Arc<RwLock<Picker>>,
        storage: Storage,
        refill_tx: mpsc::Sender<()>,
    ) -> (Self, PeerManagerHandle) {
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let events_tx = msg_tx.clone();
        let events = EventForwarder(events_tx);
        let (admit_tx, admit_rx) = mpsc::channel(conf.max_peers);
        let (stats_tx, stats_rx) = mpsc::unbounded_channel();
        let ctx = Arc::new(SharedCtx {
            torrent_id,
            info_hash,
            client_id,
            conf: conf.clone(),
            storage_info,
            piece_picker,
            storage,
            events: events.into_sender(),
        });
        let manager = Self {
            dial_semaphore: Arc::new(Semaphore::new(conf.max_concurrent_dials())),
            ctx,
            conf,
            registry: HashMap::new(),
            admit_rx,
            msg_tx,
            msg_rx,
            refill_tx,
            torrent_stats: Stats::new(),
            last_sample_totals: (0, 0),
            stats_rx,
        };
        (manager, PeerManagerHandle { admit_tx, stats_tx })
    }

    fn live_count(&self) -> usize {
        self.registry.len()
    }

    /// Runs until `shutdown` resolves (the torrent's cancellation signal),
    /// processing admissions, session events, and the heartbeat/rate/refill
    /// tickers.
    pub(crate) async fn run(&mut self, shutdown: impl std::future::Future<Output = ()>) {
        tokio::pin!(shutdown);
        let mut heartbeat = tokio::time::interval(self.conf.peer_heartbeat_interval);
        let mut rate_ticker = tokio::time::interval(RATE_SAMPLE_INTERVAL);
        let mut refill_ticker = tokio::time::interval(REFILL_CHECK_INTERVAL);
        let mut timeout_ticker = tokio::time::interval(TIMEOUT_SCAN_INTERVAL);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    self.broadcast_shutdown();
                    break;
                }
                addr = self.admit_rx.recv() => {
                    match addr {
                        Some(addr) => self.dial(addr),
                        None => break,
                    }
                }
                msg = self.msg_rx.recv() => {
                    match msg {
                        Some(Msg::HandshakeDone(addr)) => self.recheck_after_handshake(addr),
                        Some(Msg::SessionEvent(event)) => self.handle_event(event),
                        None => break,
                    }
                }
                reply = self.stats_rx.recv() => {
                    if let Some(reply) = reply {
                        reply.send((self.aggregate_stats(), self.live_count())).ok();
                    }
                }
                _ = heartbeat.tick() => self.purge_idle(),
                _ = rate_ticker.tick() => self.sample_rates(),
                _ = refill_ticker.tick() => self.maybe_signal_refill(),
                _ = timeout_ticker.tick() => self.reassign_timeouts().await,
            }
        }
    }

    /// Asks the picker for requests that have timed out and relays a CANCEL
    /// to each timed-out owner, mirroring an endgame duplicate cancel.
    async fn reassign_timeouts(&mut self) {
        let timed_out = self.ctx.piece_picker.write().await.scan_timeouts(Instant::now());
        for t in timed_out {
            if let Some(entry) = self.registry.get(&t.peer) {
                entry
                    .cmd
                    .send(Command::Cancel {
                        piece_index: t.piece_index,
                        begin: t.begin,
                    })
                    .ok();
            }
        }
    }

    /// Rejects an address already registered; otherwise registers it
    /// optimistically (without regard to the peer cap -- several addresses
    /// admitted in quick succession, each dialing concurrently behind the
    /// dial semaphore, can all be inserted before any of their handshakes
    /// complete) and spawns the connect+handshake task.
    /// [`Self::recheck_after_handshake`] is where the cap is actually
    /// enforced: it undoes the optimistic registration if the registry no
    /// longer fits once the handshake completes, closing the race window
    /// between dial and registration.
    fn dial(&mut self, addr: PeerAddr) {
        if self.registry.contains_key(&addr) {
            return;
        }

        let ctx = self.ctx.clone();
        let semaphore = self.dial_semaphore.clone();
        let msg_tx = self.msg_tx.clone();
        let (mut session, cmd) = PeerSession::outbound(ctx, addr);

        self.registry.insert(
            addr,
            PeerEntry {
                cmd,
                stats: Stats::new(),
                last_active: Instant::now(),
            },
        );

        tokio::spawn(async move {
            let permit = semaphore.acquire_owned().await;
            let (handshake_tx, handshake_rx) = oneshot::channel();

            let mut run = Box::pin(session.start(Some(handshake_tx)));
            let mut handshake_rx = Some(handshake_rx);
            loop {
                tokio::select! {
                    result = &mut run => {
                        drop(permit);
                        if let Err(e) = result {
                            log::info!("Peer {} session ended: {}", addr, e);
                        }
                        msg_tx.send(Msg::SessionEvent(Event::SessionEnded(addr))).ok();
                        break;
                    }
                    _ = async { handshake_rx.as_mut().unwrap().await }, if handshake_rx.is_some() => {
                        handshake_rx = None;
                        msg_tx.send(Msg::HandshakeDone(addr)).ok();
                    }
                }
            }
        });
    }

    /// The registry entry was inserted optimistically before the dial even
    /// started; once the handshake actually completes, re-validate against
    /// current saturation and drop the session if it no longer fits.
    fn recheck_after_handshake(&mut self, addr: PeerAddr) {
        if self.live_count() > self.conf.max_peers {
            if let Some(entry) = self.registry.remove(&addr) {
                entry.cmd.send(Command::Shutdown).ok();
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::PieceVerified { addr, piece_index } => {
                self.broadcast_have(piece_index, addr);
            }
            Event::Stats { addr, stats } => {
                if let Some(entry) = self.registry.get_mut(&addr) {
                    entry.stats = stats;
                    entry.last_active = Instant::now();
                }
            }
            Event::CancelDuplicate(cancel) => {
                if let Some(entry) = self.registry.get(&cancel.peer) {
                    entry
                        .cmd
                        .send(Command::Cancel {
                            piece_index: cancel.piece_index,
                            begin: cancel.begin,
                        })
                        .ok();
                }
            }
            Event::SessionEnded(addr) => {
                self.registry.remove(&addr);
            }
        }
    }

    /// Sends a Have to every registered peer except `exclude` (the one that
    /// delivered the completing block).
    fn broadcast_have(&self, piece_index: PieceIndex, exclude: PeerAddr) {
        for (addr, entry) in &self.registry {
            if *addr == exclude {
                continue;
            }
            // a full outbound queue drops the broadcast rather than
            // blocking the manager loop on one slow peer.
            entry.cmd.send(Command::Have { piece_index }).ok();
        }
    }

    fn broadcast_shutdown(&self) {
        for entry in self.registry.values() {
            entry.cmd.send(Command::Shutdown).ok();
        }
    }

    /// Drops sessions whose last activity (a Stats heartbeat, or session
    /// registration) is older than `keep_alive_interval`. The session's own
    /// idle timeout covers the common stall case; this is the backstop for
    /// a session that's wedged without erroring out on its own.
    fn purge_idle(&mut self) {
        let stale: Vec<PeerAddr> = self
            .registry
            .iter()
            .filter(|(_, entry)| entry.last_active.elapsed() > self.conf.keep_alive_interval)
            .map(|(addr, _)| *addr)
            .collect();
        for addr in stale {
            log::debug!("Purging idle peer {}", addr);
            if let Some(entry) = self.registry.remove(&addr) {
                entry.cmd.send(Command::Shutdown).ok();
            }
        }
    }

    /// Folds the delta in registry-wide cumulative totals since the last
    /// tick into the torrent-wide EWMA rate.
    fn sample_rates(&mut self) {
        let (downloaded, uploaded) = self.registry.values().fold((0u64, 0u64), |acc, e| {
            (
                acc.0 + e.stats.downloaded.total(),
                acc.1 + e.stats.uploaded.total(),
            )
        });
        let (prev_down, prev_up) = self.last_sample_totals;
        self.torrent_stats.sample(
            downloaded.saturating_sub(prev_down),
            uploaded.saturating_sub(prev_up),
            RATE_SAMPLE_INTERVAL,
        );
        self.last_sample_totals = (downloaded, uploaded);
    }

    fn maybe_signal_refill(&self) {
        if self.live_count() < self.conf.peer_refill_watermark {
            // a full channel means a refill is already pending; don't block.
            self.refill_tx.try_send(()).ok();
        }
    }

    /// The torrent-wide throughput snapshot last computed by the rate
    /// sampler, plus block/piece counters aggregated across every live
    /// session.
    pub(crate) fn aggregate_stats(&self) -> Stats {
        let mut total = self.torrent_stats;
        for entry in self.registry.values() {
            total.blocks_received += entry.stats.blocks_received;
            total.blocks_sent += entry.stats.blocks_sent;
            total.pieces_verified += entry.stats.pieces_verified;
            total.pieces_failed += entry.stats.pieces_failed;
        }
        total
    }

    pub(crate) fn live_peer_count(&self) -> usize {
        self.live_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        conf::{PieceDownloadStrategy, TorrentConf},
        piece_picker::PickerConf,
        storage_info::{FileInfo, FsStructure, StorageInfo},
    };
    use std::{
        net::{IpAddr, Ipv4Addr, SocketAddr},
        path::PathBuf,
    };

    fn addr(port: u16) -> PeerAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    fn test_storage_info() -> Arc<StorageInfo> {
        Arc::new(StorageInfo {
            piece_count: 1,
            piece_len: 16384,
            last_piece_len: 16384,
            download_len: 16384,
            download_dir: PathBuf::from("/tmp"),
            structure: FsStructure::File(FileInfo {
                path: PathBuf::from("demo"),
                len: 16384,
                torrent_offset: 0,
            }),
        })
    }

    fn test_picker() -> Arc<RwLock<Picker>> {
        let hashes = [[0u8; 20]];
        let conf = PickerConf {
            strategy: PieceDownloadStrategy::Sequential,
            max_global_inflight: 10,
            max_inflight_per_peer: 5,
            max_requests_per_block: 1,
            endgame_threshold: 32,
            endgame_dup_per_block: 2,
            request_timeout: Duration::from_secs(30),
            random_first_threshold: 4,
        };
        Arc::new(RwLock::new(Picker::new(1, 16384, 16384, &hashes, 10, conf)))
    }

    fn test_manager() -> (PeerManager, mpsc::Receiver<()>) {
        let conf = Arc::new(TorrentConf::new("/tmp"));
        let storage = Storage::spawn();
        let (refill_tx, refill_rx) = mpsc::channel(1);
        let (manager, _handle) = PeerManager::new(
            0,
            [0u8; 20],
            [1u8; 20],
            conf,
            test_storage_info(),
            test_picker(),
            storage,
            refill_tx,
        );
        (manager, refill_rx)
    }

    #[tokio::test]
    async fn purge_idle_removes_stale_entries_and_sends_shutdown() {
        let (mut manager, _refill_rx) = test_manager();
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<Command>();
        manager.registry.insert(
            addr(1),
            PeerEntry {
                cmd: cmd_tx,
                stats: Stats::new(),
                last_active: Instant::now() - manager.conf.keep_alive_interval
                    - Duration::from_secs(1),
            },
        );

        manager.purge_idle();

        assert!(manager.registry.is_empty());
        assert!(matches!(cmd_rx.recv().await, Some(Command::Shutdown)));
    }

    #[tokio::test]
    async fn purge_idle_keeps_recently_active_entries() {
        let (mut manager, _refill_rx) = test_manager();
        let (cmd_tx, _cmd_rx) = mpsc::unbounded_channel::<Command>();
        manager.registry.insert(
            addr(1),
            PeerEntry {
                cmd: cmd_tx,
                stats: Stats::new(),
                last_active: Instant::now(),
            },
        );

        manager.purge_idle();

        assert_eq!(manager.registry.len(), 1);
    }

    #[tokio::test]
    async fn maybe_signal_refill_below_watermark() {
        let (manager, mut refill_rx) = test_manager();
        // an empty registry is below any positive watermark.
        manager.maybe_signal_refill();
        assert!(refill_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn maybe_signal_refill_at_watermark_is_silent() {
        let (mut manager, mut refill_rx) = test_manager();
        manager.conf = Arc::new({
            let mut c = (*manager.conf).clone();
            c.peer_refill_watermark = 0;
            c
        });

        manager.maybe_signal_refill();

        assert!(refill_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn aggregate_stats_sums_registry_and_torrent_totals() {
        let (mut manager, _refill_rx) = test_manager();
        let (cmd_tx, _cmd_rx) = mpsc::unbounded_channel::<Command>();
        let mut stats = Stats::new();
        stats.blocks_received = 3;
        stats.pieces_verified = 1;
        manager.registry.insert(
            addr(2),
            PeerEntry {
                cmd: cmd_tx,
                stats,
                last_active: Instant::now(),
            },
        );

        let total = manager.aggregate_stats();

        assert_eq!(total.blocks_received, 3);
        assert_eq!(total.pieces_verified, 1);
    }

    #[tokio::test]
    async fn dial_is_a_noop_for_an_already_registered_peer() {
        let (mut manager, _refill_rx) = test_manager();
        let (cmd_tx, _cmd_rx) = mpsc::unbounded_channel::<Command>();
        manager.registry.insert(
            addr(3),
            PeerEntry {
                cmd: cmd_tx,
                stats: Stats::new(),
                last_active: Instant::now(),
            },
        );

        manager.dial(addr(3));

        assert_eq!(manager.registry.len(), 1);
    }

    #[tokio::test]
    async fn recheck_after_handshake_evicts_once_over_cap() {
        let (mut manager, _refill_rx) = test_manager();
        manager.conf = Arc::new({
            let mut c = (*manager.conf).clone();
            c.max_peers = 1;
            c
        });
        let (cmd_tx_1, _cmd_rx_1) = mpsc::unbounded_channel::<Command>();
        let (cmd_tx_2, mut cmd_rx_2) = mpsc::unbounded_channel::<Command>();
        // both optimistically registered past the cap, as dial() now allows.
        manager.registry.insert(
            addr(1),
            PeerEntry {
                cmd: cmd_tx_1,
                stats: Stats::new(),
                last_active: Instant::now(),
            },
        );
        manager.registry.insert(
            addr(2),
            PeerEntry {
                cmd: cmd_tx_2,
                stats: Stats::new(),
                last_active: Instant::now(),
            },
        );
        assert_eq!(manager.registry.len(), 2);

        manager.recheck_after_handshake(addr(2));

        assert_eq!(manager.registry.len(), 1);
        assert!(!manager.registry.contains_key(&addr(2)));
        assert!(matches!(cmd_rx_2.recv().await, Some(Command::Shutdown)));
    }

    #[tokio::test]
    async fn dial_admits_past_the_cap_leaving_eviction_to_the_recheck() {
        let (mut manager, _refill_rx) = test_manager();
        manager.conf = Arc::new({
            let mut c = (*manager.conf).clone();
            c.max_peers = 0;
            c
        });

        manager.dial(addr(4));

        assert_eq!(manager.registry.len(), 1);
    }
}

/// Wraps the manager's own message channel so a [`SharedCtx`] built for a
/// session can report [`Event`]s straight into [`PeerManager::run`]'s select
/// loop alongside admissions and handshake replies.
struct EventForwarder(mpsc::UnboundedSender<Msg>);

impl EventForwarder {
    fn into_sender(self) -> mpsc::UnboundedSender<Event> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        let inner = self.0;
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if inner.send(Msg::SessionEvent(event)).is_err() {
                    break;
                }
            }
        });
        tx
    }
}
