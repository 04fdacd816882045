//! The swarm coordinator: per-torrent glue between the
//! tracker announce loop, the peer manager, the picker, and storage.
//! Owns nothing peers touch directly -- that's the peer manager's job --
//! but drives the announce cadence that feeds it candidate addresses and
//! reports progress.

use std::{future::Future, pin::Pin, sync::Arc};

use futures::future::{FutureExt, Shared};
use rand::Rng;
use tokio::{
    sync::{mpsc, oneshot, Mutex, RwLock},
    task::JoinHandle,
    time::{Duration, Instant},
};

use crate::{
    conf::TorrentConf,
    disk::Storage,
    error::{Error, Result},
    metainfo::Metainfo,
    peer_manager::{PeerManager, PeerManagerHandle},
    piece_picker::{Picker, PickerConf},
    storage_info::StorageInfo,
    tracker::{AnnounceParams, Event as TrackerEvent, MultiTracker},
    PeerId, Sha1Hash, TorrentId,
};

/// Base of the announce-failure backoff; doubled per consecutive failure
/// up to `conf.max_announce_backoff`.
const ANNOUNCE_BACKOFF_BASE: Duration = Duration::from_secs(15);
/// Caps `2^consecutive_failures` so the shift never overflows and the
/// un-jittered delay never needs to exceed `max_announce_backoff` by much
/// before being clamped anyway.
const MAX_BACKOFF_SHIFT: u32 = 10;
/// Best-effort deadline for the final Stopped announce on shutdown.
const STOPPED_ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(10);

/// A cancellation signal both the announce loop and the peer manager await
/// on; cloning it (it's `Shared`) lets every waiter observe the same single
/// fire without a broadcast channel.
type ShutdownSignal = Shared<Pin<Box<dyn Future<Output = ()> + Send>>>;

fn shutdown_signal(rx: oneshot::Receiver<()>) -> ShutdownSignal {
    let fut: Pin<Box<dyn Future<Output = ()> + Send>> =
        Box::pin(async move { rx.await.ok(); });
    fut.shared()
}

/// A progress snapshot for a running torrent, combining picker completion
/// state with the peer manager's aggregated throughput counters.
#[derive(Clone, Copy, Debug)]
pub struct TorrentStats {
    pub downloaded: u64,
    pub uploaded: u64,
    pub download_rate: f64,
    pub upload_rate: f64,
    pub peer_count: usize,
    pub piece_count: usize,
    pub verified_piece_count: usize,
    pub is_complete: bool,
}

/// A cheaply-clonable handle to a running torrent's background tasks.
///
/// Dropping every clone does not stop the torrent -- [`TorrentHandle::shutdown`]
/// must be called explicitly, mirroring [`crate::disk::Storage`]'s
/// fire-and-forget-unless-asked-to-stop shape.
#[derive(Clone)]
pub(crate) struct TorrentHandle {
    id: TorrentId,
    info_hash: Sha1Hash,
    picker: Arc<RwLock<Picker>>,
    manager: PeerManagerHandle,
    shutdown_tx: Arc<Mutex<Option<oneshot::Sender<()>>>>,
    join: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl TorrentHandle {
    pub(crate) fn id(&self) -> TorrentId {
        self.id
    }

    pub(crate) fn info_hash(&self) -> Sha1Hash {
        self.info_hash
    }

    /// Builds a progress snapshot from the picker and peer manager's
    /// current state.
    pub(crate) async fn stats(&self) -> TorrentStats {
        let (manager_stats, peer_count) = self.manager.stats().await;
        let picker = self.picker.read().await;
        TorrentStats {
            downloaded: manager_stats.downloaded.total(),
            uploaded: manager_stats.uploaded.total(),
            download_rate: manager_stats.downloaded.rate(),
            upload_rate: manager_stats.uploaded.rate(),
            peer_count,
            piece_count: picker.piece_states().len(),
            verified_piece_count: picker
                .piece_states()
                .iter()
                .filter(|p| p.verified)
                .count(),
            is_complete: picker.is_complete(),
        }
    }

    /// Cancels the torrent's tasks and waits for the coordinator task to
    /// finish, which includes its best-effort Stopped announce. Idempotent:
    /// a second call is a no-op other than re-joining.
    pub(crate) async fn shutdown(&self) {
        if let Some(tx) = self.shutdown_tx.lock().await.take() {
            tx.send(()).ok();
        }
        let handle = self.join.lock().await.take();
        if let Some(handle) = handle {
            handle.await.ok();
        }
    }
}

/// `base << min(consecutive_failures, cap) ± 25%`, split out from
/// [`Torrent::backoff_delay`] so it's testable without a running torrent.
fn backoff_delay(consecutive_failures: usize, max_backoff: Duration) -> Duration {
    let shift = (consecutive_failures as u32).min(MAX_BACKOFF_SHIFT);
    let delay = ANNOUNCE_BACKOFF_BASE
        .checked_mul(1 << shift)
        .unwrap_or(max_backoff)
        .min(max_backoff);
    let jitter = rand::thread_rng().gen_range(0.75..1.25);
    // the jitter can push the delay back above `max_backoff`; clamp again
    // after applying it rather than before.
    delay.mul_f64(jitter).min(max_backoff)
}

/// Owns the tracker client and accounting fields the announce loop needs;
/// runs as its own task, spawned alongside (but independent of) the peer
/// manager's.
struct Torrent {
    conf: Arc<TorrentConf>,
    info_hash: Sha1Hash,
    peer_id: PeerId,
    port: u16,
    key: u32,
    num_want: Option<u32>,
    tracker: MultiTracker,
    picker: Arc<RwLock<Picker>>,
    manager: PeerManagerHandle,
    refill_rx: mpsc::Receiver<()>,
    shutdown: ShutdownSignal,
    consecutive_failures: usize,
    completed_sent: bool,
}

impl Torrent {
    /// Computes `(uploaded, downloaded, left)` for the next announce from
    /// the picker's and peer manager's current state.
    async fn accounting(&self) -> (u64, u64, u64) {
        let (stats, _) = self.manager.stats().await;
        let left = self.picker.read().await.bytes_left();
        (stats.uploaded.total(), stats.downloaded.total(), left)
    }

    async fn do_announce(&mut self, event: Option<TrackerEvent>) -> Result<Duration> {
        let (uploaded, downloaded, left) = self.accounting().await;
        let params = AnnounceParams {
            info_hash: self.info_hash,
            peer_id: self.peer_id,
            port: self.port,
            uploaded,
            downloaded,
            left,
            event,
            num_want: self.num_want,
            key: self.key,
        };
        match self.tracker.announce(&params).await {
            Ok(resp) => {
                self.consecutive_failures = 0;
                log::info!(
                    "Announce ok, {} peers, next in {:?}",
                    resp.peers.len(),
                    resp.interval
                );
                self.manager.admit_peers(resp.peers);
                if left == 0 {
                    self.completed_sent = true;
                }
                let mut interval = resp.interval;
                if let Some(min) = resp.min_interval {
                    interval = interval.max(min);
                }
                interval = interval.max(self.conf.min_announce_interval);
                Ok(interval)
            }
            Err(e) => {
                self.consecutive_failures += 1;
                log::warn!("Announce failed ({}): {}", self.consecutive_failures, e);
                Err(Error::AllTrackersFailed)
            }
        }
    }

    /// `base << min(consecutive_failures, cap) ± 25%`.
    fn backoff_delay(&self) -> Duration {
        backoff_delay(self.consecutive_failures, self.conf.max_announce_backoff)
    }

    /// Runs the announce loop until shutdown is signalled, then attempts a
    /// bounded best-effort Stopped announce.
    async fn run(&mut self) {
        let mut pending_event = Some(TrackerEvent::Started);
        let mut next_announce = Instant::now();

        loop {
            tokio::select! {
                _ = tokio::time::delay_until(next_announce) => {
                    let event = pending_event.take();
                    match self.do_announce(event).await {
                        Ok(interval) => {
                            next_announce = Instant::now() + interval;
                            if self.completed_sent && event != Some(TrackerEvent::Completed) {
                                // `left` hit zero on this or an earlier
                                // announce and we haven't told the tracker
                                // yet; do so on the very next one.
                                pending_event = Some(TrackerEvent::Completed);
                                self.completed_sent = false;
                            }
                        }
                        Err(_) => {
                            pending_event = event;
                            next_announce = Instant::now() + self.backoff_delay();
                        }
                    }
                }
                _ = self.refill_rx.recv() => {
                    log::debug!("Peer manager signalled refill, announcing out of band");
                    self.do_announce(None).await.ok();
                }
                _ = self.shutdown.clone() => break,
            }
        }

        self.send_stopped().await;
    }

    async fn send_stopped(&mut self) {
        let announce = self.do_announce(Some(TrackerEvent::Stopped));
        if tokio::time::timeout(STOPPED_ANNOUNCE_TIMEOUT, announce)
            .await
            .is_err()
        {
            log::debug!("Stopped announce for torrent did not complete in time");
        }
    }
}

/// Builds a torrent's picker, registers it with storage, spawns its peer
/// manager and announce-loop tasks, and returns a handle to both.
pub(crate) async fn spawn(
    id: TorrentId,
    metainfo: &Metainfo,
    conf: Arc<TorrentConf>,
    peer_id: PeerId,
    port: u16,
    enable_ipv6: bool,
    storage: Storage,
) -> Result<TorrentHandle> {
    log::info!(
        "Starting torrent {} ({}), {} pieces",
        id,
        hex::encode(metainfo.info_hash),
        metainfo.piece_count()
    );

    let storage_info = StorageInfo::new(metainfo, conf.download_dir.clone());
    storage.new_torrent(id, storage_info.clone()).await?;
    let storage_info = Arc::new(storage_info);

    let picker_conf = PickerConf {
        strategy: conf.piece_download_strategy,
        max_global_inflight: conf.max_global_inflight_requests,
        max_inflight_per_peer: conf.max_inflight_requests_per_peer,
        max_requests_per_block: conf.max_requests_per_block,
        endgame_threshold: conf.endgame_threshold,
        endgame_dup_per_block: conf.endgame_dup_per_block,
        request_timeout: conf.request_timeout,
        random_first_threshold: 4,
    };
    let picker = Arc::new(RwLock::new(Picker::new(
        metainfo.piece_count(),
        metainfo.piece_length,
        storage_info.last_piece_len,
        &metainfo.piece_hashes,
        conf.max_peers,
        picker_conf,
    )));

    let (refill_tx, refill_rx) = mpsc::channel(1);
    let (manager, manager_handle) = PeerManager::new(
        id,
        metainfo.info_hash,
        peer_id,
        conf.clone(),
        storage_info,
        picker.clone(),
        storage,
        refill_tx,
    );

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let shutdown = shutdown_signal(shutdown_rx);

    let mut manager = manager;
    let manager_shutdown = shutdown.clone();
    tokio::spawn(async move {
        manager.run(manager_shutdown).await;
        log::info!("Peer manager for torrent {} exited", id);
    });

    let tracker = MultiTracker::new(metainfo.tracker_tiers(), enable_ipv6);
    let num_want = conf.num_want;

    let mut torrent = Torrent {
        conf,
        info_hash: metainfo.info_hash,
        peer_id,
        port,
        key: rand::random(),
        num_want,
        tracker,
        picker: picker.clone(),
        manager: manager_handle.clone(),
        refill_rx,
        shutdown,
        consecutive_failures: 0,
        completed_sent: false,
    };
    let join = tokio::spawn(async move {
        torrent.run().await;
        log::info!("Announce loop for torrent {} exited", id);
    });

    Ok(TorrentHandle {
        id,
        info_hash: metainfo.info_hash,
        picker,
        manager: manager_handle,
        shutdown_tx: Arc::new(Mutex::new(Some(shutdown_tx))),
        join: Arc::new(Mutex::new(Some(join))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_is_capped() {
        let max = Duration::from_secs(30 * 60);
        let d0 = backoff_delay(0, max);
        assert!(d0 >= ANNOUNCE_BACKOFF_BASE.mul_f64(0.75));
        assert!(d0 <= ANNOUNCE_BACKOFF_BASE.mul_f64(1.25));

        let d_big = backoff_delay(20, max);
        assert!(d_big <= max);
    }

    #[test]
    fn backoff_never_exceeds_max_even_unshifted() {
        let max = Duration::from_secs(5);
        assert!(backoff_delay(0, max) <= max);
    }
}
