//! Configuration for the engine and its torrents.
//!
//! `Conf` is a cheap-to-clone snapshot: readers obtain their own copy by cloning the small
//! record rather than taking a lock per field. Torrents hold an `Arc<Conf>`
//! and re-read it (by asking the engine for a fresh snapshot) only when
//! adding a new torrent; an in-flight torrent keeps using the snapshot it
//! started with.

use std::{path::PathBuf, time::Duration};

use crate::PeerId;

/// The default torrent_core client id prefix (8 bytes), used to build the
/// full 20-byte peer id as `<prefix><12 random bytes>`.
pub const DEFAULT_CLIENT_ID_PREFIX: &[u8; 8] = b"-TC0001-";

/// Which order the picker assigns blocks to peers in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PieceDownloadStrategy {
    /// Uniform-shuffled eligible pieces, used to avoid clumping at the
    /// start of a download.
    Random,
    /// Lowest-availability-first; the common steady-state strategy.
    RarestFirst,
    /// In piece-index order; useful for streaming playback.
    Sequential,
}

/// The global configuration for the torrent engine and all its parts.
///
/// Cloning is O(1)-ish (a handful of `usize`/`Duration`/`PathBuf` fields);
/// there is no interior mutability here by design, so a `Conf` once handed
/// to a torrent never changes under it.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
}

impl Conf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user. It uses the default client id prefix, [`DEFAULT_CLIENT_ID_PREFIX`].
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine: EngineConf::default(),
            torrent: TorrentConf::new(download_dir),
        }
    }
}

/// Configuration related to the engine itself, applying to every torrent it
/// manages unless a torrent overrides a field in its own [`TorrentConf`].
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The 8-byte prefix used to build this client's peer id (BEP-20 style).
    /// Exactly 8 bytes; a caller-supplied value of a different length is
    /// truncated or zero-padded at startup, never rejected.
    pub client_id_prefix: [u8; 8],
    /// The TCP port to listen for incoming peer connections on. `0` means
    /// accept an OS-assigned ephemeral port (incoming connections are
    /// otherwise out of scope for this core, but the port is still part of
    /// what a tracker announce reports).
    pub port: u16,
    /// Whether to attempt IPv6 dials and parse `peers6` tracker responses.
    pub enable_ipv6: bool,
    /// Default directory new torrents download into, absent a per-torrent
    /// override.
    pub default_download_dir: PathBuf,
}

impl Default for EngineConf {
    fn default() -> Self {
        Self {
            client_id_prefix: *DEFAULT_CLIENT_ID_PREFIX,
            port: 6881,
            enable_ipv6: false,
            default_download_dir: PathBuf::from("."),
        }
    }
}

impl EngineConf {
    /// Builds a 20-byte peer id from `client_id_prefix` followed by `suffix`
    /// random bytes (typically freshly generated per torrent or per engine
    /// instance -- both are acceptable, this module only fixes the shape).
    pub fn build_peer_id(&self, suffix: &[u8; 12]) -> PeerId {
        let mut id = [0u8; 20];
        id[..8].copy_from_slice(&self.client_id_prefix);
        id[8..].copy_from_slice(suffix);
        id
    }
}

/// Per-torrent configuration. The engine applies a single default instance
/// to all torrents, but individual torrents may override it wholesale.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The directory in which a torrent's files are placed upon download and
    /// from which they are seeded.
    pub download_dir: PathBuf,

    /// The low-watermark that triggers refill signalling in the peer
    /// manager.
    pub peer_refill_watermark: usize,
    /// Requested peer count (`numwant`) to send the tracker; `None` lets
    /// the tracker pick its own default.
    pub num_want: Option<u32>,

    /// If the tracker doesn't provide a minimum announce interval, this is
    /// used as the cadence of regular announces.
    pub announce_interval: Duration,
    /// A floor under the tracker-provided `min interval` / `interval`, so a
    /// misbehaving tracker can't force hammering it.
    pub min_announce_interval: Duration,
    /// Upper bound on announce-failure backoff delay.
    pub max_announce_backoff: Duration,

    /// Strategy the picker uses to order block assignment.
    pub piece_download_strategy: PieceDownloadStrategy,
    /// Maximum simultaneously in-flight block requests, globally, for one
    /// torrent.
    pub max_global_inflight_requests: usize,
    /// Maximum simultaneously in-flight block requests to a single peer.
    pub max_inflight_requests_per_peer: usize,
    /// Maximum concurrent owners (requests) a single block may have; above
    /// 1 only in endgame.
    pub max_requests_per_block: usize,
    /// How many remaining blocks triggers endgame mode.
    pub endgame_threshold: usize,
    /// How many concurrent owners a block may have once in endgame.
    pub endgame_dup_per_block: usize,
    /// How long an in-flight request may go unanswered before it's
    /// considered timed out and reassignable.
    pub request_timeout: Duration,

    /// Maximum registered peers (live + handshaking) this torrent will
    /// keep. Also bounds the dial semaphore at `max_peers / 2`.
    pub max_peers: usize,
    /// How often the peer manager's heartbeat task purges idle peers.
    pub peer_heartbeat_interval: Duration,
    /// A peer session with no received bytes for this long is dropped.
    pub peer_idle_timeout: Duration,
    /// Per-message read deadline (not fatal on its own; only the idle
    /// timeout above is).
    pub read_timeout: Duration,
    /// Per-message write deadline; failures here are fatal to the session.
    pub write_timeout: Duration,
    /// Deadline for establishing a TCP connection and completing the
    /// handshake with a dialed peer.
    pub dial_timeout: Duration,
    /// Send a keep-alive if nothing else has been sent on the wire for
    /// this long.
    pub keep_alive_interval: Duration,
    /// Bound on a peer's outbound message queue; a full queue blocks the
    /// sender rather than dropping (back-pressure), except Have broadcasts
    /// which may be dropped under load.
    pub peer_outbound_queue_backlog: usize,

    /// Upload rate cap in bytes/sec, if any; `None` means unlimited.
    pub max_upload_rate: Option<u64>,
    /// Download rate cap in bytes/sec, if any; `None` means unlimited.
    pub max_download_rate: Option<u64>,
}

impl TorrentConf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            peer_refill_watermark: 5,
            num_want: None,

            announce_interval: Duration::from_secs(60 * 60),
            min_announce_interval: Duration::from_secs(2 * 60),
            max_announce_backoff: Duration::from_secs(30 * 60),

            piece_download_strategy: PieceDownloadStrategy::RarestFirst,
            max_global_inflight_requests: 10,
            max_inflight_requests_per_peer: 5,
            max_requests_per_block: 1,
            endgame_threshold: 32,
            endgame_dup_per_block: 2,
            request_timeout: Duration::from_secs(30),

            max_peers: 50,
            peer_heartbeat_interval: Duration::from_secs(30),
            peer_idle_timeout: Duration::from_secs(5 * 60),
            read_timeout: Duration::from_secs(45),
            write_timeout: Duration::from_secs(45),
            dial_timeout: Duration::from_secs(30),
            keep_alive_interval: Duration::from_secs(2 * 60),
            peer_outbound_queue_backlog: 25,

            max_upload_rate: None,
            max_download_rate: None,
        }
    }

    /// Max concurrent outbound dials, half the peer cap, floored at 1.
    pub fn max_concurrent_dials(&self) -> usize {
        (self.max_peers / 2).max(1)
    }
}
