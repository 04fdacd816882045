//! The public entry point: owns the disk IO task shared by every torrent,
//! assigns [`TorrentId`]s, and starts/stops each torrent's coordinator.
//!
//! This is intentionally thin -- almost everything interesting happens in
//! [`crate::torrent`], [`crate::peer_manager`] and [`crate::piece_picker`].
//! The engine's job is bookkeeping: which torrents exist, and handing out
//! the shared [`Storage`] handle and engine-wide configuration each one
//! needs to start.

use std::collections::HashMap;

use crate::{
    conf::Conf,
    disk::Storage,
    error::{Error, Result},
    metainfo::Metainfo,
    torrent::{self, TorrentHandle},
    PeerId, TorrentId,
};

pub use crate::torrent::TorrentStats;

/// Owns every torrent this process is currently running.
///
/// There is ordinarily one `Engine` per application; nothing prevents
/// running several, each with their own disk IO task and torrent registry.
pub struct Engine {
    conf: Conf,
    storage: Storage,
    torrents: HashMap<TorrentId, TorrentHandle>,
    next_id: TorrentId,
}

impl Engine {
    /// Spawns the shared disk IO task and returns an engine with no
    /// torrents running yet.
    pub fn new(conf: Conf) -> Self {
        Self {
            conf,
            storage: Storage::spawn(),
            torrents: HashMap::new(),
            next_id: 0,
        }
    }

    /// Parses and validates a `.torrent` file's bytes. Exposed so a caller
    /// can inspect a torrent (name, size, file list) before deciding to add
    /// it.
    pub fn parse_metainfo(buf: &[u8]) -> Result<Metainfo> {
        Metainfo::parse(buf).map_err(Error::from)
    }

    /// Starts a torrent from its parsed metainfo, using the engine's
    /// default [`crate::TorrentConf`] unless `conf_override` is given.
    /// Returns the [`TorrentId`] the torrent is subsequently addressed by.
    pub async fn add_torrent(
        &mut self,
        metainfo: Metainfo,
        conf_override: Option<crate::TorrentConf>,
    ) -> Result<TorrentId> {
        let id = self.next_id;
        self.next_id += 1;

        let conf = std::sync::Arc::new(conf_override.unwrap_or_else(|| self.conf.torrent.clone()));
        let peer_id = self.fresh_peer_id();

        let handle = torrent::spawn(
            id,
            &metainfo,
            conf,
            peer_id,
            self.conf.engine.port,
            self.conf.engine.enable_ipv6,
            self.storage.clone(),
        )
        .await?;

        self.torrents.insert(id, handle);
        Ok(id)
    }

    /// Cancels a torrent's announce loop and peer sessions (attempting a
    /// best-effort Stopped announce) and drops its in-memory disk state.
    /// Already-written file contents are left on disk.
    pub async fn remove_torrent(&mut self, id: TorrentId) -> Result<()> {
        let handle = self.torrents.remove(&id).ok_or(Error::InvalidTorrentId)?;
        handle.shutdown().await;
        self.storage.remove_torrent(id)
    }

    /// A progress/throughput snapshot for a running torrent.
    pub async fn stats(&self, id: TorrentId) -> Result<TorrentStats> {
        let handle = self.torrents.get(&id).ok_or(Error::InvalidTorrentId)?;
        Ok(handle.stats().await)
    }

    /// The ids of every torrent currently registered with the engine.
    pub fn torrent_ids(&self) -> Vec<TorrentId> {
        self.torrents.keys().copied().collect()
    }

    /// Shuts down every running torrent (each attempting its own best-effort
    /// Stopped announce) and then the shared disk IO task.
    pub async fn shutdown(&mut self) {
        for (_, handle) in self.torrents.drain() {
            handle.shutdown().await;
        }
        self.storage.shutdown().ok();
    }

    fn fresh_peer_id(&self) -> PeerId {
        let suffix: [u8; 12] = rand::random();
        self.conf.engine.build_peer_id(&suffix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_metainfo_bytes() -> &'static [u8] {
        b"d8:announce14:http://tracker4:infod6:lengthi4e4:name4:demo12:piece lengthi4e6:pieces20:aaaaaaaaaaaaaaaaaaaaee"
    }

    #[test]
    fn parse_metainfo_surfaces_errors() {
        assert!(Engine::parse_metainfo(b"not bencode").is_err());
        assert!(Engine::parse_metainfo(sample_metainfo_bytes()).is_ok());
    }

    #[tokio::test]
    async fn torrent_ids_track_add_and_remove() {
        let dir = std::env::temp_dir().join(format!(
            "torrent_core_engine_test_{}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();

        let mut engine = Engine::new(Conf::new(&dir));
        assert!(engine.torrent_ids().is_empty());

        let metainfo = Engine::parse_metainfo(sample_metainfo_bytes()).unwrap();
        let id = engine.add_torrent(metainfo, None).await.unwrap();
        assert_eq!(engine.torrent_ids(), vec![id]);

        let metainfo2 = Engine::parse_metainfo(sample_metainfo_bytes()).unwrap();
        let id2 = engine.add_torrent(metainfo2, None).await.unwrap();
        assert_ne!(id, id2);

        engine.remove_torrent(id).await.unwrap();
        assert_eq!(engine.torrent_ids(), vec![id2]);
        assert!(matches!(
            engine.remove_torrent(id).await,
            Err(Error::InvalidTorrentId)
        ));

        engine.shutdown().await;
        let _ = std::fs::remove_dir_all(&dir);
    }
}
