//! Multi-tier tracker announcing: per-tier shuffle-and-promote
//! (BEP-12) over a mix of HTTP and UDP tracker clients, cached per URL.

mod http;
mod udp;

use std::{net::SocketAddr, time::Duration};

use rand::seq::SliceRandom;
use url::Url;

use crate::{bencode, PeerId, Sha1Hash};

pub(crate) type Result<T> = std::result::Result<T, Error>;

/// Errors a single tracker URL can fail with. The multi-tier wrapper never
/// surfaces these directly -- it rolls over to the next URL/tier and only
/// the last one escapes, converted to [`crate::error::Error::AllTrackersFailed`].
#[derive(Debug)]
pub(crate) enum Error {
    Io(std::io::Error),
    Bencode(bencode::Error),
    Http(reqwest::Error),
    UnsupportedScheme(String),
    Protocol(&'static str),
    /// The UDP connection-id's echoed action or transaction-id didn't match
    /// what we sent; the cached id is invalidated and a fresh connect
    /// attempted.
    ConnectionMismatch,
    /// A `failure reason` (HTTP) or action=3 (UDP) tracker-level error.
    Failure(String),
    Timeout,
    AllTiersExhausted,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io(e) => write!(f, "tracker io error: {}", e),
            Error::Bencode(e) => write!(f, "tracker response bencode error: {}", e),
            Error::Http(e) => write!(f, "tracker http error: {}", e),
            Error::UnsupportedScheme(s) => write!(f, "unsupported tracker scheme: {}", s),
            Error::Protocol(reason) => write!(f, "tracker protocol error: {}", reason),
            Error::ConnectionMismatch => {
                write!(f, "udp tracker connection id/transaction mismatch")
            }
            Error::Failure(reason) => write!(f, "tracker reported failure: {}", reason),
            Error::Timeout => write!(f, "tracker request timed out"),
            Error::AllTiersExhausted => write!(f, "every tracker tier failed"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Bencode(e) => Some(e),
            Error::Http(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<bencode::Error> for Error {
    fn from(e: bencode::Error) -> Self {
        Error::Bencode(e)
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(e)
    }
}

/// The event to report in an announce, omitted for a regular re-announce.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Event {
    Started,
    Stopped,
    Completed,
}

impl Event {
    fn http_str(self) -> &'static str {
        match self {
            Event::Started => "started",
            Event::Stopped => "stopped",
            Event::Completed => "completed",
        }
    }

    /// UDP's event numbering deliberately differs from HTTP's.
    fn udp_code(self) -> u32 {
        match self {
            Event::Completed => 1,
            Event::Started => 2,
            Event::Stopped => 3,
        }
    }
}

/// Parameters for a single announce call, common to HTTP and UDP.
#[derive(Clone, Debug)]
pub(crate) struct AnnounceParams {
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: Option<Event>,
    pub num_want: Option<u32>,
    /// A value fixed for the lifetime of the torrent, sent as UDP's `key`
    /// field and HTTP's optional `key` parameter.
    pub key: u32,
}

/// The normalized result of an announce, regardless of which protocol
/// produced it.
#[derive(Clone, Debug)]
pub(crate) struct AnnounceResponse {
    pub interval: Duration,
    pub min_interval: Option<Duration>,
    pub complete: Option<u32>,
    pub incomplete: Option<u32>,
    pub tracker_id: Option<String>,
    pub peers: Vec<SocketAddr>,
}

/// Either protocol's client, behind one `announce` entry point.
enum TrackerClient {
    Http(http::HttpTracker),
    Udp(udp::UdpTracker),
}

impl TrackerClient {
    fn from_url(url: &str, enable_ipv6: bool) -> Result<Self> {
        let parsed = Url::parse(url).map_err(|_| Error::Protocol("invalid tracker url"))?;
        match parsed.scheme() {
            "http" | "https" => Ok(Self::Http(http::HttpTracker::new(parsed, enable_ipv6)?)),
            "udp" => Ok(Self::Udp(udp::UdpTracker::new(&parsed)?)),
            other => Err(Error::UnsupportedScheme(other.to_string())),
        }
    }

    async fn announce(&mut self, params: &AnnounceParams) -> Result<AnnounceResponse> {
        match self {
            Self::Http(t) => t.announce(params).await,
            Self::Udp(t) => t.announce(params).await,
        }
    }
}

struct TierEntry {
    url: String,
    client: Option<TrackerClient>,
}

/// Wraps a torrent's tiers of tracker URLs (BEP-12): each tier is
/// independently shuffled once at construction, and the URL that last
/// succeeded within a tier is promoted to the front of it.
pub(crate) struct MultiTracker {
    tiers: Vec<Vec<TierEntry>>,
    enable_ipv6: bool,
}

impl MultiTracker {
    pub(crate) fn new(tiers: Vec<Vec<String>>, enable_ipv6: bool) -> Self {
        let mut rng = rand::thread_rng();
        let tiers = tiers
            .into_iter()
            .map(|mut tier| {
                tier.shuffle(&mut rng);
                tier.into_iter()
                    .map(|url| TierEntry { url, client: None })
                    .collect()
            })
            .collect();
        Self { tiers, enable_ipv6 }
    }

    /// Tries tier 0, then tier 1, ...; within a tier, URLs in order. Returns
    /// the first success (promoting that URL to the front of its tier) or,
    /// if every tier failed, the last error seen.
    pub(crate) async fn announce(&mut self, params: &AnnounceParams) -> Result<AnnounceResponse> {
        let mut last_err = None;
        for tier in &mut self.tiers {
            for i in 0..tier.len() {
                if tier[i].client.is_none() {
                    match TrackerClient::from_url(&tier[i].url, self.enable_ipv6) {
                        Ok(client) => tier[i].client = Some(client),
                        Err(e) => {
                            log::warn!("Tracker {} unusable: {}", tier[i].url, e);
                            last_err = Some(e);
                            continue;
                        }
                    }
                }
                let result = tier[i].client.as_mut().unwrap().announce(params).await;
                match result {
                    Ok(resp) => {
                        if i != 0 {
                            let promoted = tier.remove(i);
                            tier.insert(0, promoted);
                        }
                        return Ok(resp);
                    }
                    Err(e) => {
                        log::warn!("Tracker {} announce failed: {}", tier[i].url, e);
                        last_err = Some(e);
                    }
                }
            }
        }
        Err(last_err.unwrap_or(Error::AllTiersExhausted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_udp_numbering_differs_from_http() {
        // UDP's ordinals (none=0,completed=1,started=2,stopped=3)
        // deliberately don't match the HTTP event strings' natural order.
        assert_eq!(Event::Started.udp_code(), 2);
        assert_eq!(Event::Completed.udp_code(), 1);
        assert_eq!(Event::Stopped.udp_code(), 3);
        assert_eq!(Event::Started.http_str(), "started");
    }

    #[test]
    fn unsupported_scheme_is_rejected() {
        let err = TrackerClient::from_url("ftp://example.com/announce", false);
        assert!(matches!(err, Err(Error::UnsupportedScheme(_))));
    }

    #[test]
    fn promotion_moves_successful_url_to_front() {
        // construction-time shuffling only touches URL order inside a
        // tier, never which tiers exist.
        let tracker = MultiTracker::new(
            vec![vec!["udp://a:1".into(), "udp://b:2".into()]],
            false,
        );
        assert_eq!(tracker.tiers.len(), 1);
        assert_eq!(tracker.tiers[0].len(), 2);
    }
}
