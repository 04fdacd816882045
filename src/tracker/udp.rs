//! UDP tracker client: a two-phase connect/announce
//! exchange with a cached connection-id.

use std::{
    convert::TryInto,
    net::SocketAddr,
    time::{Duration, Instant},
};

use tokio::{net::UdpSocket, time};
use url::Url;

use super::{AnnounceParams, AnnounceResponse, Error, Result};

const PROTOCOL_ID: u64 = 0x41727101980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;
/// A connect response's connection-id is valid for this long (BEP-15).
const CONNECTION_ID_TTL: Duration = Duration::from_secs(60);
const MAX_PACKET_LEN: usize = 2048;
const BASE_BACKOFF: Duration = Duration::from_secs(15);
const MAX_RETRIES: u32 = 8;

pub(crate) struct UdpTracker {
    host: String,
    port: u16,
    connection: Option<(u64, Instant)>,
}

impl UdpTracker {
    pub(crate) fn new(url: &Url) -> Result<Self> {
        let host = url
            .host_str()
            .ok_or(Error::Protocol("udp tracker url missing host"))?
            .to_string();
        let port = url
            .port()
            .ok_or(Error::Protocol("udp tracker url missing port"))?;
        Ok(Self {
            host,
            port,
            connection: None,
        })
    }

    async fn resolve(&self) -> Result<SocketAddr> {
        let mut addrs = tokio::net::lookup_host((self.host.as_str(), self.port)).await?;
        addrs
            .next()
            .ok_or(Error::Protocol("udp tracker host did not resolve"))
    }

    pub(crate) async fn announce(&mut self, params: &AnnounceParams) -> Result<AnnounceResponse> {
        let addr = self.resolve().await?;
        let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
        socket.connect(addr).await?;

        let mut attempt = 0u32;
        loop {
            let connection_id = self.connection_id(&socket, attempt).await?;
            let transaction_id = rand::random::<u32>();
            let request = build_announce_request(connection_id, transaction_id, params);
            socket.send(&request).await?;

            let mut buf = [0u8; MAX_PACKET_LEN];
            let deadline = backoff(attempt);
            match time::timeout(deadline, socket.recv(&mut buf)).await {
                Ok(Ok(n)) => match parse_announce_response(&buf[..n], transaction_id) {
                    Ok(resp) => return Ok(resp),
                    Err(Error::ConnectionMismatch) => {
                        self.connection = None;
                        attempt += 1;
                        if attempt > MAX_RETRIES {
                            return Err(Error::ConnectionMismatch);
                        }
                    }
                    Err(e) => return Err(e),
                },
                Ok(Err(e)) => return Err(Error::Io(e)),
                Err(_) => {
                    attempt += 1;
                    if attempt > MAX_RETRIES {
                        return Err(Error::Timeout);
                    }
                }
            }
        }
    }

    /// Returns a cached, unexpired connection-id, otherwise performs the
    /// connect exchange and caches the result for 60 s.
    async fn connection_id(&mut self, socket: &UdpSocket, start_attempt: u32) -> Result<u64> {
        if let Some((id, obtained_at)) = self.connection {
            if obtained_at.elapsed() < CONNECTION_ID_TTL {
                return Ok(id);
            }
        }

        let mut attempt = start_attempt;
        loop {
            let transaction_id = rand::random::<u32>();
            let mut request = Vec::with_capacity(16);
            request.extend_from_slice(&PROTOCOL_ID.to_be_bytes());
            request.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
            request.extend_from_slice(&transaction_id.to_be_bytes());
            socket.send(&request).await?;

            let mut buf = [0u8; 16];
            let deadline = backoff(attempt);
            match time::timeout(deadline, socket.recv(&mut buf)).await {
                Ok(Ok(n)) if n >= 16 => {
                    let action = u32::from_be_bytes(buf[0..4].try_into().unwrap());
                    let recv_transaction_id = u32::from_be_bytes(buf[4..8].try_into().unwrap());
                    if action != ACTION_CONNECT || recv_transaction_id != transaction_id {
                        attempt += 1;
                        if attempt > MAX_RETRIES {
                            return Err(Error::ConnectionMismatch);
                        }
                        continue;
                    }
                    let id = u64::from_be_bytes(buf[8..16].try_into().unwrap());
                    self.connection = Some((id, Instant::now()));
                    return Ok(id);
                }
                Ok(Ok(_)) => return Err(Error::Protocol("udp connect response too short")),
                Ok(Err(e)) => return Err(Error::Io(e)),
                Err(_) => {
                    attempt += 1;
                    if attempt > MAX_RETRIES {
                        return Err(Error::Timeout);
                    }
                }
            }
        }
    }
}

/// `base_backoff << attempt`, capped so it never silently overflows on a
/// long-lived retry loop.
fn backoff(attempt: u32) -> Duration {
    BASE_BACKOFF * (1u32 << attempt.min(6))
}

fn build_announce_request(
    connection_id: u64,
    transaction_id: u32,
    params: &AnnounceParams,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(98);
    buf.extend_from_slice(&connection_id.to_be_bytes());
    buf.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
    buf.extend_from_slice(&transaction_id.to_be_bytes());
    buf.extend_from_slice(&params.info_hash);
    buf.extend_from_slice(&params.peer_id);
    buf.extend_from_slice(&params.downloaded.to_be_bytes());
    buf.extend_from_slice(&params.left.to_be_bytes());
    buf.extend_from_slice(&params.uploaded.to_be_bytes());
    let event_code = params.event.map(|e| e.udp_code()).unwrap_or(0);
    buf.extend_from_slice(&event_code.to_be_bytes());
    buf.extend_from_slice(&0u32.to_be_bytes()); // ip = 0, let the tracker use the source address
    buf.extend_from_slice(&params.key.to_be_bytes());
    let num_want: i32 = params.num_want.map(|n| n as i32).unwrap_or(-1);
    buf.extend_from_slice(&num_want.to_be_bytes());
    buf.extend_from_slice(&params.port.to_be_bytes());
    debug_assert_eq!(buf.len(), 98);
    buf
}

fn parse_announce_response(buf: &[u8], expected_transaction_id: u32) -> Result<AnnounceResponse> {
    if buf.len() < 8 {
        return Err(Error::Protocol("udp announce response too short"));
    }
    let action = u32::from_be_bytes(buf[0..4].try_into().unwrap());
    let transaction_id = u32::from_be_bytes(buf[4..8].try_into().unwrap());

    if action == ACTION_ERROR {
        let message = String::from_utf8_lossy(&buf[8..]).to_string();
        return Err(Error::Failure(message));
    }
    if transaction_id != expected_transaction_id || action != ACTION_ANNOUNCE {
        return Err(Error::ConnectionMismatch);
    }
    if buf.len() < 20 {
        return Err(Error::Protocol("udp announce response missing body"));
    }

    let interval = u32::from_be_bytes(buf[8..12].try_into().unwrap());
    let leechers = u32::from_be_bytes(buf[12..16].try_into().unwrap());
    let seeders = u32::from_be_bytes(buf[16..20].try_into().unwrap());

    let peer_bytes = &buf[20..];
    if peer_bytes.len() % 6 != 0 {
        return Err(Error::Protocol("udp peers not a multiple of 6 bytes"));
    }
    let peers = peer_bytes
        .chunks_exact(6)
        .map(|c| {
            let ip = std::net::Ipv4Addr::new(c[0], c[1], c[2], c[3]);
            let port = u16::from_be_bytes([c[4], c[5]]);
            SocketAddr::new(std::net::IpAddr::V4(ip), port)
        })
        .collect();

    Ok(AnnounceResponse {
        interval: Duration::from_secs(interval as u64),
        min_interval: None,
        complete: Some(seeders),
        incomplete: Some(leechers),
        tracker_id: None,
        peers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_request_layout_matches_bep15() {
        let transaction_id = 0x1234_5678u32;
        let mut request = Vec::with_capacity(16);
        request.extend_from_slice(&PROTOCOL_ID.to_be_bytes());
        request.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
        request.extend_from_slice(&transaction_id.to_be_bytes());
        assert_eq!(request.len(), 16);
        assert_eq!(&request[0..8], &PROTOCOL_ID.to_be_bytes());
        assert_eq!(&request[8..12], &0u32.to_be_bytes());
        assert_eq!(&request[12..16], &transaction_id.to_be_bytes());
    }

    #[test]
    fn announce_request_is_98_bytes() {
        let params = AnnounceParams {
            info_hash: [1u8; 20],
            peer_id: [2u8; 20],
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 1000,
            event: Some(super::super::Event::Started),
            num_want: None,
            key: 42,
        };
        let req = build_announce_request(0xdead_beef, 7, &params);
        assert_eq!(req.len(), 98);
        // event=started must encode as 2, not HTTP's implicit ordering.
        assert_eq!(&req[64..68], &2u32.to_be_bytes());
        // default numwant is -1 (0xffffffff).
        assert_eq!(&req[80..84], &(-1i32).to_be_bytes());
    }

    #[test]
    fn parses_error_packet_as_failure() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&ACTION_ERROR.to_be_bytes());
        buf.extend_from_slice(&7u32.to_be_bytes());
        buf.extend_from_slice(b"bad info_hash");
        let err = parse_announce_response(&buf, 7).unwrap_err();
        assert!(matches!(err, Error::Failure(ref s) if s == "bad info_hash"));
    }

    #[test]
    fn transaction_id_mismatch_invalidates_connection() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
        buf.extend_from_slice(&999u32.to_be_bytes());
        buf.extend_from_slice(&[0u8; 12]);
        let err = parse_announce_response(&buf, 7).unwrap_err();
        assert!(matches!(err, Error::ConnectionMismatch));
    }

    #[test]
    fn parses_compact_peers_from_announce_response() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
        buf.extend_from_slice(&7u32.to_be_bytes());
        buf.extend_from_slice(&1800u32.to_be_bytes());
        buf.extend_from_slice(&3u32.to_be_bytes());
        buf.extend_from_slice(&5u32.to_be_bytes());
        buf.extend_from_slice(&[127, 0, 0, 1, 0x1a, 0xe1]);
        let resp = parse_announce_response(&buf, 7).unwrap();
        assert_eq!(resp.interval, Duration::from_secs(1800));
        assert_eq!(resp.incomplete, Some(3));
        assert_eq!(resp.complete, Some(5));
        assert_eq!(resp.peers, vec!["127.0.0.1:6881".parse().unwrap()]);
    }
}
