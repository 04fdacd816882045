//! HTTP tracker client.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use percent_encoding::{percent_encode, AsciiSet, NON_ALPHANUMERIC};
use url::Url;

use super::{AnnounceParams, AnnounceResponse, Error, Result};
use crate::bencode::{self, Value};

/// Bytes left unescaped by [`percent_encode`]; alphanumerics plus the four
/// RFC 3986 unreserved punctuation characters. `info_hash`/`peer_id` are raw
/// 20-byte strings, so everything else in them gets percent-escaped.
const URL_ENCODE_RESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'.')
    .remove(b'-')
    .remove(b'_')
    .remove(b'~');

pub(crate) struct HttpTracker {
    client: reqwest::Client,
    url: Url,
    enable_ipv6: bool,
    /// Echoed back on subsequent announces once a tracker hands one out.
    tracker_id: Option<String>,
}

impl HttpTracker {
    pub(crate) fn new(url: Url, enable_ipv6: bool) -> Result<Self> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            client,
            url,
            enable_ipv6,
            tracker_id: None,
        })
    }

    pub(crate) async fn announce(&mut self, params: &AnnounceParams) -> Result<AnnounceResponse> {
        let mut url = self.url.clone();
        {
            let mut qp = url.query_pairs_mut();
            qp.append_pair("port", &params.port.to_string());
            qp.append_pair("uploaded", &params.uploaded.to_string());
            qp.append_pair("downloaded", &params.downloaded.to_string());
            qp.append_pair("left", &params.left.to_string());
            qp.append_pair("compact", "1");
            qp.append_pair("key", &format!("{:08x}", params.key));
            if let Some(num_want) = params.num_want {
                qp.append_pair("numwant", &num_want.to_string());
            }
            if let Some(event) = params.event {
                qp.append_pair("event", event.http_str());
            }
            if let Some(tracker_id) = &self.tracker_id {
                qp.append_pair("trackerid", tracker_id);
            }
        }

        // info_hash/peer_id are raw byte strings that must be percent-encoded
        // byte-for-byte; `query_pairs_mut` form-encodes its values (spaces as
        // `+`, etc.) and would corrupt them, so they're appended by hand.
        let raw = format!(
            "{}{}info_hash={}&peer_id={}",
            url.as_str(),
            if url.query().is_some() { "&" } else { "?" },
            percent_encode(&params.info_hash, URL_ENCODE_RESERVED),
            percent_encode(&params.peer_id, URL_ENCODE_RESERVED),
        );

        let resp = self.client.get(&raw).send().await?;
        let body = resp.bytes().await?;
        self.parse_response(&body)
    }

    fn parse_response(&mut self, buf: &[u8]) -> Result<AnnounceResponse> {
        let value = bencode::decode(buf)?;
        let dict = value
            .as_dict()
            .ok_or(Error::Protocol("tracker response is not a dict"))?;

        if let Some(reason) = dict
            .get(b"failure reason".as_ref())
            .and_then(|v| v.as_str())
        {
            return Err(Error::Failure(reason.to_string()));
        }

        let interval = dict
            .get(b"interval".as_ref())
            .and_then(|v| v.as_int())
            .ok_or(Error::Protocol("missing interval"))?
            .max(0) as u64;
        let min_interval = dict
            .get(b"min interval".as_ref())
            .and_then(|v| v.as_int())
            .map(|n| std::time::Duration::from_secs(n.max(0) as u64));
        let complete = dict
            .get(b"complete".as_ref())
            .and_then(|v| v.as_int())
            .map(|n| n as u32);
        let incomplete = dict
            .get(b"incomplete".as_ref())
            .and_then(|v| v.as_int())
            .map(|n| n as u32);
        let tracker_id = dict
            .get(b"tracker id".as_ref())
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        if tracker_id.is_some() {
            self.tracker_id = tracker_id.clone();
        }

        let mut peers = Vec::new();
        match dict.get(b"peers".as_ref()) {
            Some(Value::Bytes(b)) => peers.extend(parse_compact_ipv4(b)?),
            Some(Value::List(list)) => peers.extend(parse_peer_dicts(list)?),
            _ => {}
        }
        if self.enable_ipv6 {
            if let Some(b) = dict.get(b"peers6".as_ref()).and_then(|v| v.as_bytes()) {
                peers.extend(parse_compact_ipv6(b)?);
            }
        }

        Ok(AnnounceResponse {
            interval: std::time::Duration::from_secs(interval),
            min_interval,
            complete,
            incomplete,
            tracker_id,
            peers,
        })
    }
}

fn parse_compact_ipv4(buf: &[u8]) -> Result<Vec<SocketAddr>> {
    if buf.len() % 6 != 0 {
        return Err(Error::Protocol("peers string not a multiple of 6 bytes"));
    }
    Ok(buf
        .chunks_exact(6)
        .map(|c| {
            let ip = Ipv4Addr::new(c[0], c[1], c[2], c[3]);
            let port = u16::from_be_bytes([c[4], c[5]]);
            SocketAddr::new(IpAddr::V4(ip), port)
        })
        .collect())
}

fn parse_compact_ipv6(buf: &[u8]) -> Result<Vec<SocketAddr>> {
    if buf.len() % 18 != 0 {
        return Err(Error::Protocol("peers6 string not a multiple of 18 bytes"));
    }
    Ok(buf
        .chunks_exact(18)
        .map(|c| {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&c[..16]);
            let ip = Ipv6Addr::from(octets);
            let port = u16::from_be_bytes([c[16], c[17]]);
            SocketAddr::new(IpAddr::V6(ip), port)
        })
        .collect())
}

fn parse_peer_dicts(list: &[Value]) -> Result<Vec<SocketAddr>> {
    let mut out = Vec::with_capacity(list.len());
    for entry in list {
        let dict = entry
            .as_dict()
            .ok_or(Error::Protocol("peer list entry is not a dict"))?;
        let ip = dict
            .get(b"ip".as_ref())
            .and_then(|v| v.as_str())
            .ok_or(Error::Protocol("peer dict missing ip"))?;
        let port = dict
            .get(b"port".as_ref())
            .and_then(|v| v.as_int())
            .ok_or(Error::Protocol("peer dict missing port"))? as u16;
        let ip: IpAddr = ip
            .parse()
            .map_err(|_| Error::Protocol("peer dict ip unparsable"))?;
        out.push(SocketAddr::new(ip, port));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_compact_ipv4_peers() {
        let buf = [127, 0, 0, 1, 0x1a, 0xe1, 10, 0, 0, 1, 0x1a, 0xe2];
        let peers = parse_compact_ipv4(&buf).unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0], "127.0.0.1:6881".parse().unwrap());
        assert_eq!(peers[1], "10.0.0.1:6882".parse().unwrap());
    }

    #[test]
    fn rejects_misaligned_compact_peers() {
        assert!(parse_compact_ipv4(&[1, 2, 3]).is_err());
    }

    #[test]
    fn failure_reason_is_surfaced_as_error() {
        let mut tracker = HttpTracker {
            client: reqwest::Client::new(),
            url: Url::parse("http://tracker.example/announce").unwrap(),
            enable_ipv6: false,
            tracker_id: None,
        };
        let body = b"d14:failure reason11:bad requeste";
        let err = tracker.parse_response(body).unwrap_err();
        assert!(matches!(err, Error::Failure(ref s) if s == "bad request"));
    }

    #[test]
    fn parses_dict_style_peer_list() {
        let mut tracker = HttpTracker {
            client: reqwest::Client::new(),
            url: Url::parse("http://tracker.example/announce").unwrap(),
            enable_ipv6: false,
            tracker_id: None,
        };
        let body = b"d8:intervali1800e5:peersld2:ip9:127.0.0.14:porti6881eeee";
        let resp = tracker.parse_response(body).unwrap();
        assert_eq!(resp.interval, std::time::Duration::from_secs(1800));
        assert_eq!(resp.peers, vec!["127.0.0.1:6881".parse().unwrap()]);
    }
}
