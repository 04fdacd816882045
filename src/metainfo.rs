//! Parsing of `.torrent` metainfo files.
//!
//! A metainfo file is a bencoded dict with an `info` sub-dict describing
//! the file layout and piece hashes, plus tracker announce URLs. See
//! BEP-3 and BEP-12 (multi-tracker `announce-list`).

use std::path::PathBuf;

use sha1::{Digest, Sha1};

use crate::{bencode, error::Error, PieceIndex, Sha1Hash};

pub(crate) type Result<T> = std::result::Result<T, Error>;

/// A single file entry in a multi-file torrent.
#[derive(Debug, Clone)]
pub struct File {
    /// Path segments relative to the torrent's root directory.
    pub path: Vec<String>,
    /// The file's length in bytes.
    pub length: u64,
}

/// Either a single file, or an ordered list of files making up an archive.
#[derive(Debug, Clone)]
pub enum Content {
    Single { length: u64 },
    Multi { files: Vec<File> },
}

/// A fully parsed and validated `.torrent` file.
#[derive(Debug, Clone)]
pub struct Metainfo {
    /// The exact 20-byte SHA-1 of the bencoded `info` dict, computed over
    /// the dict's original byte range rather than a re-encoding of it.
    pub info_hash: Sha1Hash,
    /// The suggested name of the file (single-file torrents) or root
    /// directory (multi-file torrents).
    pub name: String,
    /// The nominal length of a piece, in bytes. The final piece may be
    /// shorter.
    pub piece_length: u32,
    /// The concatenated 20-byte SHA-1 hashes of every piece, in order.
    pub piece_hashes: Vec<Sha1Hash>,
    /// Single-file length, or the ordered list of files in the archive.
    pub content: Content,
    /// The primary announce URL, if any.
    pub announce: Option<String>,
    /// Tiers of announce URLs (BEP-12), if the torrent declares one.
    pub announce_list: Vec<Vec<String>>,
    /// Whether the torrent is marked private (no DHT/PEX).
    pub private: bool,
}

impl Metainfo {
    /// Parses and validates a `.torrent` file's raw bytes.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let top = bencode::decode(buf).map_err(Error::Bencode)?;
        let top_dict = top
            .as_dict()
            .ok_or(Error::InvalidMetainfo("top-level value is not a dict"))?;

        let info_span = bencode::top_level_key_span(buf, b"info")
            .map_err(|_| Error::InvalidMetainfo("missing info dict"))?;
        let info_bytes = &buf[info_span];
        let info_hash = {
            let digest = Sha1::digest(info_bytes);
            let mut out = [0u8; 20];
            out.copy_from_slice(&digest);
            out
        };

        let info = top_dict
            .get(b"info".as_ref())
            .and_then(|v| v.as_dict())
            .ok_or(Error::InvalidMetainfo("info is not a dict"))?;

        let name = info
            .get(b"name".as_ref())
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or(Error::InvalidMetainfo("missing or empty name"))?
            .to_string();

        let piece_length = info
            .get(b"piece length".as_ref())
            .and_then(|v| v.as_int())
            .filter(|&n| n > 0)
            .ok_or(Error::InvalidMetainfo("missing or non-positive piece length"))?
            as u32;

        let pieces = info
            .get(b"pieces".as_ref())
            .and_then(|v| v.as_bytes())
            .ok_or(Error::InvalidMetainfo("missing pieces string"))?;
        if pieces.len() % 20 != 0 {
            return Err(Error::InvalidMetainfo("pieces length not a multiple of 20"));
        }
        let piece_hashes: Vec<Sha1Hash> = pieces
            .chunks_exact(20)
            .map(|c| {
                let mut h = [0u8; 20];
                h.copy_from_slice(c);
                h
            })
            .collect();
        if piece_hashes.is_empty() {
            return Err(Error::InvalidMetainfo("no pieces"));
        }

        let length = info.get(b"length".as_ref()).and_then(|v| v.as_int());
        let files = info.get(b"files".as_ref()).and_then(|v| v.as_list());

        let content = match (length, files) {
            (Some(length), None) => {
                if length < 0 {
                    return Err(Error::InvalidMetainfo("negative length"));
                }
                Content::Single { length: length as u64 }
            }
            (None, Some(files)) => {
                if files.is_empty() {
                    return Err(Error::InvalidMetainfo("empty files list"));
                }
                let mut parsed = Vec::with_capacity(files.len());
                for f in files {
                    let dict = f
                        .as_dict()
                        .ok_or(Error::InvalidMetainfo("file entry is not a dict"))?;
                    let flen = dict
                        .get(b"length".as_ref())
                        .and_then(|v| v.as_int())
                        .filter(|&n| n >= 0)
                        .ok_or(Error::InvalidMetainfo("file entry missing length"))?
                        as u64;
                    let path_list = dict
                        .get(b"path".as_ref())
                        .and_then(|v| v.as_list())
                        .filter(|l| !l.is_empty())
                        .ok_or(Error::InvalidMetainfo("file entry missing path"))?;
                    let mut segments = Vec::with_capacity(path_list.len());
                    for seg in path_list {
                        let s = seg
                            .as_str()
                            .ok_or(Error::InvalidMetainfo("path segment not a string"))?;
                        segments.push(s.to_string());
                    }
                    parsed.push(File {
                        path: segments,
                        length: flen,
                    });
                }
                Content::Multi { files: parsed }
            }
            (Some(_), Some(_)) => {
                return Err(Error::InvalidMetainfo(
                    "info dict has both length and files",
                ))
            }
            (None, None) => {
                return Err(Error::InvalidMetainfo(
                    "info dict has neither length nor files",
                ))
            }
        };

        let total_size = content.total_size();
        let expected_piece_count =
            ((total_size.saturating_sub(1)) / piece_length as u64 + 1) as usize;
        if expected_piece_count != piece_hashes.len() {
            return Err(Error::InvalidMetainfo(
                "piece count does not match total size / piece length",
            ));
        }

        let announce = top_dict
            .get(b"announce".as_ref())
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        let announce_list = top_dict
            .get(b"announce-list".as_ref())
            .and_then(|v| v.as_list())
            .map(|tiers| {
                tiers
                    .iter()
                    .filter_map(|tier| tier.as_list())
                    .map(|tier| {
                        tier.iter()
                            .filter_map(|url| url.as_str().map(|s| s.to_string()))
                            .collect::<Vec<_>>()
                    })
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        let private = info
            .get(b"private".as_ref())
            .and_then(|v| v.as_int())
            .map(|n| n != 0)
            .unwrap_or(false);

        Ok(Self {
            info_hash,
            name,
            piece_length,
            piece_hashes,
            content,
            announce,
            announce_list,
            private,
        })
    }

    /// The total number of pieces in the torrent.
    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// The total size of the torrent's content, in bytes.
    pub fn total_size(&self) -> u64 {
        self.content.total_size()
    }

    /// Returns every tracker tier to try, in priority order: the flattened
    /// `announce-list` if present (each inner vec is a tier), falling back
    /// to a single tier containing just `announce`.
    pub fn tracker_tiers(&self) -> Vec<Vec<String>> {
        if !self.announce_list.is_empty() {
            self.announce_list.clone()
        } else if let Some(url) = &self.announce {
            vec![vec![url.clone()]]
        } else {
            Vec::new()
        }
    }

    /// Returns the byte length of the piece at `index`, accounting for a
    /// possibly shorter final piece.
    pub fn piece_len(&self, index: PieceIndex) -> Result<u32> {
        let count = self.piece_count();
        if index >= count {
            return Err(Error::InvalidPieceIndex);
        }
        if index == count - 1 {
            let last =
                self.total_size() - self.piece_length as u64 * (count - 1) as u64;
            Ok(last as u32)
        } else {
            Ok(self.piece_length)
        }
    }
}

impl Content {
    pub fn total_size(&self) -> u64 {
        match self {
            Content::Single { length } => *length,
            Content::Multi { files } => files.iter().map(|f| f.length).sum(),
        }
    }
}

impl File {
    /// Joins this file's path segments into a single relative path.
    pub fn relative_path(&self) -> PathBuf {
        self.path.iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_single_file() -> Vec<u8> {
        // one piece, 4 bytes long, matching the SHA-1 of "abcd"
        let hash = Sha1::digest(b"abcd");
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d8:announce14:http://tracker4:infod6:lengthi4e4:name4:demo12:piece lengthi4e6:pieces20:");
        buf.extend_from_slice(&hash);
        buf.extend_from_slice(b"ee");
        buf
    }

    #[test]
    fn parses_single_file_torrent() {
        let buf = sample_single_file();
        let mi = Metainfo::parse(&buf).unwrap();
        assert_eq!(mi.name, "demo");
        assert_eq!(mi.piece_length, 4);
        assert_eq!(mi.piece_count(), 1);
        assert_eq!(mi.total_size(), 4);
        assert_eq!(mi.announce.as_deref(), Some("http://tracker"));
        assert!(matches!(mi.content, Content::Single { length: 4 }));
    }

    #[test]
    fn info_hash_is_over_raw_bytes_not_reencoding() {
        // deliberately out-of-canonical-order keys inside info: "name" then
        // "length" then "piece length" then "pieces" -- a re-encoder that
        // sorts keys would produce different bytes (and thus a different
        // hash) than hashing the raw slice.
        let hash = Sha1::digest(b"abcd");
        let mut info = Vec::new();
        info.extend_from_slice(b"d4:name4:demo6:lengthi4e12:piece lengthi4e6:pieces20:");
        info.extend_from_slice(&hash);
        info.push(b'e');

        let mut buf = Vec::new();
        buf.extend_from_slice(b"d8:announce14:http://tracker4:info");
        buf.extend_from_slice(&info);
        buf.push(b'e');

        let mi = Metainfo::parse(&buf).unwrap();
        let expected = Sha1::digest(&info);
        assert_eq!(&mi.info_hash[..], &expected[..]);
    }

    #[test]
    fn rejects_piece_count_mismatch() {
        let buf = sample_single_file();
        let s = String::from_utf8(buf).unwrap();
        // corrupt: claim length 100 while only one piece hash is present
        let s = s.replace("lengthi4e", "lengthi100e");
        assert!(Metainfo::parse(s.as_bytes()).is_err());
    }

    #[test]
    fn rejects_both_length_and_files() {
        let hash = Sha1::digest(b"abcd");
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d4:infod6:lengthi4e5:filesl4:nopee4:name4:demo12:piece lengthi4e6:pieces20:");
        buf.extend_from_slice(&hash);
        buf.extend_from_slice(b"eee");
        assert!(Metainfo::parse(&buf).is_err());
    }

    #[test]
    fn multi_file_total_size_and_piece_count() {
        // 2 files: 10 and 6 bytes => 16 bytes total, piece length 4 => 4 pieces
        let hashes: Vec<u8> = (0..4)
            .flat_map(|i| Sha1::digest(format!("piece{}", i).as_bytes()).to_vec())
            .collect();
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d4:infod5:filesld6:lengthi10e4:pathl1:aeed6:lengthi6e4:pathl1:beee4:name4:demo12:piece lengthi4e6:pieces");
        buf.extend_from_slice(hashes.len().to_string().as_bytes());
        buf.push(b':');
        buf.extend_from_slice(&hashes);
        buf.extend_from_slice(b"ee");

        let mi = Metainfo::parse(&buf).unwrap();
        assert_eq!(mi.total_size(), 16);
        assert_eq!(mi.piece_count(), 4);
        assert_eq!(mi.piece_len(3).unwrap(), 4);
        match &mi.content {
            Content::Multi { files } => {
                assert_eq!(files.len(), 2);
                assert_eq!(files[0].length, 10);
                assert_eq!(files[1].length, 6);
            }
            _ => panic!("expected multi-file content"),
        }
    }
}
