//! Crate-wide error type.
//!
//! Each subsystem that has a rich error surface of its own (bencode,
//! tracker) defines its own error enum and a `Result<T>` alias, and
//! converts into this flat [`Error`] at the boundary where it crosses into
//! generic engine code (see `storage_info.rs`, `peer.rs`).

use std::fmt;

use crate::bencode;

pub(crate) type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// Generic IO failure (file, socket).
    Io(std::io::Error),
    /// The metainfo file could not be parsed as valid bencode.
    Bencode(bencode::Error),
    /// The metainfo `info` dict is missing a required key or has a key of
    /// the wrong type.
    InvalidMetainfo(&'static str),
    /// A piece index was out of the torrent's piece range.
    InvalidPieceIndex,
    /// A torrent id did not correspond to a known torrent.
    InvalidTorrentId,
    /// A disk write failed for a reason other than plain IO (e.g. writing to
    /// a piece whose buffer isn't complete).
    InvalidWrite(&'static str),
    /// The peer's handshake carried an info hash that doesn't match ours.
    InvalidPeerInfoHash,
    /// The peer sent a bitfield message outside of the availability
    /// exchange state.
    BitfieldNotAfterHandshake,
    /// The peer's handshake protocol string didn't match BitTorrent's.
    InvalidProtocol,
    /// A length-prefixed peer message exceeded the maximum sane size.
    MessageTooLarge,
    /// The peer was idle (no received bytes) for longer than the configured
    /// idle timeout.
    PeerTimedOut,
    /// An internal channel was closed while a message was still in flight.
    ChannelClosed(&'static str),
    /// All tracker tiers were exhausted without a single successful
    /// announce.
    AllTrackersFailed,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Bencode(e) => write!(f, "bencode error: {}", e),
            Error::InvalidMetainfo(field) => {
                write!(f, "invalid metainfo: {}", field)
            }
            Error::InvalidPieceIndex => write!(f, "invalid piece index"),
            Error::InvalidTorrentId => write!(f, "invalid torrent id"),
            Error::InvalidWrite(reason) => {
                write!(f, "invalid disk write: {}", reason)
            }
            Error::InvalidPeerInfoHash => {
                write!(f, "peer handshake info hash mismatch")
            }
            Error::BitfieldNotAfterHandshake => {
                write!(f, "peer sent bitfield outside availability exchange")
            }
            Error::InvalidProtocol => write!(f, "invalid protocol handshake"),
            Error::MessageTooLarge => write!(f, "peer message too large"),
            Error::PeerTimedOut => write!(f, "peer idle timeout"),
            Error::ChannelClosed(which) => {
                write!(f, "internal channel closed: {}", which)
            }
            Error::AllTrackersFailed => {
                write!(f, "all tracker tiers exhausted without success")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Bencode(e) => Some(e),
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

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::ChannelClosed("mpsc send")
    }
}
