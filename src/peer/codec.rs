//! The wire codecs: the fixed 68-byte handshake and the length-prefixed
//! message frame used for everything after it.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{bitfield::Bitfield, error::*, BlockInfo, PeerId, Sha1Hash, BLOCK_LEN};

pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// A request/cancel payload is 3 big-endian u32s (piece, begin, length); a
/// piece payload is 2 (piece, begin) plus the block bytes.
const MESSAGE_HEADER_LEN: u32 = 1;
/// Generous enough for a bitfield of any reasonably sized torrent and for a
/// full-size block, while still rejecting a peer trying to make us buffer
/// an unbounded amount of memory for one frame.
const MAX_MESSAGE_LEN: u32 = BLOCK_LEN + 1024 * 1024;

/// The initial 68-byte exchange that precedes all other peer traffic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Handshake {
    pub prot: [u8; 19],
    pub reserved: [u8; 8],
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub(crate) fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        let mut prot = [0; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
        Self {
            prot,
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }
}

pub(crate) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(&mut self, handshake: Handshake, dst: &mut BytesMut) -> Result<()> {
        dst.reserve(68);
        dst.put_u8(19);
        dst.put_slice(&handshake.prot);
        dst.put_slice(&handshake.reserved);
        dst.put_slice(&handshake.info_hash);
        dst.put_slice(&handshake.peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Handshake>> {
        if src.len() < 68 {
            return Ok(None);
        }
        let pstrlen = src[0];
        if pstrlen != 19 {
            return Err(Error::InvalidProtocol);
        }
        let mut buf = src.split_to(68);
        buf.advance(1);

        let mut prot = [0u8; 19];
        buf.copy_to_slice(&mut prot);
        if prot != PROTOCOL_STRING.as_bytes() {
            return Err(Error::InvalidProtocol);
        }

        let mut reserved = [0u8; 8];
        buf.copy_to_slice(&mut reserved);
        let mut info_hash = [0u8; 20];
        buf.copy_to_slice(&mut info_hash);
        let mut peer_id = [0u8; 20];
        buf.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

/// Identifies the message type in a peer wire message's first payload byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
}

impl std::convert::TryFrom<u8> for MessageId {
    type Error = Error;

    fn try_from(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(Self::Choke),
            1 => Ok(Self::Unchoke),
            2 => Ok(Self::Interested),
            3 => Ok(Self::NotInterested),
            4 => Ok(Self::Have),
            5 => Ok(Self::Bitfield),
            6 => Ok(Self::Request),
            7 => Ok(Self::Piece),
            8 => Ok(Self::Cancel),
            _ => Err(Error::InvalidProtocol),
        }
    }
}

/// A single BitTorrent peer wire message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: usize },
    Bitfield(Bitfield),
    Request(BlockInfo),
    Piece { piece_index: usize, offset: u32, data: Vec<u8> },
    Cancel(BlockInfo),
}

impl Message {
    pub(crate) fn id(&self) -> Option<MessageId> {
        match self {
            Self::KeepAlive => None,
            Self::Choke => Some(MessageId::Choke),
            Self::Unchoke => Some(MessageId::Unchoke),
            Self::Interested => Some(MessageId::Interested),
            Self::NotInterested => Some(MessageId::NotInterested),
            Self::Have { .. } => Some(MessageId::Have),
            Self::Bitfield(_) => Some(MessageId::Bitfield),
            Self::Request(_) => Some(MessageId::Request),
            Self::Piece { .. } => Some(MessageId::Piece),
            Self::Cancel(_) => Some(MessageId::Cancel),
        }
    }
}

pub(crate) struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = Error;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<()> {
        match msg {
            Message::KeepAlive => {
                dst.reserve(4);
                dst.put_u32(0);
            }
            Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => {
                dst.reserve(5);
                dst.put_u32(MESSAGE_HEADER_LEN);
                dst.put_u8(msg.id().expect("message carries an id") as u8);
            }
            Message::Have { piece_index } => {
                dst.reserve(9);
                dst.put_u32(MESSAGE_HEADER_LEN + 4);
                dst.put_u8(MessageId::Have as u8);
                dst.put_u32(piece_index as u32);
            }
            Message::Bitfield(bitfield) => {
                let bytes = bitfield.into_wire_bytes();
                dst.reserve(5 + bytes.len());
                dst.put_u32(MESSAGE_HEADER_LEN + bytes.len() as u32);
                dst.put_u8(MessageId::Bitfield as u8);
                dst.put_slice(&bytes);
            }
            Message::Request(block) => {
                dst.reserve(17);
                dst.put_u32(MESSAGE_HEADER_LEN + 12);
                dst.put_u8(MessageId::Request as u8);
                dst.put_u32(block.piece_index as u32);
                dst.put_u32(block.offset);
                dst.put_u32(block.len);
            }
            Message::Cancel(block) => {
                dst.reserve(17);
                dst.put_u32(MESSAGE_HEADER_LEN + 12);
                dst.put_u8(MessageId::Cancel as u8);
                dst.put_u32(block.piece_index as u32);
                dst.put_u32(block.offset);
                dst.put_u32(block.len);
            }
            Message::Piece { piece_index, offset, data } => {
                dst.reserve(13 + data.len());
                dst.put_u32(MESSAGE_HEADER_LEN + 8 + data.len() as u32);
                dst.put_u8(MessageId::Piece as u8);
                dst.put_u32(piece_index as u32);
                dst.put_u32(offset);
                dst.put_slice(&data);
            }
        }
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        if src.len() < 4 {
            return Ok(None);
        }
        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        if length == 0 {
            src.advance(4);
            return Ok(Some(Message::KeepAlive));
        }
        if length > MAX_MESSAGE_LEN {
            return Err(Error::MessageTooLarge);
        }
        if src.len() < 4 + length as usize {
            return Ok(None);
        }

        src.advance(4);
        let id = MessageId::try_from(src.get_u8())?;
        let payload_len = length as usize - 1;

        // Fixed-size messages must carry exactly their expected payload;
        // `Piece` only has a lower bound (it carries a variable-length
        // block). A short payload would otherwise underflow the `get_u32`/
        // `split_to` calls below and panic the read loop instead of
        // ending the session with an error, per spec's malformed-message
        // handling.
        let expected_len: Option<usize> = match id {
            MessageId::Choke
            | MessageId::Unchoke
            | MessageId::Interested
            | MessageId::NotInterested => Some(0),
            MessageId::Have => Some(4),
            MessageId::Request | MessageId::Cancel => Some(12),
            MessageId::Piece if payload_len < 8 => Some(8),
            MessageId::Piece | MessageId::Bitfield => None,
        };
        if let Some(expected) = expected_len {
            if payload_len != expected {
                return Err(Error::InvalidProtocol);
            }
        }

        let msg = match id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => {
                let piece_index = src.get_u32() as usize;
                Message::Have { piece_index }
            }
            MessageId::Bitfield => {
                let bytes = src.split_to(payload_len);
                // the logical piece count isn't known to the codec; the
                // caller resizes this to the torrent's piece count.
                Message::Bitfield(Bitfield::from_wire_bytes(&bytes, bytes.len() * 8))
            }
            MessageId::Request | MessageId::Cancel => {
                let piece_index = src.get_u32() as usize;
                let offset = src.get_u32();
                let len = src.get_u32();
                let block = BlockInfo {
                    piece_index,
                    offset,
                    len,
                };
                if id == MessageId::Request {
                    Message::Request(block)
                } else {
                    Message::Cancel(block)
                }
            }
            MessageId::Piece => {
                let piece_index = src.get_u32() as usize;
                let offset = src.get_u32();
                let data = src.split_to(payload_len - 8).to_vec();
                Message::Piece { piece_index, offset, data }
            }
        };

        Ok(Some(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_roundtrip() {
        let mut buf = BytesMut::new();
        let hs = Handshake::new([1u8; 20], [2u8; 20]);
        HandshakeCodec.encode(hs.clone(), &mut buf).unwrap();
        assert_eq!(buf.len(), 68);
        let decoded = HandshakeCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, hs);
    }

    #[test]
    fn rejects_bad_protocol_string() {
        let mut buf = BytesMut::new();
        buf.put_u8(19);
        buf.put_slice(&[0u8; 19]);
        buf.put_slice(&[0u8; 8]);
        buf.put_slice(&[0u8; 20]);
        buf.put_slice(&[0u8; 20]);
        assert!(matches!(
            HandshakeCodec.decode(&mut buf),
            Err(Error::InvalidProtocol)
        ));
    }

    #[test]
    fn keep_alive_roundtrip() {
        let mut buf = BytesMut::new();
        PeerCodec.encode(Message::KeepAlive, &mut buf).unwrap();
        assert_eq!(&buf[..], &[0, 0, 0, 0]);
        let msg = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg, Message::KeepAlive);
    }

    #[test]
    fn have_roundtrip() {
        let mut buf = BytesMut::new();
        PeerCodec
            .encode(Message::Have { piece_index: 42 }, &mut buf)
            .unwrap();
        let msg = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg, Message::Have { piece_index: 42 });
    }

    #[test]
    fn request_roundtrip() {
        let mut buf = BytesMut::new();
        let block = BlockInfo {
            piece_index: 3,
            offset: 16384,
            len: 16384,
        };
        PeerCodec.encode(Message::Request(block), &mut buf).unwrap();
        let msg = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg, Message::Request(block));
    }

    #[test]
    fn piece_roundtrip() {
        let mut buf = BytesMut::new();
        let data = vec![7u8; 100];
        PeerCodec
            .encode(
                Message::Piece {
                    piece_index: 1,
                    offset: 0,
                    data: data.clone(),
                },
                &mut buf,
            )
            .unwrap();
        let msg = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(
            msg,
            Message::Piece {
                piece_index: 1,
                offset: 0,
                data
            }
        );
    }

    #[test]
    fn incomplete_frame_returns_none() {
        let mut buf = BytesMut::new();
        buf.put_u32(9);
        buf.put_u8(MessageId::Have as u8);
        let msg = PeerCodec.decode(&mut buf).unwrap();
        assert!(msg.is_none());
    }

    #[test]
    fn oversized_length_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_MESSAGE_LEN + 1);
        assert!(matches!(
            PeerCodec.decode(&mut buf),
            Err(Error::MessageTooLarge)
        ));
    }

    #[test]
    fn undersized_piece_payload_is_rejected_not_panicked() {
        let mut buf = BytesMut::new();
        // length=5: id byte + 4 bytes, one short of the 8-byte
        // piece/offset header a real Piece message needs.
        buf.put_u32(5);
        buf.put_u8(MessageId::Piece as u8);
        buf.put_u32(0);
        assert!(matches!(
            PeerCodec.decode(&mut buf),
            Err(Error::InvalidProtocol)
        ));
    }

    #[test]
    fn undersized_request_payload_is_rejected_not_panicked() {
        let mut buf = BytesMut::new();
        // length=9: id byte + 8 bytes, short of the 12-byte
        // piece/begin/length a Request needs.
        buf.put_u32(9);
        buf.put_u8(MessageId::Request as u8);
        buf.put_u32(0);
        buf.put_u32(0);
        assert!(matches!(
            PeerCodec.decode(&mut buf),
            Err(Error::InvalidProtocol)
        ));
    }

    #[test]
    fn undersized_have_payload_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(2);
        buf.put_u8(MessageId::Have as u8);
        buf.put_u8(0);
        assert!(matches!(
            PeerCodec.decode(&mut buf),
            Err(Error::InvalidProtocol)
        ));
    }
}
