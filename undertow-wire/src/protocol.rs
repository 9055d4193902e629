use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use undertow_common::types::{InfoHash, PeerId};

/// Identifies one block within a piece: the unit requested and
/// transferred over the wire.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
pub struct BlockInfo {
    pub index: u32,
    pub begin: u32,
    pub length: u32,
}

/// A block payload as carried by a `piece` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub index: u32,
    pub begin: u32,
    pub data: Bytes,
}

impl Block {
    pub fn info(&self) -> BlockInfo {
        BlockInfo {
            index: self.index,
            begin: self.begin,
            length: self.data.len() as u32,
        }
    }
}

/// The core peer-wire message set. Every inbound frame decodes to
/// exactly one of these; unknown ids are a decode error so the
/// connection can treat them as a protocol violation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: u32 },
    Bitfield(Bytes),
    Request(BlockInfo),
    Piece(Block),
    Cancel(BlockInfo),
}

// handshake: <pstrlen><pstr><reserved><info_hash><peer_id>
#[derive(Debug)]
pub struct Handshake {
    pub peer_id: PeerId,
    pub info_hash: InfoHash,
    reserved: [u8; 8],
}

impl Handshake {
    const PSTRLEN: u8 = 19;
    const PSTR: &[u8; 19] = b"BitTorrent protocol";

    pub const HANDSHAKE_LEN: usize = 68;

    pub fn new(peer_id: PeerId, info_hash: InfoHash) -> Self {
        Handshake {
            peer_id,
            info_hash,
            reserved: [0u8; 8],
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut bytes = BytesMut::with_capacity(Self::HANDSHAKE_LEN);
        bytes.put_u8(Self::PSTRLEN);
        bytes.put_slice(Self::PSTR);
        bytes.put_slice(&self.reserved);
        bytes.put_slice(self.info_hash.as_bytes());
        bytes.put_slice(self.peer_id.as_bytes());
        bytes.freeze()
    }

    pub fn from_bytes(src: &[u8]) -> Option<Self> {
        if src.len() != Self::HANDSHAKE_LEN || src[0] != Self::PSTRLEN || &src[1..20] != Self::PSTR
        {
            return None;
        }
        let reserved: [u8; 8] = src.get(20..28)?.try_into().ok()?;
        let info_hash: [u8; 20] = src.get(28..48)?.try_into().ok()?;
        let peer_id: [u8; 20] = src.get(48..68)?.try_into().ok()?;

        Some(Handshake {
            reserved,
            peer_id: peer_id.into(),
            info_hash: info_hash.into(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessageId {
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

impl TryFrom<u8> for MessageId {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        Ok(match value {
            0 => MessageId::Choke,
            1 => MessageId::Unchoke,
            2 => MessageId::Interested,
            3 => MessageId::NotInterested,
            4 => MessageId::Have,
            5 => MessageId::Bitfield,
            6 => MessageId::Request,
            7 => MessageId::Piece,
            8 => MessageId::Cancel,
            other => return Err(other),
        })
    }
}

/// Codec for the steady-state message stream: 4-byte big-endian length
/// prefix (zero = keep-alive), 1-byte id, type-specific payload.
#[derive(Debug, Clone, Default)]
pub struct PeerCodec {}

impl PeerCodec {
    /// Upper bound on a single frame. The largest legitimate frame is a
    /// `piece` carrying one block; anything past this is a hostile or
    /// corrupt length prefix.
    pub const MAX_FRAME_LEN: u32 = 1 << 17;
}

fn invalid_data(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.remaining() < 4 {
            return Ok(None);
        }

        // peek the length prefix without consuming it
        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&src[..4]);
        let msg_length = u32::from_be_bytes(length_bytes);

        if msg_length > Self::MAX_FRAME_LEN {
            return Err(invalid_data(format!(
                "frame length {msg_length} exceeds maximum {}",
                Self::MAX_FRAME_LEN
            )));
        }

        if src.remaining() < 4 + msg_length as usize {
            return Ok(None);
        }
        src.advance(4);
        if msg_length == 0 {
            return Ok(Some(Message::KeepAlive));
        }

        let id_byte = src.get_u8();
        let msg_id = MessageId::try_from(id_byte)
            .map_err(|id| invalid_data(format!("unknown message id {id}")))?;

        let expect_len = |expected: u32| -> Result<(), io::Error> {
            if msg_length == expected {
                Ok(())
            } else {
                Err(invalid_data(format!(
                    "message id {id_byte} has length {msg_length}, expected {expected}"
                )))
            }
        };

        let msg = match msg_id {
            MessageId::Choke => {
                expect_len(1)?;
                Message::Choke
            }
            MessageId::Unchoke => {
                expect_len(1)?;
                Message::Unchoke
            }
            MessageId::Interested => {
                expect_len(1)?;
                Message::Interested
            }
            MessageId::NotInterested => {
                expect_len(1)?;
                Message::NotInterested
            }
            // <len=0005><id=4><index>
            MessageId::Have => {
                expect_len(5)?;
                Message::Have {
                    piece_index: src.get_u32(),
                }
            }
            // <len=0001+X><id=5><bitfield>
            MessageId::Bitfield => {
                let len = msg_length as usize - 1;
                Message::Bitfield(src.split_to(len).freeze())
            }
            // <len=0013><id=6><index><begin><length>
            MessageId::Request => {
                expect_len(13)?;
                Message::Request(BlockInfo {
                    index: src.get_u32(),
                    begin: src.get_u32(),
                    length: src.get_u32(),
                })
            }
            // <len=0009+X><id=7><index><begin><block>
            MessageId::Piece => {
                if msg_length < 9 {
                    return Err(invalid_data(format!(
                        "piece message too short: {msg_length}"
                    )));
                }
                let index = src.get_u32();
                let begin = src.get_u32();
                let data = src.split_to(msg_length as usize - 9).freeze();
                Message::Piece(Block { index, begin, data })
            }
            // <len=0013><id=8><index><begin><length>
            MessageId::Cancel => {
                expect_len(13)?;
                Message::Cancel(BlockInfo {
                    index: src.get_u32(),
                    begin: src.get_u32(),
                    length: src.get_u32(),
                })
            }
        };

        Ok(Some(msg))
    }
}

impl Encoder<Message> for PeerCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            Message::KeepAlive => {
                dst.put_u32(0);
            }
            Message::Choke => {
                dst.put_u32(1);
                dst.put_u8(MessageId::Choke as u8);
            }
            Message::Unchoke => {
                dst.put_u32(1);
                dst.put_u8(MessageId::Unchoke as u8);
            }
            Message::Interested => {
                dst.put_u32(1);
                dst.put_u8(MessageId::Interested as u8);
            }
            Message::NotInterested => {
                dst.put_u32(1);
                dst.put_u8(MessageId::NotInterested as u8);
            }
            Message::Have { piece_index } => {
                dst.put_u32(5);
                dst.put_u8(MessageId::Have as u8);
                dst.put_u32(piece_index);
            }
            Message::Bitfield(bitfield) => {
                dst.put_u32(bitfield.len() as u32 + 1);
                dst.put_u8(MessageId::Bitfield as u8);
                dst.put_slice(&bitfield);
            }
            Message::Request(block) => {
                dst.put_u32(13);
                dst.put_u8(MessageId::Request as u8);
                dst.put_u32(block.index);
                dst.put_u32(block.begin);
                dst.put_u32(block.length);
            }
            Message::Piece(block) => {
                dst.put_u32(block.data.len() as u32 + 9);
                dst.put_u8(MessageId::Piece as u8);
                dst.put_u32(block.index);
                dst.put_u32(block.begin);
                dst.put_slice(&block.data);
            }
            Message::Cancel(block) => {
                dst.put_u32(13);
                dst.put_u8(MessageId::Cancel as u8);
                dst.put_u32(block.index);
                dst.put_u32(block.begin);
                dst.put_u32(block.length);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_one(bytes: &[u8]) -> Result<Option<Message>, io::Error> {
        let mut codec = PeerCodec::default();
        let mut buf = BytesMut::from(bytes);
        codec.decode(&mut buf)
    }

    fn encode_one(msg: Message) -> BytesMut {
        let mut codec = PeerCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(msg, &mut buf).unwrap();
        buf
    }

    #[test]
    fn handshake_round_trip() {
        let peer_id = PeerId::from([1u8; 20]);
        let info_hash = InfoHash::from([2u8; 20]);

        let handshake = Handshake::new(peer_id, info_hash);
        let bytes = handshake.to_bytes();
        assert_eq!(bytes.len(), Handshake::HANDSHAKE_LEN);

        let decoded = Handshake::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.peer_id, peer_id);
        assert_eq!(decoded.info_hash, info_hash);
    }

    #[test]
    fn handshake_rejects_bad_protocol_string() {
        let mut bytes = BytesMut::from(&Handshake::new(
            PeerId::from([1u8; 20]),
            InfoHash::from([2u8; 20]),
        )
        .to_bytes()[..]);
        bytes[1] = b'X';
        assert!(Handshake::from_bytes(&bytes).is_none());
    }

    #[test]
    fn keep_alive_is_zero_length_prefix() {
        assert_eq!(&encode_one(Message::KeepAlive)[..], &[0, 0, 0, 0]);
        assert_eq!(
            decode_one(&[0, 0, 0, 0]).unwrap(),
            Some(Message::KeepAlive)
        );
    }

    #[test]
    fn fixed_messages_are_bit_exact() {
        assert_eq!(&encode_one(Message::Choke)[..], &[0, 0, 0, 1, 0]);
        assert_eq!(&encode_one(Message::Unchoke)[..], &[0, 0, 0, 1, 1]);
        assert_eq!(&encode_one(Message::Interested)[..], &[0, 0, 0, 1, 2]);
        assert_eq!(&encode_one(Message::NotInterested)[..], &[0, 0, 0, 1, 3]);
        assert_eq!(
            &encode_one(Message::Have { piece_index: 7 })[..],
            &[0, 0, 0, 5, 4, 0, 0, 0, 7]
        );
        assert_eq!(
            &encode_one(Message::Request(BlockInfo {
                index: 1,
                begin: 16384,
                length: 16384,
            }))[..],
            &[0, 0, 0, 13, 6, 0, 0, 0, 1, 0, 0, 0x40, 0, 0, 0, 0x40, 0]
        );
    }

    #[test]
    fn piece_round_trip() {
        let block = Block {
            index: 3,
            begin: 16384,
            data: Bytes::from_static(b"hello world"),
        };
        let buf = encode_one(Message::Piece(block.clone()));
        // 9 byte header + payload
        assert_eq!(u32::from_be_bytes(buf[..4].try_into().unwrap()), 9 + 11);
        let decoded = decode_one(&buf).unwrap().unwrap();
        assert_eq!(decoded, Message::Piece(block));
    }

    #[test]
    fn bitfield_round_trip() {
        let payload = Bytes::from_static(&[0b1010_0000, 0b0100_0000]);
        let buf = encode_one(Message::Bitfield(payload.clone()));
        let decoded = decode_one(&buf).unwrap().unwrap();
        assert_eq!(decoded, Message::Bitfield(payload));
    }

    #[test]
    fn partial_frame_yields_none() {
        // length prefix says 13 bytes follow, only 4 present
        let bytes = [0u8, 0, 0, 13, 6, 0, 0, 0];
        assert_eq!(decode_one(&bytes).unwrap(), None);
    }

    #[test]
    fn unknown_id_is_an_error() {
        let bytes = [0u8, 0, 0, 1, 42];
        let err = decode_one(&bytes).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn wrong_payload_length_is_an_error() {
        // have with a 2-byte payload
        let bytes = [0u8, 0, 0, 3, 4, 0, 0];
        assert!(decode_one(&bytes).is_err());
    }

    #[test]
    fn oversized_frame_is_an_error() {
        let huge = (PeerCodec::MAX_FRAME_LEN + 1).to_be_bytes();
        let err = decode_one(&huge).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn consecutive_messages_decode_in_order() {
        let mut codec = PeerCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(Message::Unchoke, &mut buf).unwrap();
        codec
            .encode(Message::Have { piece_index: 2 }, &mut buf)
            .unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Message::Unchoke));
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Message::Have { piece_index: 2 })
        );
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }
}
