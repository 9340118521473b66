//! The handshake and peer message codecs of the BitTorrent wire protocol.
//!
//! A connection starts with a 68 byte handshake, after which both sides
//! switch to length prefixed messages. The two phases use separate codecs;
//! the session swaps [`HandshakeCodec`] for [`PeerCodec`] while keeping the
//! read buffer, as the peer may pipeline messages after its handshake.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    error::Error, Bitfield, BlockInfo, PeerId, PieceIndex, Sha1Hash,
};

/// The protocol string of the standard BitTorrent handshake.
pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// No valid message is larger than a maximum sized piece frame, so anything
/// beyond it is treated as garbage and the connection dropped.
const MAX_FRAME_LEN: u32 = 2 * 1024 * 1024 + 13;

/// The Fast Extension (BEP 6) flag: bit 2 of reserved byte 7.
const FAST_FLAG: u8 = 0x04;
/// The Extension Protocol (BEP 10) flag: bit 4 of reserved byte 5.
const EXTENSION_FLAG: u8 = 0x10;

/// The sub-id of the extension protocol handshake within message 20.
pub(crate) const EXTENDED_HANDSHAKE_ID: u8 = 0;

#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct Handshake {
    /// The protocol string, always "BitTorrent protocol" on valid handshakes.
    pub prot: [u8; 19],
    /// Reserved extension bits.
    pub reserved: [u8; 8],
    /// The torrent the connection is for.
    pub info_hash: Sha1Hash,
    /// The peer's arbitrary client id.
    pub peer_id: PeerId,
}

impl Handshake {
    /// Creates our handshake, advertising the Fast Extension and the
    /// Extension Protocol.
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        let mut prot = [0; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
        let mut reserved = [0; 8];
        reserved[7] |= FAST_FLAG;
        reserved[5] |= EXTENSION_FLAG;
        Self {
            prot,
            reserved,
            info_hash,
            peer_id,
        }
    }

    pub fn supports_fast(&self) -> bool {
        self.reserved[7] & FAST_FLAG != 0
    }

    pub fn supports_extension_protocol(&self) -> bool {
        self.reserved[5] & EXTENSION_FLAG != 0
    }
}

impl std::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handshake")
            .field("info_hash", &hex::encode(self.info_hash))
            .field("peer_id", &String::from_utf8_lossy(&self.peer_id))
            .field("fast", &self.supports_fast())
            .field("extension_protocol", &self.supports_extension_protocol())
            .finish()
    }
}

pub(crate) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(&mut self, handshake: Handshake, buf: &mut BytesMut) -> Result<(), Self::Error> {
        let Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        } = handshake;
        buf.reserve(68);
        buf.put_u8(prot.len() as u8);
        buf.extend_from_slice(&prot);
        buf.extend_from_slice(&reserved);
        buf.extend_from_slice(&info_hash);
        buf.extend_from_slice(&peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Handshake>, Self::Error> {
        if buf.is_empty() {
            return Ok(None);
        }
        // the protocol string length is checked before waiting for the rest
        // of the handshake so that bogus clients are cut off immediately
        if buf[0] as usize != PROTOCOL_STRING.len() {
            return Err(Error::HandshakeMismatch);
        }
        if buf.len() < 68 {
            return Ok(None);
        }

        buf.advance(1);
        let mut prot = [0; 19];
        buf.copy_to_slice(&mut prot);
        if prot != PROTOCOL_STRING.as_bytes() {
            return Err(Error::HandshakeMismatch);
        }
        let mut reserved = [0; 8];
        buf.copy_to_slice(&mut reserved);
        let mut info_hash = [0; 20];
        buf.copy_to_slice(&mut info_hash);
        let mut peer_id = [0; 20];
        buf.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

/// The ids of the messages exchanged after the handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Block = 7,
    Cancel = 8,
    Port = 9,
    Suggest = 0x0d,
    HaveAll = 0x0e,
    HaveNone = 0x0f,
    Reject = 0x10,
    AllowedFast = 0x11,
    Extended = 20,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have {
        piece_index: PieceIndex,
    },
    Bitfield(Bitfield),
    Request(BlockInfo),
    Block {
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    },
    Cancel(BlockInfo),
    /// The port of the peer's DHT node. Stored, not acted on.
    Port(u16),
    Suggest {
        piece_index: PieceIndex,
    },
    HaveAll,
    HaveNone,
    Reject(BlockInfo),
    AllowedFast {
        piece_index: PieceIndex,
    },
    /// An extension protocol (BEP 10) message: the extended sub-id followed
    /// by its bencoded payload.
    Extended {
        id: u8,
        payload: Vec<u8>,
    },
    /// A message with an id we don't know. Its payload has already been
    /// drained from the read buffer; the session logs and discards it.
    Unknown {
        id: u8,
    },
}

impl Message {
    /// Returns the id of the message, or none for a keep-alive, which has no
    /// id on the wire.
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(MessageId::Choke),
            Message::Unchoke => Some(MessageId::Unchoke),
            Message::Interested => Some(MessageId::Interested),
            Message::NotInterested => Some(MessageId::NotInterested),
            Message::Have { .. } => Some(MessageId::Have),
            Message::Bitfield(_) => Some(MessageId::Bitfield),
            Message::Request(_) => Some(MessageId::Request),
            Message::Block { .. } => Some(MessageId::Block),
            Message::Cancel(_) => Some(MessageId::Cancel),
            Message::Port(_) => Some(MessageId::Port),
            Message::Suggest { .. } => Some(MessageId::Suggest),
            Message::HaveAll => Some(MessageId::HaveAll),
            Message::HaveNone => Some(MessageId::HaveNone),
            Message::Reject(_) => Some(MessageId::Reject),
            Message::AllowedFast { .. } => Some(MessageId::AllowedFast),
            Message::Extended { .. } => Some(MessageId::Extended),
            Message::Unknown { .. } => None,
        }
    }
}

pub(crate) struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = Error;

    fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> Result<(), Self::Error> {
        use Message::*;
        match msg {
            KeepAlive => {
                buf.put_u32(0);
            }
            Choke | Unchoke | Interested | NotInterested | HaveAll | HaveNone => {
                buf.put_u32(1);
                buf.put_u8(msg.id().expect("message has an id") as u8);
            }
            Have { piece_index } | Suggest { piece_index } | AllowedFast { piece_index } => {
                let id = msg.id().expect("message has an id");
                buf.put_u32(1 + 4);
                buf.put_u8(id as u8);
                buf.put_u32(piece_index as u32);
            }
            Bitfield(bitfield) => {
                debug_assert_eq!(bitfield.len() % 8, 0);
                let bytes = bitfield.as_raw_slice();
                buf.put_u32(1 + bytes.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.extend_from_slice(bytes);
            }
            Request(block) | Cancel(block) | Reject(block) => {
                let id = msg.id().expect("message has an id");
                buf.put_u32(1 + 3 * 4);
                buf.put_u8(id as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
            Block {
                piece_index,
                offset,
                data,
            } => {
                buf.put_u32(1 + 2 * 4 + data.len() as u32);
                buf.put_u8(MessageId::Block as u8);
                buf.put_u32(piece_index as u32);
                buf.put_u32(offset);
                buf.extend_from_slice(&data);
            }
            Port(port) => {
                buf.put_u32(1 + 2);
                buf.put_u8(MessageId::Port as u8);
                buf.put_u16(port);
            }
            Extended { id, payload } => {
                buf.put_u32(1 + 1 + payload.len() as u32);
                buf.put_u8(MessageId::Extended as u8);
                buf.put_u8(id);
                buf.extend_from_slice(&payload);
            }
            Unknown { .. } => {
                // nothing to send for a message we don't understand
            }
        }
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>, Self::Error> {
        if buf.len() < 4 {
            return Ok(None);
        }

        // peek at the length prefix without consuming it, the full frame may
        // not have arrived yet
        let mut prefix = [0; 4];
        prefix.copy_from_slice(&buf[..4]);
        let frame_len = u32::from_be_bytes(prefix);

        if frame_len > MAX_FRAME_LEN {
            return Err(Error::OversizedFrame(frame_len));
        }
        if buf.len() < 4 + frame_len as usize {
            buf.reserve(4 + frame_len as usize - buf.len());
            return Ok(None);
        }

        buf.advance(4);
        if frame_len == 0 {
            return Ok(Some(Message::KeepAlive));
        }

        let mut frame = buf.split_to(frame_len as usize);
        let id = frame.get_u8();

        let msg = match id {
            id if id == MessageId::Choke as u8 => Message::Choke,
            id if id == MessageId::Unchoke as u8 => Message::Unchoke,
            id if id == MessageId::Interested as u8 => Message::Interested,
            id if id == MessageId::NotInterested as u8 => Message::NotInterested,
            id if id == MessageId::Have as u8 => {
                check_payload_len(&frame, 4)?;
                Message::Have {
                    piece_index: frame.get_u32() as PieceIndex,
                }
            }
            id if id == MessageId::Bitfield as u8 => {
                Message::Bitfield(Bitfield::from_vec(frame.to_vec()))
            }
            id if id == MessageId::Request as u8 => {
                Message::Request(decode_block_info(&mut frame)?)
            }
            id if id == MessageId::Block as u8 => {
                check_payload_len(&frame, 8)?;
                Message::Block {
                    piece_index: frame.get_u32() as PieceIndex,
                    offset: frame.get_u32(),
                    data: frame.to_vec(),
                }
            }
            id if id == MessageId::Cancel as u8 => {
                Message::Cancel(decode_block_info(&mut frame)?)
            }
            id if id == MessageId::Port as u8 => {
                check_payload_len(&frame, 2)?;
                Message::Port(frame.get_u16())
            }
            id if id == MessageId::Suggest as u8 => {
                check_payload_len(&frame, 4)?;
                Message::Suggest {
                    piece_index: frame.get_u32() as PieceIndex,
                }
            }
            id if id == MessageId::HaveAll as u8 => Message::HaveAll,
            id if id == MessageId::HaveNone as u8 => Message::HaveNone,
            id if id == MessageId::Reject as u8 => {
                Message::Reject(decode_block_info(&mut frame)?)
            }
            id if id == MessageId::AllowedFast as u8 => {
                check_payload_len(&frame, 4)?;
                Message::AllowedFast {
                    piece_index: frame.get_u32() as PieceIndex,
                }
            }
            id if id == MessageId::Extended as u8 => {
                check_payload_len(&frame, 1)?;
                Message::Extended {
                    id: frame.get_u8(),
                    payload: frame.to_vec(),
                }
            }
            // the rest of the frame is dropped with the `frame` split
            id => Message::Unknown { id },
        };

        Ok(Some(msg))
    }
}

fn check_payload_len(frame: &BytesMut, at_least: usize) -> Result<(), Error> {
    if frame.len() < at_least {
        Err(Error::ProtocolViolation)
    } else {
        Ok(())
    }
}

fn decode_block_info(frame: &mut BytesMut) -> Result<BlockInfo, Error> {
    check_payload_len(frame, 12)?;
    Ok(BlockInfo {
        piece_index: frame.get_u32() as PieceIndex,
        offset: frame.get_u32(),
        len: frame.get_u32(),
    })
}

/// The payload of the extension protocol handshake (extended sub-id 0).
///
/// Only the keys the engine acts on are modeled; everything else in the
/// peer's dictionary is ignored by the deserializer.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct ExtendedHandshake {
    /// The number of outstanding requests the peer is willing to queue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reqq: Option<u32>,
    /// The peer's user agent string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v: Option<String>,
}

impl ExtendedHandshake {
    /// The handshake we advertise to peers.
    pub fn ours() -> Self {
        Self {
            v: Some(format!("tycho {}", env!("CARGO_PKG_VERSION"))),
            reqq: Some(super::MAX_REQUEST_QUEUE_LEN as u32),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn encode_msg(msg: Message) -> BytesMut {
        let mut buf = BytesMut::new();
        PeerCodec.encode(msg, &mut buf).unwrap();
        buf
    }

    fn roundtrip(msg: Message) {
        let mut buf = encode_msg(msg.clone());
        // the length prefix is the length of the body plus the id byte
        let body_len = buf.len() - 4 - 1;
        let mut prefix = [0; 4];
        prefix.copy_from_slice(&buf[..4]);
        assert_eq!(u32::from_be_bytes(prefix) as usize, body_len + 1);

        let decoded = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert!(buf.is_empty());
    }

    fn block(piece_index: PieceIndex, offset: u32, len: u32) -> BlockInfo {
        BlockInfo {
            piece_index,
            offset,
            len,
        }
    }

    #[test]
    fn test_handshake_roundtrip() {
        let handshake = Handshake::new([0xab; 20], *b"-TY0100-abcdefghijkl");
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(handshake, &mut buf).unwrap();
        assert_eq!(buf.len(), 68);

        let decoded = HandshakeCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, handshake);
        assert!(decoded.supports_fast());
        assert!(decoded.supports_extension_protocol());
    }

    #[test]
    fn test_handshake_rejects_other_protocols() {
        let mut buf = BytesMut::new();
        buf.put_u8(12);
        buf.extend_from_slice(b"Not Torrent.");
        assert!(matches!(
            HandshakeCodec.decode(&mut buf),
            Err(Error::HandshakeMismatch)
        ));
    }

    #[test]
    fn test_handshake_waits_for_full_frame() {
        let handshake = Handshake::new([1; 20], [2; 20]);
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(handshake, &mut buf).unwrap();
        let mut partial = buf.split_to(40);
        assert!(HandshakeCodec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn test_keep_alive_framing() {
        let encoded = encode_msg(Message::KeepAlive);
        assert_eq!(&encoded[..], b"\x00\x00\x00\x00");

        let mut buf = BytesMut::from(&b"\x00\x00\x00\x00"[..]);
        assert_eq!(
            PeerCodec.decode(&mut buf).unwrap().unwrap(),
            Message::KeepAlive
        );
    }

    #[test]
    fn test_block_encoding_fixture() {
        let encoded = encode_msg(Message::Block {
            piece_index: 5,
            offset: 20,
            data: b"hello world".to_vec(),
        });
        assert_eq!(
            &encoded[..],
            b"\x00\x00\x00\x14\x07\x00\x00\x00\x05\x00\x00\x00\x14hello world"
        );
    }

    #[test]
    fn test_message_roundtrips() {
        let mut bitfield = Bitfield::repeat(false, 16);
        bitfield.set(0, true);
        bitfield.set(9, true);

        for msg in [
            Message::KeepAlive,
            Message::Choke,
            Message::Unchoke,
            Message::Interested,
            Message::NotInterested,
            Message::Have { piece_index: 42 },
            Message::Bitfield(bitfield),
            Message::Request(block(1, 0x4000, 0x4000)),
            Message::Block {
                piece_index: 1,
                offset: 0x4000,
                data: vec![0xfe; 64],
            },
            Message::Cancel(block(1, 0x4000, 0x4000)),
            Message::Port(6881),
            Message::Suggest { piece_index: 3 },
            Message::HaveAll,
            Message::HaveNone,
            Message::Reject(block(2, 0, 0x4000)),
            Message::AllowedFast { piece_index: 7 },
            Message::Extended {
                id: 0,
                payload: b"d1:v5:tychoe".to_vec(),
            },
        ] {
            if msg == Message::KeepAlive {
                // no id byte, tested separately
                continue;
            }
            roundtrip(msg);
        }
    }

    #[test]
    fn test_unknown_id_is_drained() {
        let mut buf = BytesMut::new();
        buf.put_u32(1 + 3);
        buf.put_u8(0xfd);
        buf.extend_from_slice(b"abc");
        // a second message follows the unknown one
        PeerCodec
            .encode(Message::Interested, &mut buf)
            .unwrap();

        assert_eq!(
            PeerCodec.decode(&mut buf).unwrap().unwrap(),
            Message::Unknown { id: 0xfd }
        );
        assert_eq!(
            PeerCodec.decode(&mut buf).unwrap().unwrap(),
            Message::Interested
        );
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_FRAME_LEN + 1);
        buf.put_u8(MessageId::Block as u8);
        assert!(matches!(
            PeerCodec.decode(&mut buf),
            Err(Error::OversizedFrame(_))
        ));
    }

    #[test]
    fn test_partial_frame_returns_none() {
        let mut full = encode_msg(Message::Block {
            piece_index: 0,
            offset: 0,
            data: vec![1; 100],
        });
        let mut partial = full.split_to(50);
        assert!(PeerCodec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn test_extended_handshake_payload() {
        let payload = serde_bencode::to_bytes(&ExtendedHandshake::ours()).unwrap();
        let decoded: ExtendedHandshake = serde_bencode::from_bytes(&payload).unwrap();
        assert_eq!(decoded.reqq, Some(super::super::MAX_REQUEST_QUEUE_LEN as u32));
        assert!(decoded.v.unwrap().starts_with("tycho"));
    }
}
