//! Wire framing: the fixed-format handshake codec and the length-prefixed
//! message codec used for everything after it.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{error::Error, Bitfield, BlockInfo, PeerId, Sha1Hash};

use super::ltep::{ExtendedMessage, UT_METADATA, UT_PEX};
use super::message::{Message, MessageId, FAST_EXT_RESERVED_BIT, LTEP_RESERVED_BIT, PROTOCOL_STRING};

const PROTOCOL_STRING_LEN: u8 = 19;
const RESERVED_LEN: usize = 8;
const HANDSHAKE_LEN: usize = 1 + PROTOCOL_STRING_LEN as usize + RESERVED_LEN + 20 + 20;

/// The fixed 68 byte handshake message, the very first thing exchanged on
/// a new connection, before any length-prefixed message is valid.
#[derive(Clone, Debug)]
pub(crate) struct Handshake {
    pub prot: [u8; 19],
    pub reserved: [u8; RESERVED_LEN],
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId, supports_ltep: bool) -> Self {
        let mut prot = [0u8; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
        let mut reserved = [0u8; RESERVED_LEN];
        reserved[7] |= FAST_EXT_RESERVED_BIT;
        if supports_ltep {
            reserved[5] |= LTEP_RESERVED_BIT;
        }
        Self { prot, reserved, info_hash, peer_id }
    }

    pub fn supports_fast_ext(&self) -> bool {
        self.reserved[7] & FAST_EXT_RESERVED_BIT != 0
    }

    pub fn supports_ltep(&self) -> bool {
        self.reserved[5] & LTEP_RESERVED_BIT != 0
    }
}

pub(crate) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(&mut self, handshake: Handshake, buf: &mut BytesMut) -> Result<(), Error> {
        buf.reserve(HANDSHAKE_LEN);
        buf.put_u8(PROTOCOL_STRING_LEN);
        buf.put_slice(&handshake.prot);
        buf.put_slice(&handshake.reserved);
        buf.put_slice(&handshake.info_hash);
        buf.put_slice(&handshake.peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Handshake>, Error> {
        if buf.len() < 1 + PROTOCOL_STRING_LEN as usize {
            return Ok(None);
        }
        if buf[0] != PROTOCOL_STRING_LEN {
            return Err(Error::ProtocolViolation("invalid handshake protocol string length"));
        }
        if buf.len() < HANDSHAKE_LEN {
            return Ok(None);
        }

        buf.advance(1);
        let mut prot = [0u8; 19];
        buf.copy_to_slice(&mut prot);
        if prot != PROTOCOL_STRING.as_bytes() {
            return Err(Error::ProtocolViolation("unrecognized wire protocol"));
        }
        let mut reserved = [0u8; RESERVED_LEN];
        buf.copy_to_slice(&mut reserved);
        let mut info_hash = [0u8; 20];
        buf.copy_to_slice(&mut info_hash);
        let mut peer_id = [0u8; 20];
        buf.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake { prot, reserved, info_hash, peer_id }))
    }
}

/// Frames everything after the handshake: a 4 byte big endian length
/// prefix followed by a 1 byte message id and an id-specific payload.
///
/// Holds the extension ids the *remote* peer asked us to use (its own `m`
/// dictionary from the LTEP handshake), shared with the session so that
/// once the handshake arrives mid-connection, every subsequent `Extended`
/// message this codec encodes is tagged with the id the remote peer
/// actually expects, not the id we happen to use for the same extension
/// locally. The two sides of a split `Framed` each get a clone of the same
/// `Arc`, so an update made while decoding is visible to encoding too.
pub(crate) struct PeerCodec {
    remote_ext_ids: Arc<Mutex<HashMap<String, u8>>>,
}

impl PeerCodec {
    pub fn new() -> Self {
        Self { remote_ext_ids: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// A handle sharing the same remote-extension-id map, to be handed to
    /// the session so it can update it once the LTEP handshake arrives.
    pub fn remote_ext_ids(&self) -> Arc<Mutex<HashMap<String, u8>>> {
        Arc::clone(&self.remote_ext_ids)
    }
}

/// Largest a `Block`/`Request`/`Cancel`/`Reject` payload may legally be:
/// the 8 byte block-info header plus at most one full block of data
/// (spec.md §4.2 edge case, 16,393 bytes).
const MAX_BLOCK_MSG_LEN: u32 = 9 + crate::BLOCK_LEN;

/// Per spec.md §4.1's edge cases, messages whose declared length doesn't
/// match what their id requires are a protocol violation rather than a
/// silent drop, so a misbehaving peer gets disconnected instead of
/// desyncing the frame boundary.
fn validate_len(id: MessageId, len: u32) -> Result<(), Error> {
    let ok = match id {
        MessageId::Choke
        | MessageId::Unchoke
        | MessageId::Interested
        | MessageId::NotInterested
        | MessageId::HaveAll
        | MessageId::HaveNone => len == 1,
        MessageId::Have | MessageId::Suggest | MessageId::AllowedFast => len == 5,
        MessageId::Bitfield => len >= 1,
        MessageId::Request | MessageId::Cancel | MessageId::Reject => len == 13,
        MessageId::Block => (9..=MAX_BLOCK_MSG_LEN).contains(&len),
        MessageId::Extended => len >= 2,
    };
    if ok {
        Ok(())
    } else {
        Err(Error::ProtocolViolation("invalid message length for id"))
    }
}

impl Encoder<Message> for PeerCodec {
    type Error = Error;

    fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> Result<(), Error> {
        match msg {
            Message::KeepAlive => {
                buf.put_u32(0);
            }
            Message::Choke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Choke as u8);
            }
            Message::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Unchoke as u8);
            }
            Message::Interested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Interested as u8);
            }
            Message::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::NotInterested as u8);
            }
            Message::HaveAll => {
                buf.put_u32(1);
                buf.put_u8(MessageId::HaveAll as u8);
            }
            Message::HaveNone => {
                buf.put_u32(1);
                buf.put_u8(MessageId::HaveNone as u8);
            }
            Message::Have { piece_index } => {
                buf.put_u32(5);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece_index as u32);
            }
            Message::Suggest { piece_index } => {
                buf.put_u32(5);
                buf.put_u8(MessageId::Suggest as u8);
                buf.put_u32(piece_index as u32);
            }
            Message::AllowedFast { piece_index } => {
                buf.put_u32(5);
                buf.put_u8(MessageId::AllowedFast as u8);
                buf.put_u32(piece_index as u32);
            }
            Message::Bitfield(bitfield) => {
                let bytes = bitfield_to_wire_bytes(&bitfield);
                buf.put_u32(1 + bytes.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put_slice(&bytes);
            }
            Message::Request(info) => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Request as u8);
                put_block_info(buf, &info);
            }
            Message::Cancel(info) => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Cancel as u8);
                put_block_info(buf, &info);
            }
            Message::Reject(info) => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Reject as u8);
                put_block_info(buf, &info);
            }
            Message::Block { piece_index, offset, data } => {
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(MessageId::Block as u8);
                buf.put_u32(piece_index as u32);
                buf.put_u32(offset);
                buf.put_slice(&data);
            }
            Message::Extended(ext) => {
                // sub-ids other than the handshake's fixed 0 are whatever
                // the *remote* peer told us to use for that extension in
                // its own handshake's `m` dictionary, not whatever id we
                // happen to use locally.
                let remote_ids = self.remote_ext_ids.lock().unwrap();
                let (sub_id, payload) = match ext {
                    ExtendedMessage::Handshake(h) => (0u8, h.to_bytes()?),
                    ExtendedMessage::Metadata(m) => {
                        (remote_ids.get(UT_METADATA).copied().unwrap_or(1), m.to_bytes()?)
                    }
                    ExtendedMessage::Pex(p) => {
                        (remote_ids.get(UT_PEX).copied().unwrap_or(2), p.to_bytes()?)
                    }
                    ExtendedMessage::Unknown { id, payload } => (id, payload),
                };
                drop(remote_ids);
                buf.put_u32(2 + payload.len() as u32);
                buf.put_u8(MessageId::Extended as u8);
                buf.put_u8(sub_id);
                buf.put_slice(&payload);
            }
        }
        Ok(())
    }
}

fn put_block_info(buf: &mut BytesMut, info: &BlockInfo) {
    buf.put_u32(info.piece_index as u32);
    buf.put_u32(info.offset);
    buf.put_u32(info.len);
}

fn bitfield_to_wire_bytes(bitfield: &Bitfield) -> Vec<u8> {
    let piece_count = bitfield.piece_count();
    let byte_len = (piece_count + 7) / 8;
    let mut bytes = vec![0u8; byte_len];
    for index in bitfield.iter_have() {
        bytes[index / 8] |= 0b1000_0000 >> (index % 8);
    }
    bytes
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>, Error> {
        if buf.len() < 4 {
            return Ok(None);
        }
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&buf[..4]);
        let len = u32::from_be_bytes(len_bytes) as usize;

        if len == 0 {
            buf.advance(4);
            return Ok(Some(Message::KeepAlive));
        }

        if buf.len() < 4 + len {
            buf.reserve(4 + len - buf.len());
            return Ok(None);
        }

        buf.advance(4);
        let id_byte = buf[0];
        let id = MessageId::from_u8(id_byte)
            .ok_or(Error::ProtocolViolation("unknown message id"))?;
        validate_len(id, len as u32)?;
        buf.advance(1);
        let payload_len = len - 1;
        let payload = buf.split_to(payload_len);

        let msg = match id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::HaveAll => Message::HaveAll,
            MessageId::HaveNone => Message::HaveNone,
            MessageId::Have => Message::Have { piece_index: read_u32(&payload, 0) as usize },
            MessageId::Suggest => Message::Suggest { piece_index: read_u32(&payload, 0) as usize },
            MessageId::AllowedFast => {
                Message::AllowedFast { piece_index: read_u32(&payload, 0) as usize }
            }
            MessageId::Bitfield => {
                // the logical piece count isn't known at the codec layer;
                // the caller resizes this once it is
                Message::Bitfield(Bitfield::from_wire_bytes(&payload, payload.len() * 8))
            }
            MessageId::Request => Message::Request(read_block_info(&payload, 0)),
            MessageId::Cancel => Message::Cancel(read_block_info(&payload, 0)),
            MessageId::Reject => Message::Reject(read_block_info(&payload, 0)),
            MessageId::Block => {
                let piece_index = read_u32(&payload, 0) as usize;
                let offset = read_u32(&payload, 4);
                let data = payload[8..].to_vec();
                Message::Block { piece_index, offset, data }
            }
            MessageId::Extended => {
                let sub_id = payload[0];
                let ext_payload = payload[1..].to_vec();
                let ext = match sub_id {
                    0 => ExtendedMessage::Handshake(
                        super::ltep::ExtendedHandshake::from_bytes(&ext_payload)?,
                    ),
                    1 => ExtendedMessage::Metadata(
                        super::ltep::MetadataMessage::from_bytes(&ext_payload)?,
                    ),
                    2 => ExtendedMessage::Pex(super::ltep::PexMessage::from_bytes(&ext_payload)?),
                    id => ExtendedMessage::Unknown { id, payload: ext_payload },
                };
                Message::Extended(ext)
            }
        };

        Ok(Some(msg))
    }
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

fn read_block_info(buf: &[u8], offset: usize) -> BlockInfo {
    BlockInfo {
        piece_index: read_u32(buf, offset) as usize,
        offset: read_u32(buf, offset + 4),
        len: read_u32(buf, offset + 8),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_round_trips() {
        let mut codec = HandshakeCodec;
        let mut buf = BytesMut::new();
        let handshake = Handshake::new([1; 20], [2; 20], true);
        codec.encode(handshake.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.info_hash, handshake.info_hash);
        assert_eq!(decoded.peer_id, handshake.peer_id);
        assert!(decoded.supports_fast_ext());
        assert!(decoded.supports_ltep());
    }

    #[test]
    fn keepalive_round_trips() {
        let mut codec = PeerCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Message::KeepAlive, &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(decoded, Message::KeepAlive));
    }

    #[test]
    fn request_round_trips() {
        let mut codec = PeerCodec::new();
        let mut buf = BytesMut::new();
        let info = BlockInfo { piece_index: 3, offset: 16384, len: 16384 };
        codec.encode(Message::Request(info), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        match decoded {
            Message::Request(got) => assert_eq!(got, info),
            _ => panic!("expected Request"),
        }
    }

    #[test]
    fn invalid_length_for_id_is_rejected() {
        let mut codec = PeerCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32(2); // Choke should be length 1
        buf.put_u8(MessageId::Choke as u8);
        buf.put_u8(0);
        assert!(codec.decode(&mut buf).is_err());
    }
}
