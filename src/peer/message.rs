//! The peer wire protocol's message set: the baseline BitTorrent messages
//! plus the Fast Extension (BEP 6) and the LTEP envelope (BEP 10) that
//! carries extended messages such as metadata exchange (BEP 9) and PEX
//! (BEP 11).

use crate::{Bitfield, BlockInfo, PieceIndex};

use super::ltep::ExtendedMessage;

/// The protocol string sent in the handshake, identifying this as the
/// BitTorrent wire protocol.
pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// The reserved byte bit for the Fast Extension (BEP 6), in the last byte
/// of the handshake's 8 reserved bytes.
pub(crate) const FAST_EXT_RESERVED_BIT: u8 = 0b0000_0100;
/// The reserved byte bit for LTEP (BEP 10), in the 6th reserved byte.
pub(crate) const LTEP_RESERVED_BIT: u8 = 0b0001_0000;

/// Message type ids as they appear on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
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
    // Fast Extension, BEP 6
    HaveAll = 0x0e,
    HaveNone = 0x0f,
    Suggest = 0x0d,
    AllowedFast = 0x11,
    Reject = 0x10,
    // BEP 10
    Extended = 20,
}

impl MessageId {
    pub fn from_u8(id: u8) -> Option<Self> {
        Some(match id {
            0 => Self::Choke,
            1 => Self::Unchoke,
            2 => Self::Interested,
            3 => Self::NotInterested,
            4 => Self::Have,
            5 => Self::Bitfield,
            6 => Self::Request,
            7 => Self::Block,
            8 => Self::Cancel,
            0x0d => Self::Suggest,
            0x0e => Self::HaveAll,
            0x0f => Self::HaveNone,
            0x10 => Self::Reject,
            0x11 => Self::AllowedFast,
            20 => Self::Extended,
            _ => return None,
        })
    }
}

/// A parsed peer wire message.
#[derive(Debug)]
pub(crate) enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: PieceIndex },
    Bitfield(Bitfield),
    Request(BlockInfo),
    Block { piece_index: PieceIndex, offset: u32, data: Vec<u8> },
    Cancel(BlockInfo),
    /// BEP 6: peer has every piece; sent instead of a dense `Bitfield`.
    HaveAll,
    /// BEP 6: peer has no pieces.
    HaveNone,
    /// BEP 6: peer suggests we request this piece, without implying
    /// they'll unchoke us for it.
    Suggest { piece_index: PieceIndex },
    /// BEP 6: this piece may be requested even while choked.
    AllowedFast { piece_index: PieceIndex },
    /// BEP 6: rejects a request we made, in lieu of silently ignoring it.
    Reject(BlockInfo),
    /// BEP 10 envelope, carrying a sub-protocol message.
    Extended(ExtendedMessage),
}

impl Message {
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
            Message::HaveAll => Some(MessageId::HaveAll),
            Message::HaveNone => Some(MessageId::HaveNone),
            Message::Suggest { .. } => Some(MessageId::Suggest),
            Message::AllowedFast { .. } => Some(MessageId::AllowedFast),
            Message::Reject(_) => Some(MessageId::Reject),
            Message::Extended(_) => Some(MessageId::Extended),
        }
    }
}
