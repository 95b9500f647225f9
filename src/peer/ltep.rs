//! The libtorrent extension protocol envelope (BEP 10) and the extensions
//! built on top of it that this engine speaks: metadata exchange (BEP 9)
//! and peer exchange (BEP 11).

use std::{
    collections::HashMap,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
};

use serde_bytes::ByteBuf;

use crate::error::{Error, Result};

/// The extension-local message ids we advertise for our own messages, sent
/// in the `m` dictionary of the handshake. `ut_metadata` and `ut_pex` are
/// the de facto standard names other clients also use, which is what lets
/// two independently written implementations agree on them.
pub(crate) const UT_METADATA: &str = "ut_metadata";
pub(crate) const UT_PEX: &str = "ut_pex";

/// The BEP 10 extension handshake payload, sent as the first `Extended`
/// message (with sub-id 0) right after the regular handshake completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ExtendedHandshake {
    /// Maps extension name to the local id this peer wants to see it
    /// tagged with in subsequent `Extended` messages.
    pub m: HashMap<String, u8>,
    /// The size, in bytes, of the torrent's metadata info dictionary, if
    /// known (BEP 9). Omitted for private torrents and for torrents whose
    /// metadata isn't fully known yet.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata_size: Option<u32>,
    /// The dotted-quad/port our peer sees us connecting from, letting us
    /// learn our own external IP.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub yourip: Option<ByteBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub v: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reqq: Option<u32>,
    /// Whether we support the encrypted stream transport (MSE/PE). Always
    /// unset: encryption stays a non-goal, so we never claim support.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub e: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<ByteBuf>,
    /// Our listening port, so a peer that only knows us from an incoming
    /// connection can still recommend us to others via PEX.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p: Option<u16>,
    /// Set once we've finished downloading and have nothing left to
    /// request, so a peer doesn't bother unchoking us for pieces we'll
    /// never ask for.
    #[serde(rename = "upload_only", skip_serializing_if = "Option::is_none")]
    pub upload_only: Option<u8>,
}

impl ExtendedHandshake {
    pub fn new(client_version: String) -> Self {
        Self::with_metadata_size(client_version, None, false, None)
    }

    /// Builds a handshake advertising `metadata_size` (if known and the
    /// torrent isn't private, per BEP 9), our listening `port` (for PEX),
    /// and whether we're currently upload-only (finished downloading).
    pub fn with_metadata_size(
        client_version: String,
        metadata_size: Option<u32>,
        upload_only: bool,
        port: Option<u16>,
    ) -> Self {
        let mut m = HashMap::new();
        m.insert(UT_METADATA.to_string(), 1);
        m.insert(UT_PEX.to_string(), 2);
        Self {
            m,
            metadata_size,
            yourip: None,
            v: Some(client_version),
            reqq: Some(250),
            e: None,
            ipv6: None,
            p: port,
            upload_only: if upload_only { Some(1) } else { None },
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_bencode::to_bytes(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_bencode::from_bytes(bytes)?)
    }
}

/// BEP 9 metadata piece exchange message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MetadataMsgKind {
    Request,
    Data,
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MetadataMsgHeader {
    msg_type: u8,
    piece: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    total_size: Option<u32>,
}

/// A fully decoded BEP 9 message: the bencoded header plus, for `Data`
/// messages, the raw metadata piece bytes that follow it in the same
/// extended-message payload.
#[derive(Debug, Clone)]
pub(crate) struct MetadataMessage {
    pub kind: MetadataMsgKind,
    pub piece: u32,
    pub total_size: Option<u32>,
    pub data: Option<Vec<u8>>,
}

/// The fixed size of a metadata piece, other than possibly the last one
/// (BEP 9).
pub(crate) const METADATA_PIECE_LEN: u32 = 0x4000;

impl MetadataMessage {
    pub fn request(piece: u32) -> Self {
        Self { kind: MetadataMsgKind::Request, piece, total_size: None, data: None }
    }

    pub fn data(piece: u32, total_size: u32, data: Vec<u8>) -> Self {
        Self { kind: MetadataMsgKind::Data, piece, total_size: Some(total_size), data: Some(data) }
    }

    pub fn reject(piece: u32) -> Self {
        Self { kind: MetadataMsgKind::Reject, piece, total_size: None, data: None }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let header = MetadataMsgHeader {
            msg_type: match self.kind {
                MetadataMsgKind::Request => 0,
                MetadataMsgKind::Data => 1,
                MetadataMsgKind::Reject => 2,
            },
            piece: self.piece,
            total_size: self.total_size,
        };
        let mut bytes = serde_bencode::to_bytes(&header)?;
        if let Some(data) = &self.data {
            bytes.extend_from_slice(data);
        }
        Ok(bytes)
    }

    /// Parses a BEP 9 message. Since the bencoded header has no explicit
    /// terminator other than its own dictionary closing brace, we decode
    /// only as much as `serde_bencode` consumes and treat the remainder as
    /// the trailing raw data, if any.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        // serde_bencode doesn't report how many bytes of the input it
        // consumed, so find the header's closing brace ourselves: walking
        // a bencoded dict byte by byte is the simplest way to find where
        // it ends without a second crate.
        let header_end = bencoded_dict_len(bytes)
            .ok_or_else(|| Error::ProtocolViolation("malformed metadata message"))?;
        let header: MetadataMsgHeader = serde_bencode::from_bytes(&bytes[..header_end])?;
        let kind = match header.msg_type {
            0 => MetadataMsgKind::Request,
            1 => MetadataMsgKind::Data,
            2 => MetadataMsgKind::Reject,
            _ => return Err(Error::ProtocolViolation("unknown metadata message type")),
        };
        let data = if kind == MetadataMsgKind::Data {
            Some(bytes[header_end..].to_vec())
        } else {
            None
        };
        Ok(Self { kind, piece: header.piece, total_size: header.total_size, data })
    }
}

/// Returns the byte length of the bencoded dictionary starting at the
/// front of `bytes`, by tracking nesting depth of `d`/`l`/`e` markers.
fn bencoded_dict_len(bytes: &[u8]) -> Option<usize> {
    let mut depth = 0i32;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'd' | b'l' => {
                depth += 1;
                i += 1;
            }
            b'i' => {
                i += 1;
                while i < bytes.len() && bytes[i] != b'e' {
                    i += 1;
                }
                i += 1;
            }
            b'e' => {
                depth -= 1;
                i += 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            b'0'..=b'9' => {
                let start = i;
                while i < bytes.len() && bytes[i] != b':' {
                    i += 1;
                }
                let len: usize = std::str::from_utf8(&bytes[start..i]).ok()?.parse().ok()?;
                i += 1 + len;
            }
            _ => return None,
        }
    }
    None
}

/// One entry of a BEP 11 peer list, decoded from the compact form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PexPeer {
    pub addr: SocketAddr,
}

/// A BEP 11 gossip message: peers added and dropped since the last
/// exchange with this peer.
#[derive(Debug, Clone, Default)]
pub(crate) struct PexMessage {
    pub added: Vec<PexPeer>,
    pub dropped: Vec<PexPeer>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PexWireMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    added: Option<ByteBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[serde(rename = "added.f")]
    added_f: Option<ByteBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    dropped: Option<ByteBuf>,
}

impl PexMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let wire = PexWireMessage {
            added: Some(ByteBuf::from(encode_compact_peers(&self.added))),
            added_f: Some(ByteBuf::from(vec![0u8; self.added.len()])),
            dropped: Some(ByteBuf::from(encode_compact_peers(&self.dropped))),
        };
        Ok(serde_bencode::to_bytes(&wire)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let wire: PexWireMessage = serde_bencode::from_bytes(bytes)?;
        Ok(Self {
            added: wire.added.map(|b| decode_compact_peers(&b)).unwrap_or_default(),
            dropped: wire.dropped.map(|b| decode_compact_peers(&b)).unwrap_or_default(),
        })
    }
}

fn encode_compact_peers(peers: &[PexPeer]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(peers.len() * 6);
    for peer in peers {
        if let SocketAddr::V4(addr) = peer.addr {
            bytes.extend_from_slice(&addr.ip().octets());
            bytes.extend_from_slice(&addr.port().to_be_bytes());
        }
    }
    bytes
}

fn decode_compact_peers(bytes: &[u8]) -> Vec<PexPeer> {
    bytes
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            PexPeer { addr: SocketAddr::V4(SocketAddrV4::new(ip, port)) }
        })
        .collect()
}

/// A decoded `Extended` message (BEP 10 sub-id 0 is always the handshake;
/// other sub-ids are dispatched by the id the two peers agreed on in
/// their handshakes).
#[derive(Debug)]
pub(crate) enum ExtendedMessage {
    Handshake(ExtendedHandshake),
    Metadata(MetadataMessage),
    Pex(PexMessage),
    /// An extension we don't recognize; kept around rather than dropped
    /// so logging can report what the peer sent.
    Unknown { id: u8, payload: Vec<u8> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_request_round_trips() {
        let msg = MetadataMessage::request(3);
        let bytes = msg.to_bytes().unwrap();
        let decoded = MetadataMessage::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.kind, MetadataMsgKind::Request);
        assert_eq!(decoded.piece, 3);
    }

    #[test]
    fn metadata_data_keeps_trailing_bytes() {
        let payload = vec![1, 2, 3, 4];
        let msg = MetadataMessage::data(0, 4, payload.clone());
        let bytes = msg.to_bytes().unwrap();
        let decoded = MetadataMessage::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.data, Some(payload));
    }

    #[test]
    fn pex_compact_peers_round_trip() {
        let peer = PexPeer { addr: "127.0.0.1:6881".parse().unwrap() };
        let msg = PexMessage { added: vec![peer], dropped: Vec::new() };
        let bytes = msg.to_bytes().unwrap();
        let decoded = PexMessage::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.added, vec![peer]);
    }
}
