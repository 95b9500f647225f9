//! The crate-wide error type and result alias.
//!
//! Mirrors the error kinds laid out for the peer engine: protocol
//! violations close a peer without banning it, integrity failures accrue
//! strikes against the peers that contributed to the piece, transport
//! errors close the peer and may flag its atom unreachable, and disk
//! errors propagate up to the torrent.

use std::fmt;
use std::io;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug)]
pub enum Error {
    /// The peer violated the wire protocol (bad length, out of range piece
    /// index, unexpected message for the current state, etc).
    ProtocolViolation(&'static str),
    /// A completed piece failed its SHA-1 checksum.
    IntegrityFailure,
    /// The peer's handshake declared a torrent info hash we don't have.
    InvalidPeerInfoHash,
    /// We expected the peer to be a seed but it isn't.
    PeerNotSeed,
    /// A bitfield message arrived outside of the availability exchange.
    BitfieldNotAfterHandshake,
    /// A piece or block index fell outside of the torrent's bounds.
    InvalidPieceIndex,
    /// An operation referenced a torrent id that isn't registered with the
    /// engine.
    InvalidTorrentId,
    /// The remote address is blocklisted.
    Blocklisted,
    /// The underlying channel to another task has closed.
    ChannelClosed,
    /// Transport-level IO error (EOF, reset, timeout, etc).
    Io(io::Error),
    /// Bencode (de)serialization failure, e.g. while decoding an LTEP
    /// extension payload or the metainfo dictionary.
    Bencode(serde_bencode::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ProtocolViolation(msg) => {
                write!(f, "protocol violation: {}", msg)
            }
            Error::IntegrityFailure => {
                write!(f, "piece failed integrity check")
            }
            Error::InvalidPeerInfoHash => {
                write!(f, "peer handshake info hash mismatch")
            }
            Error::PeerNotSeed => write!(f, "peer is not a seed"),
            Error::BitfieldNotAfterHandshake => {
                write!(f, "bitfield message received outside of availability exchange")
            }
            Error::InvalidPieceIndex => write!(f, "invalid piece index"),
            Error::InvalidTorrentId => write!(f, "invalid torrent id"),
            Error::Blocklisted => write!(f, "address is blocklisted"),
            Error::ChannelClosed => write!(f, "internal channel closed"),
            Error::Io(e) => write!(f, "io error: {}", e),
            Error::Bencode(e) => write!(f, "bencode error: {}", e),
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

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_bencode::Error> for Error {
    fn from(e: serde_bencode::Error) -> Self {
        Error::Bencode(e)
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::ChannelClosed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_does_not_panic() {
        let variants: Vec<Error> = vec![
            Error::ProtocolViolation("bad length"),
            Error::IntegrityFailure,
            Error::InvalidPeerInfoHash,
            Error::PeerNotSeed,
            Error::BitfieldNotAfterHandshake,
            Error::InvalidPieceIndex,
            Error::InvalidTorrentId,
            Error::Blocklisted,
            Error::ChannelClosed,
        ];
        for e in variants {
            assert!(!format!("{}", e).is_empty());
        }
    }
}
