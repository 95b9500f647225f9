//! Error types specific to the disk IO actor.

use std::{fmt, io};

pub type Result<T, E = crate::error::Error> = std::result::Result<T, E>;

/// Failure to allocate a new torrent's on-disk layout.
#[derive(Debug)]
pub enum NewTorrentError {
    /// A torrent with this id is already registered with the disk task.
    AlreadyExists,
    Io(io::Error),
}

impl fmt::Display for NewTorrentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyExists => write!(f, "torrent already allocated"),
            Self::Io(e) => write!(f, "torrent allocation io error: {}", e),
        }
    }
}

impl std::error::Error for NewTorrentError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::AlreadyExists => None,
        }
    }
}

impl From<io::Error> for NewTorrentError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Failure while writing or reading a block on behalf of a torrent.
#[derive(Debug)]
pub enum WriteError {
    InvalidPieceIndex,
    Io(io::Error),
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPieceIndex => write!(f, "invalid piece index"),
            Self::Io(e) => write!(f, "disk io error: {}", e),
        }
    }
}

impl std::error::Error for WriteError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::InvalidPieceIndex => None,
        }
    }
}

impl From<io::Error> for WriteError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}
