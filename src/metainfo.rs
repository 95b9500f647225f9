//! Parses a torrent's bencoded metainfo (`.torrent` file) into the shape
//! the rest of the engine works with: piece hashes split out, file layout
//! normalized into [`FsStructure`], and the info hash derived once up
//! front rather than recomputed on demand.

use std::path::PathBuf;

use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};

use crate::{
    error::{Error, Result},
    storage_info::{FileInfo, FsStructure},
    Sha1Hash,
};

/// The length of a single SHA-1 piece hash, as packed in the `pieces`
/// string of the info dictionary.
const PIECE_HASH_LEN: usize = 20;

/// A parsed `.torrent` file.
#[derive(Debug, Clone)]
pub struct Metainfo {
    /// The torrent's name, used as the download directory name for
    /// multi-file torrents and the file name for single-file torrents.
    pub name: String,
    /// The tracker this torrent was published with, if any (BEP 3
    /// `announce`).
    pub announce: Option<String>,
    /// Additional tracker tiers (BEP 12 `announce-list`); each inner `Vec`
    /// is a tier, tried in order, with trackers within a tier shuffled.
    pub announce_list: Vec<Vec<String>>,
    /// If set, clients must not implement or use DHT, PEX, or LPD for this
    /// torrent (BEP 27).
    pub private: bool,
    /// The nominal piece length; only the last piece may be shorter.
    pub piece_len: u32,
    /// The concatenated SHA-1 hashes of every piece, `PIECE_HASH_LEN`
    /// bytes each.
    piece_hashes: Vec<u8>,
    /// The files this torrent contains and where they sit in the flat
    /// torrent byte space.
    pub structure: FsStructure,
    /// The SHA-1 hash of the bencoded info dictionary, computed once at
    /// parse time.
    pub info_hash: Sha1Hash,
    /// The exact bencoded bytes of the info dictionary, kept around so a
    /// running torrent can serve BEP 9 metadata requests with bytes that
    /// hash to `info_hash` rather than re-encoding (and possibly
    /// reordering) the dictionary on demand.
    raw_info_bytes: Vec<u8>,
}

impl Metainfo {
    /// Parses a `.torrent` file's raw bytes.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let raw: RawMetainfo = serde_bencode::from_bytes(buf)?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawMetainfo) -> Result<Self> {
        let raw_info_bytes = serde_bencode::to_bytes(&raw.info)?;
        let info_hash = {
            let digest = Sha1::digest(&raw_info_bytes);
            let mut hash = [0u8; 20];
            hash.copy_from_slice(&digest);
            hash
        };

        let pieces = raw.info.pieces.into_vec();
        if pieces.len() % PIECE_HASH_LEN != 0 {
            return Err(Error::ProtocolViolation("metainfo pieces field isn't a multiple of 20 bytes"));
        }

        let structure = match raw.info.files {
            Some(files) => {
                let mut torrent_offset = 0;
                let files = files
                    .into_iter()
                    .map(|f| {
                        let len = f.length.max(0) as u64;
                        let info = FileInfo {
                            path: f.path.iter().collect(),
                            len,
                            torrent_offset,
                        };
                        torrent_offset += len;
                        info
                    })
                    .collect();
                FsStructure::Archive { files }
            }
            None => {
                let len = raw
                    .info
                    .length
                    .ok_or_else(|| Error::ProtocolViolation("metainfo has neither length nor files"))?;
                FsStructure::File(FileInfo {
                    path: PathBuf::from(&raw.info.name),
                    len,
                    torrent_offset: 0,
                })
            }
        };

        let announce_list = raw
            .announce_list
            .unwrap_or_default()
            .into_iter()
            .map(|tier| tier.into_iter().collect())
            .collect();

        Ok(Self {
            name: raw.info.name,
            announce: raw.announce,
            announce_list,
            private: raw.info.private.unwrap_or(0) != 0,
            piece_len: raw.info.piece_length as u32,
            piece_hashes: pieces,
            structure,
            info_hash,
            raw_info_bytes,
        })
    }

    /// The exact bencoded info dictionary bytes, sliced into BEP 9's fixed
    /// 16KiB metadata pieces.
    pub fn metadata_piece(&self, index: u32) -> Option<&[u8]> {
        let start = index as usize * crate::peer::METADATA_PIECE_LEN as usize;
        if start >= self.raw_info_bytes.len() {
            return None;
        }
        let end = (start + crate::peer::METADATA_PIECE_LEN as usize).min(self.raw_info_bytes.len());
        Some(&self.raw_info_bytes[start..end])
    }

    pub fn metadata_size(&self) -> u32 {
        self.raw_info_bytes.len() as u32
    }

    /// The number of pieces in the torrent, derived from the length of the
    /// concatenated piece hash string.
    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len() / PIECE_HASH_LEN
    }

    /// Returns the expected SHA-1 hash of the piece at `index`.
    pub fn piece_hash(&self, index: crate::PieceIndex) -> Option<&[u8]> {
        let start = index * PIECE_HASH_LEN;
        self.piece_hashes.get(start..start + PIECE_HASH_LEN)
    }

    /// The raw, concatenated piece hash bytes, as the disk task wants them
    /// for piece verification.
    pub fn piece_hashes_bytes(&self) -> &[u8] {
        &self.piece_hashes
    }
}

#[derive(Debug, Deserialize)]
struct RawMetainfo {
    info: RawInfo,
    announce: Option<String>,
    #[serde(rename = "announce-list")]
    announce_list: Option<Vec<Vec<String>>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RawInfo {
    name: String,
    #[serde(with = "serde_bytes")]
    pieces: ByteBuf,
    #[serde(rename = "piece length")]
    piece_length: u64,
    length: Option<u64>,
    files: Option<Vec<RawFile>>,
    private: Option<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RawFile {
    path: Vec<String>,
    length: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bencode_single_file_torrent() -> Vec<u8> {
        let raw = RawMetainfo {
            info: RawInfo {
                name: "foo.txt".to_string(),
                pieces: ByteBuf::from(vec![7u8; PIECE_HASH_LEN * 2]),
                piece_length: 16384,
                length: Some(20000),
                files: None,
                private: None,
            },
            announce: Some("https://tracker.example/announce".to_string()),
            announce_list: Some(vec![vec!["https://tracker.example/announce".to_string()]]),
        };
        serde_bencode::to_bytes(&raw).unwrap()
    }

    #[test]
    fn parses_single_file_torrent() {
        let bytes = bencode_single_file_torrent();
        let metainfo = Metainfo::from_bytes(&bytes).unwrap();
        assert_eq!(metainfo.name, "foo.txt");
        assert_eq!(metainfo.piece_count(), 2);
        assert!(!metainfo.structure.is_archive());
        assert!(!metainfo.private);
        assert_eq!(metainfo.announce_list.len(), 1);
    }

    #[test]
    fn rejects_malformed_piece_hashes() {
        let mut raw = RawMetainfo {
            info: RawInfo {
                name: "foo.txt".to_string(),
                pieces: ByteBuf::from(vec![7u8; PIECE_HASH_LEN + 1]),
                piece_length: 16384,
                length: Some(20000),
                files: None,
                private: None,
            },
            announce: None,
            announce_list: None,
        };
        raw.info.pieces = ByteBuf::from(vec![1u8; 19]);
        let bytes = serde_bencode::to_bytes(&raw).unwrap();
        assert!(Metainfo::from_bytes(&bytes).is_err());
    }
}
