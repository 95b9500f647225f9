//! A piece-availability bitfield with compact representations for the two
//! states the Fast Extension lets a peer announce without listing every
//! piece: "has all" and "has none" (BEP 6 `HaveAll`/`HaveNone`).
//!
//! Keeping these as dedicated states rather than eagerly allocating
//! a `piece_count`-bit vector matters at scale (many peers, each tracking
//! a potentially large piece count) and makes the replication-map
//! bump/drop path an O(1) operation for seeds instead of O(pieces).

use bitvec::prelude::{BitVec, Msb0};

/// The underlying dense representation: most significant bit first, i.e.
/// the first highest bit represents the first piece.
pub type BitSet = BitVec<Msb0, u8>;

/// Piece availability of a peer (or of us).
#[derive(Clone, Debug)]
pub enum Bitfield {
    /// The peer has every piece (BEP 6 `HaveAll`, or a dense bitfield that
    /// turned out to have every bit set).
    All { piece_count: usize },
    /// The peer has no pieces (BEP 6 `HaveNone`, or before any bitfield
    /// has been received).
    None { piece_count: usize },
    /// An explicit per-piece set, used once availability stops being
    /// uniform.
    Sparse(BitSet),
}

impl Bitfield {
    /// Creates a bitfield in the `None` state for a torrent with the given
    /// piece count.
    pub fn none(piece_count: usize) -> Self {
        Bitfield::None { piece_count }
    }

    /// Creates a bitfield in the `All` state for a torrent with the given
    /// piece count.
    pub fn all(piece_count: usize) -> Self {
        Bitfield::All { piece_count }
    }

    /// Builds a sparse bitfield from the raw wire bytes, expanding to the
    /// `All` state if the resulting set has every bit set (mirrors the
    /// historical behavior of collapsing an all-set dense bitfield into
    /// the compact representation).
    pub fn from_wire_bytes(bytes: &[u8], piece_count: usize) -> Self {
        let mut bits: BitSet = BitVec::from_vec(bytes.to_vec());
        bits.truncate(piece_count);
        if bits.all() {
            Bitfield::All { piece_count }
        } else if !bits.any() {
            Bitfield::None { piece_count }
        } else {
            Bitfield::Sparse(bits)
        }
    }

    pub fn piece_count(&self) -> usize {
        match self {
            Bitfield::All { piece_count } => *piece_count,
            Bitfield::None { piece_count } => *piece_count,
            Bitfield::Sparse(bits) => bits.len(),
        }
    }

    /// Returns whether the piece at `index` is set. Out of range indices
    /// (possible while metadata is unknown, per spec §4.1 edge cases) are
    /// reported as missing rather than panicking.
    pub fn has_piece(&self, index: usize) -> bool {
        match self {
            Bitfield::All { piece_count } => index < *piece_count,
            Bitfield::None { .. } => false,
            Bitfield::Sparse(bits) => bits.get(index).map(|b| *b).unwrap_or(false),
        }
    }

    /// Sets the piece at `index`, promoting `None` to `Sparse` as needed
    /// and collapsing back to `All` once every piece is set. Duplicate
    /// `Have` messages are idempotent no-ops.
    pub fn set_piece(&mut self, index: usize) {
        match self {
            Bitfield::All { .. } => {}
            Bitfield::None { piece_count } => {
                let piece_count = *piece_count;
                let mut bits = BitSet::repeat(false, piece_count);
                if let Some(mut b) = bits.get_mut(index) {
                    *b = true;
                }
                *self = Bitfield::Sparse(bits);
            }
            Bitfield::Sparse(bits) => {
                if let Some(mut b) = bits.get_mut(index) {
                    *b = true;
                }
                if bits.all() {
                    *self = Bitfield::All {
                        piece_count: bits.len(),
                    };
                }
            }
        }
    }

    /// Returns true if every piece is set.
    pub fn is_seed(&self) -> bool {
        matches!(self, Bitfield::All { .. })
    }

    /// Returns true if no piece is set.
    pub fn is_empty_set(&self) -> bool {
        match self {
            Bitfield::None { .. } => true,
            Bitfield::Sparse(bits) => !bits.any(),
            Bitfield::All { piece_count } => *piece_count == 0,
        }
    }

    /// Iterates the indices of pieces the peer has. For `All` this yields
    /// every index in order; callers that only need membership tests
    /// should prefer [`Bitfield::has_piece`] to avoid the O(pieces) walk.
    pub fn iter_have(&self) -> Box<dyn Iterator<Item = usize> + '_> {
        match self {
            Bitfield::All { piece_count } => Box::new(0..*piece_count),
            Bitfield::None { .. } => Box::new(std::iter::empty()),
            Bitfield::Sparse(bits) => {
                Box::new(bits.iter().enumerate().filter_map(|(i, b)| if *b { Some(i) } else { None }))
            }
        }
    }

    /// Resizes the logical piece count, e.g. once torrent metadata (and
    /// thus the real piece count) becomes known. Out-of-range bits set
    /// while metadata was unknown are simply dropped by truncation; the
    /// caller is expected to have already disconnected peers whose prior
    /// `Have`s referenced now-invalid indices (see spec §4.1 boundary
    /// behaviours).
    pub fn resize(&mut self, piece_count: usize) {
        match self {
            Bitfield::All { piece_count: p } => *p = piece_count,
            Bitfield::None { piece_count: p } => *p = piece_count,
            Bitfield::Sparse(bits) => {
                bits.resize(piece_count, false);
                if bits.all() {
                    *self = Bitfield::All { piece_count };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn have_all_then_bitfield_wins() {
        let mut bf = Bitfield::all(4);
        // a subsequent Bitfield should replace the All state wholesale
        bf = Bitfield::from_wire_bytes(&[0b1010_0000], 4);
        assert!(bf.has_piece(0));
        assert!(!bf.has_piece(1));
        assert!(bf.has_piece(2));
        assert!(!bf.has_piece(3));
    }

    #[test]
    fn set_piece_is_idempotent() {
        let mut bf = Bitfield::none(4);
        bf.set_piece(1);
        bf.set_piece(1);
        assert!(bf.has_piece(1));
        assert_eq!(bf.iter_have().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn collapses_to_all_when_fully_set() {
        let mut bf = Bitfield::none(2);
        bf.set_piece(0);
        bf.set_piece(1);
        assert!(bf.is_seed());
    }

    #[test]
    fn out_of_range_has_piece_is_false_not_panic() {
        let bf = Bitfield::none(4);
        assert!(!bf.has_piece(100));
        let bf = Bitfield::all(4);
        assert!(!bf.has_piece(100));
    }
}
