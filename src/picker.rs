//! The rarest-first weighted piece picker and the block-request ledger it
//! feeds (spec.md §4.2, §4.3).
//!
//! Pieces carry a weight derived from a compound key (how close to done it
//! already is, declared priority, replication count, then a random salt)
//! with ties broken toward pieces we've already started downloading, so a
//! session favors completing in-progress pieces over spreading its
//! outstanding requests thin. The piece list is kept in one of three
//! states and only re-sorted when moving between them, since a full sort
//! on every block received would be wasteful once a torrent has thousands
//! of pieces.

use std::time::{Duration, Instant};

use rand::Rng;

use crate::{
    atom::AtomId, block_count, block_len, download::PieceDownload, replication::ReplicationMap,
    Bitfield, BlockInfo, PieceIndex,
};

/// A piece entry in the picker, along with its current sort key.
#[derive(Clone, Debug)]
struct WeightedPiece {
    index: PieceIndex,
    total_blocks: u16,
    /// Blocks of this piece we've actually received (removed from the
    /// ledger's pending set by arrival, not by timeout/cancel).
    received_blocks: u16,
    /// Declared file priority, lower sorts first (higher priority wins).
    /// Every piece currently ranks `Normal`: nothing in this engine exposes
    /// a per-file priority knob yet, so the term is carried through the key
    /// rather than dropped, ready for when one exists.
    priority_rank: u8,
    replication: u16,
    /// Assigned once at piece creation so ties between otherwise identical
    /// pieces are broken the same way across peers (spec.md §4.2).
    salt: u16,
}

impl WeightedPiece {
    fn missing_blocks(&self) -> u16 {
        self.total_blocks.saturating_sub(self.received_blocks)
    }

    /// The compound sort key: lower sorts first. Pieces with more pending
    /// requests than blocks actually missing (heavily-duplicated endgame
    /// pieces) are pushed to the back.
    fn sort_key(&self, pending: u16) -> (u32, u8, u16, u16) {
        let missing = self.missing_blocks();
        let term1 = if pending > missing {
            u32::from(self.total_blocks) + u32::from(pending)
        } else {
            u32::from(missing - pending)
        };
        (term1, self.priority_rank, self.replication, self.salt)
    }
}

/// Tracks how far along the piece list is toward being fully sorted by
/// weight, so a `Have` message doesn't force an immediate full re-sort.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SortState {
    /// Newly created or just resized; no ordering guarantee.
    Unsorted,
    /// Sorted by ascending weight (rarest/most-wanted first). This is the
    /// state `pick_block` requires.
    ByWeight,
}

/// Rarest-first piece picker plus the ledger of outstanding block
/// requests across all peers of a torrent.
pub(crate) struct Picker {
    /// One entry per piece we don't have yet; pieces we've completed are
    /// removed from this list entirely.
    pieces: Vec<WeightedPiece>,
    sort_state: SortState,
    /// Pieces with at least one block requested or received.
    downloads: std::collections::HashMap<PieceIndex, PieceDownload>,
    /// Total piece count of the torrent (including pieces already had).
    piece_count: usize,
    /// Entered once outstanding requests, by byte count, reach bytes left
    /// to download (spec.md §4.2).
    endgame: bool,
    /// Set once on endgame entry: outstanding requests divided by active
    /// downloading peers, zeroed on exit. Bounds how eagerly a single
    /// well-performing peer may be handed duplicate requests.
    endgame_factor: usize,
}

/// Below this many outstanding pieces, endgame mode may duplicate
/// requests across peers to avoid one slow peer stalling completion. Kept
/// as a cheap fallback trigger alongside the byte-based condition so a
/// torrent with very few, very large pieces still enters endgame.
const ENDGAME_PIECE_THRESHOLD: usize = 20;

impl Picker {
    pub fn new(piece_count: usize, replication: &ReplicationMap, piece_len: impl Fn(PieceIndex) -> u32) -> Self {
        let mut rng = rand::thread_rng();
        let pieces = (0..piece_count)
            .map(|index| WeightedPiece {
                index,
                total_blocks: block_count(piece_len(index)) as u16,
                received_blocks: 0,
                priority_rank: 0,
                replication: replication.count(index),
                salt: rng.gen(),
            })
            .collect();
        Self {
            pieces,
            sort_state: SortState::Unsorted,
            downloads: std::collections::HashMap::new(),
            piece_count,
            endgame: false,
            endgame_factor: 0,
        }
    }

    /// Removes a piece from the pickable set once we have it (by having
    /// completed the download or because we started as a seed).
    pub fn received_piece(&mut self, index: PieceIndex) {
        self.pieces.retain(|p| p.index != index);
        self.downloads.remove(&index);
    }

    /// Resets a piece's received-block count so it's requested again from
    /// scratch, e.g. after it failed its hash check (spec.md §6
    /// "integrity failure").
    pub fn reset_piece(&mut self, index: PieceIndex) {
        if let Some(p) = self.pieces.iter_mut().find(|p| p.index == index) {
            p.received_blocks = 0;
        }
        self.downloads.remove(&index);
        self.sort_state = SortState::Unsorted;
    }

    /// Updates a piece's replication-derived weight, e.g. on a `Have`.
    pub fn bump_availability(&mut self, index: PieceIndex) {
        if let Some(p) = self.pieces.iter_mut().find(|p| p.index == index) {
            p.replication = p.replication.saturating_add(1);
        }
        self.sort_state = SortState::Unsorted;
    }

    fn ensure_sorted_by_weight(&mut self) {
        if self.sort_state != SortState::ByWeight {
            let downloads = &self.downloads;
            self.pieces.sort_by_key(|p| {
                let pending = downloads.get(&p.index).map(|d| d.distinct_pending_count()).unwrap_or(0) as u16;
                p.sort_key(pending)
            });
            self.sort_state = SortState::ByWeight;
        }
    }

    /// Recomputes whether we're in endgame and, on fresh entry, the
    /// duplicate-request factor (spec.md §4.2). `active_peers` is the
    /// number of peers currently being downloaded from (webseeds are out
    /// of scope, so they never contribute to the divisor).
    pub fn update_endgame(&mut self, active_peers: usize) {
        let outstanding: usize = self.downloads.values().map(|d| d.request_count()).sum();
        let bytes_left: u64 = self
            .pieces
            .iter()
            .map(|p| u64::from(p.missing_blocks()) * u64::from(crate::BLOCK_LEN))
            .sum();
        let by_bytes = (outstanding as u64) * u64::from(crate::BLOCK_LEN) >= bytes_left && bytes_left > 0;
        let by_piece_count = !self.pieces.is_empty() && self.pieces.len() <= ENDGAME_PIECE_THRESHOLD;
        let now_endgame = by_bytes || by_piece_count;

        if now_endgame && !self.endgame {
            self.endgame_factor = outstanding / active_peers.max(1);
        } else if !now_endgame {
            self.endgame_factor = 0;
        }
        self.endgame = now_endgame;
    }

    /// Picks the next block to request from a peer with the given
    /// availability, preferring rarest pieces and, within a piece,
    /// lowest-offset blocks not already requested. In endgame mode, a
    /// block already requested from exactly one other atom may be
    /// duplicated, but only once this peer's own pending count plus
    /// however many more blocks it still wants clears the endgame factor
    /// (spec.md §4.2 "Request selection").
    pub fn pick_block(
        &mut self,
        atom: AtomId,
        candidate_pending: usize,
        remaining_numwant: usize,
        peer_has: &Bitfield,
        piece_len: impl Fn(PieceIndex) -> u32,
        now: Instant,
    ) -> Option<BlockInfo> {
        self.ensure_sorted_by_weight();

        let may_duplicate = self.endgame && candidate_pending + remaining_numwant >= self.endgame_factor;

        for piece in &self.pieces {
            if !peer_has.has_piece(piece.index) {
                continue;
            }
            let len = piece_len(piece.index);
            let total_blocks = block_count(len);
            let download = self.downloads.entry(piece.index).or_insert_with(PieceDownload::new);

            for block_index in 0..total_blocks {
                let offset = block_index as u32 * crate::BLOCK_LEN;
                let info = BlockInfo {
                    piece_index: piece.index,
                    offset,
                    len: block_len(len, block_index),
                };
                if !download.has_pending(&info) {
                    download.add_request(info, atom, now);
                    return Some(info);
                }
                if may_duplicate && download.requester_count(&info) <= 1 && !download.has_pending_from(atom, &info) {
                    download.add_request(info, atom, now);
                    return Some(info);
                }
            }
        }
        None
    }

    /// Records that a block arrived, removing its pending request(s).
    pub fn received_block(&mut self, info: &BlockInfo) {
        if let Some(d) = self.downloads.get_mut(&info.piece_index) {
            d.remove_request(info);
        }
        if let Some(p) = self.pieces.iter_mut().find(|p| p.index == info.piece_index) {
            p.received_blocks = p.received_blocks.saturating_add(1);
        }
        self.sort_state = SortState::Unsorted;
    }

    /// Returns requests older than `timeout`, across all in-progress
    /// pieces, so the caller can cancel and re-issue them (spec.md §4.2
    /// "Timed cancellation", every refill-upkeep tick).
    pub fn collect_timed_out(&mut self, now: Instant, timeout: Duration) -> Vec<crate::download::PendingRequest> {
        let timed_out: Vec<_> = self
            .downloads
            .iter()
            .flat_map(|(piece, d)| d.timed_out(now, timeout).into_iter().map(move |r| (*piece, r)))
            .collect();
        for (piece, req) in &timed_out {
            if let Some(d) = self.downloads.get_mut(piece) {
                d.remove_request_from(req.atom, &req.info);
            }
        }
        if !timed_out.is_empty() {
            self.sort_state = SortState::Unsorted;
        }
        timed_out.into_iter().map(|(_, r)| r).collect()
    }

    pub fn is_endgame(&self) -> bool {
        self.endgame
    }

    pub fn outstanding_piece_count(&self) -> usize {
        self.pieces.len()
    }

    pub fn resize(&mut self, piece_count: usize) {
        self.piece_count = piece_count;
        self.sort_state = SortState::Unsorted;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn atom(n: u32) -> AtomId {
        let mut pool = crate::atom::AtomPool::new();
        let addr: std::net::SocketAddr = format!("127.0.0.1:{}", 2000 + n).parse().unwrap();
        pool.ensure(addr, crate::atom::DiscoverySource::Tracker, Instant::now())
    }

    #[test]
    fn rarest_piece_is_picked_first() {
        let mut replication = ReplicationMap::new(3);
        for _ in 0..3 {
            replication.bump_piece(0);
        }
        replication.bump_piece(1);
        for _ in 0..2 {
            replication.bump_piece(2);
        }
        let mut picker = Picker::new(3, &replication, |_| crate::BLOCK_LEN);
        let peer_has = Bitfield::all(3);
        let now = Instant::now();
        let block = picker
            .pick_block(atom(1), 0, 4, &peer_has, |_| crate::BLOCK_LEN, now)
            .unwrap();
        assert_eq!(block.piece_index, 1);
    }

    #[test]
    fn received_piece_removes_it_from_pool() {
        let replication = ReplicationMap::new(2);
        let mut picker = Picker::new(2, &replication, |_| crate::BLOCK_LEN);
        picker.received_piece(0);
        assert_eq!(picker.outstanding_piece_count(), 1);
    }

    #[test]
    fn collect_timed_out_clears_the_ledger_entry() {
        let replication = ReplicationMap::new(1);
        let mut picker = Picker::new(1, &replication, |_| crate::BLOCK_LEN);
        let peer_has = Bitfield::all(1);
        let t0 = Instant::now();
        let a = atom(1);
        picker.pick_block(a, 0, 1, &peer_has, |_| crate::BLOCK_LEN, t0).unwrap();
        let later = t0 + Duration::from_secs(121);
        let timed_out = picker.collect_timed_out(later, Duration::from_secs(120));
        assert_eq!(timed_out.len(), 1);
        assert_eq!(timed_out[0].atom, a);
        let again = picker.collect_timed_out(later, Duration::from_secs(120));
        assert!(again.is_empty());
    }

    #[test]
    fn endgame_allows_one_duplicate_request() {
        let replication = ReplicationMap::new(1);
        let mut picker = Picker::new(1, &replication, |_| crate::BLOCK_LEN);
        let peer_has = Bitfield::all(1);
        let now = Instant::now();
        let a = atom(1);
        let b = atom(2);
        picker.pick_block(a, 0, 1, &peer_has, |_| crate::BLOCK_LEN, now).unwrap();
        picker.update_endgame(1);
        assert!(picker.is_endgame());
        let dup = picker.pick_block(b, 0, 1, &peer_has, |_| crate::BLOCK_LEN, now);
        assert!(dup.is_some());
    }
}
