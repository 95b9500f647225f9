//! Tracks the blocks requested for a single in-progress piece, across
//! possibly more than one peer (endgame mode requests the same block from
//! several peers at once).

use std::time::Instant;

use crate::{atom::AtomId, BlockInfo};

/// One outstanding block request: what was asked for, from which atom, and
/// when, so the request ledger can time it out (spec.md §4.2, 120s) and so
/// endgame mode can tell a fresh request from a stale duplicate.
#[derive(Clone, Copy, Debug)]
pub(crate) struct PendingRequest {
    pub info: BlockInfo,
    pub atom: AtomId,
    pub sent_at: Instant,
}

/// The state of a piece that has at least one block requested or received,
/// but is not yet complete. One of these lives in a torrent's request
/// ledger per piece currently being downloaded.
#[derive(Debug, Default)]
pub(crate) struct PieceDownload {
    /// Requests sent out for blocks of this piece that haven't been
    /// answered yet. Endgame mode may have more than one entry for the same
    /// offset, each tagged with the atom it was sent to, so a timed-out
    /// request can be cancelled from the one peer that's actually sitting
    /// on it without disturbing the others.
    pending: Vec<PendingRequest>,
}

impl PieceDownload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that a request for `info` has been sent to `atom`.
    pub fn add_request(&mut self, info: BlockInfo, atom: AtomId, now: Instant) {
        self.pending.push(PendingRequest { info, atom, sent_at: now });
    }

    /// Removes every pending request for the given block, regardless of
    /// which atom it was sent to, e.g. once the block arrives.
    pub fn remove_request(&mut self, info: &BlockInfo) {
        self.pending.retain(|r| &r.info != info);
    }

    /// Removes the single pending request for `info` that was sent to
    /// `atom`, leaving any other atom's request for the same block (during
    /// endgame) untouched.
    pub fn remove_request_from(&mut self, atom: AtomId, info: &BlockInfo) {
        self.pending.retain(|r| !(r.atom == atom && &r.info == info));
    }

    /// Returns the requests older than `timeout`, without removing them;
    /// the caller decides whether to cancel and re-request.
    pub fn timed_out(&self, now: Instant, timeout: std::time::Duration) -> Vec<PendingRequest> {
        self.pending
            .iter()
            .filter(|r| now.saturating_duration_since(r.sent_at) >= timeout)
            .copied()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn request_count(&self) -> usize {
        self.pending.len()
    }

    /// Returns whether this exact block already has an outstanding
    /// request, from any atom.
    pub fn has_pending(&self, info: &BlockInfo) -> bool {
        self.pending.iter().any(|r| &r.info == info)
    }

    /// Returns how many atoms currently hold an outstanding request for
    /// this exact block, used by endgame mode's "at most one existing
    /// requester" duplicate-request rule.
    pub fn requester_count(&self, info: &BlockInfo) -> usize {
        self.pending.iter().filter(|r| &r.info == info).count()
    }

    /// Whether `atom` specifically already has a pending request for this
    /// block, so endgame mode doesn't hand the same atom the same block
    /// twice.
    pub fn has_pending_from(&self, atom: AtomId, info: &BlockInfo) -> bool {
        self.pending.iter().any(|r| r.atom == atom && &r.info == info)
    }

    /// Count of distinct block offsets with at least one pending request,
    /// as opposed to [`Self::request_count`] which counts every pending
    /// request including endgame duplicates. Feeds the picker's "fewest
    /// remaining minus pending" sort key (spec.md §4.2).
    pub fn distinct_pending_count(&self) -> usize {
        let mut offsets: Vec<u32> = self.pending.iter().map(|r| r.info.offset).collect();
        offsets.sort_unstable();
        offsets.dedup();
        offsets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn block(offset: u32) -> BlockInfo {
        BlockInfo {
            piece_index: 0,
            offset,
            len: crate::BLOCK_LEN,
        }
    }

    fn atom(n: u32) -> AtomId {
        // AtomId has no public constructor outside the atom module; tests
        // here only ever compare requester counts, which don't care which
        // concrete id is used, so reuse one obtained through a real pool.
        let mut pool = crate::atom::AtomPool::new();
        let addr: std::net::SocketAddr = format!("127.0.0.1:{}", 1000 + n).parse().unwrap();
        pool.ensure(addr, crate::atom::DiscoverySource::Tracker, Instant::now())
    }

    #[test]
    fn removes_request_by_block() {
        let mut d = PieceDownload::new();
        let now = Instant::now();
        let a = atom(1);
        d.add_request(block(0), a, now);
        d.add_request(block(16384), a, now);
        assert_eq!(d.request_count(), 2);
        d.remove_request(&block(0));
        assert_eq!(d.request_count(), 1);
    }

    #[test]
    fn timed_out_respects_timeout() {
        let mut d = PieceDownload::new();
        let t0 = Instant::now();
        d.add_request(block(0), atom(1), t0);
        assert!(d.timed_out(t0, Duration::from_secs(120)).is_empty());
        let later = t0 + Duration::from_secs(121);
        assert_eq!(d.timed_out(later, Duration::from_secs(120)).len(), 1);
    }

    #[test]
    fn requester_count_tracks_duplicate_endgame_requests() {
        let mut d = PieceDownload::new();
        let now = Instant::now();
        let a = atom(1);
        let b = atom(2);
        d.add_request(block(0), a, now);
        assert_eq!(d.requester_count(&block(0)), 1);
        d.add_request(block(0), b, now);
        assert_eq!(d.requester_count(&block(0)), 2);
        d.remove_request_from(a, &block(0));
        assert_eq!(d.requester_count(&block(0)), 1);
    }
}
