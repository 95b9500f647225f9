//! Choke/unchoke and interest-classification controller (spec.md §4.4).
//!
//! Every rechoke tick, peers are ranked by recent transfer rate and the
//! top N (by upload rate while we're leeching, download rate while
//! seeding) are unchoked, plus one peer chosen at random for an
//! "optimistic" unchoke that gets a few ticks of immunity from being
//! rechoked straight back, so a peer with no track record yet gets a
//! chance to prove itself.

use std::time::{Duration, Instant};

use rand::Rng;

use crate::{counter::EventRing, PeerId};

/// Per-peer classification fed by its recent cancel/block ratio, used to
/// decide whether we stay interested in a choked peer (spec.md §4.4).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum InterestGrade {
    /// Too little history to judge yet.
    Untested,
    /// Mostly delivers what we request.
    Good,
    /// Cancels or chokes us disproportionately often.
    Bad,
}

/// Per-peer bookkeeping the choke controller needs: identity for logging,
/// its current choke/interest state, and the event rings that feed
/// [`InterestGrade`] classification.
pub(crate) struct ChokeState {
    pub is_choked: bool,
    pub is_optimistically_unchoked: bool,
    optimistic_ticks_remaining: u32,
    blocks_received: EventRing,
    cancels_received: EventRing,
}

impl Default for ChokeState {
    fn default() -> Self {
        Self {
            is_choked: true,
            is_optimistically_unchoked: false,
            optimistic_ticks_remaining: 0,
            blocks_received: EventRing::new(Duration::from_secs(60)),
            cancels_received: EventRing::new(Duration::from_secs(60)),
        }
    }
}

impl ChokeState {
    pub fn note_block_received(&mut self, now: Instant) {
        self.blocks_received.record(now);
    }

    /// Records that we cancelled a request to this peer, e.g. because it
    /// timed out and the ledger reassigned the block elsewhere.
    pub fn note_cancel_sent(&mut self, now: Instant) {
        self.cancels_received.record(now);
    }

    /// Classifies the peer by its recent blocks-received/cancels-sent
    /// history (spec.md §4.4 "Interest").
    pub fn grade(&mut self, now: Instant) -> InterestGrade {
        let blocks = self.blocks_received.count(now);
        let cancels = self.cancels_received.count(now);
        if blocks == 0 && cancels == 0 {
            InterestGrade::Untested
        } else if cancels == 0 {
            InterestGrade::Good
        } else if blocks == 0 {
            InterestGrade::Bad
        } else if cancels * 10 < blocks {
            InterestGrade::Good
        } else {
            InterestGrade::Bad
        }
    }
}

/// A candidate considered for unchoking on one rechoke tick (spec.md
/// §4.4 "Unchoking").
pub(crate) struct Candidate {
    pub peer_id: PeerId,
    /// The rate rule 3 says to rank by: our upload rate to this peer while
    /// we're seeding, both directions summed for a private torrent, or
    /// this peer's download rate to us otherwise.
    pub rate: u64,
    pub is_interested: bool,
    /// Rule 1: seeds and partial seeds never need reciprocation.
    pub is_seed: bool,
    /// Tie-break: a peer already unchoked stays preferred over an
    /// otherwise-equal newcomer, so unchokes don't needlessly flap.
    pub was_unchoked: bool,
    /// Newly-connected peers get a 3x weight in the optimistic-unchoke
    /// draw so they get a fair shot at proving themselves quickly.
    pub is_newly_connected: bool,
}

/// Decides, given the candidates connected to a torrent, which should be
/// unchoked this tick (spec.md §4.4, steps 1-4). Returns the set of peer
/// ids to unchoke. `is_uploading` is rule 2: a torrent not uploading at
/// all chokes everyone, i.e. a leecher with nothing yet to share.
pub(crate) fn rechoke(candidates: &[Candidate], upload_slots: usize, is_uploading: bool) -> Vec<PeerId> {
    if !is_uploading {
        return Vec::new();
    }
    let mut interested: Vec<&Candidate> = candidates
        .iter()
        .filter(|c| c.is_interested && !c.is_seed)
        .collect();
    // rate desc, was-unchoked preferred, then a random tie-break so equal
    // candidates don't always lose to the same neighbour in the sort.
    let mut rng = rand::thread_rng();
    let tie: std::collections::HashMap<PeerId, u32> =
        interested.iter().map(|c| (c.peer_id, rng.gen())).collect();
    interested.sort_by(|a, b| {
        b.rate
            .cmp(&a.rate)
            .then(b.was_unchoked.cmp(&a.was_unchoked))
            .then(tie[&b.peer_id].cmp(&tie[&a.peer_id]))
    });
    interested.into_iter().take(upload_slots).map(|c| c.peer_id).collect()
}

/// Picks one interested, not-already-unchoked peer at random for the
/// optimistic unchoke slot, weighting newly-connected peers 3x by
/// duplicating them in the draw pool (spec.md §4.4 step 5).
pub(crate) fn pick_optimistic_unchoke<'a>(
    candidates: &'a [Candidate],
    already_unchoked: &[PeerId],
) -> Option<&'a Candidate> {
    use rand::seq::IteratorRandom;
    let mut rng = rand::thread_rng();
    let pool: Vec<&Candidate> = candidates
        .iter()
        .filter(|c| c.is_interested && !c.is_seed && !already_unchoked.contains(&c.peer_id))
        .flat_map(|c| std::iter::repeat(c).take(if c.is_newly_connected { 3 } else { 1 }))
        .collect();
    pool.into_iter().choose(&mut rng)
}

/// How many rechoke ticks an optimistic unchoke lasts before it's
/// reconsidered (spec.md §4.4 step 5).
pub(crate) const OPTIMISTIC_UNCHOKE_TICKS: u32 = 4;

impl ChokeState {
    pub fn start_optimistic_unchoke(&mut self) {
        self.is_optimistically_unchoked = true;
        self.is_choked = false;
        self.optimistic_ticks_remaining = OPTIMISTIC_UNCHOKE_TICKS;
    }

    /// Advances the optimistic-unchoke immunity counter by one tick,
    /// returning whether immunity has expired (the caller may then
    /// rechoke this peer normally).
    pub fn tick_optimistic(&mut self) -> bool {
        if !self.is_optimistically_unchoked {
            return true;
        }
        if self.optimistic_ticks_remaining == 0 {
            self.is_optimistically_unchoked = false;
            true
        } else {
            self.optimistic_ticks_remaining -= 1;
            false
        }
    }
}

fn interest_rank(grade: InterestGrade) -> u8 {
    match grade {
        InterestGrade::Good => 0,
        InterestGrade::Untested => 1,
        InterestGrade::Bad => 2,
    }
}

/// Decides which peers to declare `Interested` in: good peers first, then
/// untested, then bad, randomly broken within a class, capped at
/// `max_peers` (spec.md §4.4 "Interest"). `candidates` is
/// `(peer_id, grade, has_wanted_pieces)`; peers with nothing we want are
/// dropped before ranking.
pub(crate) fn select_interested(
    candidates: &[(PeerId, InterestGrade, bool)],
    max_peers: usize,
) -> Vec<PeerId> {
    let mut rng = rand::thread_rng();
    let mut eligible: Vec<&(PeerId, InterestGrade, bool)> =
        candidates.iter().filter(|(_, _, has_wanted)| *has_wanted).collect();
    let tie: std::collections::HashMap<PeerId, u32> =
        eligible.iter().map(|(id, _, _)| (*id, rng.gen())).collect();
    eligible.sort_by(|a, b| {
        interest_rank(a.1)
            .cmp(&interest_rank(b.1))
            .then(tie[&b.0].cmp(&tie[&a.0]))
    });
    eligible.into_iter().take(max_peers).map(|(id, _, _)| *id).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(b: u8) -> PeerId {
        let mut id = [0u8; 20];
        id[0] = b;
        id
    }

    fn candidate(id: u8, rate: u64, is_interested: bool) -> Candidate {
        Candidate {
            peer_id: pid(id),
            rate,
            is_interested,
            is_seed: false,
            was_unchoked: false,
            is_newly_connected: false,
        }
    }

    #[test]
    fn rechoke_picks_highest_rate_interested_peers() {
        let candidates = vec![candidate(1, 10, true), candidate(2, 100, true), candidate(3, 50, false)];
        let unchoked = rechoke(&candidates, 1, true);
        assert_eq!(unchoked, vec![pid(2)]);
    }

    #[test]
    fn rechoke_chokes_everyone_when_not_uploading() {
        let candidates = vec![candidate(1, 10, true)];
        assert!(rechoke(&candidates, 5, false).is_empty());
    }

    #[test]
    fn rechoke_never_unchokes_a_seed() {
        let mut c = candidate(1, 999, true);
        c.is_seed = true;
        assert!(rechoke(&[c], 5, true).is_empty());
    }

    #[test]
    fn grade_is_untested_with_too_little_history() {
        let mut state = ChokeState::default();
        assert_eq!(state.grade(Instant::now()), InterestGrade::Untested);
    }

    #[test]
    fn grade_is_bad_when_cancels_dominate() {
        let mut state = ChokeState::default();
        let now = Instant::now();
        state.note_block_received(now);
        for _ in 0..4 {
            state.note_cancel_sent(now);
        }
        assert_eq!(state.grade(now), InterestGrade::Bad);
    }

    #[test]
    fn grade_is_good_when_cancels_are_rare() {
        let mut state = ChokeState::default();
        let now = Instant::now();
        for _ in 0..20 {
            state.note_block_received(now);
        }
        state.note_cancel_sent(now);
        assert_eq!(state.grade(now), InterestGrade::Good);
    }

    #[test]
    fn optimistic_unchoke_expires_after_fixed_ticks() {
        let mut state = ChokeState::default();
        state.start_optimistic_unchoke();
        for _ in 0..OPTIMISTIC_UNCHOKE_TICKS {
            assert!(!state.tick_optimistic());
        }
        assert!(state.tick_optimistic());
    }

    #[test]
    fn select_interested_ranks_good_before_bad() {
        let now = Instant::now();
        let mut good = ChokeState::default();
        good.note_block_received(now);
        let mut bad = ChokeState::default();
        bad.note_block_received(now);
        for _ in 0..5 {
            bad.note_cancel_sent(now);
        }
        let candidates = vec![
            (pid(1), bad.grade(now), true),
            (pid(2), good.grade(now), true),
        ];
        let picked = select_interested(&candidates, 1);
        assert_eq!(picked, vec![pid(2)]);
    }
}
