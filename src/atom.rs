//! The atom pool: a per-torrent set of known peer endpoints that outlives
//! any particular connection to them.
//!
//! An atom is created the first time an address is observed (from a
//! tracker, LTEP, PEX, DHT, an incoming connection, resume data, or LPD)
//! and is only destroyed by pool pruning (§4.6) or a permanent ban (§7).
//! A live [`crate::peer::PeerHandle`] never owns an atom directly: it holds
//! its stable [`AtomId`] and looks the atom up through the owning
//! [`AtomPool`], which lets peers be destroyed asynchronously to atom
//! pruning without ever dangling (see spec.md §9 "Cyclic references").

use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Index into [`AtomPool`]'s arena. Stable across reconnects; never reused
/// for a different address while that address's atom is alive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AtomId(u32);

/// Where an atom's address was first, and best, learned from. Ordinal
/// order is trust order: lower is more trusted, per the glossary
/// ("incoming<ltep<tracker<dht<pex<resume<lpd").
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum DiscoverySource {
    Incoming = 0,
    Ltep = 1,
    Tracker = 2,
    Dht = 3,
    Pex = 4,
    Resume = 5,
    Lpd = 6,
}

/// Primary capability/reachability flags of an atom's address, as a plain
/// bitmask (no need to pull in a flags crate for five bits).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AtomFlags(u8);

impl AtomFlags {
    pub const ENCRYPTION: AtomFlags = AtomFlags(0b0000_0001);
    pub const IS_SEED: AtomFlags = AtomFlags(0b0000_0010);
    pub const SUPPORTS_UTP: AtomFlags = AtomFlags(0b0000_0100);
    pub const HOLEPUNCH: AtomFlags = AtomFlags(0b0000_1000);
    pub const CONNECTABLE: AtomFlags = AtomFlags(0b0001_0000);

    pub fn empty() -> Self {
        AtomFlags(0)
    }

    pub fn contains(self, other: AtomFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: AtomFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: AtomFlags) {
        self.0 &= !other.0;
    }
}

/// Secondary, rarer flags, kept separate so the common path doesn't need
/// to mask them out (mirrors the `flags`/`flags2` split in the data
/// model).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AtomFlags2(u8);

impl AtomFlags2 {
    pub const BANNED: AtomFlags2 = AtomFlags2(0b0000_0001);
    pub const UNREACHABLE: AtomFlags2 = AtomFlags2(0b0000_0010);

    pub fn empty() -> Self {
        AtomFlags2(0)
    }

    pub fn contains(self, other: AtomFlags2) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: AtomFlags2) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: AtomFlags2) {
        self.0 &= !other.0;
    }
}

/// A tristate cache of a blocklist lookup, refreshed whenever the
/// blocklist changes (spec.md §3 invariant).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Blocklisted {
    Unknown,
    Yes,
    No,
}

/// A known peer endpoint, independent of whether we're currently
/// connected to it.
#[derive(Debug)]
pub struct Atom {
    pub addr: SocketAddr,
    pub from_first: DiscoverySource,
    pub from_best: DiscoverySource,
    pub flags: AtomFlags,
    pub flags2: AtomFlags2,
    /// Seed probability in `[0, 100]`, or `None` if unknown.
    pub seed_probability: Option<u8>,
    pub num_fails: u32,
    pub piece_data_time: Option<Instant>,
    pub last_connection_at: Option<Instant>,
    pub last_connection_attempt_at: Option<Instant>,
    pub time: Instant,
    pub shelf_date: Instant,
    pub blocklisted: Blocklisted,
    /// The live peer bound to this atom, if any. An atom never has both a
    /// live peer and an in-flight outgoing handshake (spec.md §8
    /// invariant); that mutual exclusion is enforced by
    /// [`crate::torrent::TorrentPeers`], not by this field's type.
    pub peer: Option<AtomId>,
}

impl Atom {
    fn new(addr: SocketAddr, source: DiscoverySource, now: Instant) -> Self {
        Self {
            addr,
            from_first: source,
            from_best: source,
            flags: AtomFlags::empty(),
            flags2: AtomFlags2::empty(),
            seed_probability: None,
            num_fails: 0,
            piece_data_time: None,
            last_connection_at: None,
            last_connection_attempt_at: None,
            time: now,
            shelf_date: now,
            blocklisted: Blocklisted::Unknown,
            peer: None,
        }
    }

    pub fn is_banned(&self) -> bool {
        self.flags2.contains(AtomFlags2::BANNED)
    }

    pub fn is_unreachable(&self) -> bool {
        self.flags2.contains(AtomFlags2::UNREACHABLE)
    }

    pub fn is_seed(&self) -> bool {
        self.flags.contains(AtomFlags::IS_SEED)
    }

    pub fn mark_seed(&mut self) {
        self.flags.insert(AtomFlags::IS_SEED);
        self.seed_probability = Some(100);
    }

    /// Merges in a newly learned discovery source, keeping the most
    /// trusted one as `from_best` while preserving `from_first`
    /// (`from_best <= from_first`, spec.md §3/§8 invariant).
    pub fn note_source(&mut self, source: DiscoverySource) {
        if source < self.from_best {
            self.from_best = source;
        }
    }

    /// Returns the reconnect interval for this atom given its current
    /// failure count, per spec.md §4.5.
    pub fn reconnect_interval(&self, now: Instant) -> Duration {
        const SCHEDULE_SECS: [u64; 7] = [0, 5, 120, 900, 1800, 3600, 7200];
        if let Some(piece_data_time) = self.piece_data_time {
            if now.saturating_duration_since(piece_data_time) < Duration::from_secs(600) {
                return Duration::from_secs(5);
            }
        }
        let index = (self.num_fails as usize).min(SCHEDULE_SECS.len() - 1);
        let secs = SCHEDULE_SECS[index];
        let secs = if self.is_unreachable() { secs * 2 } else { secs };
        Duration::from_secs(secs)
    }
}

/// Owns all atoms for a single torrent by stable id, as a simple
/// generational-free arena (a `Vec` of slots plus a free list): peers hold
/// an [`AtomId`], never a pointer, so an atom can be pruned or a peer
/// destroyed in either order without dangling references.
#[derive(Debug, Default)]
pub struct AtomPool {
    slots: Vec<Option<Atom>>,
    free: Vec<u32>,
}

impl AtomPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Finds the atom for `addr`, if one already exists.
    pub fn find(&self, addr: &SocketAddr) -> Option<AtomId> {
        self.slots
            .iter()
            .enumerate()
            .find(|(_, a)| a.as_ref().map(|a| &a.addr) == Some(addr))
            .map(|(i, _)| AtomId(i as u32))
    }

    /// Ensures an atom exists for `addr`, creating one with the given
    /// discovery source if it doesn't, or merging the source into an
    /// existing atom's `from_best` otherwise.
    pub fn ensure(&mut self, addr: SocketAddr, source: DiscoverySource, now: Instant) -> AtomId {
        if let Some(id) = self.find(&addr) {
            self.get_mut(id).unwrap().note_source(source);
            id
        } else {
            self.insert(Atom::new(addr, source, now))
        }
    }

    fn insert(&mut self, atom: Atom) -> AtomId {
        if let Some(index) = self.free.pop() {
            self.slots[index as usize] = Some(atom);
            AtomId(index)
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Some(atom));
            AtomId(index)
        }
    }

    pub fn get(&self, id: AtomId) -> Option<&Atom> {
        self.slots.get(id.0 as usize).and_then(|a| a.as_ref())
    }

    pub fn get_mut(&mut self, id: AtomId) -> Option<&mut Atom> {
        self.slots.get_mut(id.0 as usize).and_then(|a| a.as_mut())
    }

    /// Permanently removes an atom, e.g. during pool pruning (§4.6). The
    /// slot is recycled for a future insertion.
    pub fn remove(&mut self, id: AtomId) -> Option<Atom> {
        let atom = self.slots.get_mut(id.0 as usize)?.take();
        if atom.is_some() {
            self.free.push(id.0);
        }
        atom
    }

    pub fn iter(&self) -> impl Iterator<Item = (AtomId, &Atom)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, a)| a.as_ref().map(|a| (AtomId(i as u32), a)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (AtomId, &mut Atom)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, a)| a.as_mut().map(|a| (AtomId(i as u32), a)))
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Computes the pool size cap for the given `max_connected_peers`, per
    /// spec.md §4.6.
    pub fn size_cap(max_connected_peers: usize) -> usize {
        let n = max_connected_peers;
        if n >= 55 {
            n + 150
        } else if n >= 20 {
            2 * n + 95
        } else {
            4 * n + 55
        }
    }

    /// Prunes the pool down to `size_cap(max_connected_peers)` atoms,
    /// always keeping atoms that are currently in use (bound to a live
    /// peer). The remaining atoms are ranked by: most recent piece-data
    /// time within the last hour wins, then the higher `shelf_date` wins
    /// (spec.md §4.6).
    pub fn prune(&mut self, max_connected_peers: usize, now: Instant) {
        let cap = Self::size_cap(max_connected_peers);
        let mut candidates: Vec<AtomId> = self
            .iter()
            .filter(|(_, a)| a.peer.is_none())
            .map(|(id, _)| id)
            .collect();
        let in_use_count = self.len() - candidates.len();
        if in_use_count >= cap {
            return;
        }
        let budget = cap - in_use_count;
        if candidates.len() <= budget {
            return;
        }

        let one_hour_ago = now.checked_sub(Duration::from_secs(3600));
        candidates.sort_by(|a, b| {
            let a = self.get(*a).unwrap();
            let b = self.get(*b).unwrap();
            let a_recent = a
                .piece_data_time
                .filter(|t| one_hour_ago.map(|h| *t >= h).unwrap_or(false));
            let b_recent = b
                .piece_data_time
                .filter(|t| one_hour_ago.map(|h| *t >= h).unwrap_or(false));
            match (a_recent, b_recent) {
                (Some(a_t), Some(b_t)) => b_t.cmp(&a_t),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => b.shelf_date.cmp(&a.shelf_date),
            }
        });

        for id in candidates.into_iter().skip(budget) {
            self.remove(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    #[test]
    fn from_best_never_exceeds_from_first() {
        let mut pool = AtomPool::new();
        let now = Instant::now();
        let id = pool.ensure(addr(1), DiscoverySource::Resume, now);
        pool.ensure(addr(1), DiscoverySource::Tracker, now);
        let atom = pool.get(id).unwrap();
        assert_eq!(atom.from_first, DiscoverySource::Resume);
        assert_eq!(atom.from_best, DiscoverySource::Tracker);
        assert!((atom.from_best as u8) <= (atom.from_first as u8));
    }

    #[test]
    fn size_cap_matches_spec_thresholds() {
        assert_eq!(AtomPool::size_cap(10), 4 * 10 + 55);
        assert_eq!(AtomPool::size_cap(20), 2 * 20 + 95);
        assert_eq!(AtomPool::size_cap(55), 55 + 150);
        assert_eq!(AtomPool::size_cap(100), 100 + 150);
    }

    #[test]
    fn prune_keeps_atoms_with_live_peers() {
        let mut pool = AtomPool::new();
        let now = Instant::now();
        let kept = pool.ensure(addr(1), DiscoverySource::Tracker, now);
        pool.get_mut(kept).unwrap().peer = Some(AtomId(999));
        for i in 2..100u16 {
            pool.ensure(addr(i), DiscoverySource::Tracker, now);
        }
        pool.prune(1, now);
        assert!(pool.get(kept).is_some());
        assert!(pool.len() <= AtomPool::size_cap(1) + 1);
    }

    #[test]
    fn reconnect_interval_doubles_when_unreachable() {
        let mut atom = Atom::new(addr(1), DiscoverySource::Tracker, Instant::now());
        atom.num_fails = 2;
        let base = atom.reconnect_interval(Instant::now() + Duration::from_secs(10_000));
        atom.flags2.insert(AtomFlags2::UNREACHABLE);
        let doubled = atom.reconnect_interval(Instant::now() + Duration::from_secs(10_000));
        assert_eq!(doubled, base * 2);
    }
}
