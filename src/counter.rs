//! Sliding-window counters used throughout the engine: per-peer throughput
//! (for the choke controller's rate ranking and the desired-request-count
//! formula) and per-peer event rings (blocks sent, cancels sent, in each
//! direction) used to classify a peer as "good"/"bad"/"untested" for
//! interest declaration (spec.md §4.4).

use std::time::{Duration, Instant};

/// Tracks bytes transferred in one-second buckets over a fixed window,
/// exposing a recent-average rate in bytes/second. This is the basis for
/// the "peer's upload/download rate" used by the choke controller and the
/// "piece-speed query" the I/O layer contract names in §6.
#[derive(Debug)]
pub struct ThroughputCounter {
    window: Duration,
    buckets: Vec<(Instant, u64)>,
}

impl ThroughputCounter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            buckets: Vec::new(),
        }
    }

    /// Records `bytes` transferred at `now`.
    pub fn record(&mut self, now: Instant, bytes: u64) {
        self.evict(now);
        if let Some(last) = self.buckets.last_mut() {
            if now.duration_since(last.0) < Duration::from_secs(1) {
                last.1 += bytes;
                return;
            }
        }
        self.buckets.push((now, bytes));
    }

    fn evict(&mut self, now: Instant) {
        let window = self.window;
        self.buckets
            .retain(|(t, _)| now.saturating_duration_since(*t) <= window);
    }

    /// Returns the average rate, in bytes/second, over the window.
    pub fn rate(&mut self, now: Instant) -> u64 {
        self.evict(now);
        if self.buckets.is_empty() {
            return 0;
        }
        let total: u64 = self.buckets.iter().map(|(_, b)| *b).sum();
        total / self.window.as_secs().max(1)
    }
}

/// Counts discrete events (e.g. blocks sent, cancels sent) within a fixed
/// trailing window, used by the choke controller's good/bad/untested
/// classification (spec.md §4.4).
#[derive(Debug, Default)]
pub struct EventRing {
    window: Duration,
    events: Vec<Instant>,
}

impl EventRing {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            events: Vec::new(),
        }
    }

    pub fn record(&mut self, now: Instant) {
        self.evict(now);
        self.events.push(now);
    }

    fn evict(&mut self, now: Instant) {
        let window = self.window;
        self.events
            .retain(|t| now.saturating_duration_since(*t) <= window);
    }

    /// Returns the number of events recorded within the window.
    pub fn count(&mut self, now: Instant) -> usize {
        self.evict(now);
        self.events.len()
    }
}

impl Default for ThroughputCounter {
    fn default() -> Self {
        Self::new(Duration::from_secs(20))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throughput_counter_evicts_stale_buckets() {
        let mut c = ThroughputCounter::new(Duration::from_secs(10));
        let t0 = Instant::now();
        c.record(t0, 1000);
        assert_eq!(c.rate(t0), 100);
        let later = t0 + Duration::from_secs(20);
        assert_eq!(c.rate(later), 0);
    }

    #[test]
    fn event_ring_counts_within_window() {
        let mut r = EventRing::new(Duration::from_secs(60));
        let t0 = Instant::now();
        r.record(t0);
        r.record(t0 + Duration::from_secs(30));
        assert_eq!(r.count(t0 + Duration::from_secs(30)), 2);
        assert_eq!(r.count(t0 + Duration::from_secs(91)), 0);
    }
}
