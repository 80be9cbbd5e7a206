//! Replay window for at-most-once delivery
//!
//! Every gateway that hears a packet republishes it, so a device commonly
//! sees the same radio packet two or three times. The sender's monotonic
//! timestamp identifies a packet on its channel; the window remembers the
//! timestamps it has accepted and rejects repeats.
//!
//! Entries are kept in insertion order. Once the window grows past its
//! capacity, entries older than `max_age` are collected from the oldest end.
//! A hard limit of twice the capacity bounds memory under a flood of fresh
//! packets.

use lru::LruCache;
use std::time::{Duration, Instant};
use tracing::trace;

use crate::config::ReplayConfig;

/// Replay window counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    /// Timestamps accepted
    pub accepted: u64,
    /// Repeats rejected
    pub rejected: u64,
    /// Entries collected
    pub collected: u64,
}

/// Insertion-ordered set of recently accepted timestamps
#[derive(Debug)]
pub struct ReplayWindow {
    seen: LruCache<u64, Instant>,
    capacity: usize,
    max_age: Duration,
    stats: ReplayStats,
}

impl ReplayWindow {
    /// Window with explicit sizing
    pub fn new(capacity: usize, max_age: Duration) -> Self {
        Self {
            seen: LruCache::unbounded(),
            capacity: capacity.max(1),
            max_age,
            stats: ReplayStats::default(),
        }
    }

    /// Window from device configuration
    pub fn from_config(config: &ReplayConfig) -> Self {
        Self::new(config.capacity, config.max_age)
    }

    /// Accept `timestamp` once. Returns `false` for a repeat.
    pub fn validate(&mut self, timestamp: u64, now: Instant) -> bool {
        // peek keeps insertion order intact
        if self.seen.peek(&timestamp).is_some() {
            self.stats.rejected += 1;
            trace!(timestamp, "Replay rejected");
            return false;
        }
        self.seen.put(timestamp, now);
        self.stats.accepted += 1;
        if self.seen.len() > self.capacity {
            self.collect(now);
        }
        true
    }

    fn collect(&mut self, now: Instant) {
        let hard_limit = self.capacity * 2;
        while let Some((_, &seen_at)) = self.seen.peek_lru() {
            let stale = now.saturating_duration_since(seen_at) > self.max_age;
            if !stale && self.seen.len() <= hard_limit {
                break;
            }
            self.seen.pop_lru();
            self.stats.collected += 1;
        }
    }

    /// Entries currently held
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// True when nothing has been accepted yet
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Counters
    pub fn stats(&self) -> ReplayStats {
        self.stats
    }
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::from_config(&ReplayConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeat_is_rejected() {
        let mut window = ReplayWindow::default();
        let now = Instant::now();
        assert!(window.validate(1_000, now));
        assert!(!window.validate(1_000, now));
        assert!(window.validate(1_001, now));
        assert_eq!(window.stats().rejected, 1);
    }

    #[test]
    fn test_old_entries_collected_over_capacity() {
        let mut window = ReplayWindow::new(4, Duration::from_secs(16));
        let start = Instant::now();
        for ts in 0..4 {
            assert!(window.validate(ts, start));
        }
        let later = start + Duration::from_secs(17);
        assert!(window.validate(100, later));
        // everything from `start` is stale once we go over capacity
        assert_eq!(window.len(), 1);
        assert!(window.validate(0, later));
    }

    #[test]
    fn test_fresh_entries_survive_until_hard_limit() {
        let mut window = ReplayWindow::new(4, Duration::from_secs(16));
        let now = Instant::now();
        for ts in 0..8 {
            assert!(window.validate(ts, now));
        }
        assert_eq!(window.len(), 8);
        assert!(!window.validate(0, now));

        assert!(window.validate(8, now));
        assert_eq!(window.len(), 8);
        // oldest fresh entry went first
        assert!(window.validate(0, now));
    }
}
