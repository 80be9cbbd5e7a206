//! Reverse lookup from on-air hints to candidate channel keys
//!
//! The index is rebuilt whenever the key set changes or the clock crosses a
//! half-bucket boundary (which is where the nearest alternate bucket flips).
//! Each key contributes its current, alternate and fixed hints. Hints collide,
//! so every lookup returns all keys that share the value.

use sg1_core::{derive_hints, ChannelKey, Hint, TIME_BUCKET_SHIFT};
use std::collections::{BTreeSet, HashMap};
use tracing::trace;

/// Time-bucketed hint → keys map
#[derive(Debug, Default)]
pub struct HintIndex {
    keys: BTreeSet<ChannelKey>,
    by_hint: HashMap<Hint, Vec<ChannelKey>>,
    built_for: Option<i64>,
}

impl HintIndex {
    /// Empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Rounded bucket: changes every half bucket
    fn cache_key(unix_micros: i64) -> i64 {
        (unix_micros + (1 << (TIME_BUCKET_SHIFT - 1))) >> TIME_BUCKET_SHIFT
    }

    /// Add a key. Returns `true` if it was new.
    pub fn insert(&mut self, key: ChannelKey) -> bool {
        let added = self.keys.insert(key);
        if added {
            self.built_for = None;
        }
        added
    }

    /// Drop a key. Returns `true` if it was known.
    pub fn remove(&mut self, key: &ChannelKey) -> bool {
        let removed = self.keys.remove(key);
        if removed {
            self.built_for = None;
        }
        removed
    }

    /// Replace the whole key set
    pub fn replace<I: IntoIterator<Item = ChannelKey>>(&mut self, keys: I) {
        self.keys = keys.into_iter().collect();
        self.built_for = None;
    }

    /// Whether `key` is indexed
    pub fn contains(&self, key: &ChannelKey) -> bool {
        self.keys.contains(key)
    }

    /// Number of keys
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// True when no keys are known
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Rebuild if the key set changed or the clock moved to a new half
    /// bucket. Returns `true` if a rebuild happened.
    pub fn refresh(&mut self, unix_micros: i64) -> bool {
        let cache_key = Self::cache_key(unix_micros);
        if self.built_for == Some(cache_key) {
            return false;
        }

        self.by_hint.clear();
        for key in &self.keys {
            let set = derive_hints(key, unix_micros);
            let mut hints = set.routing_hints().to_vec();
            hints.sort();
            hints.dedup();
            for hint in hints {
                self.by_hint.entry(hint).or_default().push(*key);
            }
        }
        self.built_for = Some(cache_key);
        trace!(keys = self.keys.len(), hints = self.by_hint.len(), "Rebuilt hint index");
        true
    }

    /// Keys that may have produced `hint`
    pub fn candidates(&self, hint: Hint) -> &[ChannelKey] {
        self.by_hint.get(&hint).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Keys matching any of `hints`, in hint order, each key at most once
    pub fn candidates_for(&self, hints: &[Hint]) -> Vec<ChannelKey> {
        let mut out: Vec<ChannelKey> = Vec::new();
        for hint in hints {
            for key in self.candidates(*hint) {
                if !out.contains(key) {
                    out.push(*key);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sg1_core::fixed_hint;

    const NOW: i64 = 1_700_000_000_000_000;

    #[test]
    fn test_lookup_by_every_routing_hint() {
        let key = ChannelKey::new([1; 32]);
        let mut index = HintIndex::new();
        index.insert(key);
        assert!(index.refresh(NOW));

        let set = derive_hints(&key, NOW);
        for hint in set.routing_hints() {
            assert_eq!(index.candidates(hint), &[key]);
        }
    }

    #[test]
    fn test_refresh_only_on_half_bucket_change() {
        let mut index = HintIndex::new();
        index.insert(ChannelKey::new([2; 32]));
        assert!(index.refresh(NOW));
        assert!(!index.refresh(NOW + 1000));
        assert!(index.refresh(NOW + (1 << TIME_BUCKET_SHIFT)));

        // new key forces a rebuild
        index.insert(ChannelKey::new([3; 32]));
        assert!(index.refresh(NOW + (1 << TIME_BUCKET_SHIFT)));
    }

    #[test]
    fn test_candidates_deduplicated_across_hints() {
        let a = ChannelKey::new([5; 32]);
        let b = ChannelKey::new([6; 32]);
        let mut index = HintIndex::new();
        index.replace([a, b]);
        index.refresh(NOW);

        let ha = fixed_hint(&a);
        let hb = fixed_hint(&b);
        assert_eq!(index.candidates_for(&[ha, hb]), vec![a, b]);
        assert_eq!(index.candidates_for(&[hb, ha]), vec![b, a]);
        assert_eq!(index.candidates_for(&[ha, ha]), vec![a]);
    }

    #[test]
    fn test_removed_key_no_longer_matches() {
        let a = ChannelKey::new([7; 32]);
        let mut index = HintIndex::new();
        index.insert(a);
        index.refresh(NOW);
        assert!(index.remove(&a));
        index.refresh(NOW);
        assert!(index.candidates(fixed_hint(&a)).is_empty());
        assert!(index.is_empty());
    }
}
