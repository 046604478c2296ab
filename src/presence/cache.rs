//! Memoized per-item live counts for aggregate reads.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;

/// Point-in-time mapping item id -> live viewer count.
///
/// Cloning is cheap; the map is shared. Items with zero live viewers are
/// never present.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AggregateSnapshot {
    counts: Arc<HashMap<String, usize>>,
    total: usize,
}

impl AggregateSnapshot {
    pub fn new(mut counts: HashMap<String, usize>) -> Self {
        counts.retain(|_, count| *count > 0);
        let total = counts.values().sum();
        Self {
            counts: Arc::new(counts),
            total,
        }
    }

    /// Live viewers of one item, 0 when absent
    pub fn get(&self, item_id: &str) -> usize {
        self.counts.get(item_id).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// Number of items with at least one live viewer
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, usize)> + '_ {
        self.counts.iter().map(|(item, count)| (item.as_str(), *count))
    }

    pub fn counts(&self) -> &HashMap<String, usize> {
        &self.counts
    }

    pub fn into_map(self) -> HashMap<String, usize> {
        Arc::try_unwrap(self.counts).unwrap_or_else(|shared| (*shared).clone())
    }
}

struct Cached {
    generation: u64,
    built_at: Instant,
    snapshot: AggregateSnapshot,
}

/// Generation-tagged snapshot cache.
///
/// Every mutation bumps `generation` after it has been applied. A snapshot
/// remembers the generation read *before* its scan, so a write racing with
/// a rebuild always leaves the cache stale and the next read rebuilds.
/// Writers only touch the atomic; they never wait on the snapshot lock.
pub struct AggregateCache {
    generation: AtomicU64,
    slot: RwLock<Option<Cached>>,
    max_age: Option<Duration>,
    recomputations: AtomicU64,
}

impl AggregateCache {
    pub fn new(max_age: Option<Duration>) -> Self {
        Self {
            generation: AtomicU64::new(0),
            slot: RwLock::new(None),
            max_age,
            recomputations: AtomicU64::new(0),
        }
    }

    /// Mark the current snapshot stale
    #[inline]
    pub fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Return the cached snapshot, rebuilding it with `recompute` when any
    /// mutation happened since it was built.
    pub fn get_snapshot<F>(&self, now: Instant, recompute: F) -> AggregateSnapshot
    where
        F: FnOnce(Instant) -> HashMap<String, usize>,
    {
        if let Some(snapshot) = self.current(&self.slot.read(), now) {
            return snapshot;
        }

        // Concurrent readers that missed queue here; the first rebuilds and
        // the rest pick up its result.
        let mut slot = self.slot.write();
        if let Some(snapshot) = self.current(&slot, now) {
            return snapshot;
        }

        let generation = self.generation();
        let snapshot = AggregateSnapshot::new(recompute(now));
        self.recomputations.fetch_add(1, Ordering::Relaxed);
        *slot = Some(Cached {
            generation,
            built_at: now,
            snapshot: snapshot.clone(),
        });
        snapshot
    }

    /// Whether the next read would be served without a rebuild
    pub fn is_valid(&self, now: Instant) -> bool {
        self.current(&self.slot.read(), now).is_some()
    }

    pub fn recomputations(&self) -> u64 {
        self.recomputations.load(Ordering::Relaxed)
    }

    fn current(&self, slot: &Option<Cached>, now: Instant) -> Option<AggregateSnapshot> {
        let cached = slot.as_ref()?;
        if cached.generation != self.generation() {
            return None;
        }
        if let Some(max_age) = self.max_age {
            if now.saturating_duration_since(cached.built_at) > max_age {
                return None;
            }
        }
        Some(cached.snapshot.clone())
    }
}

impl Default for AggregateCache {
    fn default() -> Self {
        Self::new(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn counts(pairs: &[(&str, usize)]) -> HashMap<String, usize> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn snapshot_drops_zero_counts_and_sums() {
        let snapshot = AggregateSnapshot::new(counts(&[("a", 2), ("b", 0), ("c", 1)]));
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.get("b"), 0);
        assert_eq!(snapshot.total(), 3);
        assert!(snapshot.iter().all(|(_, count)| count > 0));
    }

    #[test]
    fn valid_snapshot_is_served_without_recompute() {
        let cache = AggregateCache::default();
        let now = Instant::now();
        let calls = Cell::new(0);
        let build = |_| {
            calls.set(calls.get() + 1);
            counts(&[("a", 1)])
        };

        assert_eq!(cache.get_snapshot(now, build).get("a"), 1);
        assert_eq!(cache.get_snapshot(now, build).get("a"), 1);
        assert_eq!(calls.get(), 1);
        assert_eq!(cache.recomputations(), 1);
    }

    #[test]
    fn invalidate_forces_recompute_on_next_read() {
        let cache = AggregateCache::default();
        let now = Instant::now();

        cache.get_snapshot(now, |_| counts(&[("a", 1)]));
        cache.invalidate();
        assert!(!cache.is_valid(now));

        let snapshot = cache.get_snapshot(now, |_| counts(&[("a", 2)]));
        assert_eq!(snapshot.get("a"), 2);
        assert!(cache.is_valid(now));
    }

    #[test]
    fn invalidation_during_rebuild_leaves_cache_stale() {
        let cache = AggregateCache::default();
        let now = Instant::now();

        // A write lands while the scan is running.
        let snapshot = cache.get_snapshot(now, |_| {
            cache.invalidate();
            counts(&[("a", 1)])
        });
        assert_eq!(snapshot.get("a"), 1);
        assert!(!cache.is_valid(now));

        let rebuilt = cache.get_snapshot(now, |_| counts(&[("a", 2)]));
        assert_eq!(rebuilt.get("a"), 2);
    }

    #[test]
    fn max_age_expires_valid_snapshot() {
        let cache = AggregateCache::new(Some(Duration::from_secs(2)));
        let start = Instant::now();

        cache.get_snapshot(start, |_| counts(&[("a", 1)]));
        assert!(cache.is_valid(start + Duration::from_secs(2)));
        assert!(!cache.is_valid(start + Duration::from_secs(3)));

        let snapshot = cache.get_snapshot(start + Duration::from_secs(3), |_| HashMap::new());
        assert!(snapshot.is_empty());
    }
}
