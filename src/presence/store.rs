//! Sharded item -> viewer -> last-seen index.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::{AHashMap, RandomState};
use dashmap::DashMap;
use tokio::sync::broadcast;

use super::cache::AggregateCache;
use super::events::{DepartureReason, PresenceEvent};

/// Sessions of one item, keyed by viewer id.
#[derive(Debug, Default)]
pub struct ItemPresenceSet {
    viewers: AHashMap<String, Instant>,
}

impl ItemPresenceSet {
    /// Returns true when the viewer was not tracked before.
    fn touch(&mut self, viewer_id: &str, now: Instant) -> bool {
        match self.viewers.get_mut(viewer_id) {
            Some(last_seen) => {
                // out-of-order heartbeats never move last_seen backwards
                if now > *last_seen {
                    *last_seen = now;
                }
                false
            }
            None => {
                self.viewers.insert(viewer_id.to_owned(), now);
                true
            }
        }
    }

    fn live(&self, now: Instant, threshold: Duration) -> impl Iterator<Item = &str> + '_ {
        self.viewers
            .iter()
            .filter(move |(_, seen)| is_live(**seen, now, threshold))
            .map(|(viewer, _)| viewer.as_str())
    }

    fn count_live(&self, now: Instant, threshold: Duration) -> usize {
        self.live(now, threshold).count()
    }

    pub fn len(&self) -> usize {
        self.viewers.len()
    }
}

#[inline]
fn is_live(last_seen: Instant, now: Instant, threshold: Duration) -> bool {
    now.saturating_duration_since(last_seen) < threshold
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Created,
    Refreshed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Removal {
    /// A session existed and was deleted
    pub removed: bool,
    /// The deletion emptied the item, which was dropped from the index
    pub item_emptied: bool,
}

/// Sessions dropped by one sweep.
#[derive(Debug, Clone, Default)]
pub struct SweepOutcome {
    /// (item_id, viewer_id) pairs removed
    pub evicted: Vec<(String, String)>,
    /// Items whose last session was evicted
    pub emptied_items: Vec<String>,
}

impl SweepOutcome {
    pub fn removed_any(&self) -> bool {
        !self.evicted.is_empty()
    }
}

/// Raw occupancy figures gathered in a single pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Census {
    pub tracked_items: usize,
    pub session_entries: usize,
    pub live_sessions: usize,
}

/// Authoritative presence index.
///
/// Items hash onto independently locked shards, so heartbeats for items in
/// different shards never contend. Every operation on one item runs under
/// that item's shard lock, which is what keeps a sweep from dropping a
/// session refreshed concurrently: the sweep either observes the new
/// timestamp or the heartbeat recreates the session after it.
///
/// Presence events are sent while the shard lock is still held, so the
/// channel carries each item's transitions in the order the index applied
/// them.
pub struct PresenceStore {
    items: DashMap<String, ItemPresenceSet, RandomState>,
    threshold: Duration,
    cache: Arc<AggregateCache>,
    events: broadcast::Sender<PresenceEvent>,
}

impl PresenceStore {
    /// `shard_amount` must be a power of two >= 2; `PresenceConfig::validate`
    /// checks it before the service builds a store.
    pub(crate) fn new(
        threshold: Duration,
        shard_amount: usize,
        cache: Arc<AggregateCache>,
        events: broadcast::Sender<PresenceEvent>,
    ) -> Self {
        Self {
            items: DashMap::with_hasher_and_shard_amount(RandomState::new(), shard_amount),
            threshold,
            cache,
            events,
        }
    }

    #[inline]
    fn publish(&self, event: PresenceEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    /// Create or refresh the (item, viewer) session
    pub fn upsert(&self, item_id: &str, viewer_id: &str, now: Instant) -> Upsert {
        let created = {
            // Look up first so refreshes of known items never allocate a key
            let mut set = match self.items.get_mut(item_id) {
                Some(set) => set,
                None => self.items.entry(item_id.to_owned()).or_default(),
            };
            let created = set.touch(viewer_id, now);
            if created {
                self.publish(PresenceEvent::Arrived {
                    item_id: item_id.to_owned(),
                    viewer_id: viewer_id.to_owned(),
                });
            }
            created
        };
        self.cache.invalidate();

        if created {
            Upsert::Created
        } else {
            Upsert::Refreshed
        }
    }

    /// Delete the session if present. Absent sessions are a no-op.
    pub fn remove(&self, item_id: &str, viewer_id: &str) -> Removal {
        let mut removed = false;
        let item_emptied = self
            .items
            .remove_if_mut(item_id, |_, set| {
                removed = set.viewers.remove(viewer_id).is_some();
                if !removed {
                    return false;
                }
                self.publish(PresenceEvent::Departed {
                    item_id: item_id.to_owned(),
                    viewer_id: viewer_id.to_owned(),
                    reason: DepartureReason::Stopped,
                });
                let emptied = set.viewers.is_empty();
                if emptied {
                    self.publish(PresenceEvent::ItemIdle {
                        item_id: item_id.to_owned(),
                    });
                }
                emptied
            })
            .is_some();

        if removed {
            self.cache.invalidate();
        }
        Removal {
            removed,
            item_emptied,
        }
    }

    /// Sessions of `item_id` seen within the liveness threshold
    pub fn count_live(&self, item_id: &str, now: Instant) -> usize {
        self.items
            .get(item_id)
            .map(|set| set.count_live(now, self.threshold))
            .unwrap_or(0)
    }

    pub fn live_viewers(&self, item_id: &str, now: Instant) -> Vec<String> {
        self.items
            .get(item_id)
            .map(|set| set.live(now, self.threshold).map(str::to_owned).collect())
            .unwrap_or_default()
    }

    pub fn is_live(&self, item_id: &str, viewer_id: &str, now: Instant) -> bool {
        self.items
            .get(item_id)
            .and_then(|set| set.viewers.get(viewer_id).copied())
            .is_some_and(|seen| is_live(seen, now, self.threshold))
    }

    /// Remove every session whose age reached the threshold.
    ///
    /// Shards are locked one at a time; no lock is held across the whole
    /// scan.
    pub fn sweep_expired(&self, now: Instant) -> SweepOutcome {
        let threshold = self.threshold;
        let mut outcome = SweepOutcome::default();

        self.items.retain(|item_id, set| {
            set.viewers.retain(|viewer_id, seen| {
                if is_live(*seen, now, threshold) {
                    return true;
                }
                self.publish(PresenceEvent::Departed {
                    item_id: item_id.clone(),
                    viewer_id: viewer_id.clone(),
                    reason: DepartureReason::Expired,
                });
                outcome.evicted.push((item_id.clone(), viewer_id.clone()));
                false
            });
            if set.viewers.is_empty() {
                self.publish(PresenceEvent::ItemIdle {
                    item_id: item_id.clone(),
                });
                outcome.emptied_items.push(item_id.clone());
                return false;
            }
            true
        });

        if outcome.removed_any() {
            self.cache.invalidate();
        }
        outcome
    }

    /// item -> live count, omitting items with no live viewer
    pub fn live_counts(&self, now: Instant) -> HashMap<String, usize> {
        self.items
            .iter()
            .filter_map(|entry| {
                let live = entry.value().count_live(now, self.threshold);
                (live > 0).then(|| (entry.key().clone(), live))
            })
            .collect()
    }

    pub fn census(&self, now: Instant) -> Census {
        self.items
            .iter()
            .fold(Census::default(), |mut census, entry| {
                census.tracked_items += 1;
                census.session_entries += entry.len();
                census.live_sessions += entry.count_live(now, self.threshold);
                census
            })
    }

    /// Drop every session. Publishes no events.
    pub fn clear(&self) {
        self.items.clear();
        self.cache.invalidate();
    }
}
