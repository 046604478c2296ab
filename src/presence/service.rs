use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::cache::{AggregateCache, AggregateSnapshot};
use super::events::PresenceEvent;
use super::store::PresenceStore;
use crate::clock::{Clock, SystemClock};
use crate::config::PresenceConfig;
use crate::errors::{PresenceError, Result};

/// Diagnostic counters for capacity monitoring
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PresenceStats {
    /// Items with at least one tracked session (live or pending eviction)
    pub tracked_items: usize,
    /// Sessions currently within the liveness threshold
    pub live_viewers: usize,
    /// All sessions held, including ones pending eviction
    pub session_entries: usize,
    pub heartbeats: u64,
    pub rejected: u64,
    pub removals: u64,
    pub evictions: u64,
    pub sweeps: u64,
    pub sweep_failures: u64,
    pub recomputations: u64,
}

#[derive(Default)]
struct Counters {
    heartbeats: AtomicU64,
    rejected: AtomicU64,
    removals: AtomicU64,
    evictions: AtomicU64,
    sweeps: AtomicU64,
    sweep_failures: AtomicU64,
}

/// Public entry point of the presence engine.
///
/// Share it behind an `Arc`; every method takes `&self` and is safe to call
/// from any number of threads.
///
/// ```
/// use viewer_presence::{PresenceConfig, PresenceService};
///
/// let presence = PresenceService::new(PresenceConfig::default()).unwrap();
/// presence.register_heartbeat("viewer-1", "movie-42");
/// presence.register_heartbeat("viewer-2", "movie-42");
/// assert_eq!(presence.get_item_viewer_count("movie-42"), 2);
/// assert_eq!(presence.get_total_active_count(), 2);
///
/// presence.remove_viewer("viewer-1", "movie-42");
/// assert_eq!(presence.get_item_viewer_count("movie-42"), 1);
/// ```
pub struct PresenceService {
    config: PresenceConfig,
    store: PresenceStore,
    cache: Arc<AggregateCache>,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<PresenceEvent>,
    counters: Counters,
}

impl PresenceService {
    pub fn new(config: PresenceConfig) -> Result<Self> {
        Self::with_clock(config, SystemClock)
    }

    pub fn with_clock(config: PresenceConfig, clock: impl Clock) -> Result<Self> {
        config.validate()?;

        let cache = Arc::new(AggregateCache::new(config.snapshot_max_age));
        let (events, _) = broadcast::channel(config.event_buffer);
        let store = PresenceStore::new(
            config.liveness_threshold,
            config.shard_amount,
            cache.clone(),
            events.clone(),
        );

        Ok(Self {
            config,
            store,
            cache,
            clock: Arc::new(clock),
            events,
            counters: Counters::default(),
        })
    }

    pub fn config(&self) -> &PresenceConfig {
        &self.config
    }

    #[inline]
    fn now(&self) -> Instant {
        self.clock.now()
    }

    /// Record that `viewer_id` is consuming `item_id` as of now.
    ///
    /// Blank identifiers are dropped with a warning.
    pub fn register_heartbeat(&self, viewer_id: &str, item_id: &str) {
        if let Err(err) = self.try_register_heartbeat(viewer_id, item_id) {
            warn!(viewer_id, item_id, error = %err, "heartbeat rejected");
        }
    }

    pub fn try_register_heartbeat(&self, viewer_id: &str, item_id: &str) -> Result<()> {
        self.check_ids(viewer_id, item_id)?;

        self.store.upsert(item_id, viewer_id, self.now());
        self.counters.heartbeats.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Explicit "stopped watching". Absent sessions are a no-op.
    pub fn remove_viewer(&self, viewer_id: &str, item_id: &str) {
        if let Err(err) = self.try_remove_viewer(viewer_id, item_id) {
            warn!(viewer_id, item_id, error = %err, "stop signal rejected");
        }
    }

    /// Returns whether a session was removed.
    pub fn try_remove_viewer(&self, viewer_id: &str, item_id: &str) -> Result<bool> {
        self.check_ids(viewer_id, item_id)?;

        let removal = self.store.remove(item_id, viewer_id);
        if removal.removed {
            self.counters.removals.fetch_add(1, Ordering::Relaxed);
        }
        if removal.item_emptied {
            debug!(item_id, "last viewer stopped, item dropped");
        }
        Ok(removal.removed)
    }

    /// Fresh live count for one item; never served from the snapshot cache
    pub fn get_item_viewer_count(&self, item_id: &str) -> usize {
        if is_blank(item_id) {
            return 0;
        }
        self.store.count_live(item_id, self.now())
    }

    /// Live viewer ids of one item, unordered
    pub fn get_item_viewers(&self, item_id: &str) -> Vec<String> {
        if is_blank(item_id) {
            return Vec::new();
        }
        self.store.live_viewers(item_id, self.now())
    }

    pub fn is_watching(&self, viewer_id: &str, item_id: &str) -> bool {
        validate_ids(viewer_id, item_id).is_ok()
            && self.store.is_live(item_id, viewer_id, self.now())
    }

    /// item -> live count for every item with at least one live viewer
    pub fn get_all_active_counts(&self) -> AggregateSnapshot {
        self.cache
            .get_snapshot(self.now(), |now| self.store.live_counts(now))
    }

    pub fn get_total_active_count(&self) -> usize {
        self.get_all_active_counts().total()
    }

    pub fn get_stats(&self) -> PresenceStats {
        let census = self.store.census(self.now());
        let c = &self.counters;

        PresenceStats {
            tracked_items: census.tracked_items,
            live_viewers: census.live_sessions,
            session_entries: census.session_entries,
            heartbeats: c.heartbeats.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            removals: c.removals.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
            sweeps: c.sweeps.load(Ordering::Relaxed),
            sweep_failures: c.sweep_failures.load(Ordering::Relaxed),
            recomputations: self.cache.recomputations(),
        }
    }

    /// Evict every session past the liveness threshold.
    ///
    /// Called by the [`Evictor`](super::Evictor). Each eviction is published
    /// as a departure, like an explicit stop. Returns the number of sessions
    /// removed.
    pub fn sweep_expired(&self) -> usize {
        let outcome = self.store.sweep_expired(self.now());
        self.counters.sweeps.fetch_add(1, Ordering::Relaxed);

        let evicted = outcome.evicted.len();
        if evicted == 0 {
            return 0;
        }
        self.counters
            .evictions
            .fetch_add(evicted as u64, Ordering::Relaxed);
        debug!(
            evicted,
            emptied_items = outcome.emptied_items.len(),
            "presence sweep evicted stale sessions"
        );
        evicted
    }

    pub(crate) fn record_sweep_failure(&self) {
        self.counters.sweep_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Subscribe to arrivals, departures and idle items
    pub fn subscribe(&self) -> broadcast::Receiver<PresenceEvent> {
        self.events.subscribe()
    }

    /// Drop every session. Publishes no events.
    pub fn clear(&self) {
        self.store.clear();
    }

    fn check_ids(&self, viewer_id: &str, item_id: &str) -> Result<()> {
        validate_ids(viewer_id, item_id).inspect_err(|_| {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
        })
    }
}

fn validate_ids(viewer_id: &str, item_id: &str) -> Result<()> {
    if is_blank(viewer_id) {
        return Err(PresenceError::InvalidIdentifier { field: "viewer_id" });
    }
    if is_blank(item_id) {
        return Err(PresenceError::InvalidIdentifier { field: "item_id" });
    }
    Ok(())
}

#[inline]
fn is_blank(id: &str) -> bool {
    id.trim().is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::presence::events::DepartureReason;
    use std::time::Duration;

    fn service() -> (PresenceService, ManualClock) {
        let clock = ManualClock::new();
        let service = PresenceService::with_clock(PresenceConfig::default(), clock.clone()).unwrap();
        (service, clock)
    }

    fn drain(rx: &mut broadcast::Receiver<PresenceEvent>) -> Vec<PresenceEvent> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[test]
    fn repeated_heartbeats_count_once() {
        let (presence, clock) = service();
        for _ in 0..10 {
            presence.register_heartbeat("v1", "m1");
            clock.advance(Duration::from_secs(5));
        }
        assert_eq!(presence.get_item_viewer_count("m1"), 1);
        assert_eq!(presence.get_stats().heartbeats, 10);
    }

    #[test]
    fn liveness_window_holds_without_sweep() {
        let (presence, clock) = service();
        presence.register_heartbeat("v1", "m1");

        clock.set(Duration::from_millis(14_999));
        assert_eq!(presence.get_item_viewer_count("m1"), 1);
        assert!(presence.is_watching("v1", "m1"));

        clock.set(Duration::from_secs(15));
        assert_eq!(presence.get_item_viewer_count("m1"), 0);
        assert!(!presence.is_watching("v1", "m1"));
        assert_eq!(presence.get_stats().session_entries, 1);
    }

    #[test]
    fn explicit_stop_applies_immediately() {
        let (presence, clock) = service();
        presence.register_heartbeat("v1", "m1");
        clock.set(Duration::from_secs(1));

        presence.remove_viewer("v1", "m1");
        assert_eq!(presence.get_item_viewer_count("m1"), 0);
        assert!(presence.get_all_active_counts().is_empty());

        // stopping twice is benign
        assert_eq!(presence.try_remove_viewer("v1", "m1"), Ok(false));
        assert_eq!(presence.get_stats().removals, 1);
    }

    #[test]
    fn aggregate_counts_then_sweep() {
        let (presence, clock) = service();
        presence.register_heartbeat("v1", "m1");
        presence.register_heartbeat("v2", "m1");
        presence.register_heartbeat("v1", "m2");

        let counts = presence.get_all_active_counts();
        assert_eq!(counts.get("m1"), 2);
        assert_eq!(counts.get("m2"), 1);
        assert_eq!(counts.len(), 2);
        assert_eq!(presence.get_total_active_count(), 3);

        clock.set(Duration::from_secs(16));
        assert_eq!(presence.sweep_expired(), 3);
        assert!(presence.get_all_active_counts().is_empty());
        assert_eq!(presence.get_total_active_count(), 0);

        let stats = presence.get_stats();
        assert_eq!(stats.tracked_items, 0);
        assert_eq!(stats.session_entries, 0);
        assert_eq!(stats.evictions, 3);
        assert_eq!(stats.sweeps, 1);
    }

    #[test]
    fn aggregate_reads_reuse_snapshot_until_mutation() {
        let (presence, _clock) = service();
        presence.register_heartbeat("v1", "m1");

        presence.get_all_active_counts();
        presence.get_all_active_counts();
        assert_eq!(presence.get_stats().recomputations, 1);

        presence.register_heartbeat("v2", "m1");
        assert_eq!(presence.get_all_active_counts().get("m1"), 2);
        assert_eq!(presence.get_stats().recomputations, 2);
    }

    #[test]
    fn blank_identifiers_are_rejected_without_side_effects() {
        let (presence, _clock) = service();
        presence.register_heartbeat("", "m1");
        presence.register_heartbeat("v1", "  ");
        presence.remove_viewer("", "");

        assert_eq!(
            presence.try_register_heartbeat("", "m1"),
            Err(PresenceError::InvalidIdentifier { field: "viewer_id" })
        );
        assert_eq!(
            presence.try_register_heartbeat("v1", ""),
            Err(PresenceError::InvalidIdentifier { field: "item_id" })
        );

        let stats = presence.get_stats();
        assert_eq!(stats.tracked_items, 0);
        assert_eq!(stats.heartbeats, 0);
        assert_eq!(stats.rejected, 5);
        assert_eq!(presence.get_item_viewer_count(""), 0);
    }

    #[test]
    fn stats_separate_raw_entries_from_live_viewers() {
        let (presence, clock) = service();
        presence.register_heartbeat("v1", "m1");
        clock.set(Duration::from_secs(10));
        presence.register_heartbeat("v2", "m2");
        clock.set(Duration::from_secs(20));

        let stats = presence.get_stats();
        assert_eq!(stats.tracked_items, 2);
        assert_eq!(stats.session_entries, 2);
        assert_eq!(stats.live_viewers, 1);
    }

    #[test]
    fn stop_and_eviction_publish_departures() {
        let (presence, clock) = service();
        let mut rx = presence.subscribe();

        presence.register_heartbeat("v1", "m1");
        presence.register_heartbeat("v1", "m1");
        presence.register_heartbeat("v2", "m2");
        presence.remove_viewer("v1", "m1");

        clock.set(Duration::from_secs(15));
        presence.sweep_expired();

        let events = drain(&mut rx);
        assert_eq!(
            events,
            vec![
                PresenceEvent::Arrived { item_id: "m1".into(), viewer_id: "v1".into() },
                PresenceEvent::Arrived { item_id: "m2".into(), viewer_id: "v2".into() },
                PresenceEvent::Departed {
                    item_id: "m1".into(),
                    viewer_id: "v1".into(),
                    reason: DepartureReason::Stopped,
                },
                PresenceEvent::ItemIdle { item_id: "m1".into() },
                PresenceEvent::Departed {
                    item_id: "m2".into(),
                    viewer_id: "v2".into(),
                    reason: DepartureReason::Expired,
                },
                PresenceEvent::ItemIdle { item_id: "m2".into() },
            ]
        );
    }

    #[test]
    fn clear_drops_everything() {
        let (presence, _clock) = service();
        presence.register_heartbeat("v1", "m1");
        presence.get_all_active_counts();

        presence.clear();
        assert_eq!(presence.get_total_active_count(), 0);
        assert_eq!(presence.get_stats().tracked_items, 0);
    }

    #[test]
    fn invalid_config_is_refused() {
        let config = PresenceConfig::default().with_sweep_interval(Duration::from_secs(30));
        assert!(matches!(
            PresenceService::new(config),
            Err(PresenceError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn stop_with_blank_viewer_is_an_error() {
        let (presence, _clock) = service();
        presence.register_heartbeat("v1", "m1");

        assert_eq!(
            presence.try_remove_viewer("", "m1"),
            Err(PresenceError::InvalidIdentifier { field: "viewer_id" })
        );
        assert_eq!(
            presence.try_remove_viewer("v1", " "),
            Err(PresenceError::InvalidIdentifier { field: "item_id" })
        );
        assert!(presence.is_watching("v1", "m1"));
        assert_eq!(presence.get_stats().removals, 0);
    }

    #[test]
    fn zero_event_buffer_is_refused_not_panicked() {
        let config = PresenceConfig::default().with_event_buffer(0);
        assert!(matches!(
            PresenceService::with_clock(config, ManualClock::new()),
            Err(PresenceError::InvalidConfig { field: "event_buffer", .. })
        ));
    }
}
