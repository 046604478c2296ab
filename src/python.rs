//! Python bindings (`python` feature).
//!
//! Example (Python):
//!     presence = PresenceService(liveness_threshold_secs=15, sweep_interval_secs=10)
//!     presence.register_heartbeat("viewer-1", "movie-42")
//!     presence.get_item_viewer_count("movie-42")  # 1
//!     presence.get_all_active_counts()             # {"movie-42": 1}

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;
use tokio::runtime::{Builder, Runtime};

use crate::config::PresenceConfig;
use crate::errors::{InvalidConfig, InvalidIdentifier};
use crate::presence::{Evictor, EvictorHandle, PresenceService, PresenceStats};

/// Snapshot of engine counters
#[pyclass(name = "PresenceStats", frozen)]
#[derive(Debug)]
pub struct PyPresenceStats {
    #[pyo3(get)]
    pub tracked_items: usize,
    #[pyo3(get)]
    pub live_viewers: usize,
    #[pyo3(get)]
    pub session_entries: usize,
    #[pyo3(get)]
    pub heartbeats: u64,
    #[pyo3(get)]
    pub rejected: u64,
    #[pyo3(get)]
    pub removals: u64,
    #[pyo3(get)]
    pub evictions: u64,
    #[pyo3(get)]
    pub sweeps: u64,
    #[pyo3(get)]
    pub sweep_failures: u64,
    #[pyo3(get)]
    pub recomputations: u64,
}

impl From<PresenceStats> for PyPresenceStats {
    fn from(stats: PresenceStats) -> Self {
        Self {
            tracked_items: stats.tracked_items,
            live_viewers: stats.live_viewers,
            session_entries: stats.session_entries,
            heartbeats: stats.heartbeats,
            rejected: stats.rejected,
            removals: stats.removals,
            evictions: stats.evictions,
            sweeps: stats.sweeps,
            sweep_failures: stats.sweep_failures,
            recomputations: stats.recomputations,
        }
    }
}

#[pymethods]
impl PyPresenceStats {
    fn __repr__(&self) -> String {
        format!(
            "PresenceStats(items={}, live={}, entries={}, heartbeats={}, evictions={}, sweep_failures={})",
            self.tracked_items,
            self.live_viewers,
            self.session_entries,
            self.heartbeats,
            self.evictions,
            self.sweep_failures,
        )
    }
}

/// Presence engine with a background evictor thread
#[pyclass(name = "PresenceService")]
pub struct PyPresenceService {
    inner: Arc<PresenceService>,
    runtime: Runtime,
    evictor: Option<EvictorHandle>,
}

#[pymethods]
impl PyPresenceService {
    #[new]
    #[pyo3(signature = (
        liveness_threshold_secs=15.0,
        heartbeat_interval_secs=5.0,
        sweep_interval_secs=10.0,
        shard_amount=64,
        start_evictor=true
    ))]
    pub fn new(
        liveness_threshold_secs: f64,
        heartbeat_interval_secs: f64,
        sweep_interval_secs: f64,
        shard_amount: usize,
        start_evictor: bool,
    ) -> PyResult<Self> {
        let config = PresenceConfig::default()
            .with_liveness_threshold(seconds("liveness_threshold_secs", liveness_threshold_secs)?)
            .with_heartbeat_interval(seconds("heartbeat_interval_secs", heartbeat_interval_secs)?)
            .with_sweep_interval(seconds("sweep_interval_secs", sweep_interval_secs)?)
            .with_shard_amount(shard_amount);
        let inner = Arc::new(PresenceService::new(config)?);

        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("presence-evictor")
            .enable_time()
            .build()?;

        let mut service = Self {
            inner,
            runtime,
            evictor: None,
        };
        if start_evictor {
            service.start_evictor();
        }
        Ok(service)
    }

    pub fn register_heartbeat(&self, viewer_id: &str, item_id: &str) {
        self.inner.register_heartbeat(viewer_id, item_id);
    }

    /// Returns True if a session was removed. Raises InvalidIdentifier for
    /// blank ids.
    pub fn remove_viewer(&self, viewer_id: &str, item_id: &str) -> PyResult<bool> {
        Ok(self.inner.try_remove_viewer(viewer_id, item_id)?)
    }

    pub fn get_item_viewer_count(&self, item_id: &str) -> usize {
        self.inner.get_item_viewer_count(item_id)
    }

    pub fn get_item_viewers(&self, item_id: &str) -> Vec<String> {
        self.inner.get_item_viewers(item_id)
    }

    pub fn is_watching(&self, viewer_id: &str, item_id: &str) -> bool {
        self.inner.is_watching(viewer_id, item_id)
    }

    pub fn get_all_active_counts(&self) -> HashMap<String, usize> {
        self.inner.get_all_active_counts().into_map()
    }

    pub fn get_total_active_count(&self) -> usize {
        self.inner.get_total_active_count()
    }

    pub fn get_stats(&self) -> PyPresenceStats {
        self.inner.get_stats().into()
    }

    /// Run one eviction sweep now; returns the number of sessions removed
    pub fn sweep_expired(&self) -> usize {
        self.inner.sweep_expired()
    }

    pub fn clear(&self) {
        self.inner.clear();
    }

    pub fn start_evictor(&mut self) {
        if self.evictor.is_some() {
            return;
        }
        let evictor = Evictor::for_service(self.inner.clone());
        self.evictor = Some(evictor.spawn_on(self.runtime.handle()));
    }

    pub fn stop_evictor(&mut self) {
        if let Some(handle) = self.evictor.take() {
            handle.stop();
        }
    }

    #[getter]
    pub fn evictor_running(&self) -> bool {
        self.evictor
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    fn __repr__(&self) -> String {
        let stats = self.inner.get_stats();
        format!(
            "PresenceService(items={}, live={}, evictor={})",
            stats.tracked_items,
            stats.live_viewers,
            self.evictor_running(),
        )
    }
}

fn seconds(name: &str, value: f64) -> PyResult<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| PyValueError::new_err(format!("{name} must be a non-negative number of seconds")))
}

#[pymodule(gil_used = false)]
fn viewer_presence(module: &Bound<'_, PyModule>) -> PyResult<()> {
    let py = module.py();
    module.add_class::<PyPresenceService>()?;
    module.add_class::<PyPresenceStats>()?;
    module.add("InvalidIdentifier", py.get_type::<InvalidIdentifier>())?;
    module.add("InvalidConfig", py.get_type::<InvalidConfig>())?;
    Ok(())
}
