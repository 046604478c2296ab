//! Periodic background sweep of stale sessions.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, info};

use super::service::PresenceService;

/// Something the evictor can sweep.
pub trait Sweeper: Send + Sync + 'static {
    /// Remove stale entries and return how many were removed
    fn sweep(&self) -> usize;

    /// Called after a sweep cycle panicked
    fn sweep_failed(&self) {}
}

impl Sweeper for PresenceService {
    fn sweep(&self) -> usize {
        self.sweep_expired()
    }

    fn sweep_failed(&self) {
        self.record_sweep_failure();
    }
}

/// Runs [`Sweeper::sweep`] on a fixed period.
///
/// A panicking cycle is caught, logged and counted; the schedule keeps
/// going.
pub struct Evictor<S: Sweeper> {
    target: Arc<S>,
    period: Duration,
}

impl Evictor<PresenceService> {
    /// Evictor using the service's configured sweep interval
    pub fn for_service(service: Arc<PresenceService>) -> Self {
        let period = service.config().sweep_interval;
        Self::new(service, period)
    }
}

impl<S: Sweeper> Evictor<S> {
    pub fn new(target: Arc<S>, period: Duration) -> Self {
        Self { target, period }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// One sweep cycle. Returns `None` when the cycle panicked.
    pub fn run_once(&self) -> Option<usize> {
        match panic::catch_unwind(AssertUnwindSafe(|| self.target.sweep())) {
            Ok(evicted) => Some(evicted),
            Err(payload) => {
                self.target.sweep_failed();
                error!(
                    cause = panic_message(payload.as_ref()),
                    "presence sweep panicked; retrying next cycle"
                );
                None
            }
        }
    }

    /// Start the sweep loop on the current tokio runtime.
    ///
    /// Panics if called outside a runtime, like `tokio::spawn`.
    pub fn spawn(self) -> EvictorHandle {
        self.spawn_on(&Handle::current())
    }

    pub fn spawn_on(self, runtime: &Handle) -> EvictorHandle {
        let shutdown = Arc::new(Notify::new());
        let task = runtime.spawn(self.run(shutdown.clone()));
        EvictorHandle { shutdown, task }
    }

    async fn run(self, shutdown: Arc<Notify>) {
        // first sweep one period after start
        let mut ticker = time::interval_at(time::Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(period_ms = self.period.as_millis() as u64, "presence evictor started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_once();
                }
                _ = shutdown.notified() => break,
            }
        }

        info!("presence evictor stopped");
    }
}

/// Handle to a running evictor task.
pub struct EvictorHandle {
    shutdown: Arc<Notify>,
    task: JoinHandle<()>,
}

impl EvictorHandle {
    /// Stop the loop and wait for it to exit
    pub async fn shutdown(self) {
        self.shutdown.notify_one();
        let _ = self.task.await;
    }

    /// Stop the loop without waiting
    pub fn stop(&self) {
        self.shutdown.notify_one();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&'static str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
