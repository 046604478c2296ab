//! In-memory presence engine: which viewers are watching which items, right
//! now, driven by periodic heartbeats.
//!
//! [`PresenceService`] is the façade external transports call. It is backed
//! by a sharded item index, a generation-tagged [`AggregateCache`] for
//! dashboard polling, and a background [`Evictor`] that drops sessions whose
//! heartbeats stopped.

pub mod clock;
pub mod config;
pub mod errors;
pub mod presence;

#[cfg(feature = "python")]
mod python;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::PresenceConfig;
pub use errors::{PresenceError, Result};
pub use presence::{
    AggregateCache, AggregateSnapshot, DepartureReason, Evictor, EvictorHandle, PresenceEvent,
    PresenceService, PresenceStats, Sweeper,
};
