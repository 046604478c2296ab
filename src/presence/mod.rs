//! Heartbeat-driven presence tracking
//!
//! Tracks which viewers are consuming which items from periodic heartbeats,
//! evicts sessions that stop reporting, and serves per-item and global live
//! counts to polling readers.

pub mod cache;
pub mod events;
pub mod evictor;
pub mod service;
pub(crate) mod store;

pub use cache::{AggregateCache, AggregateSnapshot};
pub use events::{DepartureReason, PresenceEvent};
pub use evictor::{Evictor, EvictorHandle, Sweeper};
pub use service::{PresenceService, PresenceStats};
