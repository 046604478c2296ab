use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::errors::{PresenceError, Result};

/// Timing and sizing knobs for the presence engine.
///
/// Durations deserialize from integer milliseconds, e.g.
/// `{"liveness_threshold": 15000, "sweep_interval": 10000}`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// Maximum heartbeat age before a session stops counting as live
    #[serde(with = "millis")]
    pub liveness_threshold: Duration,
    /// Interval at which clients are expected to send heartbeats
    #[serde(with = "millis")]
    pub heartbeat_interval: Duration,
    /// Period of the background eviction sweep
    #[serde(with = "millis")]
    pub sweep_interval: Duration,
    /// Number of independently locked shards in the session index
    pub shard_amount: usize,
    /// Capacity of the presence event channel
    pub event_buffer: usize,
    /// Rebuild a valid aggregate snapshot once it is older than this
    #[serde(with = "millis_opt")]
    pub snapshot_max_age: Option<Duration>,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            liveness_threshold: Duration::from_secs(15),
            heartbeat_interval: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(10),
            shard_amount: 64,
            event_buffer: 1024,
            snapshot_max_age: None,
        }
    }
}

impl PresenceConfig {
    pub const ENV_LIVENESS_THRESHOLD_MS: &'static str = "PRESENCE_LIVENESS_THRESHOLD_MS";
    pub const ENV_HEARTBEAT_INTERVAL_MS: &'static str = "PRESENCE_HEARTBEAT_INTERVAL_MS";
    pub const ENV_SWEEP_INTERVAL_MS: &'static str = "PRESENCE_SWEEP_INTERVAL_MS";
    pub const ENV_SHARDS: &'static str = "PRESENCE_SHARDS";
    pub const ENV_EVENT_BUFFER: &'static str = "PRESENCE_EVENT_BUFFER";
    pub const ENV_SNAPSHOT_MAX_AGE_MS: &'static str = "PRESENCE_SNAPSHOT_MAX_AGE_MS";

    /// Build a config from `PRESENCE_*` environment variables.
    ///
    /// Unset variables keep their defaults. A variable that is set but does
    /// not parse is reported rather than silently ignored.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(ms) = parse_var::<u64, _>(&lookup, Self::ENV_LIVENESS_THRESHOLD_MS)? {
            config.liveness_threshold = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, Self::ENV_HEARTBEAT_INTERVAL_MS)? {
            config.heartbeat_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, Self::ENV_SWEEP_INTERVAL_MS)? {
            config.sweep_interval = Duration::from_millis(ms);
        }
        if let Some(shards) = parse_var(&lookup, Self::ENV_SHARDS)? {
            config.shard_amount = shards;
        }
        if let Some(buffer) = parse_var(&lookup, Self::ENV_EVENT_BUFFER)? {
            config.event_buffer = buffer;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, Self::ENV_SNAPSHOT_MAX_AGE_MS)? {
            config.snapshot_max_age = (ms > 0).then(|| Duration::from_millis(ms));
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_liveness_threshold(mut self, threshold: Duration) -> Self {
        self.liveness_threshold = threshold;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_shard_amount(mut self, shard_amount: usize) -> Self {
        self.shard_amount = shard_amount;
        self
    }

    pub fn with_event_buffer(mut self, event_buffer: usize) -> Self {
        self.event_buffer = event_buffer;
        self
    }

    pub fn with_snapshot_max_age(mut self, max_age: Option<Duration>) -> Self {
        self.snapshot_max_age = max_age;
        self
    }

    /// Check the timing relationships the engine depends on.
    ///
    /// heartbeat interval < liveness threshold, and
    /// 0 < sweep interval < liveness threshold.
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval.is_zero() {
            return Err(PresenceError::invalid_config(
                "heartbeat_interval",
                "must be greater than zero",
            ));
        }
        if self.liveness_threshold <= self.heartbeat_interval {
            return Err(PresenceError::invalid_config(
                "liveness_threshold",
                format!(
                    "{:?} must exceed the heartbeat interval {:?}",
                    self.liveness_threshold, self.heartbeat_interval
                ),
            ));
        }
        if self.sweep_interval.is_zero() || self.sweep_interval >= self.liveness_threshold {
            return Err(PresenceError::invalid_config(
                "sweep_interval",
                format!(
                    "{:?} must be non-zero and below the liveness threshold {:?}",
                    self.sweep_interval, self.liveness_threshold
                ),
            ));
        }
        // dashmap requires a power of two greater than one
        if self.shard_amount < 2 || !self.shard_amount.is_power_of_two() {
            return Err(PresenceError::invalid_config(
                "shard_amount",
                format!("{} is not a power of two >= 2", self.shard_amount),
            ));
        }
        if self.event_buffer == 0 {
            return Err(PresenceError::invalid_config(
                "event_buffer",
                "must be greater than zero",
            ));
        }
        Ok(())
    }

    /// Worst-case lifetime of an abandoned session before eviction.
    pub fn max_stale_lifetime(&self) -> Duration {
        self.liveness_threshold + self.sweep_interval
    }
}

fn parse_var<T, F>(lookup: &F, key: &'static str) -> Result<Option<T>>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| PresenceError::invalid_config(key, format!("cannot parse {raw:?}"))),
    }
}

mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod millis_opt {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
