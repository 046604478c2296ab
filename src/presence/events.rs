use serde::Serialize;

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DepartureReason {
    /// Explicit stop signal
    Stopped,
    /// Heartbeats stopped arriving and the sweep evicted the session
    Expired,
}

/// Presence transitions published to subscribers.
///
/// Refreshing an existing session publishes nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PresenceEvent {
    Arrived {
        item_id: String,
        viewer_id: String,
    },
    Departed {
        item_id: String,
        viewer_id: String,
        reason: DepartureReason,
    },
    /// The item's last session ended
    ItemIdle { item_id: String },
}

impl PresenceEvent {
    pub fn item_id(&self) -> &str {
        match self {
            Self::Arrived { item_id, .. }
            | Self::Departed { item_id, .. }
            | Self::ItemIdle { item_id } => item_id,
        }
    }
}
