use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use common::StreamId;

use crate::Version;

/// A point-in-time aggregate state at a specific stream version.
///
/// Snapshots only accelerate reconstruction: loading starts from the
/// snapshot and replays the stream's tail. The event log remains the sole
/// source of truth and a snapshot can always be discarded and recomputed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// The stream this snapshot belongs to.
    pub stream_id: StreamId,

    /// The kind of aggregate the stream holds (e.g. "Order").
    pub stream_type: String,

    /// The stream version the state was taken at.
    pub version: Version,

    /// When the snapshot was taken.
    pub taken_at: DateTime<Utc>,

    /// The serialized aggregate state.
    pub state: serde_json::Value,
}

impl Snapshot {
    /// Creates a new snapshot from raw JSON state.
    pub fn new(
        stream_id: StreamId,
        stream_type: impl Into<String>,
        version: Version,
        state: serde_json::Value,
    ) -> Self {
        Self {
            stream_id,
            stream_type: stream_type.into(),
            version,
            taken_at: Utc::now(),
            state,
        }
    }

    /// Creates a snapshot by serializing an aggregate state.
    pub fn from_state<T: Serialize>(
        stream_id: StreamId,
        stream_type: impl Into<String>,
        version: Version,
        state: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            stream_id,
            stream_type: stream_type.into(),
            version,
            taken_at: Utc::now(),
            state: serde_json::to_value(state)?,
        })
    }

    /// Deserializes the snapshot state into a concrete type.
    pub fn into_state<T: for<'de> Deserialize<'de>>(self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.state)
    }
}
