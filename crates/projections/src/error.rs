//! Projection error types.

use thiserror::Error;

/// Errors that can occur on the query side.
#[derive(Debug, Error)]
pub enum ProjectionError {
    /// An error occurred in the event store.
    #[error("event store error: {0}")]
    EventStore(#[from] event_store::EventStoreError),

    /// Failed to (de)serialize an event payload or document.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A rebuild was requested for a projection nobody registered.
    #[error("unknown projection: {0}")]
    UnknownProjection(String),
}

/// Result type for projection operations.
pub type Result<T> = std::result::Result<T, ProjectionError>;
