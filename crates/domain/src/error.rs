//! Domain error types and the error taxonomy exposed to callers.

use common::StreamId;
use event_store::EventStoreError;
use thiserror::Error;

use crate::order::OrderError;

/// Errors that can occur during command handling.
#[derive(Debug, Error)]
pub enum DomainError {
    /// An error occurred in the event store.
    #[error("event store error: {0}")]
    EventStore(#[from] EventStoreError),

    /// The order aggregate rejected the command.
    #[error("order error: {0}")]
    Order(OrderError),

    /// The targeted stream has never been started.
    #[error("{stream_type} not found: {stream_id}")]
    StreamNotFound {
        stream_type: &'static str,
        stream_id: StreamId,
    },

    /// Creation targeted a stream that already exists.
    #[error("{stream_type} already exists: {stream_id}")]
    AlreadyExists {
        stream_type: &'static str,
        stream_id: StreamId,
    },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Coarse classification of a command failure, for callers that need to
/// translate errors into their own surface (HTTP, queues, retries) without
/// matching on every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed command input; rejected before any state change.
    Validation,
    /// The aggregate's current state forbids the command.
    Conflict,
    /// The targeted stream has never been started.
    NotFound,
    /// Optimistic version mismatch at commit; reload and retry.
    Concurrency,
    /// Infrastructure failure; no partial effect was committed.
    Internal,
}

impl DomainError {
    /// Classifies this error into the caller-facing taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DomainError::Order(e) => e.kind(),
            DomainError::StreamNotFound { .. } => ErrorKind::NotFound,
            DomainError::AlreadyExists { .. } => ErrorKind::Conflict,
            DomainError::EventStore(EventStoreError::ConcurrencyConflict { .. }) => {
                ErrorKind::Concurrency
            }
            DomainError::EventStore(EventStoreError::StreamNotFound(_)) => ErrorKind::NotFound,
            DomainError::EventStore(_) | DomainError::Serialization(_) => ErrorKind::Internal,
        }
    }

    /// True for transient concurrency conflicts the caller may retry.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Concurrency
    }
}
