//! Storage contract for the event-sourced order engine.
//!
//! The canonical write surface is the event log: streams of immutable
//! events with per-stream versions and a global commit sequence. Everything
//! else a command produces (outbox messages and inline read-model updates)
//! is carried in the same [`UnitOfWork`] and becomes durable atomically with
//! the events, or not at all.

pub mod documents;
pub mod error;
pub mod event;
pub mod memory;
pub mod outbox;
pub mod postgres;
pub mod projection;
pub mod snapshot;
pub mod store;

pub use common::StreamId;
pub use documents::{BufferedDocuments, DocumentStore, DocumentTx, LiveDocuments, ShardProgress};
pub use error::{EventStoreError, Result};
pub use event::{EventEnvelope, EventEnvelopeBuilder, EventId, Sequence, Version};
pub use memory::InMemoryEventStore;
pub use outbox::{
    LogPublisher, MessageId, MessagePublisher, OutboxMessage, OutboxRelay, OutboxStore,
    PublishError,
};
pub use postgres::PostgresEventStore;
pub use projection::Projection;
pub use snapshot::Snapshot;
pub use store::{EventStore, EventStoreExt, EventStream, UnitOfWork};
