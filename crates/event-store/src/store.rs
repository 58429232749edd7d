use std::pin::Pin;

use async_trait::async_trait;
use futures_core::Stream;

use common::StreamId;

use crate::{
    EventEnvelope, EventStoreError, Result, Sequence, Snapshot, Version, outbox::OutboxMessage,
};

/// Everything one command commits as a single atomic transactional unit:
/// the new events for one stream, the outbox messages describing them, and
/// (implicitly) the inline read-model updates the store derives from the
/// events at commit time.
///
/// The expected prior version is mandatory. An append whose expected
/// version does not match the stream's actual version at commit time is
/// rejected with [`EventStoreError::ConcurrencyConflict`], which closes the
/// check-then-append race between concurrent commands on the same stream.
#[derive(Debug, Clone)]
pub struct UnitOfWork {
    events: Vec<EventEnvelope>,
    expected_version: Version,
    messages: Vec<OutboxMessage>,
}

impl UnitOfWork {
    /// Creates a unit of work appending `events` on top of
    /// `expected_version` (0 for a stream that must not exist yet).
    pub fn append(events: Vec<EventEnvelope>, expected_version: Version) -> Self {
        Self {
            events,
            expected_version,
            messages: Vec::new(),
        }
    }

    /// Stages an outbox message for delivery after this unit commits.
    pub fn publish(mut self, message: OutboxMessage) -> Self {
        self.messages.push(message);
        self
    }

    /// Stages several outbox messages at once.
    pub fn publish_all(mut self, messages: impl IntoIterator<Item = OutboxMessage>) -> Self {
        self.messages.extend(messages);
        self
    }

    /// The events to append.
    pub fn events(&self) -> &[EventEnvelope] {
        &self.events
    }

    /// The required stream version prior to this commit.
    pub fn expected_version(&self) -> Version {
        self.expected_version
    }

    /// The staged outbox messages.
    pub fn messages(&self) -> &[OutboxMessage] {
        &self.messages
    }

    /// Splits the unit into its parts for a store implementation.
    pub fn into_parts(self) -> (Vec<EventEnvelope>, Version, Vec<OutboxMessage>) {
        (self.events, self.expected_version, self.messages)
    }

    /// Validates the shape of the unit: non-empty, a single stream, and
    /// versions sequential from `expected_version + 1`.
    pub fn validate(&self) -> Result<()> {
        let first = self
            .events
            .first()
            .ok_or_else(|| EventStoreError::InvalidCommit("no events to commit".to_string()))?;

        let mut expected = self.expected_version;
        for event in &self.events {
            if event.stream_id != first.stream_id {
                return Err(EventStoreError::InvalidCommit(
                    "all events must belong to the same stream".to_string(),
                ));
            }
            if event.stream_type != first.stream_type {
                return Err(EventStoreError::InvalidCommit(
                    "all events must have the same stream type".to_string(),
                ));
            }
            expected = expected.next();
            if event.version != expected {
                return Err(EventStoreError::InvalidCommit(format!(
                    "event versions must be sequential: expected {}, got {}",
                    expected, event.version
                )));
            }
        }

        Ok(())
    }
}

/// A stream of committed events in global order.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<EventEnvelope>> + Send>>;

/// Core contract the engine requires from its storage collaborator.
///
/// Implementations must be thread-safe (Send + Sync) and must make the
/// whole [`UnitOfWork`] (event append, outbox staging and inline
/// projection updates) durable atomically: no partial application is ever
/// observable, and nothing in the unit is visible before the commit
/// succeeds.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Commits a unit of work.
    ///
    /// Assigns global sequences to the events, applies every registered
    /// inline projection within the same transaction, and returns the new
    /// stream version. Fails with `ConcurrencyConflict` when the expected
    /// version does not match the stream's actual current version.
    async fn commit(&self, unit: UnitOfWork) -> Result<Version>;

    /// Retrieves all events of a stream, in version order.
    async fn read_stream(&self, stream_id: StreamId) -> Result<Vec<EventEnvelope>>;

    /// Retrieves a stream's events starting from a version (inclusive).
    ///
    /// Useful when replaying on top of a snapshot.
    async fn read_stream_from(
        &self,
        stream_id: StreamId,
        from_version: Version,
    ) -> Result<Vec<EventEnvelope>>;

    /// Retrieves up to `limit` events across all streams with a sequence
    /// strictly greater than `after`, in global order. The catch-up read
    /// for asynchronous projection shards.
    async fn read_all_after(&self, after: Sequence, limit: usize) -> Result<Vec<EventEnvelope>>;

    /// Streams every committed event in global order. The rebuild read.
    async fn stream_all(&self) -> Result<EventStream>;

    /// Gets the current version of a stream, or None if it has never been
    /// started.
    async fn stream_version(&self, stream_id: StreamId) -> Result<Option<Version>>;

    /// The highest committed global sequence, or the start sentinel when
    /// the log is empty.
    async fn max_sequence(&self) -> Result<Sequence>;

    /// Saves a point-in-time aggregate snapshot, replacing any prior one.
    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<()>;

    /// Retrieves the latest snapshot for a stream, if any.
    async fn get_snapshot(&self, stream_id: StreamId) -> Result<Option<Snapshot>>;
}

/// Extension trait providing convenience methods for event stores.
#[async_trait]
pub trait EventStoreExt: EventStore {
    /// Commits a single event on top of `expected_version`.
    async fn commit_one(&self, event: EventEnvelope, expected_version: Version) -> Result<Version> {
        self.commit(UnitOfWork::append(vec![event], expected_version))
            .await
    }

    /// Checks whether a stream has been started.
    async fn stream_exists(&self, stream_id: StreamId) -> Result<bool> {
        Ok(self.stream_version(stream_id).await?.is_some())
    }

    /// Loads a stream for aggregate reconstruction, optionally starting
    /// from a snapshot.
    ///
    /// If a snapshot exists, returns it together with the events recorded
    /// after it; otherwise returns None and the full stream.
    async fn load_stream(
        &self,
        stream_id: StreamId,
    ) -> Result<(Option<Snapshot>, Vec<EventEnvelope>)> {
        if let Some(snapshot) = self.get_snapshot(stream_id).await? {
            let events = self
                .read_stream_from(stream_id, snapshot.version.next())
                .await?;
            Ok((Some(snapshot), events))
        } else {
            let events = self.read_stream(stream_id).await?;
            Ok((None, events))
        }
    }
}

// Blanket implementation for all EventStore implementations
impl<T: EventStore + ?Sized> EventStoreExt for T {}
