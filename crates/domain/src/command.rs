//! Command handling: load, validate, commit.

use std::marker::PhantomData;

use common::StreamId;
use event_store::{
    EventEnvelope, EventStore, EventStoreExt, OutboxMessage, Snapshot, UnitOfWork, Version,
};
use serde::Serialize;

use crate::aggregate::{Aggregate, DomainEvent, SnapshotCapable};
use crate::error::DomainError;

/// Result of command execution.
#[derive(Debug)]
pub struct CommandResult<A: Aggregate> {
    /// The aggregate after applying the new events.
    pub aggregate: A,

    /// The events that were generated and committed.
    pub events: Vec<A::Event>,

    /// The stream version after the command.
    pub new_version: Version,
}

/// Executes commands against event-sourced aggregates.
///
/// Per command: reconstruct the aggregate from its stream, run the
/// behavior closure, and commit the produced events together with one
/// outbox message per event as a single atomic unit, carrying the loaded
/// version as the commit precondition. Two commands racing on the same
/// stream therefore cannot both win: the loser's commit is rejected with a
/// concurrency conflict and the caller retries against fresh state.
pub struct CommandHandler<S, A>
where
    S: EventStore,
    A: Aggregate,
{
    store: S,
    _phantom: PhantomData<A>,
}

impl<S, A> CommandHandler<S, A>
where
    S: EventStore,
    A: Aggregate,
{
    /// Creates a new command handler over the given event store.
    pub fn new(store: S) -> Self {
        Self {
            store,
            _phantom: PhantomData,
        }
    }

    /// Returns a reference to the underlying event store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Reconstructs an aggregate from its stream, starting from a snapshot
    /// when one exists. A never-started stream yields a default instance.
    pub async fn load(&self, stream_id: StreamId) -> Result<A, DomainError>
    where
        A: for<'de> serde::Deserialize<'de>,
    {
        let (snapshot, events) = self.store.load_stream(stream_id).await?;

        let mut aggregate = if let Some(snapshot) = snapshot {
            self.restore_from_snapshot(snapshot)?
        } else {
            A::default()
        };

        for envelope in events {
            let event: A::Event = serde_json::from_value(envelope.payload)?;
            aggregate.apply(event);
            aggregate.set_version(envelope.version);
        }

        Ok(aggregate)
    }

    /// Loads an aggregate, returning None if its stream was never started.
    pub async fn load_existing(&self, stream_id: StreamId) -> Result<Option<A>, DomainError>
    where
        A: for<'de> serde::Deserialize<'de>,
    {
        let aggregate = self.load(stream_id).await?;
        if aggregate.id().is_some() {
            Ok(Some(aggregate))
        } else {
            Ok(None)
        }
    }

    /// Creation path: the stream must not exist yet.
    ///
    /// The pre-check produces a friendly `AlreadyExists`; the commit's
    /// expected-version-0 precondition catches the race the check cannot.
    pub async fn execute_new<F>(
        &self,
        stream_id: StreamId,
        command_fn: F,
    ) -> Result<CommandResult<A>, DomainError>
    where
        A: for<'de> serde::Deserialize<'de>,
        A::Event: Serialize,
        F: FnOnce(&A) -> Result<Vec<A::Event>, A::Error>,
        DomainError: From<A::Error>,
    {
        if self.store.stream_exists(stream_id).await? {
            return Err(DomainError::AlreadyExists {
                stream_type: A::stream_type(),
                stream_id,
            });
        }

        self.run(stream_id, A::default(), command_fn).await
    }

    /// Executes a command against an existing aggregate.
    ///
    /// Fails with `StreamNotFound` when the stream was never started.
    /// Behavior errors propagate unchanged.
    pub async fn execute<F>(
        &self,
        stream_id: StreamId,
        command_fn: F,
    ) -> Result<CommandResult<A>, DomainError>
    where
        A: for<'de> serde::Deserialize<'de>,
        A::Event: Serialize,
        F: FnOnce(&A) -> Result<Vec<A::Event>, A::Error>,
        DomainError: From<A::Error>,
    {
        let aggregate = self.load(stream_id).await?;
        if aggregate.id().is_none() {
            return Err(DomainError::StreamNotFound {
                stream_type: A::stream_type(),
                stream_id,
            });
        }

        self.run(stream_id, aggregate, command_fn).await
    }

    async fn run<F>(
        &self,
        stream_id: StreamId,
        mut aggregate: A,
        command_fn: F,
    ) -> Result<CommandResult<A>, DomainError>
    where
        A::Event: Serialize,
        F: FnOnce(&A) -> Result<Vec<A::Event>, A::Error>,
        DomainError: From<A::Error>,
    {
        let current_version = aggregate.version();

        let events = command_fn(&aggregate)?;

        if events.is_empty() {
            tracing::info!(%stream_id, "command produced no events, nothing to commit");
            return Ok(CommandResult {
                aggregate,
                events: vec![],
                new_version: current_version,
            });
        }

        let envelopes = self.build_envelopes(stream_id, current_version, &events)?;
        let messages: Vec<OutboxMessage> = envelopes.iter().map(OutboxMessage::for_event).collect();

        let unit = UnitOfWork::append(envelopes, current_version).publish_all(messages);
        let new_version = self.store.commit(unit).await?;

        for event in &events {
            aggregate.apply(event.clone());
        }
        aggregate.set_version(new_version);

        metrics::counter!("commands_committed").increment(1);
        tracing::info!(
            %stream_id,
            event_count = events.len(),
            %new_version,
            "committed command events"
        );

        Ok(CommandResult {
            aggregate,
            events,
            new_version,
        })
    }

    /// Builds event envelopes from domain events, versioned sequentially
    /// on top of the loaded version.
    fn build_envelopes(
        &self,
        stream_id: StreamId,
        current_version: Version,
        events: &[A::Event],
    ) -> Result<Vec<EventEnvelope>, DomainError>
    where
        A::Event: Serialize,
    {
        let mut envelopes = Vec::with_capacity(events.len());
        let mut version = current_version;

        for event in events {
            version = version.next();
            let envelope = EventEnvelope::builder()
                .stream_id(stream_id)
                .stream_type(A::stream_type())
                .event_type(event.event_type())
                .version(version)
                .occurred_at(event.occurred_at())
                .payload(event)?
                .build();
            envelopes.push(envelope);
        }

        Ok(envelopes)
    }

    fn restore_from_snapshot(&self, snapshot: Snapshot) -> Result<A, DomainError>
    where
        A: for<'de> serde::Deserialize<'de>,
    {
        let aggregate: A = serde_json::from_value(snapshot.state)?;
        Ok(aggregate)
    }
}

impl<S, A> CommandHandler<S, A>
where
    S: EventStore,
    A: SnapshotCapable,
{
    /// Executes a command against an existing aggregate and saves a
    /// snapshot when the aggregate's interval says so.
    pub async fn execute_with_snapshot<F>(
        &self,
        stream_id: StreamId,
        command_fn: F,
    ) -> Result<CommandResult<A>, DomainError>
    where
        A: for<'de> serde::Deserialize<'de>,
        A::Event: Serialize,
        F: FnOnce(&A) -> Result<Vec<A::Event>, A::Error>,
        DomainError: From<A::Error>,
    {
        let result = self.execute(stream_id, command_fn).await?;
        self.maybe_snapshot(stream_id, &result).await?;
        Ok(result)
    }

    async fn maybe_snapshot(
        &self,
        stream_id: StreamId,
        result: &CommandResult<A>,
    ) -> Result<(), DomainError> {
        if result.aggregate.should_snapshot() {
            let snapshot = Snapshot::from_state(
                stream_id,
                A::stream_type(),
                result.new_version,
                &result.aggregate,
            )?;
            self.store.save_snapshot(snapshot).await?;
            tracing::debug!(%stream_id, version = %result.new_version, "saved aggregate snapshot");
        }
        Ok(())
    }
}
