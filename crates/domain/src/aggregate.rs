//! Core aggregate and domain event traits.

use chrono::{DateTime, Utc};
use common::StreamId;
use event_store::Version;
use serde::{Serialize, de::DeserializeOwned};

/// Trait for domain events.
///
/// Domain events are immutable facts, named in past tense. The occurrence
/// timestamp is part of the event itself, supplied by whoever produced it,
/// so replaying a stream never consults a clock.
pub trait DomainEvent: Serialize + DeserializeOwned + Send + Sync + Clone {
    /// Returns the event type name, used for routing and storage.
    fn event_type(&self) -> &'static str;

    /// Returns when the event occurred, as stated by its producer.
    fn occurred_at(&self) -> DateTime<Utc>;
}

/// Trait for event-sourced aggregates.
///
/// An aggregate is reconstructed by folding its stream's events in order,
/// and exposes behavior methods that validate invariants against that
/// in-memory state and return new events. Behavior methods never touch
/// storage.
pub trait Aggregate: Default + Send + Sync + Sized {
    /// The type of events this aggregate produces and consumes.
    type Event: DomainEvent;

    /// The type of errors this aggregate's behavior can produce.
    type Error: std::error::Error + Send + Sync;

    /// Returns the stream type name (e.g. "Order").
    fn stream_type() -> &'static str;

    /// Returns the aggregate's stream ID, or None before the first event.
    fn id(&self) -> Option<StreamId>;

    /// Returns the current version, mirroring the applied-event count.
    fn version(&self) -> Version;

    /// Sets the version; called by the command handler after load/commit.
    fn set_version(&mut self, version: Version);

    /// Folds one event into the state.
    ///
    /// Must be pure and deterministic, must not fail: events are facts
    /// that have already happened.
    fn apply(&mut self, event: Self::Event);

    /// Folds multiple events in sequence.
    fn apply_events(&mut self, events: impl IntoIterator<Item = Self::Event>) {
        for event in events {
            self.apply(event);
        }
    }
}

/// Trait for aggregates that support snapshotting.
///
/// A snapshot is purely a reconstruction accelerator: loading starts from
/// the snapshot and replays the stream's tail, and the snapshot can always
/// be discarded in favor of a full replay.
pub trait SnapshotCapable: Aggregate + Serialize + DeserializeOwned {
    /// Number of events between snapshots.
    fn snapshot_interval() -> usize {
        100
    }

    /// Whether a snapshot should be taken at the current version.
    fn should_snapshot(&self) -> bool {
        self.version().as_i64() > 0
            && (self.version().as_i64() as usize).is_multiple_of(Self::snapshot_interval())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    enum TestEvent {
        Created { at: DateTime<Utc> },
        Bumped { by: i32, at: DateTime<Utc> },
    }

    impl DomainEvent for TestEvent {
        fn event_type(&self) -> &'static str {
            match self {
                TestEvent::Created { .. } => "TestCreated",
                TestEvent::Bumped { .. } => "TestBumped",
            }
        }

        fn occurred_at(&self) -> DateTime<Utc> {
            match self {
                TestEvent::Created { at } | TestEvent::Bumped { at, .. } => *at,
            }
        }
    }

    #[derive(Debug, Default, Clone, Serialize, Deserialize)]
    struct TestAggregate {
        id: Option<StreamId>,
        value: i32,
        version: Version,
    }

    #[derive(Debug, thiserror::Error)]
    #[error("test error")]
    struct TestError;

    impl Aggregate for TestAggregate {
        type Event = TestEvent;
        type Error = TestError;

        fn stream_type() -> &'static str {
            "TestAggregate"
        }

        fn id(&self) -> Option<StreamId> {
            self.id
        }

        fn version(&self) -> Version {
            self.version
        }

        fn set_version(&mut self, version: Version) {
            self.version = version;
        }

        fn apply(&mut self, event: Self::Event) {
            match event {
                TestEvent::Created { .. } => {
                    if self.id.is_none() {
                        self.id = Some(StreamId::new());
                    }
                }
                TestEvent::Bumped { by, .. } => {
                    self.value += by;
                }
            }
        }
    }

    impl SnapshotCapable for TestAggregate {}

    #[test]
    fn apply_events_folds_in_order() {
        let mut aggregate = TestAggregate::default();
        let at = Utc::now();
        aggregate.apply_events(vec![
            TestEvent::Created { at },
            TestEvent::Bumped { by: 40, at },
            TestEvent::Bumped { by: 2, at },
        ]);

        assert!(aggregate.id().is_some());
        assert_eq!(aggregate.value, 42);
    }

    #[test]
    fn snapshot_interval_gates_should_snapshot() {
        let mut aggregate = TestAggregate::default();
        assert!(!aggregate.should_snapshot());

        aggregate.set_version(Version::new(100));
        assert!(aggregate.should_snapshot());

        aggregate.set_version(Version::new(101));
        assert!(!aggregate.should_snapshot());
    }
}
