use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use common::StreamId;

use crate::{
    EventEnvelope, EventStoreError, Result, Sequence, Snapshot, Version,
    documents::{BufferedDocuments, CollectionMap, DocumentStore, ShardProgress},
    outbox::{MessageId, OutboxMessage, OutboxStore},
    projection::Projection,
    store::{EventStore, EventStream, UnitOfWork},
};

#[derive(Default)]
struct Inner {
    /// Committed events in global order.
    events: Vec<EventEnvelope>,
    next_sequence: i64,
    documents: CollectionMap,
    outbox: Vec<OutboxMessage>,
    dispatched: HashSet<MessageId>,
    progress: HashMap<String, Sequence>,
    snapshots: HashMap<StreamId, Snapshot>,
}

/// In-memory store implementation for tests and embedded use.
///
/// All state lives behind one lock, so a commit (version check, sequence
/// assignment, event append, outbox staging and inline projections) is a
/// single atomic step, mirroring the database transaction of the
/// PostgreSQL implementation. Inline projection writes are staged in a
/// buffer and only merged when every projection succeeded.
#[derive(Clone, Default)]
pub struct InMemoryEventStore {
    inner: Arc<Mutex<Inner>>,
    inline: Arc<std::sync::RwLock<Vec<Arc<dyn Projection>>>>,
}

impl InMemoryEventStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a projection to run inline, within each commit.
    pub fn register_inline(&self, projection: Arc<dyn Projection>) {
        self.inline
            .write()
            .expect("inline projection registry poisoned")
            .push(projection);
    }

    /// Returns the total number of committed events.
    pub async fn event_count(&self) -> usize {
        self.inner.lock().await.events.len()
    }

    /// Returns the number of outbox messages not yet dispatched.
    pub async fn pending_outbox_count(&self) -> usize {
        let inner = self.inner.lock().await;
        inner
            .outbox
            .iter()
            .filter(|m| !inner.dispatched.contains(&m.message_id))
            .count()
    }

    /// Clears all state.
    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        *inner = Inner::default();
    }

    fn inline_projections(&self) -> Vec<Arc<dyn Projection>> {
        self.inline
            .read()
            .expect("inline projection registry poisoned")
            .clone()
    }
}

fn current_version(events: &[EventEnvelope], stream_id: StreamId) -> Version {
    events
        .iter()
        .filter(|e| e.stream_id == stream_id)
        .map(|e| e.version)
        .max()
        .unwrap_or(Version::initial())
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn commit(&self, unit: UnitOfWork) -> Result<Version> {
        unit.validate()?;
        let projections = self.inline_projections();
        let (events, expected_version, messages) = unit.into_parts();
        let stream_id = events[0].stream_id;

        let mut inner = self.inner.lock().await;

        let actual = current_version(&inner.events, stream_id);
        if actual != expected_version {
            return Err(EventStoreError::ConcurrencyConflict {
                stream_id,
                expected: expected_version,
                actual,
            });
        }

        // Stage: assign sequences, then run inline projections against a
        // write buffer so a failure leaves the store untouched.
        let mut staged = events;
        for (offset, event) in staged.iter_mut().enumerate() {
            event.sequence = Sequence::new(inner.next_sequence + 1 + offset as i64);
        }

        let mut docs = BufferedDocuments::over(&inner.documents);
        for projection in &projections {
            for event in &staged {
                projection.apply(event, &mut docs).await?;
            }
        }
        let writes = docs.into_writes();

        // Point of no return: everything lands together.
        let new_version = staged
            .last()
            .map(|e| e.version)
            .unwrap_or(expected_version);
        let last_sequence = staged
            .last()
            .map(|e| e.sequence)
            .unwrap_or(Sequence::start());
        inner.next_sequence += staged.len() as i64;
        metrics::counter!("events_committed").increment(staged.len() as u64);
        inner.events.extend(staged);
        inner.outbox.extend(messages);
        for ((collection, key), document) in writes {
            inner
                .documents
                .entry(collection)
                .or_default()
                .insert(key, document);
        }
        // Inline shards are always current: their checkpoints move with
        // the commit itself.
        for projection in &projections {
            inner
                .progress
                .insert(projection.name().to_string(), last_sequence);
        }

        Ok(new_version)
    }

    async fn read_stream(&self, stream_id: StreamId) -> Result<Vec<EventEnvelope>> {
        let inner = self.inner.lock().await;
        let mut events: Vec<_> = inner
            .events
            .iter()
            .filter(|e| e.stream_id == stream_id)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.version);
        Ok(events)
    }

    async fn read_stream_from(
        &self,
        stream_id: StreamId,
        from_version: Version,
    ) -> Result<Vec<EventEnvelope>> {
        let inner = self.inner.lock().await;
        let mut events: Vec<_> = inner
            .events
            .iter()
            .filter(|e| e.stream_id == stream_id && e.version >= from_version)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.version);
        Ok(events)
    }

    async fn read_all_after(&self, after: Sequence, limit: usize) -> Result<Vec<EventEnvelope>> {
        let inner = self.inner.lock().await;
        let mut events: Vec<_> = inner
            .events
            .iter()
            .filter(|e| e.sequence > after)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.sequence);
        events.truncate(limit);
        Ok(events)
    }

    async fn stream_all(&self) -> Result<EventStream> {
        use futures_util::stream;

        let inner = self.inner.lock().await;
        let mut events = inner.events.clone();
        events.sort_by_key(|e| e.sequence);

        Ok(Box::pin(stream::iter(events.into_iter().map(Ok))))
    }

    async fn stream_version(&self, stream_id: StreamId) -> Result<Option<Version>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .events
            .iter()
            .filter(|e| e.stream_id == stream_id)
            .map(|e| e.version)
            .max())
    }

    async fn max_sequence(&self) -> Result<Sequence> {
        let inner = self.inner.lock().await;
        Ok(Sequence::new(inner.next_sequence))
    }

    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.snapshots.insert(snapshot.stream_id, snapshot);
        Ok(())
    }

    async fn get_snapshot(&self, stream_id: StreamId) -> Result<Option<Snapshot>> {
        let inner = self.inner.lock().await;
        Ok(inner.snapshots.get(&stream_id).cloned())
    }
}

#[async_trait]
impl DocumentStore for InMemoryEventStore {
    async fn get_document(&self, collection: &str, key: &str) -> Result<Option<Value>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .documents
            .get(collection)
            .and_then(|docs| docs.get(key))
            .cloned())
    }

    async fn upsert_document(&self, collection: &str, key: &str, document: Value) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .documents
            .entry(collection.to_string())
            .or_default()
            .insert(key.to_string(), document);
        Ok(())
    }

    async fn list_documents(&self, collection: &str) -> Result<Vec<Value>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .documents
            .get(collection)
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn clear_collection(&self, collection: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.documents.remove(collection);
        Ok(())
    }

    async fn shard_progress(&self) -> Result<Vec<ShardProgress>> {
        let inner = self.inner.lock().await;
        let mut progress: Vec<_> = inner
            .progress
            .iter()
            .map(|(shard_name, last_sequence)| ShardProgress {
                shard_name: shard_name.clone(),
                last_sequence: *last_sequence,
            })
            .collect();
        progress.sort_by(|a, b| a.shard_name.cmp(&b.shard_name));
        Ok(progress)
    }

    async fn update_shard_progress(
        &self,
        shard_name: &str,
        last_sequence: Sequence,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.progress.insert(shard_name.to_string(), last_sequence);
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for InMemoryEventStore {
    async fn pending_messages(&self, limit: usize) -> Result<Vec<OutboxMessage>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .outbox
            .iter()
            .filter(|m| !inner.dispatched.contains(&m.message_id))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_dispatched(&self, message_ids: &[MessageId]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.dispatched.extend(message_ids.iter().copied());
        Ok(())
    }
}
