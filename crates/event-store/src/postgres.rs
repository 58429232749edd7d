use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};
use uuid::Uuid;

use common::StreamId;

use crate::{
    EventEnvelope, EventId, EventStoreError, Result, Sequence, Snapshot, Version,
    documents::{DocumentStore, DocumentTx, ShardProgress},
    outbox::{MessageId, OutboxMessage, OutboxStore},
    projection::Projection,
    store::{EventStore, EventStream, UnitOfWork},
};

/// PostgreSQL-backed store implementation.
///
/// One commit is one database transaction: the expected-version check, the
/// event inserts (which assign the global `sequence` via bigserial), the
/// outbox inserts and every inline projection's document writes either all
/// become visible together or not at all.
#[derive(Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
    inline: Arc<std::sync::RwLock<Vec<Arc<dyn Projection>>>>,
}

impl PostgresEventStore {
    /// Creates a new PostgreSQL store.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            inline: Arc::new(std::sync::RwLock::new(Vec::new())),
        }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Registers a projection to run inline, within each commit.
    pub fn register_inline(&self, projection: Arc<dyn Projection>) {
        self.inline
            .write()
            .expect("inline projection registry poisoned")
            .push(projection);
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    fn inline_projections(&self) -> Vec<Arc<dyn Projection>> {
        self.inline
            .read()
            .expect("inline projection registry poisoned")
            .clone()
    }

    fn row_to_event(row: PgRow) -> Result<EventEnvelope> {
        Ok(EventEnvelope {
            event_id: EventId::from_uuid(row.try_get::<Uuid, _>("id")?),
            event_type: row.try_get("event_type")?,
            stream_id: StreamId::from_uuid(row.try_get::<Uuid, _>("stream_id")?),
            stream_type: row.try_get("stream_type")?,
            version: Version::new(row.try_get("version")?),
            sequence: Sequence::new(row.try_get("sequence")?),
            occurred_at: row.try_get("occurred_at")?,
            payload: row.try_get("payload")?,
        })
    }
}

/// Transactional document access over an open Postgres transaction, used
/// while applying inline projections inside a commit.
struct PgDocuments<'a> {
    tx: &'a mut Transaction<'static, Postgres>,
}

#[async_trait]
impl DocumentTx for PgDocuments<'_> {
    async fn get(&mut self, collection: &str, key: &str) -> Result<Option<Value>> {
        let doc: Option<Value> =
            sqlx::query_scalar("SELECT data FROM documents WHERE collection = $1 AND key = $2")
                .bind(collection)
                .bind(key)
                .fetch_optional(&mut **self.tx)
                .await?;
        Ok(doc)
    }

    async fn upsert(&mut self, collection: &str, key: &str, document: Value) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO documents (collection, key, data)
            VALUES ($1, $2, $3)
            ON CONFLICT (collection, key) DO UPDATE SET data = EXCLUDED.data
            "#,
        )
        .bind(collection)
        .bind(key)
        .bind(document)
        .execute(&mut **self.tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl EventStore for PostgresEventStore {
    async fn commit(&self, unit: UnitOfWork) -> Result<Version> {
        unit.validate()?;
        let projections = self.inline_projections();
        let (events, expected_version, messages) = unit.into_parts();
        let stream_id = events[0].stream_id;

        let mut tx = self.pool.begin().await?;

        let current: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM events WHERE stream_id = $1")
                .bind(stream_id.as_uuid())
                .fetch_one(&mut *tx)
                .await?;
        let actual = Version::new(current.unwrap_or(0));
        if actual != expected_version {
            return Err(EventStoreError::ConcurrencyConflict {
                stream_id,
                expected: expected_version,
                actual,
            });
        }

        let mut staged = events;
        let mut new_version = expected_version;
        for event in &mut staged {
            let sequence: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO events (id, event_type, stream_id, stream_type, version, occurred_at, payload)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                RETURNING sequence
                "#,
            )
            .bind(event.event_id.as_uuid())
            .bind(&event.event_type)
            .bind(event.stream_id.as_uuid())
            .bind(&event.stream_type)
            .bind(event.version.as_i64())
            .bind(event.occurred_at)
            .bind(&event.payload)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| {
                // A unique violation on (stream_id, version) is a writer we
                // raced against; surface it as the concurrency conflict it is.
                if let sqlx::Error::Database(ref db_err) = e
                    && db_err.constraint() == Some("unique_stream_version")
                {
                    return EventStoreError::ConcurrencyConflict {
                        stream_id,
                        expected: expected_version,
                        actual: event.version,
                    };
                }
                EventStoreError::Database(e)
            })?;

            event.sequence = Sequence::new(sequence);
            new_version = event.version;
        }

        for message in &messages {
            sqlx::query(
                r#"
                INSERT INTO outbox (message_id, event_id, event_type, stream_id, payload, enqueued_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(message.message_id.as_uuid())
            .bind(message.event_id.as_uuid())
            .bind(&message.event_type)
            .bind(message.stream_id.as_uuid())
            .bind(&message.payload)
            .bind(message.enqueued_at)
            .execute(&mut *tx)
            .await?;
        }

        {
            let mut docs = PgDocuments { tx: &mut tx };
            for projection in &projections {
                for event in &staged {
                    projection.apply(event, &mut docs).await?;
                }
            }
        }

        // Inline shards are always current: their checkpoints move in the
        // same transaction as the commit.
        let last_sequence = staged
            .last()
            .map(|e| e.sequence)
            .unwrap_or(Sequence::start());
        for projection in &projections {
            sqlx::query(
                r#"
                INSERT INTO projection_progress (shard_name, last_sequence)
                VALUES ($1, $2)
                ON CONFLICT (shard_name) DO UPDATE SET last_sequence = EXCLUDED.last_sequence
                "#,
            )
            .bind(projection.name())
            .bind(last_sequence.as_i64())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        metrics::counter!("events_committed").increment(staged.len() as u64);
        Ok(new_version)
    }

    async fn read_stream(&self, stream_id: StreamId) -> Result<Vec<EventEnvelope>> {
        let rows = sqlx::query(
            r#"
            SELECT sequence, id, event_type, stream_id, stream_type, version, occurred_at, payload
            FROM events
            WHERE stream_id = $1
            ORDER BY version ASC
            "#,
        )
        .bind(stream_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_event).collect()
    }

    async fn read_stream_from(
        &self,
        stream_id: StreamId,
        from_version: Version,
    ) -> Result<Vec<EventEnvelope>> {
        let rows = sqlx::query(
            r#"
            SELECT sequence, id, event_type, stream_id, stream_type, version, occurred_at, payload
            FROM events
            WHERE stream_id = $1 AND version >= $2
            ORDER BY version ASC
            "#,
        )
        .bind(stream_id.as_uuid())
        .bind(from_version.as_i64())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_event).collect()
    }

    async fn read_all_after(&self, after: Sequence, limit: usize) -> Result<Vec<EventEnvelope>> {
        let rows = sqlx::query(
            r#"
            SELECT sequence, id, event_type, stream_id, stream_type, version, occurred_at, payload
            FROM events
            WHERE sequence > $1
            ORDER BY sequence ASC
            LIMIT $2
            "#,
        )
        .bind(after.as_i64())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_event).collect()
    }

    async fn stream_all(&self) -> Result<EventStream> {
        use futures_util::StreamExt;

        let stream = sqlx::query(
            r#"
            SELECT sequence, id, event_type, stream_id, stream_type, version, occurred_at, payload
            FROM events
            ORDER BY sequence ASC
            "#,
        )
        .fetch(&self.pool)
        .map(|result| match result {
            Ok(row) => Self::row_to_event(row),
            Err(e) => Err(EventStoreError::Database(e)),
        });

        Ok(Box::pin(stream))
    }

    async fn stream_version(&self, stream_id: StreamId) -> Result<Option<Version>> {
        let version: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM events WHERE stream_id = $1")
                .bind(stream_id.as_uuid())
                .fetch_one(&self.pool)
                .await?;

        Ok(version.map(Version::new))
    }

    async fn max_sequence(&self) -> Result<Sequence> {
        let sequence: Option<i64> = sqlx::query_scalar("SELECT MAX(sequence) FROM events")
            .fetch_one(&self.pool)
            .await?;

        Ok(Sequence::new(sequence.unwrap_or(0)))
    }

    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO snapshots (stream_id, stream_type, version, taken_at, state)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (stream_id) DO UPDATE SET
                stream_type = EXCLUDED.stream_type,
                version = EXCLUDED.version,
                taken_at = EXCLUDED.taken_at,
                state = EXCLUDED.state
            "#,
        )
        .bind(snapshot.stream_id.as_uuid())
        .bind(&snapshot.stream_type)
        .bind(snapshot.version.as_i64())
        .bind(snapshot.taken_at)
        .bind(&snapshot.state)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_snapshot(&self, stream_id: StreamId) -> Result<Option<Snapshot>> {
        let row: Option<PgRow> = sqlx::query(
            r#"
            SELECT stream_id, stream_type, version, taken_at, state
            FROM snapshots
            WHERE stream_id = $1
            "#,
        )
        .bind(stream_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(Snapshot {
                stream_id: StreamId::from_uuid(row.try_get::<Uuid, _>("stream_id")?),
                stream_type: row.try_get("stream_type")?,
                version: Version::new(row.try_get("version")?),
                taken_at: row.try_get("taken_at")?,
                state: row.try_get("state")?,
            })),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl DocumentStore for PostgresEventStore {
    async fn get_document(&self, collection: &str, key: &str) -> Result<Option<Value>> {
        let doc: Option<Value> =
            sqlx::query_scalar("SELECT data FROM documents WHERE collection = $1 AND key = $2")
                .bind(collection)
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(doc)
    }

    async fn upsert_document(&self, collection: &str, key: &str, document: Value) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO documents (collection, key, data)
            VALUES ($1, $2, $3)
            ON CONFLICT (collection, key) DO UPDATE SET data = EXCLUDED.data
            "#,
        )
        .bind(collection)
        .bind(key)
        .bind(document)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_documents(&self, collection: &str) -> Result<Vec<Value>> {
        let docs: Vec<Value> =
            sqlx::query_scalar("SELECT data FROM documents WHERE collection = $1 ORDER BY key")
                .bind(collection)
                .fetch_all(&self.pool)
                .await?;
        Ok(docs)
    }

    async fn clear_collection(&self, collection: &str) -> Result<()> {
        sqlx::query("DELETE FROM documents WHERE collection = $1")
            .bind(collection)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn shard_progress(&self) -> Result<Vec<ShardProgress>> {
        let rows = sqlx::query(
            "SELECT shard_name, last_sequence FROM projection_progress ORDER BY shard_name",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(ShardProgress {
                    shard_name: row.try_get("shard_name")?,
                    last_sequence: Sequence::new(row.try_get("last_sequence")?),
                })
            })
            .collect()
    }

    async fn update_shard_progress(
        &self,
        shard_name: &str,
        last_sequence: Sequence,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO projection_progress (shard_name, last_sequence)
            VALUES ($1, $2)
            ON CONFLICT (shard_name) DO UPDATE SET last_sequence = EXCLUDED.last_sequence
            "#,
        )
        .bind(shard_name)
        .bind(last_sequence.as_i64())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for PostgresEventStore {
    async fn pending_messages(&self, limit: usize) -> Result<Vec<OutboxMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT message_id, event_id, event_type, stream_id, payload, enqueued_at
            FROM outbox
            WHERE dispatched_at IS NULL
            ORDER BY seq ASC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(OutboxMessage {
                    message_id: MessageId::from_uuid(row.try_get::<Uuid, _>("message_id")?),
                    event_id: EventId::from_uuid(row.try_get::<Uuid, _>("event_id")?),
                    event_type: row.try_get("event_type")?,
                    stream_id: StreamId::from_uuid(row.try_get::<Uuid, _>("stream_id")?),
                    payload: row.try_get("payload")?,
                    enqueued_at: row.try_get("enqueued_at")?,
                })
            })
            .collect()
    }

    async fn mark_dispatched(&self, message_ids: &[MessageId]) -> Result<()> {
        let ids: Vec<Uuid> = message_ids.iter().map(|id| id.as_uuid()).collect();
        sqlx::query("UPDATE outbox SET dispatched_at = NOW() WHERE message_id = ANY($1)")
            .bind(&ids)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
