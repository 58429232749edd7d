//! Order timeline read model — append-only per-event audit log.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::StreamId;
use event_store::{DocumentTx, EventEnvelope, EventId, Projection, Result};
use serde::{Deserialize, Serialize};

/// Document collection this view lives in.
pub const COLLECTION: &str = "order_timeline";

/// One timeline row per committed order event.
///
/// Entries are keyed by event id and never mutated after creation, so
/// replaying the same event is a no-op rather than a duplicate. Display
/// order is by `occurred_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderTimelineEntry {
    /// The event this entry records (also the document key).
    pub id: EventId,

    /// The order the event belongs to.
    pub order_id: StreamId,

    /// Event type name for display.
    pub event_type: String,

    /// The raw event payload.
    pub payload: serde_json::Value,

    /// When the event occurred.
    pub occurred_at: DateTime<Utc>,
}

/// Event-log projection: a stateless transform, one new document per
/// event, no merge logic.
#[derive(Debug, Clone, Default)]
pub struct OrderTimelineProjection;

#[async_trait]
impl Projection for OrderTimelineProjection {
    fn name(&self) -> &'static str {
        "order_timeline"
    }

    fn collection(&self) -> &'static str {
        COLLECTION
    }

    async fn apply(&self, event: &EventEnvelope, docs: &mut dyn DocumentTx) -> Result<()> {
        if event.stream_type != "Order" {
            return Ok(());
        }

        let entry = OrderTimelineEntry {
            id: event.event_id,
            order_id: event.stream_id,
            event_type: event.event_type.clone(),
            payload: event.payload.clone(),
            occurred_at: event.occurred_at,
        };

        docs.upsert(
            COLLECTION,
            &event.event_id.to_string(),
            serde_json::to_value(&entry)?,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::{CustomerId, DomainEvent, OrderEvent};
    use event_store::{BufferedDocuments, Version};

    fn at(minute: u32) -> DateTime<Utc> {
        format!("2024-03-01T12:{minute:02}:00Z").parse().unwrap()
    }

    fn envelope(order_id: StreamId, version: i64, event: &OrderEvent) -> EventEnvelope {
        EventEnvelope::builder()
            .stream_id(order_id)
            .stream_type("Order")
            .event_type(event.event_type())
            .version(Version::new(version))
            .occurred_at(event.occurred_at())
            .payload(event)
            .unwrap()
            .build()
    }

    #[tokio::test]
    async fn one_entry_per_event() {
        let projection = OrderTimelineProjection;
        let mut docs = BufferedDocuments::detached();
        let order_id = StreamId::new();

        let created = OrderEvent::order_created(order_id, CustomerId::new(), "test", at(0));
        let shipped = OrderEvent::order_shipped(order_id, at(1));
        projection
            .apply(&envelope(order_id, 1, &created), &mut docs)
            .await
            .unwrap();
        projection
            .apply(&envelope(order_id, 2, &shipped), &mut docs)
            .await
            .unwrap();

        assert_eq!(docs.len(), 2);
    }

    #[tokio::test]
    async fn replaying_the_same_event_does_not_duplicate() {
        let projection = OrderTimelineProjection;
        let mut docs = BufferedDocuments::detached();
        let order_id = StreamId::new();

        let created = OrderEvent::order_created(order_id, CustomerId::new(), "test", at(0));
        let env = envelope(order_id, 1, &created);
        projection.apply(&env, &mut docs).await.unwrap();
        projection.apply(&env, &mut docs).await.unwrap();

        assert_eq!(docs.len(), 1);
    }

    #[tokio::test]
    async fn entry_captures_event_fields() {
        let projection = OrderTimelineProjection;
        let mut docs = BufferedDocuments::detached();
        let order_id = StreamId::new();

        let cancelled = OrderEvent::order_cancelled(order_id, "changed mind", at(3));
        let env = envelope(order_id, 2, &cancelled);
        projection.apply(&env, &mut docs).await.unwrap();

        let value = docs
            .get(COLLECTION, &env.event_id.to_string())
            .await
            .unwrap()
            .unwrap();
        let entry: OrderTimelineEntry = serde_json::from_value(value).unwrap();
        assert_eq!(entry.order_id, order_id);
        assert_eq!(entry.event_type, "OrderCancelled");
        assert_eq!(entry.occurred_at, at(3));
    }
}
