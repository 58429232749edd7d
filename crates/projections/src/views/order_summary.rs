//! Order summary read model — one denormalized document per order.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::StreamId;
use domain::{CustomerId, OrderEvent};
use event_store::{DocumentTx, EventEnvelope, Projection, Result};
use serde::{Deserialize, Serialize};

/// Document collection this view lives in.
pub const COLLECTION: &str = "order_summary";

/// Denormalized summary of one order, keyed by order id.
///
/// `total_items` is the running sum of every added quantity, not
/// de-duplicated per item. Documents are created on OrderCreated, updated
/// on every later order event, and never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSummary {
    /// The order (stream) id.
    pub id: StreamId,

    /// The customer who placed the order.
    pub customer_id: CustomerId,

    /// Order description from creation.
    pub description: String,

    /// Running sum of all added quantities.
    pub total_items: u64,

    /// True once the order shipped.
    pub is_shipped: bool,

    /// True once the order was cancelled.
    pub is_cancelled: bool,

    /// occurred_at of the last event folded in.
    pub updated_at: DateTime<Utc>,
}

/// Single-stream projection: the document key is the originating order's
/// stream id. Registered inline, so queries read their own writes.
#[derive(Debug, Clone, Default)]
pub struct OrderSummaryProjection;

#[async_trait]
impl Projection for OrderSummaryProjection {
    fn name(&self) -> &'static str {
        "order_summary"
    }

    fn collection(&self) -> &'static str {
        COLLECTION
    }

    async fn apply(&self, event: &EventEnvelope, docs: &mut dyn DocumentTx) -> Result<()> {
        if event.stream_type != "Order" {
            return Ok(());
        }

        let order_event: OrderEvent = serde_json::from_value(event.payload.clone())?;
        let key = event.stream_id.to_string();

        match order_event {
            OrderEvent::OrderCreated(data) => {
                let doc = OrderSummary {
                    id: data.order_id,
                    customer_id: data.customer_id,
                    description: data.description,
                    total_items: 0,
                    is_shipped: false,
                    is_cancelled: false,
                    updated_at: data.occurred_at,
                };
                docs.upsert(COLLECTION, &key, serde_json::to_value(&doc)?)
                    .await?;
            }
            OrderEvent::OrderItemAdded(data) => {
                if let Some(value) = docs.get(COLLECTION, &key).await? {
                    let mut doc: OrderSummary = serde_json::from_value(value)?;
                    doc.total_items += u64::from(data.quantity);
                    doc.updated_at = data.occurred_at;
                    docs.upsert(COLLECTION, &key, serde_json::to_value(&doc)?)
                        .await?;
                }
            }
            OrderEvent::OrderShipped(data) => {
                if let Some(value) = docs.get(COLLECTION, &key).await? {
                    let mut doc: OrderSummary = serde_json::from_value(value)?;
                    doc.is_shipped = true;
                    doc.updated_at = data.occurred_at;
                    docs.upsert(COLLECTION, &key, serde_json::to_value(&doc)?)
                        .await?;
                }
            }
            OrderEvent::OrderCancelled(data) => {
                if let Some(value) = docs.get(COLLECTION, &key).await? {
                    let mut doc: OrderSummary = serde_json::from_value(value)?;
                    doc.is_cancelled = true;
                    doc.updated_at = data.occurred_at;
                    docs.upsert(COLLECTION, &key, serde_json::to_value(&doc)?)
                        .await?;
                }
            }
        }

        Ok(())
    }
}
