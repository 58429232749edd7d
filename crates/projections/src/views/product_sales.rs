//! Product sales read model — per-item totals across all orders.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domain::{ItemId, OrderEvent};
use event_store::{DocumentTx, EventEnvelope, Projection, Result};
use serde::{Deserialize, Serialize};

/// Document collection this view lives in.
pub const COLLECTION: &str = "product_sales";

/// Sales totals for one item, keyed by item id.
///
/// This is the multi-stream view: a single document merges OrderItemAdded
/// events from every order stream that mentions the item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductSales {
    /// The item id the document is sliced by.
    pub id: ItemId,

    /// Item display name, filled from the first event that carries one.
    pub product_name: String,

    /// Total quantity sold across all orders.
    pub total_quantity_sold: u64,

    /// The latest sale timestamp observed.
    pub last_sale_at: DateTime<Utc>,
}

/// Multi-stream projection keyed by the item id extracted from the event,
/// not by the originating stream.
#[derive(Debug, Clone, Default)]
pub struct ProductSalesProjection;

impl ProductSalesProjection {
    /// An event whose timestamp was never set (the epoch sentinel) falls
    /// back to processing time, so the view still moves forward.
    fn sale_time(occurred_at: DateTime<Utc>) -> DateTime<Utc> {
        if occurred_at == DateTime::UNIX_EPOCH {
            Utc::now()
        } else {
            occurred_at
        }
    }
}

#[async_trait]
impl Projection for ProductSalesProjection {
    fn name(&self) -> &'static str {
        "product_sales"
    }

    fn collection(&self) -> &'static str {
        COLLECTION
    }

    async fn apply(&self, event: &EventEnvelope, docs: &mut dyn DocumentTx) -> Result<()> {
        if event.stream_type != "Order" {
            return Ok(());
        }

        let order_event: OrderEvent = serde_json::from_value(event.payload.clone())?;
        let OrderEvent::OrderItemAdded(data) = order_event else {
            return Ok(());
        };

        let key = data.item_id.to_string();
        let sale_at = Self::sale_time(data.occurred_at);

        let doc = match docs.get(COLLECTION, &key).await? {
            Some(value) => {
                let mut doc: ProductSales = serde_json::from_value(value)?;
                if doc.product_name.trim().is_empty() {
                    doc.product_name = data.item_name;
                }
                doc.total_quantity_sold += u64::from(data.quantity);
                doc.last_sale_at = sale_at;
                doc
            }
            None => ProductSales {
                id: data.item_id,
                product_name: data.item_name,
                total_quantity_sold: u64::from(data.quantity),
                last_sale_at: sale_at,
            },
        };

        docs.upsert(COLLECTION, &key, serde_json::to_value(&doc)?)
            .await
    }
}
