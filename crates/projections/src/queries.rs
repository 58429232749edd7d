//! Read-model query accessors.

use common::StreamId;
use domain::ItemId;
use event_store::DocumentStore;

use crate::Result;
use crate::views::{OrderSummary, OrderTimelineEntry, ProductSales, order_summary,
    order_timeline, product_sales};

/// Query access to the read-model collections.
///
/// Reads go straight to the document store: the order summary is updated
/// inline with each commit and reflects the latest committed write, while
/// the asynchronous views trail their shard checkpoints.
pub struct ReadModelQueries<S: DocumentStore> {
    store: S,
}

impl<S: DocumentStore> ReadModelQueries<S> {
    /// Creates query accessors over the given document store.
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Fetches one order summary.
    #[tracing::instrument(skip(self))]
    pub async fn get_order_summary(&self, order_id: StreamId) -> Result<Option<OrderSummary>> {
        let doc = self
            .store
            .get_document(order_summary::COLLECTION, &order_id.to_string())
            .await?;
        Ok(doc.map(serde_json::from_value).transpose()?)
    }

    /// Lists every order summary.
    #[tracing::instrument(skip(self))]
    pub async fn list_orders(&self) -> Result<Vec<OrderSummary>> {
        self.store
            .list_documents(order_summary::COLLECTION)
            .await?
            .into_iter()
            .map(|doc| Ok(serde_json::from_value(doc)?))
            .collect()
    }

    /// Fetches one order's timeline, ordered by occurrence time.
    #[tracing::instrument(skip(self))]
    pub async fn get_timeline(&self, order_id: StreamId) -> Result<Vec<OrderTimelineEntry>> {
        let mut entries: Vec<OrderTimelineEntry> = self
            .store
            .list_documents(order_timeline::COLLECTION)
            .await?
            .into_iter()
            .map(serde_json::from_value)
            .collect::<std::result::Result<_, _>>()?;

        entries.retain(|entry| entry.order_id == order_id);
        entries.sort_by_key(|entry| entry.occurred_at);
        Ok(entries)
    }

    /// Fetches sales totals for one item.
    #[tracing::instrument(skip(self))]
    pub async fn get_product_sales(&self, item_id: ItemId) -> Result<Option<ProductSales>> {
        let doc = self
            .store
            .get_document(product_sales::COLLECTION, &item_id.to_string())
            .await?;
        Ok(doc.map(serde_json::from_value).transpose()?)
    }

    /// The `n` best-selling items, descending by total quantity sold.
    ///
    /// `n` is clamped to 1..=100.
    #[tracing::instrument(skip(self))]
    pub async fn top_products(&self, n: usize) -> Result<Vec<ProductSales>> {
        let n = n.clamp(1, 100);

        let mut products: Vec<ProductSales> = self
            .store
            .list_documents(product_sales::COLLECTION)
            .await?
            .into_iter()
            .map(serde_json::from_value)
            .collect::<std::result::Result<_, _>>()?;

        products.sort_by(|a, b| b.total_quantity_sold.cmp(&a.total_quantity_sold));
        products.truncate(n);
        Ok(products)
    }
}
