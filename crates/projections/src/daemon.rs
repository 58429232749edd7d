//! Catch-up daemon: drives asynchronous projection shards and rebuilds.

use std::sync::Arc;
use std::time::Duration;

use event_store::{
    DocumentStore, EventStore, LiveDocuments, Projection, Sequence, documents::BufferedDocuments,
};
use futures_util::StreamExt;
use tokio::sync::watch;

use crate::error::{ProjectionError, Result};

/// Point-in-time view of one shard for operational status queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectionStatus {
    /// The shard's name.
    pub shard_name: String,

    /// Last globally sequenced event the shard has processed.
    pub last_sequence: Sequence,

    /// Events between the global high-water mark and the checkpoint.
    pub lag: i64,
}

struct Shard {
    projection: Arc<dyn Projection>,
    /// False for inline projections: the commit keeps them current, the
    /// daemon only knows them for rebuild and status.
    catch_up: bool,
}

impl Clone for Shard {
    fn clone(&self) -> Self {
        Self {
            projection: Arc::clone(&self.projection),
            catch_up: self.catch_up,
        }
    }
}

/// Feeds committed events to asynchronous projection shards and rebuilds
/// read models from the full log.
///
/// Each registered shard tracks its own checkpoint: the catch-up loop
/// reads the log past it in batches, applies the events, and advances the
/// checkpoint only after the read-model writes went through. Rebuilds
/// replay the whole log into a staging buffer and swap the collection,
/// without ever pausing the write path; readers may observe a transiently
/// partial view while the swap happens.
pub struct ProjectionDaemon<S> {
    store: S,
    shards: Vec<Shard>,
    batch_size: usize,
    poll_interval: Duration,
}

impl<S: Clone> Clone for ProjectionDaemon<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            shards: self.shards.clone(),
            batch_size: self.batch_size,
            poll_interval: self.poll_interval,
        }
    }
}

impl<S> ProjectionDaemon<S>
where
    S: EventStore + DocumentStore + Clone,
{
    /// Creates a daemon with the default batch size (200) and polling
    /// interval (1s).
    pub fn new(store: S) -> Self {
        Self {
            store,
            shards: Vec::new(),
            batch_size: 200,
            poll_interval: Duration::from_secs(1),
        }
    }

    /// Overrides the catch-up batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Overrides the polling interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Registers a projection as an asynchronous shard the daemon
    /// catches up.
    pub fn register(&mut self, projection: Arc<dyn Projection>) {
        self.shards.push(Shard {
            projection,
            catch_up: true,
        });
    }

    /// Registers a projection that runs inline at commit time, so the
    /// daemon can still rebuild it and report its status.
    pub fn register_inline(&mut self, projection: Arc<dyn Projection>) {
        self.shards.push(Shard {
            projection,
            catch_up: false,
        });
    }

    /// Names of all registered shards.
    pub fn shard_names(&self) -> Vec<&'static str> {
        self.shards.iter().map(|s| s.projection.name()).collect()
    }

    async fn checkpoint(&self, shard_name: &str) -> Result<Sequence> {
        Ok(self
            .store
            .shard_progress()
            .await?
            .into_iter()
            .find(|p| p.shard_name == shard_name)
            .map(|p| p.last_sequence)
            .unwrap_or(Sequence::start()))
    }

    /// Catches every registered shard up to the current end of the log.
    ///
    /// Returns the number of events applied across all shards.
    #[tracing::instrument(skip(self))]
    pub async fn catch_up_once(&self) -> Result<u64> {
        let mut total: u64 = 0;

        for shard in self.shards.iter().filter(|s| s.catch_up) {
            let shard = &shard.projection;
            let mut checkpoint = self.checkpoint(shard.name()).await?;

            loop {
                let events = self
                    .store
                    .read_all_after(checkpoint, self.batch_size)
                    .await?;
                if events.is_empty() {
                    break;
                }

                let mut docs = LiveDocuments::new(&self.store);
                for event in &events {
                    shard.apply(event, &mut docs).await?;
                }

                // Writes are durable; only now does the checkpoint move.
                checkpoint = events.last().map(|e| e.sequence).unwrap_or(checkpoint);
                self.store
                    .update_shard_progress(shard.name(), checkpoint)
                    .await?;

                total += events.len() as u64;
                metrics::counter!("projection_events_processed")
                    .increment(events.len() as u64);

                if events.len() < self.batch_size {
                    break;
                }
            }
        }

        Ok(total)
    }

    /// Recomputes one read model from the full event history.
    ///
    /// The replay lands in a staging buffer first; the live collection is
    /// replaced afterwards and the shard checkpoint jumps to the replayed
    /// high-water mark. Repeated rebuilds converge to the same documents.
    #[tracing::instrument(skip(self))]
    pub async fn rebuild(&self, projection_name: &str) -> Result<()> {
        let shard = self
            .shards
            .iter()
            .map(|s| &s.projection)
            .find(|p| p.name() == projection_name)
            .ok_or_else(|| ProjectionError::UnknownProjection(projection_name.to_string()))?;

        tracing::info!(projection = projection_name, "projection rebuild started");

        let mut staging = BufferedDocuments::detached();
        let mut high_water = Sequence::start();
        let mut stream = self.store.stream_all().await?;
        while let Some(event) = stream.next().await {
            let event = event?;
            shard.apply(&event, &mut staging).await?;
            high_water = event.sequence;
        }
        drop(stream);

        // Swap: readers may briefly see a partial collection here, which
        // is the documented eventual-consistency window of a rebuild.
        self.store.clear_collection(shard.collection()).await?;
        let writes = staging.into_writes();
        let documents = writes.len();
        for ((collection, key), document) in writes {
            self.store
                .upsert_document(&collection, &key, document)
                .await?;
        }
        self.store
            .update_shard_progress(shard.name(), high_water)
            .await?;

        metrics::counter!("projection_rebuilds").increment(1);
        tracing::info!(
            projection = projection_name,
            documents,
            checkpoint = %high_water,
            "projection rebuild complete"
        );

        Ok(())
    }

    /// Resolves a stored shard name to a registered projection and
    /// rebuilds it. Matching is by identifier containment, so decorated
    /// shard names still resolve.
    pub async fn rebuild_for_shard(&self, shard_name: &str) -> Result<()> {
        let lowered = shard_name.to_lowercase();
        let projection = self
            .shards
            .iter()
            .map(|s| &s.projection)
            .find(|p| lowered.contains(p.name()))
            .ok_or_else(|| ProjectionError::UnknownProjection(shard_name.to_string()))?;

        let name = projection.name();
        self.rebuild(name).await
    }

    /// Status of every registered shard against the global high-water mark.
    pub async fn status(&self) -> Result<Vec<ProjectionStatus>> {
        let max = self.store.max_sequence().await?;
        let progress = self.store.shard_progress().await?;

        Ok(self
            .shards
            .iter()
            .map(|shard| {
                let name = shard.projection.name();
                let last_sequence = progress
                    .iter()
                    .find(|p| p.shard_name == name)
                    .map(|p| p.last_sequence)
                    .unwrap_or(Sequence::start());
                ProjectionStatus {
                    shard_name: name.to_string(),
                    last_sequence,
                    lag: max.lag_from(last_sequence),
                }
            })
            .collect())
    }

    /// Runs the catch-up loop until the shutdown signal flips.
    ///
    /// A failing tick is logged and retried on the next interval; the loop
    /// itself never dies.
    #[tracing::instrument(skip(self, shutdown))]
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(shards = ?self.shard_names(), "projection daemon started");

        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.catch_up_once().await {
                        tracing::error!(error = %e, "projection catch-up failed");
                    }
                }
            }
        }

        tracing::info!("projection daemon stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::views::{OrderSummaryProjection, ProductSalesProjection};
    use chrono::Utc;
    use common::StreamId;
    use domain::{CustomerId, DomainEvent, ItemId, OrderEvent};
    use event_store::{EventEnvelope, InMemoryEventStore, UnitOfWork, Version};

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

    async fn seed_order(store: &InMemoryEventStore, quantities: &[u32]) -> (StreamId, ItemId) {
        let order_id = StreamId::new();
        let item_id = ItemId::new();
        let at = Utc::now();

        let mut events = vec![envelope(
            order_id,
            1,
            &OrderEvent::order_created(order_id, CustomerId::new(), "seeded", at),
        )];
        for (i, qty) in quantities.iter().enumerate() {
            events.push(envelope(
                order_id,
                i as i64 + 2,
                &OrderEvent::order_item_added(order_id, item_id, "widget", *qty, at),
            ));
        }
        store
            .commit(UnitOfWork::append(events, Version::initial()))
            .await
            .unwrap();

        (order_id, item_id)
    }

    fn daemon(store: &InMemoryEventStore) -> ProjectionDaemon<InMemoryEventStore> {
        let mut daemon = ProjectionDaemon::new(store.clone()).with_batch_size(2);
        daemon.register(Arc::new(ProductSalesProjection));
        daemon.register(Arc::new(OrderSummaryProjection));
        daemon
    }

    #[tokio::test]
    async fn catch_up_applies_and_advances_checkpoints() {
        let store = InMemoryEventStore::new();
        let (_, item_id) = seed_order(&store, &[3, 2]).await;
        let daemon = daemon(&store);

        let processed = daemon.catch_up_once().await.unwrap();
        assert_eq!(processed, 6); // 3 events x 2 shards

        let doc = store
            .get_document("product_sales", &item_id.to_string())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc["total_quantity_sold"], 5);

        for status in daemon.status().await.unwrap() {
            assert_eq!(status.lag, 0, "shard {} lags", status.shard_name);
        }
    }

    #[tokio::test]
    async fn catch_up_is_incremental() {
        let store = InMemoryEventStore::new();
        let (_, item_id) = seed_order(&store, &[3]).await;
        let daemon = daemon(&store);

        daemon.catch_up_once().await.unwrap();
        assert_eq!(daemon.catch_up_once().await.unwrap(), 0);

        seed_order(&store, &[4]).await;
        let processed = daemon.catch_up_once().await.unwrap();
        assert_eq!(processed, 4); // 2 new events x 2 shards

        // The first item's totals were not reprocessed.
        let doc = store
            .get_document("product_sales", &item_id.to_string())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc["total_quantity_sold"], 3);
    }

    #[tokio::test]
    async fn rebuild_matches_incremental_application() {
        let store = InMemoryEventStore::new();
        seed_order(&store, &[1, 2]).await;
        seed_order(&store, &[5]).await;
        let daemon = daemon(&store);

        daemon.catch_up_once().await.unwrap();
        let mut incremental = store.list_documents("product_sales").await.unwrap();

        daemon.rebuild("product_sales").await.unwrap();
        let mut rebuilt = store.list_documents("product_sales").await.unwrap();

        let sort_key = |v: &serde_json::Value| v["id"].as_str().unwrap_or_default().to_string();
        incremental.sort_by_key(sort_key);
        rebuilt.sort_by_key(sort_key);
        assert_eq!(incremental, rebuilt);

        // Rebuild is idempotent.
        daemon.rebuild("product_sales").await.unwrap();
        let mut again = store.list_documents("product_sales").await.unwrap();
        again.sort_by_key(sort_key);
        assert_eq!(rebuilt, again);
    }

    #[tokio::test]
    async fn rebuild_advances_checkpoint_to_high_water() {
        let store = InMemoryEventStore::new();
        seed_order(&store, &[1, 2, 3]).await;
        let daemon = daemon(&store);

        daemon.rebuild("product_sales").await.unwrap();

        let status = daemon.status().await.unwrap();
        let sales = status
            .iter()
            .find(|s| s.shard_name == "product_sales")
            .unwrap();
        assert_eq!(sales.lag, 0);
        assert_eq!(
            sales.last_sequence,
            store.max_sequence().await.unwrap()
        );
    }

    #[tokio::test]
    async fn rebuild_unknown_projection_errors() {
        let store = InMemoryEventStore::new();
        let daemon = daemon(&store);

        let result = daemon.rebuild("no_such_projection").await;
        assert!(matches!(
            result,
            Err(ProjectionError::UnknownProjection(_))
        ));
    }

    #[tokio::test]
    async fn rebuild_for_shard_resolves_decorated_names() {
        let store = InMemoryEventStore::new();
        seed_order(&store, &[2]).await;
        let daemon = daemon(&store);

        daemon
            .rebuild_for_shard("ProductSales:product_sales:All")
            .await
            .unwrap();
        assert_eq!(store.list_documents("product_sales").await.unwrap().len(), 1);
    }
}
