//! Projection health monitor: a self-healing control loop over shard lag.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use event_store::{DocumentStore, EventStore};
use tokio::sync::{RwLock, watch};

use crate::daemon::ProjectionDaemon;
use crate::error::Result;

/// Per-shard health as last observed by the monitor.
///
/// Healthy (lag within threshold) -> Lagging (threshold exceeded) ->
/// Rebuilding (repair in flight) -> Healthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardHealth {
    /// Lag is within the threshold.
    Healthy,
    /// Lag exceeded the threshold; a rebuild is due.
    Lagging,
    /// A rebuild is running for this shard.
    Rebuilding,
}

/// Background loop comparing each shard's checkpoint to the global
/// high-water mark and repairing stale read models by replay.
///
/// Rebuilds are fire-and-forget: the monitor marks the shard and spawns
/// the repair, and the next polling tick is never blocked by it. Errors
/// inside one tick are caught and logged; the loop retries on the next
/// interval. Threshold and interval are policy knobs, not a hard bound on
/// lag.
pub struct ProjectionHealthMonitor<S> {
    store: S,
    daemon: ProjectionDaemon<S>,
    interval: Duration,
    lag_threshold: i64,
    health: Arc<RwLock<HashMap<String, ShardHealth>>>,
}

impl<S: Clone> Clone for ProjectionHealthMonitor<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            daemon: self.daemon.clone(),
            interval: self.interval,
            lag_threshold: self.lag_threshold,
            health: Arc::clone(&self.health),
        }
    }
}

impl<S> ProjectionHealthMonitor<S>
where
    S: EventStore + DocumentStore + Clone + Send + Sync + 'static,
{
    /// Creates a monitor with the default interval (30s) and lag
    /// threshold (1000 events).
    pub fn new(store: S, daemon: ProjectionDaemon<S>) -> Self {
        Self {
            store,
            daemon,
            interval: Duration::from_secs(30),
            lag_threshold: 1000,
            health: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Overrides the polling interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Overrides the lag threshold.
    pub fn with_lag_threshold(mut self, lag_threshold: i64) -> Self {
        self.lag_threshold = lag_threshold;
        self
    }

    /// The last observed health per shard.
    pub async fn health(&self) -> HashMap<String, ShardHealth> {
        self.health.read().await.clone()
    }

    /// Runs one health check over every tracked shard.
    #[tracing::instrument(skip(self))]
    pub async fn check_once(&self) -> Result<()> {
        let max = self.store.max_sequence().await?;
        if !max.is_assigned() {
            tracing::debug!("no events yet, skipping health check");
            return Ok(());
        }

        for shard in self.store.shard_progress().await? {
            let lag = max.lag_from(shard.last_sequence);

            if lag > self.lag_threshold {
                let mut health = self.health.write().await;
                if health.get(&shard.shard_name) == Some(&ShardHealth::Rebuilding) {
                    tracing::debug!(shard = %shard.shard_name, "rebuild already in flight");
                    continue;
                }
                health.insert(shard.shard_name.clone(), ShardHealth::Rebuilding);
                drop(health);

                tracing::warn!(
                    shard = %shard.shard_name,
                    lag,
                    threshold = self.lag_threshold,
                    "projection lagging, triggering rebuild"
                );
                metrics::counter!("projection_rebuilds_triggered").increment(1);
                self.spawn_rebuild(shard.shard_name);
            } else {
                tracing::debug!(shard = %shard.shard_name, lag, "projection healthy");
                self.health
                    .write()
                    .await
                    .insert(shard.shard_name, ShardHealth::Healthy);
            }
        }

        Ok(())
    }

    /// Fire-and-forget repair; the polling loop never waits on it.
    fn spawn_rebuild(&self, shard_name: String) {
        let daemon = self.daemon.clone();
        let health = Arc::clone(&self.health);
        tokio::spawn(async move {
            match daemon.rebuild_for_shard(&shard_name).await {
                Ok(()) => {
                    health
                        .write()
                        .await
                        .insert(shard_name.clone(), ShardHealth::Healthy);
                    tracing::info!(shard = %shard_name, "projection rebuild finished");
                }
                Err(e) => {
                    // Leave the shard marked Lagging so the next tick retries.
                    health
                        .write()
                        .await
                        .insert(shard_name.clone(), ShardHealth::Lagging);
                    tracing::error!(shard = %shard_name, error = %e, "projection rebuild failed");
                }
            }
        });
    }

    /// Runs the monitor until the shutdown signal flips.
    #[tracing::instrument(skip(self, shutdown))]
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            interval_ms = self.interval.as_millis() as u64,
            lag_threshold = self.lag_threshold,
            "projection health monitor started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.check_once().await {
                        tracing::error!(error = %e, "projection health check failed");
                    }
                }
            }
        }

        tracing::info!("projection health monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::views::ProductSalesProjection;
    use chrono::Utc;
    use common::StreamId;
    use domain::{CustomerId, DomainEvent, ItemId, OrderEvent};
    use event_store::{
        EventEnvelope, EventStore, InMemoryEventStore, Sequence, UnitOfWork, Version,
    };

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

    async fn seed_events(store: &InMemoryEventStore, item_count: usize) {
        let order_id = StreamId::new();
        let at = Utc::now();
        let mut events = vec![envelope(
            order_id,
            1,
            &OrderEvent::order_created(order_id, CustomerId::new(), "monitored", at),
        )];
        for i in 0..item_count {
            events.push(envelope(
                order_id,
                i as i64 + 2,
                &OrderEvent::order_item_added(order_id, ItemId::new(), "widget", 1, at),
            ));
        }
        store
            .commit(UnitOfWork::append(events, Version::initial()))
            .await
            .unwrap();
    }

    fn monitor(
        store: &InMemoryEventStore,
        threshold: i64,
    ) -> ProjectionHealthMonitor<InMemoryEventStore> {
        let mut daemon = ProjectionDaemon::new(store.clone());
        daemon.register(std::sync::Arc::new(ProductSalesProjection));
        ProjectionHealthMonitor::new(store.clone(), daemon).with_lag_threshold(threshold)
    }

    async fn wait_for_healthy(
        monitor: &ProjectionHealthMonitor<InMemoryEventStore>,
        shard: &str,
    ) {
        for _ in 0..100 {
            if monitor.health().await.get(shard) == Some(&ShardHealth::Healthy) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("shard {shard} never became healthy");
    }

    #[tokio::test]
    async fn empty_log_skips_the_check() {
        let store = InMemoryEventStore::new();
        let monitor = monitor(&store, 5);

        monitor.check_once().await.unwrap();
        assert!(monitor.health().await.is_empty());
    }

    #[tokio::test]
    async fn within_threshold_is_healthy() {
        let store = InMemoryEventStore::new();
        seed_events(&store, 3).await;
        store
            .update_shard_progress("product_sales", Sequence::new(2))
            .await
            .unwrap();

        let monitor = monitor(&store, 5);
        monitor.check_once().await.unwrap();

        assert_eq!(
            monitor.health().await.get("product_sales"),
            Some(&ShardHealth::Healthy)
        );
    }

    #[tokio::test]
    async fn lag_beyond_threshold_triggers_rebuild_and_recovers() {
        let store = InMemoryEventStore::new();
        seed_events(&store, 9).await; // 10 events
        store
            .update_shard_progress("product_sales", Sequence::start())
            .await
            .unwrap();

        let monitor = monitor(&store, 5);
        monitor.check_once().await.unwrap();
        wait_for_healthy(&monitor, "product_sales").await;

        // The rebuild advanced the checkpoint to the high-water mark.
        let progress = store.shard_progress().await.unwrap();
        let sales = progress
            .iter()
            .find(|p| p.shard_name == "product_sales")
            .unwrap();
        assert_eq!(sales.last_sequence, store.max_sequence().await.unwrap());

        // And the read model is populated.
        assert_eq!(store.list_documents("product_sales").await.unwrap().len(), 9);
    }

    #[tokio::test]
    async fn unknown_shard_failure_does_not_kill_the_loop() {
        let store = InMemoryEventStore::new();
        seed_events(&store, 9).await;
        // A checkpoint for a shard nobody registered.
        store
            .update_shard_progress("orphan_shard", Sequence::start())
            .await
            .unwrap();

        let monitor = monitor(&store, 5);
        monitor.check_once().await.unwrap();

        // The failed rebuild leaves the orphan marked lagging...
        for _ in 0..100 {
            if monitor.health().await.get("orphan_shard") == Some(&ShardHealth::Lagging) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            monitor.health().await.get("orphan_shard"),
            Some(&ShardHealth::Lagging)
        );

        // ...and the next tick still runs.
        monitor.check_once().await.unwrap();
    }

    #[tokio::test]
    async fn monitor_stops_on_shutdown() {
        let store = InMemoryEventStore::new();
        let monitor = monitor(&store, 5).with_interval(Duration::from_millis(10));
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(monitor.run(rx));
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("monitor did not stop")
            .unwrap();
    }
}
