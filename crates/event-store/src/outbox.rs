//! Transactional outbox: messages become durable with the commit that
//! produced their events, and are forwarded to transport afterwards.
//!
//! Staging a message via [`crate::UnitOfWork::publish`] guarantees it is
//! observable to subscribers if and only if the events it describes were
//! committed, so the classic dual-write bug (event persisted, notification
//! lost, or vice versa) cannot happen. Delivery from the durable outbox is
//! at-least-once: the relay marks a message dispatched only after the
//! transport accepted it, so a crash in between redelivers.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

use common::StreamId;

use crate::{EventEnvelope, EventId, Result};

/// Unique identifier for an outbox message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Creates a new random message ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a message ID from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A staged notification describing one committed event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxMessage {
    /// Unique identifier for this message.
    pub message_id: MessageId,

    /// The event this message describes.
    pub event_id: EventId,

    /// The event type name, used by subscribers for routing.
    pub event_type: String,

    /// The stream the event belongs to.
    pub stream_id: StreamId,

    /// The event payload as JSON.
    pub payload: serde_json::Value,

    /// When the message was staged.
    pub enqueued_at: DateTime<Utc>,
}

impl OutboxMessage {
    /// Builds the message describing an event envelope.
    pub fn for_event(envelope: &EventEnvelope) -> Self {
        Self {
            message_id: MessageId::new(),
            event_id: envelope.event_id,
            event_type: envelope.event_type.clone(),
            stream_id: envelope.stream_id,
            payload: envelope.payload.clone(),
            enqueued_at: Utc::now(),
        }
    }
}

/// Durable outbox storage, written as part of the commit and drained by
/// the relay.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Returns up to `limit` committed messages not yet dispatched, oldest
    /// first.
    async fn pending_messages(&self, limit: usize) -> Result<Vec<OutboxMessage>>;

    /// Marks messages as dispatched so they are not delivered again.
    async fn mark_dispatched(&self, message_ids: &[MessageId]) -> Result<()>;
}

/// Error delivering a message to downstream transport.
#[derive(Debug, Error)]
pub enum PublishError {
    /// The transport rejected or failed to accept the message.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Downstream transport for committed outbox messages.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    /// Delivers one message. Returning an error leaves the message pending
    /// for redelivery.
    async fn publish(&self, message: &OutboxMessage) -> std::result::Result<(), PublishError>;
}

/// A publisher that logs deliveries instead of sending them anywhere.
///
/// Stands in for a real transport in embedded and test setups.
#[derive(Debug, Clone, Default)]
pub struct LogPublisher;

#[async_trait]
impl MessagePublisher for LogPublisher {
    async fn publish(&self, message: &OutboxMessage) -> std::result::Result<(), PublishError> {
        tracing::info!(
            message_id = %message.message_id,
            event_type = %message.event_type,
            stream_id = %message.stream_id,
            "outbox message delivered"
        );
        Ok(())
    }
}

/// Background task forwarding committed outbox messages to a publisher.
///
/// Polls the durable outbox on a fixed interval; a delivery failure stops
/// the current batch and the remaining messages are retried on the next
/// tick. Shuts down cooperatively via the watch channel.
pub struct OutboxRelay<S, P> {
    store: S,
    publisher: P,
    poll_interval: Duration,
    batch_size: usize,
}

impl<S, P> OutboxRelay<S, P>
where
    S: OutboxStore,
    P: MessagePublisher,
{
    /// Creates a relay with the default polling interval (1s) and batch
    /// size (100).
    pub fn new(store: S, publisher: P) -> Self {
        Self {
            store,
            publisher,
            poll_interval: Duration::from_secs(1),
            batch_size: 100,
        }
    }

    /// Overrides the polling interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Overrides the batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Delivers one batch of pending messages.
    ///
    /// Returns the number of messages dispatched. Messages are marked
    /// dispatched one by one, after the publisher accepted them.
    pub async fn drain_once(&self) -> Result<usize> {
        let pending = self.store.pending_messages(self.batch_size).await?;
        if pending.is_empty() {
            return Ok(0);
        }

        let mut dispatched = 0;
        for message in &pending {
            match self.publisher.publish(message).await {
                Ok(()) => {
                    self.store.mark_dispatched(&[message.message_id]).await?;
                    dispatched += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        message_id = %message.message_id,
                        error = %e,
                        "outbox delivery failed, will retry"
                    );
                    break;
                }
            }
        }

        if dispatched > 0 {
            metrics::counter!("outbox_messages_dispatched").increment(dispatched as u64);
            tracing::debug!(dispatched, "outbox batch drained");
        }

        Ok(dispatched)
    }

    /// Runs the relay until the shutdown signal flips.
    #[tracing::instrument(skip(self, shutdown))]
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            interval_ms = self.poll_interval.as_millis() as u64,
            batch_size = self.batch_size,
            "outbox relay started"
        );

        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.drain_once().await {
                        tracing::error!(error = %e, "outbox relay tick failed");
                    }
                }
            }
        }

        tracing::info!("outbox relay stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Mutex;

    /// Publisher that records deliveries and can be told to fail.
    #[derive(Clone, Default)]
    pub(crate) struct RecordingPublisher {
        delivered: Arc<Mutex<Vec<OutboxMessage>>>,
        fail: Arc<AtomicBool>,
    }

    impl RecordingPublisher {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn set_fail(&self, fail: bool) {
            self.fail.store(fail, Ordering::SeqCst);
        }

        pub(crate) async fn delivered(&self) -> Vec<OutboxMessage> {
            self.delivered.lock().await.clone()
        }
    }

    #[async_trait]
    impl MessagePublisher for RecordingPublisher {
        async fn publish(&self, message: &OutboxMessage) -> std::result::Result<(), PublishError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(PublishError::Transport("injected failure".to_string()));
            }
            self.delivered.lock().await.push(message.clone());
            Ok(())
        }
    }

    fn message(event_type: &str) -> OutboxMessage {
        OutboxMessage {
            message_id: MessageId::new(),
            event_id: EventId::new(),
            event_type: event_type.to_string(),
            stream_id: StreamId::new(),
            payload: serde_json::json!({}),
            enqueued_at: Utc::now(),
        }
    }

    /// Minimal outbox store over a shared vec for relay unit tests.
    #[derive(Clone, Default)]
    struct VecOutbox {
        pending: Arc<Mutex<Vec<OutboxMessage>>>,
    }

    #[async_trait]
    impl OutboxStore for VecOutbox {
        async fn pending_messages(&self, limit: usize) -> Result<Vec<OutboxMessage>> {
            Ok(self.pending.lock().await.iter().take(limit).cloned().collect())
        }

        async fn mark_dispatched(&self, message_ids: &[MessageId]) -> Result<()> {
            self.pending
                .lock()
                .await
                .retain(|m| !message_ids.contains(&m.message_id));
            Ok(())
        }
    }

    #[tokio::test]
    async fn drain_delivers_and_marks() {
        let outbox = VecOutbox::default();
        outbox.pending.lock().await.push(message("OrderCreated"));
        outbox.pending.lock().await.push(message("OrderShipped"));

        let publisher = RecordingPublisher::new();
        let relay = OutboxRelay::new(outbox.clone(), publisher.clone());

        let dispatched = relay.drain_once().await.unwrap();
        assert_eq!(dispatched, 2);
        assert_eq!(publisher.delivered().await.len(), 2);
        assert!(outbox.pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn failed_delivery_stays_pending() {
        let outbox = VecOutbox::default();
        outbox.pending.lock().await.push(message("OrderCreated"));

        let publisher = RecordingPublisher::new();
        publisher.set_fail(true);
        let relay = OutboxRelay::new(outbox.clone(), publisher.clone());

        let dispatched = relay.drain_once().await.unwrap();
        assert_eq!(dispatched, 0);
        assert_eq!(outbox.pending.lock().await.len(), 1);

        // Next tick retries and succeeds: at-least-once, never lost.
        publisher.set_fail(false);
        let dispatched = relay.drain_once().await.unwrap();
        assert_eq!(dispatched, 1);
        assert!(outbox.pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn relay_stops_on_shutdown() {
        let relay = OutboxRelay::new(VecOutbox::default(), RecordingPublisher::new())
            .with_poll_interval(Duration::from_millis(10));
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(relay.run(rx));
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("relay did not stop")
            .unwrap();
    }
}
