//! The projection contract shared by inline and asynchronous application.

use async_trait::async_trait;

use crate::{DocumentTx, EventEnvelope, Result};

/// Transforms committed events into read-model documents.
///
/// The same implementation serves three execution modes: inline (driven by
/// the store inside `commit`, atomic with the append), asynchronous
/// (driven by the projection daemon past a shard checkpoint), and rebuild
/// (replayed over the full log into a fresh buffer). `apply` must therefore
/// be deterministic in the event and the documents it reads, and idempotent
/// per event key where the read model requires it.
#[async_trait]
pub trait Projection: Send + Sync {
    /// Shard name this projection is tracked under (e.g. "order_summary").
    fn name(&self) -> &'static str;

    /// The document collection this projection writes.
    fn collection(&self) -> &'static str;

    /// Folds one event into the read model.
    async fn apply(&self, event: &EventEnvelope, docs: &mut dyn DocumentTx) -> Result<()>;
}
