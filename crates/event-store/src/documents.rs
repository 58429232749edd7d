//! Document storage for read models and projection shard checkpoints.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde_json::Value;

use crate::{Result, Sequence};

/// Checkpoint of one asynchronous projection shard: the last global
/// sequence whose read-model write has been durably committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardProgress {
    pub shard_name: String,
    pub last_sequence: Sequence,
}

/// Keyed JSON document storage, one logical table per read-model kind.
///
/// `upsert_document` on this trait is the non-transactional path used by
/// asynchronous shards and rebuilds; inline projections write through a
/// [`DocumentTx`] inside the commit instead.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetches a document by collection and key.
    async fn get_document(&self, collection: &str, key: &str) -> Result<Option<Value>>;

    /// Stores or replaces a document.
    async fn upsert_document(&self, collection: &str, key: &str, document: Value) -> Result<()>;

    /// Lists every document in a collection.
    async fn list_documents(&self, collection: &str) -> Result<Vec<Value>>;

    /// Removes every document in a collection (rebuild swap).
    async fn clear_collection(&self, collection: &str) -> Result<()>;

    /// Returns the checkpoint of every tracked shard.
    async fn shard_progress(&self) -> Result<Vec<ShardProgress>>;

    /// Advances a shard checkpoint. Callers must only do this after the
    /// corresponding read-model writes are durable.
    async fn update_shard_progress(&self, shard_name: &str, last_sequence: Sequence)
    -> Result<()>;
}

/// Transactional document access handed to inline projections during a
/// commit. Reads observe the transaction's own writes.
#[async_trait]
pub trait DocumentTx: Send {
    /// Fetches a document, seeing earlier writes in the same transaction.
    async fn get(&mut self, collection: &str, key: &str) -> Result<Option<Value>>;

    /// Stages a document write in the transaction.
    async fn upsert(&mut self, collection: &str, key: &str, document: Value) -> Result<()>;
}

/// Map of collections to their documents, as held by the in-memory store
/// and by rebuild staging buffers.
pub type CollectionMap = HashMap<String, BTreeMap<String, Value>>;

/// A [`DocumentTx`] that buffers writes over an optional committed base.
///
/// Used by the in-memory store to stage a commit (writes only land if the
/// whole unit succeeds) and, detached from any base, by projection
/// rebuilds to recompute a collection from scratch.
pub struct BufferedDocuments<'a> {
    base: Option<&'a CollectionMap>,
    writes: HashMap<(String, String), Value>,
}

impl<'a> BufferedDocuments<'a> {
    /// Creates a buffer over committed documents.
    pub fn over(base: &'a CollectionMap) -> Self {
        Self {
            base: Some(base),
            writes: HashMap::new(),
        }
    }

    /// Creates a buffer with no base: reads only observe the buffer.
    pub fn detached() -> BufferedDocuments<'static> {
        BufferedDocuments {
            base: None,
            writes: HashMap::new(),
        }
    }

    /// Number of buffered writes.
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    /// True when nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Consumes the buffer, returning the staged writes.
    pub fn into_writes(self) -> HashMap<(String, String), Value> {
        self.writes
    }
}

#[async_trait]
impl DocumentTx for BufferedDocuments<'_> {
    async fn get(&mut self, collection: &str, key: &str) -> Result<Option<Value>> {
        if let Some(doc) = self
            .writes
            .get(&(collection.to_string(), key.to_string()))
        {
            return Ok(Some(doc.clone()));
        }
        Ok(self
            .base
            .and_then(|base| base.get(collection))
            .and_then(|docs| docs.get(key))
            .cloned())
    }

    async fn upsert(&mut self, collection: &str, key: &str, document: Value) -> Result<()> {
        self.writes
            .insert((collection.to_string(), key.to_string()), document);
        Ok(())
    }
}

/// A [`DocumentTx`] that writes straight through to a [`DocumentStore`].
///
/// The catch-up path of asynchronous shards uses this: each event's writes
/// land immediately, and the shard checkpoint is advanced afterwards.
pub struct LiveDocuments<'a, S: DocumentStore + ?Sized> {
    store: &'a S,
}

impl<'a, S: DocumentStore + ?Sized> LiveDocuments<'a, S> {
    /// Wraps a document store.
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S: DocumentStore + ?Sized> DocumentTx for LiveDocuments<'_, S> {
    async fn get(&mut self, collection: &str, key: &str) -> Result<Option<Value>> {
        self.store.get_document(collection, key).await
    }

    async fn upsert(&mut self, collection: &str, key: &str, document: Value) -> Result<()> {
        self.store.upsert_document(collection, key, document).await
    }
}
