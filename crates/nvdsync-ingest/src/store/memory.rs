//! In-process document store
//!
//! Holds documents in memory with the same write semantics as the
//! Elasticsearch backend: unversioned upserts overwrite, versioned upserts only
//! apply when strictly newer. Test hooks can stall bulk requests, reject
//! specific ids, or fail whole requests.

use async_trait::async_trait;
use nvdsync_common::WriteError;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{watch, RwLock};
use tracing::debug;

use super::{BulkItemResult, BulkResponse, DocumentStore, WriteOperation};

#[derive(Debug, Clone)]
struct StoredDocument {
    doc_type: String,
    payload: Value,
    version: Option<u64>,
}

type Collection = HashMap<String, StoredDocument>;

/// Memory-backed [`DocumentStore`]
#[derive(Debug)]
pub struct MemoryDocumentStore {
    collections: RwLock<HashMap<String, Collection>>,
    rejected_ids: RwLock<HashSet<String>>,
    batch_sizes: RwLock<Vec<usize>>,
    paused: watch::Sender<bool>,
    failing_bulks: AtomicUsize,
    bulk_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            collections: RwLock::new(HashMap::new()),
            rejected_ids: RwLock::new(HashSet::new()),
            batch_sizes: RwLock::new(Vec::new()),
            paused,
            failing_bulks: AtomicUsize::new(0),
            bulk_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Stall every bulk request until [`resume`](Self::resume) is called
    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    /// Reject every future write of this id
    pub async fn reject_id(&self, id: impl Into<String>) {
        self.rejected_ids.write().await.insert(id.into());
    }

    /// Fail the next `count` bulk requests as a whole
    pub fn fail_next_bulks(&self, count: usize) {
        self.failing_bulks.store(count, Ordering::SeqCst);
    }

    pub async fn document(&self, collection: &str, id: &str) -> Option<Value> {
        self.collections
            .read()
            .await
            .get(collection)
            .and_then(|docs| docs.get(id))
            .map(|doc| doc.payload.clone())
    }

    /// Stored version and type of a document
    pub async fn document_meta(&self, collection: &str, id: &str) -> Option<(String, Option<u64>)> {
        self.collections
            .read()
            .await
            .get(collection)
            .and_then(|docs| docs.get(id))
            .map(|doc| (doc.doc_type.clone(), doc.version))
    }

    pub async fn count(&self, collection: &str) -> usize {
        self.collections
            .read()
            .await
            .get(collection)
            .map_or(0, HashMap::len)
    }

    pub async fn has_collection(&self, name: &str) -> bool {
        self.collections.read().await.contains_key(name)
    }

    /// Sizes of every bulk request received, in arrival order
    pub async fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes.read().await.clone()
    }

    /// Total operations received across all bulk requests
    pub async fn operations_received(&self) -> usize {
        self.batch_sizes.read().await.iter().sum()
    }

    pub fn bulk_calls(&self) -> usize {
        self.bulk_calls.load(Ordering::SeqCst)
    }

    /// Bulk requests currently being processed (including stalled ones)
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of concurrent bulk requests observed
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn apply(&self, operations: &[WriteOperation]) -> BulkResponse {
        let rejected = self.rejected_ids.read().await;
        let mut collections = self.collections.write().await;
        let mut items = Vec::with_capacity(operations.len());

        for op in operations {
            if rejected.contains(&op.id) {
                items.push(BulkItemResult::failed(&op.collection, &op.id, "document rejected by store"));
                continue;
            }

            let docs = collections.entry(op.collection.clone()).or_default();
            let current = docs.get(&op.id).and_then(|doc| doc.version);

            if let (Some(incoming), Some(current)) = (op.version, current) {
                if incoming <= current {
                    items.push(BulkItemResult::failed(
                        &op.collection,
                        &op.id,
                        format!(
                            "version conflict, current version [{}] is higher or equal to the one provided [{}]",
                            current, incoming
                        ),
                    ));
                    continue;
                }
            }

            docs.insert(
                op.id.clone(),
                StoredDocument {
                    doc_type: op.doc_type.clone(),
                    payload: op.payload.clone(),
                    version: op.version.or(current),
                },
            );
            items.push(BulkItemResult::ok(&op.collection, &op.id));
        }

        BulkResponse { items }
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn create_collection(&self, name: &str) -> Result<(), WriteError> {
        let mut collections = self.collections.write().await;
        if collections.contains_key(name) {
            return Err(WriteError::CollectionExists(name.to_string()));
        }
        collections.insert(name.to_string(), HashMap::new());
        Ok(())
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, WriteError> {
        Ok(self.document(collection, id).await)
    }

    async fn bulk(&self, operations: &[WriteOperation]) -> Result<BulkResponse, WriteError> {
        self.bulk_calls.fetch_add(1, Ordering::SeqCst);
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);

        let mut gate = self.paused.subscribe();
        let opened = gate.wait_for(|paused| !*paused).await.map(|_| ());

        self.batch_sizes.write().await.push(operations.len());

        let result = match opened {
            Err(_) => Err(WriteError::Transport("store gate closed".to_string())),
            Ok(()) => {
                let should_fail = self
                    .failing_bulks
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();

                if should_fail {
                    Err(WriteError::Transport("simulated bulk failure".to_string()))
                } else {
                    Ok(self.apply(operations).await)
                }
            },
        };

        debug!(operations = operations.len(), ok = result.is_ok(), "Memory bulk applied");
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
