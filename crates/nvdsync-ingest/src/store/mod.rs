//! Document store abstraction
//!
//! The engine writes through [`DocumentStore`] only. Backends:
//!
//! - [`MemoryDocumentStore`]: in-process, used by tests and `store.kind = "memory"`
//! - [`ElasticsearchStore`]: REST API (`_bulk` with external versioning)
//! - `PostgresStore`: JSONB rows, behind the `database` feature

pub mod elasticsearch;
pub mod memory;
#[cfg(feature = "database")]
pub mod postgres;

use async_trait::async_trait;
use nvdsync_common::WriteError;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

use crate::config::StoreConfig;

pub use elasticsearch::ElasticsearchStore;
pub use memory::MemoryDocumentStore;
#[cfg(feature = "database")]
pub use postgres::PostgresStore;

/// Type discriminator for feed entries
pub const RECORD_DOC_TYPE: &str = "cve";

/// Type discriminator for the checkpoint document
pub const CHECKPOINT_DOC_TYPE: &str = "checkpoint";

/// One upsert request
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOperation {
    pub collection: String,
    pub doc_type: String,
    pub id: String,
    pub payload: Value,
    /// External version. A versioned write only applies when it is strictly
    /// greater than the stored version.
    pub version: Option<u64>,
}

impl WriteOperation {
    /// Unversioned upsert: the latest write wins
    pub fn upsert(
        collection: impl Into<String>,
        doc_type: impl Into<String>,
        id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            collection: collection.into(),
            doc_type: doc_type.into(),
            id: id.into(),
            payload,
            version: None,
        }
    }

    /// Upsert guarded by an external version
    pub fn versioned(
        collection: impl Into<String>,
        doc_type: impl Into<String>,
        id: impl Into<String>,
        payload: Value,
        version: u64,
    ) -> Self {
        Self {
            version: Some(version),
            ..Self::upsert(collection, doc_type, id, payload)
        }
    }
}

/// Outcome of one item of a bulk request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkItemResult {
    pub collection: String,
    pub id: String,
    /// Rejection reason, `None` when the item was stored
    pub error: Option<String>,
}

impl BulkItemResult {
    pub fn ok(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
            error: None,
        }
    }

    pub fn failed(collection: impl Into<String>, id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
            error: Some(reason.into()),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.error.is_some()
    }
}

/// Per-item results of a bulk request, in request order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkResponse {
    pub items: Vec<BulkItemResult>,
}

impl BulkResponse {
    pub fn has_failures(&self) -> bool {
        self.items.iter().any(BulkItemResult::is_failure)
    }

    pub fn failures(&self) -> impl Iterator<Item = &BulkItemResult> {
        self.items.iter().filter(|item| item.is_failure())
    }
}

/// Open the backend selected in the configuration
pub async fn open_store(
    config: &StoreConfig,
    timeout: std::time::Duration,
) -> nvdsync_common::Result<Arc<dyn DocumentStore>> {
    match config {
        StoreConfig::Elasticsearch { url } => {
            info!(url = %url, "Using Elasticsearch document store");
            Ok(Arc::new(ElasticsearchStore::new(url, timeout)?))
        },
        StoreConfig::Memory => {
            info!("Using in-memory document store");
            Ok(Arc::new(MemoryDocumentStore::new()))
        },
        #[cfg(feature = "database")]
        StoreConfig::Postgres { url, max_connections } => {
            info!("Using PostgreSQL document store");
            Ok(Arc::new(PostgresStore::connect(url, *max_connections, timeout).await?))
        },
        #[cfg(not(feature = "database"))]
        StoreConfig::Postgres { .. } => Err(nvdsync_common::SyncError::Config(
            "the postgres store requires the `database` feature".to_string(),
        )),
    }
}

/// Backend that stores JSON documents in named collections
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Create a collection. An existing collection is reported as
    /// [`WriteError::CollectionExists`].
    async fn create_collection(&self, name: &str) -> Result<(), WriteError>;

    /// Fetch a document by id
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, WriteError>;

    /// Apply a batch of upserts. An `Err` means the whole request failed;
    /// individual rejections are reported in the response.
    async fn bulk(&self, operations: &[WriteOperation]) -> Result<BulkResponse, WriteError>;
}
