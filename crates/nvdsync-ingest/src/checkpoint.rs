//! Per-feed sync checkpoints
//!
//! Every feed's checkpoint lives in one shared document:
//!
//! ```json
//! {
//!   "version": 7,
//!   "feeds": {
//!     "nvdcve-2.0-modified": {
//!       "url": "https://nvd.nist.gov/feeds/xml/cve/nvdcve-2.0-modified.xml",
//!       "last_modified": "2014-07-26T15:55:03Z",
//!       "synced_at": "2014-07-26T16:02:11.532Z"
//!     }
//!   }
//! }
//! ```
//!
//! Writes go through the bulk pipeline as versioned operations carrying the
//! full document, so a snapshot that reaches the store late cannot replace a
//! newer one.
//!
//! A checkpoint this process submitted only counts once the store has
//! acknowledged that exact write. Until then, and for good if the write is
//! lost, reads of that feed report the previous value and the feed version is
//! imported again on the next cycle. Feeds this process has not written are
//! read from the stored document.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::feed::FeedSource;
use crate::pipeline::{AckStatus, BulkPipeline, WriteAck};
use crate::store::{DocumentStore, WriteOperation, CHECKPOINT_DOC_TYPE};
use nvdsync_common::Result;

/// Last imported version of one feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedCheckpoint {
    pub url: String,
    /// Remote modification instant of the imported version
    pub last_modified: DateTime<Utc>,
    /// When the import was submitted
    pub synced_at: DateTime<Utc>,
}

/// The shared checkpoint document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointDocument {
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub feeds: BTreeMap<String, FeedCheckpoint>,
}

/// What a worker needs to know about its feed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub feed_name: String,
    /// `None` when the feed was never imported
    pub last_modified: Option<DateTime<Utc>>,
}

/// A submitted document version whose outcome is not known yet
struct PendingWrite {
    version: u64,
    /// Feed this write records, `None` for a rewrite
    entry: Option<(String, FeedCheckpoint)>,
    /// Everything the written document contains
    feeds: BTreeMap<String, FeedCheckpoint>,
    ack: WriteAck,
}

#[derive(Default)]
struct State {
    /// Entries reads can rely on
    confirmed: BTreeMap<String, FeedCheckpoint>,
    /// Feeds this process submitted a checkpoint for
    written: HashSet<String>,
    /// Highest document version seen or submitted
    version: u64,
    /// Version and content of the newest acknowledged document
    accepted: Option<(u64, BTreeMap<String, FeedCheckpoint>)>,
    pending: Vec<PendingWrite>,
}

impl State {
    /// Fold acknowledged writes in and drop lost ones
    fn settle(&mut self) {
        for mut write in std::mem::take(&mut self.pending) {
            match write.ack.status() {
                AckStatus::Pending => self.pending.push(write),
                AckStatus::Accepted => {
                    if let Some((name, entry)) = write.entry {
                        keep_newer(&mut self.confirmed, name, entry);
                    }
                    if self.accepted.as_ref().map_or(true, |(version, _)| write.version > *version) {
                        self.accepted = Some((write.version, write.feeds));
                    }
                },
                AckStatus::Rejected(reason) => {
                    let feed = write.entry.as_ref().map(|(name, _)| name.as_str()).unwrap_or("-");
                    warn!(
                        feed,
                        version = write.version,
                        reason = %reason,
                        "Checkpoint write was not stored, the feed will be imported again"
                    );
                },
            }
        }
    }

    /// Document content for the next write: confirmed entries overlaid with
    /// entries still in flight
    fn next_feeds(&self) -> BTreeMap<String, FeedCheckpoint> {
        let mut feeds = self.confirmed.clone();
        for write in &self.pending {
            if let Some((name, entry)) = &write.entry {
                feeds.insert(name.clone(), entry.clone());
            }
        }
        feeds
    }
}

fn keep_newer(feeds: &mut BTreeMap<String, FeedCheckpoint>, name: String, entry: FeedCheckpoint) {
    match feeds.get(&name) {
        Some(current) if current.last_modified >= entry.last_modified => {},
        _ => {
            feeds.insert(name, entry);
        },
    }
}

/// Reads and writes the shared checkpoint document
pub struct CheckpointStore {
    store: Arc<dyn DocumentStore>,
    pipeline: BulkPipeline,
    collection: String,
    document_id: String,
    state: Mutex<State>,
}

impl CheckpointStore {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        pipeline: BulkPipeline,
        collection: impl Into<String>,
        document_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            pipeline,
            collection: collection.into(),
            document_id: document_id.into(),
            state: Mutex::new(State::default()),
        }
    }

    /// Current checkpoint of a feed
    pub async fn load(&self, feed_name: &str) -> Result<Checkpoint> {
        let stored = self.fetch().await?;

        let mut state = self.state.lock().await;
        state.settle();

        if let Some(stored) = stored {
            state.version = state.version.max(stored.version);
            for (name, entry) in stored.feeds {
                if !state.written.contains(&name) {
                    keep_newer(&mut state.confirmed, name, entry);
                }
            }
        }

        Ok(Checkpoint {
            feed_name: feed_name.to_string(),
            last_modified: state.confirmed.get(feed_name).map(|entry| entry.last_modified),
        })
    }

    /// Submit a new checkpoint for a feed. Returns the document version written.
    pub async fn record(&self, source: &FeedSource, last_modified: DateTime<Utc>) -> Result<u64> {
        let entry = FeedCheckpoint {
            url: source.url.clone(),
            last_modified,
            synced_at: Utc::now(),
        };

        // held across submit so versions reach the pipeline in order
        let mut state = self.state.lock().await;
        state.settle();

        let mut feeds = state.next_feeds();
        feeds.insert(source.name.clone(), entry.clone());

        let version = state.version + 1;
        let ack = self.submit(version, &feeds).await?;

        state.version = version;
        state.written.insert(source.name.clone());
        state.pending.push(PendingWrite {
            version,
            entry: Some((source.name.clone(), entry)),
            feeds,
            ack,
        });

        debug!(feed = %source.name, version, last_modified = %last_modified, "Checkpoint submitted");
        Ok(version)
    }

    /// Rewrite the document when the newest stored version carries entries
    /// whose own write was lost. Returns whether a rewrite was submitted.
    ///
    /// Only meaningful once no checkpoint write is in flight.
    pub async fn reconcile(&self) -> Result<bool> {
        let mut state = self.state.lock().await;
        state.settle();

        if !state.pending.is_empty() {
            debug!(pending = state.pending.len(), "Checkpoint writes in flight, not reconciling");
            return Ok(false);
        }

        let stale = match &state.accepted {
            Some((_, feeds)) => *feeds != state.confirmed,
            None => false,
        };
        if !stale {
            return Ok(false);
        }

        let feeds = state.confirmed.clone();
        let version = state.version + 1;
        let ack = self.submit(version, &feeds).await?;

        state.version = version;
        state.pending.push(PendingWrite {
            version,
            entry: None,
            feeds,
            ack,
        });

        info!(version, "Checkpoint document rewritten without lost entries");
        Ok(true)
    }

    async fn submit(&self, version: u64, feeds: &BTreeMap<String, FeedCheckpoint>) -> Result<WriteAck> {
        let document = CheckpointDocument {
            version,
            feeds: feeds.clone(),
        };

        self.pipeline
            .submit_acked(WriteOperation::versioned(
                &self.collection,
                CHECKPOINT_DOC_TYPE,
                &self.document_id,
                serde_json::to_value(&document)?,
                version,
            ))
            .await
    }

    async fn fetch(&self) -> Result<Option<CheckpointDocument>> {
        let Some(raw) = self.store.get(&self.collection, &self.document_id).await? else {
            return Ok(None);
        };

        match serde_json::from_value::<CheckpointDocument>(raw) {
            Ok(document) => Ok(Some(document)),
            Err(e) => {
                warn!(
                    collection = %self.collection,
                    id = %self.document_id,
                    error = %e,
                    "Malformed checkpoint document, treating it as empty"
                );
                Ok(None)
            },
        }
    }
}
