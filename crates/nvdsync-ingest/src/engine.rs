//! Lifecycle coordinator
//!
//! [`SyncEngine`] owns the shared pieces (store, transport, decoder) and, while
//! running, one pipeline, one checkpoint store and one worker task per feed.
//! Ending a session drains the pipeline and rewrites the checkpoint document
//! if it still lists an entry whose own write was lost.
//!
//! # Example
//!
//! ```no_run
//! use nvdsync_ingest::config::EngineConfig;
//! use nvdsync_ingest::store::MemoryDocumentStore;
//! use nvdsync_ingest::SyncEngine;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = EngineConfig::default();
//! let engine = SyncEngine::new(config, Arc::new(MemoryDocumentStore::new()))?;
//!
//! engine.start().await?;
//! tokio::signal::ctrl_c().await?;
//! engine.stop().await;
//! # Ok(())
//! # }
//! ```

use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::checkpoint::CheckpointStore;
use crate::config::EngineConfig;
use crate::feed::{FeedClient, FeedDecoder, FeedTransport, NvdXmlDecoder};
use crate::pipeline::{BulkPipeline, PipelineStats};
use crate::store::DocumentStore;
use crate::worker::{CycleOutcome, FeedWorker, WorkerContext, WorkerState};
use nvdsync_common::{Result, SyncError};

/// Result of one feed's cycle in [`SyncEngine::run_once`]
#[derive(Debug)]
pub struct FeedReport {
    pub feed: String,
    pub outcome: Result<CycleOutcome>,
}

struct Session {
    cancel: CancellationToken,
    pipeline: BulkPipeline,
    checkpoints: Arc<CheckpointStore>,
    workers: Vec<Arc<FeedWorker>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Session {
    async fn drain(&self) {
        self.pipeline.flush().await;
        if let Err(e) = self.checkpoints.reconcile().await {
            warn!(error = %e, "Checkpoint document could not be reconciled");
        }
        self.pipeline.close().await;
    }
}

enum Lifecycle {
    Idle,
    Running(Session),
    /// Finished session, kept for inspection
    Stopped(Session),
}

/// Incremental feed synchronization engine
pub struct SyncEngine {
    config: EngineConfig,
    store: Arc<dyn DocumentStore>,
    transport: Arc<dyn FeedTransport>,
    decoder: Arc<dyn FeedDecoder>,
    lifecycle: Mutex<Lifecycle>,
}

impl SyncEngine {
    /// Engine with the HTTP/file transport and the NVD XML decoder
    pub fn new(config: EngineConfig, store: Arc<dyn DocumentStore>) -> Result<Self> {
        let transport = FeedClient::new(config.request_timeout)?;
        Ok(Self::with_parts(config, store, Arc::new(transport), Arc::new(NvdXmlDecoder)))
    }

    pub fn with_parts(
        config: EngineConfig,
        store: Arc<dyn DocumentStore>,
        transport: Arc<dyn FeedTransport>,
        decoder: Arc<dyn FeedDecoder>,
    ) -> Self {
        Self {
            config,
            store,
            transport,
            decoder,
            lifecycle: Mutex::new(Lifecycle::Idle),
        }
    }

    /// Create collections, build the pipeline and spawn one worker per feed
    pub async fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if matches!(*lifecycle, Lifecycle::Running(_)) {
            return Err(SyncError::AlreadyRunning);
        }

        let (pipeline, checkpoints, workers) = self.prepare().await?;
        let cancel = CancellationToken::new();

        let tasks = workers
            .iter()
            .map(|worker| {
                let worker = Arc::clone(worker);
                let cancel = cancel.child_token();
                tokio::spawn(async move { worker.run(cancel).await })
            })
            .collect();

        info!(
            name = %self.config.name,
            feeds = workers.len(),
            index = %self.config.index,
            "Sync engine started"
        );

        *lifecycle = Lifecycle::Running(Session {
            cancel,
            pipeline,
            checkpoints,
            workers,
            tasks,
        });
        Ok(())
    }

    /// Cancel the workers, drain the pipeline and wait for every worker to
    /// stop. Does nothing unless the engine is running.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        let mut session = match std::mem::replace(&mut *lifecycle, Lifecycle::Idle) {
            Lifecycle::Running(session) => session,
            other => {
                *lifecycle = other;
                debug!("Sync engine not running, nothing to stop");
                return;
            },
        };

        info!(name = %self.config.name, "Stopping sync engine");
        session.cancel.cancel();
        session.drain().await;

        for (worker, task) in session.workers.iter().zip(session.tasks.drain(..)) {
            if let Err(e) = task.await {
                error!(feed = %worker.source().name, error = %e, "Feed worker task panicked");
            }
        }

        let stats = session.pipeline.stats();
        info!(
            submitted = stats.submitted,
            succeeded = stats.succeeded,
            failed = stats.failed,
            "Sync engine stopped"
        );
        *lifecycle = Lifecycle::Stopped(session);
    }

    /// One cycle for every feed, concurrently, then drain the pipeline
    pub async fn run_once(&self) -> Result<Vec<FeedReport>> {
        let mut lifecycle = self.lifecycle.lock().await;
        if matches!(*lifecycle, Lifecycle::Running(_)) {
            return Err(SyncError::AlreadyRunning);
        }

        let (pipeline, checkpoints, workers) = self.prepare().await?;

        let reports = join_all(workers.iter().map(|worker| {
            let span = info_span!("feed_cycle", feed = %worker.source().name);
            async move {
                FeedReport {
                    feed: worker.source().name.clone(),
                    outcome: worker.run_cycle().await,
                }
            }
            .instrument(span)
        }))
        .await;

        let session = Session {
            cancel: CancellationToken::new(),
            pipeline,
            checkpoints,
            workers,
            tasks: Vec::new(),
        };
        session.drain().await;

        *lifecycle = Lifecycle::Stopped(session);
        Ok(reports)
    }

    pub async fn is_running(&self) -> bool {
        matches!(*self.lifecycle.lock().await, Lifecycle::Running(_))
    }

    /// State of each worker of the current or last session
    pub async fn worker_states(&self) -> Vec<(String, WorkerState)> {
        match &*self.lifecycle.lock().await {
            Lifecycle::Running(session) | Lifecycle::Stopped(session) => session
                .workers
                .iter()
                .map(|worker| (worker.source().name.clone(), worker.state()))
                .collect(),
            Lifecycle::Idle => Vec::new(),
        }
    }

    /// Pipeline counters of the current or last session
    pub async fn pipeline_stats(&self) -> Option<PipelineStats> {
        match &*self.lifecycle.lock().await {
            Lifecycle::Running(session) | Lifecycle::Stopped(session) => Some(session.pipeline.stats()),
            Lifecycle::Idle => None,
        }
    }

    async fn prepare(&self) -> Result<(BulkPipeline, Arc<CheckpointStore>, Vec<Arc<FeedWorker>>)> {
        self.ensure_collection(&self.config.index).await?;
        self.ensure_collection(&self.config.checkpoint.collection).await?;

        let pipeline = BulkPipeline::new(Arc::clone(&self.store), self.config.bulk.clone());
        let checkpoints = Arc::new(CheckpointStore::new(
            Arc::clone(&self.store),
            pipeline.clone(),
            &self.config.checkpoint.collection,
            &self.config.checkpoint.document_id,
        ));

        let ctx = WorkerContext {
            transport: Arc::clone(&self.transport),
            decoder: Arc::clone(&self.decoder),
            checkpoints: Arc::clone(&checkpoints),
            pipeline: pipeline.clone(),
            collection: self.config.index.clone(),
        };

        let workers = self
            .config
            .feeds
            .iter()
            .map(|source| Arc::new(FeedWorker::new(source.clone(), ctx.clone())))
            .collect();

        Ok((pipeline, checkpoints, workers))
    }

    async fn ensure_collection(&self, name: &str) -> Result<()> {
        match self.store.create_collection(name).await {
            Ok(()) => info!(collection = %name, "Collection created"),
            Err(e) if e.is_collection_exists() => debug!(collection = %name, "Collection already exists"),
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::feed::FeedSource;
    use crate::pipeline::BulkConfig;
    use crate::store::MemoryDocumentStore;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use nvdsync_common::{TransportError, WriteError};
    use serde_json::Value;
    use std::time::Duration;

    struct FixedTransport;

    #[async_trait]
    impl FeedTransport for FixedTransport {
        async fn head_last_modified(&self, _url: &str) -> std::result::Result<DateTime<Utc>, TransportError> {
            Ok(Utc.with_ymd_and_hms(2014, 7, 26, 15, 55, 3).unwrap())
        }

        async fn fetch(&self, _url: &str) -> std::result::Result<Vec<u8>, TransportError> {
            Ok(br#"<nvd><entry id="CVE-2003-0001"/><entry id="CVE-2003-0002"/></nvd>"#.to_vec())
        }
    }

    /// Refuses to create collections
    struct LockedStore;

    #[async_trait]
    impl DocumentStore for LockedStore {
        async fn create_collection(&self, _name: &str) -> std::result::Result<(), WriteError> {
            Err(WriteError::Rejected {
                status: 403,
                reason: "cluster_block_exception".to_string(),
            })
        }

        async fn get(&self, _collection: &str, _id: &str) -> std::result::Result<Option<Value>, WriteError> {
            Ok(None)
        }

        async fn bulk(
            &self,
            _operations: &[crate::store::WriteOperation],
        ) -> std::result::Result<crate::store::BulkResponse, WriteError> {
            Ok(Default::default())
        }
    }

    fn config(feeds: &[&str]) -> EngineConfig {
        EngineConfig {
            feeds: feeds
                .iter()
                .map(|name| FeedSource::new(*name, format!("http://feeds.test/{}.xml", name), Duration::from_secs(3600)))
                .collect(),
            bulk: BulkConfig {
                batch_size: 10,
                flush_interval: Duration::from_millis(100),
                max_concurrent_batches: 1,
            },
            store: StoreConfig::Memory,
            ..EngineConfig::default()
        }
    }

    fn engine(store: &Arc<MemoryDocumentStore>, feeds: &[&str]) -> SyncEngine {
        SyncEngine::with_parts(config(feeds), store.clone(), Arc::new(FixedTransport), Arc::new(NvdXmlDecoder))
    }

    async fn wait_until_sleeping(engine: &SyncEngine) {
        for _ in 0..200 {
            let states = engine.worker_states().await;
            if !states.is_empty() && states.iter().all(|(_, state)| *state == WorkerState::Sleeping) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("workers never went to sleep");
    }

    #[tokio::test]
    async fn test_start_creates_collections_and_runs_workers() {
        let store = Arc::new(MemoryDocumentStore::new());
        let engine = engine(&store, &["nvdcve-2.0-2002", "nvdcve-2.0-2003"]);

        engine.start().await.unwrap();
        assert!(engine.is_running().await);
        assert!(store.has_collection("nvd").await);
        assert!(store.has_collection("nvdsync-checkpoints").await);

        wait_until_sleeping(&engine).await;
        engine.stop().await;

        assert!(!engine.is_running().await);
        for (_, state) in engine.worker_states().await {
            assert_eq!(state, WorkerState::Stopped);
        }
        // both feeds carry the same two ids
        assert_eq!(store.count("nvd").await, 2);
        assert_eq!(engine.pipeline_stats().await.unwrap().submitted, 6);
    }

    #[tokio::test]
    async fn test_existing_collections_are_not_an_error() {
        let store = Arc::new(MemoryDocumentStore::new());
        store.create_collection("nvd").await.unwrap();
        store.create_collection("nvdsync-checkpoints").await.unwrap();
        let engine = engine(&store, &["nvdcve-2.0-2003"]);

        engine.start().await.unwrap();
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_collection_creation_failure_aborts_start() {
        let engine = SyncEngine::with_parts(
            config(&["nvdcve-2.0-2003"]),
            Arc::new(LockedStore),
            Arc::new(FixedTransport),
            Arc::new(NvdXmlDecoder),
        );

        let err = engine.start().await.unwrap_err();
        assert!(matches!(err, SyncError::Write(WriteError::Rejected { status: 403, .. })));
        assert!(!engine.is_running().await);
    }

    #[tokio::test]
    async fn test_start_twice_is_an_error() {
        let store = Arc::new(MemoryDocumentStore::new());
        let engine = engine(&store, &["nvdcve-2.0-2003"]);

        engine.start().await.unwrap();
        assert!(matches!(engine.start().await, Err(SyncError::AlreadyRunning)));
        assert!(matches!(engine.run_once().await, Err(SyncError::AlreadyRunning)));
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let store = Arc::new(MemoryDocumentStore::new());
        let engine = engine(&store, &["nvdcve-2.0-2003"]);

        engine.stop().await;
        engine.start().await.unwrap();
        engine.stop().await;
        engine.stop().await;
        assert!(!engine.is_running().await);
    }

    #[tokio::test]
    async fn test_run_once_reports_each_feed() {
        let store = Arc::new(MemoryDocumentStore::new());
        let engine = engine(&store, &["nvdcve-2.0-2002", "nvdcve-2.0-2003"]);

        let reports = engine.run_once().await.unwrap();
        assert_eq!(reports.len(), 2);
        for report in &reports {
            assert!(matches!(report.outcome, Ok(CycleOutcome::Synced { records: 2, .. })));
        }
        assert_eq!(store.count("nvd").await, 2);

        // checkpoints were flushed, so a second pass skips both feeds
        let reports = engine.run_once().await.unwrap();
        for report in &reports {
            assert!(matches!(report.outcome, Ok(CycleOutcome::Unchanged { .. })));
        }
        assert_eq!(engine.pipeline_stats().await.unwrap().submitted, 0);
    }

    #[tokio::test]
    async fn test_failed_batch_is_imported_again_next_run() {
        let store = Arc::new(MemoryDocumentStore::new());
        let engine = engine(&store, &["nvdcve-2.0-2003"]);
        store.fail_next_bulks(1);

        let reports = engine.run_once().await.unwrap();
        assert!(matches!(reports[0].outcome, Ok(CycleOutcome::Synced { records: 2, .. })));
        assert_eq!(engine.pipeline_stats().await.unwrap().batches_failed, 1);
        assert_eq!(store.count("nvd").await, 0);
        assert!(store.document("nvdsync-checkpoints", "nvd_meta").await.is_none());

        let reports = engine.run_once().await.unwrap();
        assert!(matches!(reports[0].outcome, Ok(CycleOutcome::Synced { records: 2, .. })));
        assert_eq!(store.count("nvd").await, 2);

        let reports = engine.run_once().await.unwrap();
        assert!(matches!(reports[0].outcome, Ok(CycleOutcome::Unchanged { .. })));
    }
}
