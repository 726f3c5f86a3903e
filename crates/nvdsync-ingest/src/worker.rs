//! Feed worker: the per-feed poll loop
//!
//! One worker per configured feed. Each cycle checks the remote modification
//! time, compares it with the checkpoint, and on change fetches, decodes and
//! enqueues every record before submitting the new checkpoint. Cycle errors
//! are logged and retried on the next poll; only cancellation or a closed
//! pipeline end the loop.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::checkpoint::CheckpointStore;
use crate::detector::detect;
use crate::feed::{FeedDecoder, FeedSource, FeedTransport};
use crate::pipeline::BulkPipeline;
use crate::store::{WriteOperation, RECORD_DOC_TYPE};
use nvdsync_common::{Result, SyncError};

/// Where a worker is in its cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Fetching,
    Decoding,
    Enqueuing,
    CheckpointUpdating,
    Sleeping,
    Stopped,
}

impl WorkerState {
    pub fn as_str(&self) -> &str {
        match self {
            WorkerState::Idle => "idle",
            WorkerState::Fetching => "fetching",
            WorkerState::Decoding => "decoding",
            WorkerState::Enqueuing => "enqueuing",
            WorkerState::CheckpointUpdating => "checkpoint_updating",
            WorkerState::Sleeping => "sleeping",
            WorkerState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one successful cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Remote version already imported; nothing was written
    Unchanged { last_modified: DateTime<Utc> },
    /// Records and checkpoint were submitted
    Synced {
        records: usize,
        duplicates: usize,
        last_modified: DateTime<Utc>,
    },
}

/// Collaborators a worker needs
#[derive(Clone)]
pub struct WorkerContext {
    pub transport: Arc<dyn FeedTransport>,
    pub decoder: Arc<dyn FeedDecoder>,
    pub checkpoints: Arc<CheckpointStore>,
    pub pipeline: BulkPipeline,
    /// Collection receiving the feed records
    pub collection: String,
}

/// Poll loop for a single feed
pub struct FeedWorker {
    source: FeedSource,
    ctx: WorkerContext,
    state: watch::Sender<WorkerState>,
}

impl FeedWorker {
    pub fn new(source: FeedSource, ctx: WorkerContext) -> Self {
        let (state, _) = watch::channel(WorkerState::Idle);
        Self { source, ctx, state }
    }

    pub fn source(&self) -> &FeedSource {
        &self.source
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: WorkerState) {
        self.state.send_replace(state);
    }

    /// Poll until cancelled or until the pipeline refuses writes
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            feed = %self.source.name,
            url = %self.source.url,
            poll_interval_secs = self.source.poll_interval.as_secs(),
            "Feed worker started"
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let span = info_span!("feed_cycle", feed = %self.source.name);
            match self.run_cycle().instrument(span).await {
                Ok(_) => {},
                Err(SyncError::PipelineClosed) => {
                    info!(feed = %self.source.name, "Bulk pipeline closed, stopping worker");
                    break;
                },
                Err(e) => {
                    error!(feed = %self.source.name, error = %e, "Feed cycle failed");
                },
            }

            self.set_state(WorkerState::Sleeping);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.source.poll_interval) => {},
            }
        }

        self.set_state(WorkerState::Stopped);
        info!(feed = %self.source.name, "Feed worker stopped");
    }

    /// One check-and-import pass
    pub async fn run_cycle(&self) -> Result<CycleOutcome> {
        self.set_state(WorkerState::Fetching);
        let remote = self.ctx.transport.head_last_modified(&self.source.url).await?;
        let checkpoint = self.ctx.checkpoints.load(&self.source.name).await?;

        let decision = detect(remote, checkpoint.last_modified);
        if !decision.should_sync() {
            debug!(
                remote = %remote,
                stored = ?checkpoint.last_modified,
                "Feed unchanged since last import"
            );
            return Ok(CycleOutcome::Unchanged { last_modified: remote });
        }

        info!(remote = %remote, stored = ?checkpoint.last_modified, "Feed changed, importing");
        let raw = self.ctx.transport.fetch(&self.source.url).await?;

        self.set_state(WorkerState::Decoding);
        let records = self.ctx.decoder.decode(&raw)?;
        let total = records.len();
        debug!(bytes = raw.len(), records = total, "Feed decoded");

        self.set_state(WorkerState::Enqueuing);
        let mut seen = HashSet::with_capacity(total);
        let mut duplicates = 0usize;

        for record in records {
            if !seen.insert(record.id.clone()) {
                duplicates += 1;
            }
            self.ctx
                .pipeline
                .submit(WriteOperation::upsert(
                    &self.ctx.collection,
                    RECORD_DOC_TYPE,
                    record.id,
                    record.payload,
                ))
                .await?;
        }

        if duplicates > 0 {
            warn!(duplicates, "Feed repeats record ids; the last occurrence wins");
        }

        self.set_state(WorkerState::CheckpointUpdating);
        self.ctx.checkpoints.record(&self.source, remote).await?;

        info!(records = total, last_modified = %remote, "Feed imported");
        Ok(CycleOutcome::Synced {
            records: total,
            duplicates,
            last_modified: remote,
        })
    }
}
