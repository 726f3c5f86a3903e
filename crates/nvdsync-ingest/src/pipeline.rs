//! Bulk write pipeline
//!
//! Write operations from every feed worker land in one open batch. A batch is
//! dispatched to the [`DocumentStore`] when it reaches `batch_size`, when the
//! flush timer fires, or when the pipeline is closed. At most
//! `max_concurrent_batches` bulk requests run at once; a submitter that fills
//! a batch while all permits are taken waits for one to free up. That wait is
//! the only backpressure in the engine.
//!
//! Failures never propagate back to submitters. A failed bulk request is logged
//! and dropped (the next poll cycle is the retry), rejected items are logged
//! with their id, and both are counted in [`PipelineStats`]. A submitter that
//! needs to know whether its operation was stored uses
//! [`BulkPipeline::submit_acked`] and polls the returned [`WriteAck`].

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::task_tracker::TaskTrackerToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::store::{DocumentStore, WriteOperation};
use nvdsync_common::{Result, SyncError};

/// Default number of operations per bulk request
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Default time after which a partial batch is flushed
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Default number of bulk requests allowed in flight
pub const DEFAULT_MAX_CONCURRENT_BATCHES: usize = 1;

/// Batching limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BulkConfig {
    /// Operations per bulk request
    pub batch_size: usize,
    /// Flush cadence for partial batches
    #[serde(with = "millis_string")]
    pub flush_interval: Duration,
    /// Bulk requests allowed in flight
    pub max_concurrent_batches: usize,
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            max_concurrent_batches: DEFAULT_MAX_CONCURRENT_BATCHES,
        }
    }
}

/// Counter snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    /// Operations accepted by `submit`
    pub submitted: u64,
    /// Bulk requests the store answered
    pub batches_flushed: u64,
    /// Bulk requests that failed as a whole
    pub batches_failed: u64,
    /// Operations the store accepted
    pub succeeded: u64,
    /// Operations rejected individually or lost with a failed request
    pub failed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    batches_flushed: AtomicU64,
    batches_failed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Why a batch left the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushTrigger {
    Size,
    Timer,
    Drain,
    Close,
}

impl fmt::Display for FlushTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlushTrigger::Size => write!(f, "size"),
            FlushTrigger::Timer => write!(f, "timer"),
            FlushTrigger::Drain => write!(f, "drain"),
            FlushTrigger::Close => write!(f, "close"),
        }
    }
}

type AckSender = oneshot::Sender<std::result::Result<(), String>>;

/// Store outcome of one operation queued with [`BulkPipeline::submit_acked`]
#[derive(Debug)]
pub struct WriteAck {
    receiver: oneshot::Receiver<std::result::Result<(), String>>,
}

/// What is known about an acknowledged operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckStatus {
    /// Still queued or in flight
    Pending,
    /// Stored
    Accepted,
    /// Rejected by the store, lost with a failed request, or dropped
    Rejected(String),
}

impl WriteAck {
    /// Current status, without waiting. The final status is reported once;
    /// later calls report the operation as dropped.
    pub fn status(&mut self) -> AckStatus {
        match self.receiver.try_recv() {
            Ok(Ok(())) => AckStatus::Accepted,
            Ok(Err(reason)) => AckStatus::Rejected(reason),
            Err(oneshot::error::TryRecvError::Empty) => AckStatus::Pending,
            Err(oneshot::error::TryRecvError::Closed) => {
                AckStatus::Rejected("dropped before reaching the store".to_string())
            },
        }
    }
}

/// Position of an acknowledged operation within its batch
#[derive(Debug)]
struct AckSlot {
    index: usize,
    sender: AckSender,
}

#[derive(Debug, Default)]
struct OpenBatch {
    operations: Vec<WriteOperation>,
    acks: Vec<AckSlot>,
    closed: bool,
}

/// A batch taken out of the pipeline but not yet handed to a flush task.
/// The token keeps `close()` and `flush()` waiting until it is.
struct TakenBatch {
    operations: Vec<WriteOperation>,
    acks: Vec<AckSlot>,
    trigger: FlushTrigger,
    _token: TaskTrackerToken,
}

struct Inner {
    store: Arc<dyn DocumentStore>,
    config: BulkConfig,
    open: Mutex<OpenBatch>,
    permits: Arc<Semaphore>,
    flushes: TaskTracker,
    counters: Counters,
    batch_seq: AtomicU64,
    timer_cancel: CancellationToken,
    timer: Mutex<Option<JoinHandle<()>>>,
}

/// Shared handle to the bulk write pipeline. Clones feed the same batch.
#[derive(Clone)]
pub struct BulkPipeline {
    inner: Arc<Inner>,
}

impl fmt::Debug for BulkPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BulkPipeline")
            .field("config", &self.inner.config)
            .field("stats", &self.inner.counters.snapshot())
            .finish()
    }
}

impl BulkPipeline {
    /// Build the pipeline and start its flush timer.
    ///
    /// Must be called from within a tokio runtime. Zero limits are raised to 1.
    pub fn new(store: Arc<dyn DocumentStore>, config: BulkConfig) -> Self {
        let config = BulkConfig {
            batch_size: config.batch_size.max(1),
            max_concurrent_batches: config.max_concurrent_batches.max(1),
            flush_interval: config.flush_interval.max(Duration::from_millis(1)),
        };

        let inner = Arc::new(Inner {
            store,
            permits: Arc::new(Semaphore::new(config.max_concurrent_batches)),
            open: Mutex::new(OpenBatch::default()),
            flushes: TaskTracker::new(),
            counters: Counters::default(),
            batch_seq: AtomicU64::new(0),
            timer_cancel: CancellationToken::new(),
            timer: Mutex::new(None),
            config,
        });

        let timer = tokio::spawn(run_flush_timer(
            Arc::downgrade(&inner),
            inner.config.flush_interval,
            inner.timer_cancel.clone(),
        ));
        // uncontended: the timer task only holds a Weak
        if let Ok(mut slot) = inner.timer.try_lock() {
            *slot = Some(timer);
        }

        debug!(
            batch_size = inner.config.batch_size,
            flush_interval_ms = inner.config.flush_interval.as_millis() as u64,
            max_concurrent_batches = inner.config.max_concurrent_batches,
            "Bulk pipeline started"
        );

        Self { inner }
    }

    /// Queue one operation.
    ///
    /// Returns once the operation is in a batch. If it completed a batch, that
    /// batch is handed to a flush task first, which waits while
    /// `max_concurrent_batches` requests are in flight. Not cancel safe: a
    /// dropped future can lose the batch it was dispatching.
    pub async fn submit(&self, operation: WriteOperation) -> Result<()> {
        self.enqueue(operation, None).await
    }

    /// Queue one operation like [`submit`](Self::submit) and return a handle
    /// that reports whether the store accepted it.
    pub async fn submit_acked(&self, operation: WriteOperation) -> Result<WriteAck> {
        let (sender, receiver) = oneshot::channel();
        self.enqueue(operation, Some(sender)).await?;
        Ok(WriteAck { receiver })
    }

    async fn enqueue(&self, operation: WriteOperation, ack: Option<AckSender>) -> Result<()> {
        let full = {
            let mut open = self.inner.open.lock().await;
            if open.closed {
                return Err(SyncError::PipelineClosed);
            }

            if let Some(sender) = ack {
                let index = open.operations.len();
                open.acks.push(AckSlot { index, sender });
            }
            open.operations.push(operation);
            self.inner.counters.submitted.fetch_add(1, Ordering::Relaxed);

            if open.operations.len() >= self.inner.config.batch_size {
                Some(self.inner.take(&mut open, FlushTrigger::Size))
            } else {
                None
            }
        };

        if let Some(batch) = full {
            self.inner.dispatch(batch).await;
        }
        Ok(())
    }

    /// Dispatch the open batch and wait until no bulk request is in flight.
    /// The pipeline stays open.
    pub async fn flush(&self) {
        let batch = {
            let mut open = self.inner.open.lock().await;
            if open.closed || open.operations.is_empty() {
                None
            } else {
                Some(self.inner.take(&mut open, FlushTrigger::Drain))
            }
        };

        if let Some(batch) = batch {
            self.inner.dispatch(batch).await;
        }

        self.inner.flushes.close();
        self.inner.flushes.wait().await;

        // close() owns the tracker once the pipeline is closed
        let open = self.inner.open.lock().await;
        if !open.closed {
            self.inner.flushes.reopen();
        }
    }

    /// Flush the open batch, wait for every in-flight request and refuse
    /// further submissions. Safe to call more than once.
    pub async fn close(&self) {
        let remainder = {
            let mut open = self.inner.open.lock().await;
            let first_close = !open.closed;
            open.closed = true;

            if first_close && !open.operations.is_empty() {
                Some(self.inner.take(&mut open, FlushTrigger::Close))
            } else {
                None
            }
        };

        self.inner.timer_cancel.cancel();
        let timer = self.inner.timer.lock().await.take();
        if let Some(timer) = timer {
            if let Err(e) = timer.await {
                warn!(error = %e, "Flush timer ended abnormally");
            }
        }

        if let Some(batch) = remainder {
            self.inner.dispatch(batch).await;
        }

        self.inner.flushes.close();
        self.inner.flushes.wait().await;

        let stats = self.stats();
        info!(
            submitted = stats.submitted,
            batches = stats.batches_flushed,
            succeeded = stats.succeeded,
            failed = stats.failed,
            "Bulk pipeline closed"
        );
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.open.lock().await.closed
    }

    /// Operations waiting in the open batch
    pub async fn pending(&self) -> usize {
        self.inner.open.lock().await.operations.len()
    }

    pub fn stats(&self) -> PipelineStats {
        self.inner.counters.snapshot()
    }
}

impl Inner {
    fn take(&self, open: &mut OpenBatch, trigger: FlushTrigger) -> TakenBatch {
        TakenBatch {
            operations: std::mem::take(&mut open.operations),
            acks: std::mem::take(&mut open.acks),
            trigger,
            _token: self.flushes.token(),
        }
    }

    async fn take_for_timer(&self) -> Option<TakenBatch> {
        let mut open = self.open.lock().await;
        if open.closed || open.operations.is_empty() {
            return None;
        }
        Some(self.take(&mut open, FlushTrigger::Timer))
    }

    async fn dispatch(self: &Arc<Self>, batch: TakenBatch) {
        let TakenBatch {
            operations,
            acks,
            trigger,
            _token,
        } = batch;

        let batch_id = self.batch_seq.fetch_add(1, Ordering::Relaxed) + 1;

        let permit = match Arc::clone(&self.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => {
                error!(batch = batch_id, size = operations.len(), error = %e, "Bulk batch dropped");
                self.counters.batches_failed.fetch_add(1, Ordering::Relaxed);
                self.counters.failed.fetch_add(operations.len() as u64, Ordering::Relaxed);
                return;
            },
        };

        let inner = Arc::clone(self);
        self.flushes.spawn(async move {
            inner.flush(batch_id, operations, acks, trigger).await;
            drop(permit);
        });
    }

    async fn flush(&self, batch_id: u64, operations: Vec<WriteOperation>, acks: Vec<AckSlot>, trigger: FlushTrigger) {
        let size = operations.len();
        debug!(batch = batch_id, size, trigger = %trigger, "Executing bulk request");

        match self.store.bulk(&operations).await {
            Ok(response) => {
                for item in response.failures() {
                    warn!(
                        batch = batch_id,
                        collection = %item.collection,
                        id = %item.id,
                        reason = item.error.as_deref().unwrap_or_default(),
                        "Bulk item rejected"
                    );
                }

                let accepted = response.items.iter().filter(|item| !item.is_failure()).count();
                let rejected = size.saturating_sub(accepted);

                self.counters.batches_flushed.fetch_add(1, Ordering::Relaxed);
                self.counters.succeeded.fetch_add(accepted as u64, Ordering::Relaxed);
                self.counters.failed.fetch_add(rejected as u64, Ordering::Relaxed);

                if rejected > 0 {
                    warn!(batch = batch_id, size, failed = rejected, "Bulk request completed with failures");
                } else {
                    debug!(batch = batch_id, size, "Bulk request completed");
                }

                for slot in acks {
                    let outcome = match response.items.get(slot.index) {
                        Some(item) => item.error.clone().map_or(Ok(()), Err),
                        None => Err("missing from bulk response".to_string()),
                    };
                    // the submitter may have stopped listening
                    let _ = slot.sender.send(outcome);
                }
            },
            Err(e) => {
                error!(batch = batch_id, size, error = %e, "Bulk request failed");
                self.counters.batches_failed.fetch_add(1, Ordering::Relaxed);
                self.counters.failed.fetch_add(size as u64, Ordering::Relaxed);

                let reason = e.to_string();
                for slot in acks {
                    let _ = slot.sender.send(Err(reason.clone()));
                }
            },
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.timer_cancel.cancel();
    }
}

async fn run_flush_timer(inner: Weak<Inner>, every: Duration, cancel: CancellationToken) {
    let mut ticker = interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let Some(inner) = inner.upgrade() else { break };
                if let Some(batch) = inner.take_for_timer().await {
                    inner.dispatch(batch).await;
                }
            }
        }
    }

    debug!("Flush timer stopped");
}

mod millis_string {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{}ms", value.as_millis()))
    }
}
