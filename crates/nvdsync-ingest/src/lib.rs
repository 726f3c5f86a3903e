//! nvdsync Ingest Library
//!
//! Incremental synchronization of NVD vulnerability feeds into a document
//! store. A feed is only downloaded when its remote modification time is newer
//! than the checkpoint recorded by the previous import.
//!
//! # Components
//!
//! - **feed**: feed sources, transport (HTTP, file://) and the NVD XML decoder
//! - **detector**: remote-vs-checkpoint comparison
//! - **pipeline**: batched bulk writes with a flush timer and a concurrency cap
//! - **checkpoint**: per-feed checkpoints kept in one versioned document
//! - **worker**: the per-feed poll loop
//! - **engine**: start/stop coordination of all of the above
//! - **store**: the [`store::DocumentStore`] seam and its backends
//!
//! # Example
//!
//! ```no_run
//! use nvdsync_ingest::config::EngineConfig;
//! use nvdsync_ingest::store::open_store;
//! use nvdsync_ingest::SyncEngine;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = EngineConfig::load(None)?;
//!     let store = open_store(&config.store, config.request_timeout).await?;
//!     let engine = SyncEngine::new(config, store)?;
//!
//!     for report in engine.run_once().await? {
//!         println!("{}: {:?}", report.feed, report.outcome);
//!     }
//!     Ok(())
//! }
//! ```

pub mod checkpoint;
pub mod config;
pub mod detector;
pub mod engine;
pub mod feed;
pub mod pipeline;
pub mod store;
pub mod worker;

pub use engine::{FeedReport, SyncEngine};
pub use feed::{FeedSource, Record};
pub use pipeline::{BulkConfig, BulkPipeline, PipelineStats};
pub use worker::{CycleOutcome, FeedWorker, WorkerState};
