//! nvdsync Common Library
//!
//! Shared error taxonomy, logging setup and timestamp helpers for the nvdsync
//! workspace members.
//!
//! # Overview
//!
//! - **Error Handling**: transport, decode and write errors plus the engine-level
//!   [`SyncError`] that wraps them
//! - **Logging**: `tracing` subscriber initialization driven by [`logging::LogConfig`]
//! - **Time**: normalization of HTTP and RFC 3339 timestamps to UTC instants
//!
//! # Example
//!
//! ```no_run
//! use nvdsync_common::time::parse_http_date;
//!
//! let instant = parse_http_date("Sat, 26 Jul 2014 15:55:03 GMT");
//! assert!(instant.is_some());
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod error;
pub mod logging;
pub mod time;

// Re-export commonly used types
pub use error::{DecodeError, Result, SyncError, TransportError, WriteError};
