//! Shared fixtures for the engine integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use nvdsync_common::TransportError;
use nvdsync_ingest::config::{EngineConfig, StoreConfig};
use nvdsync_ingest::feed::{FeedTransport, NvdXmlDecoder};
use nvdsync_ingest::store::MemoryDocumentStore;
use nvdsync_ingest::{BulkConfig, FeedSource, SyncEngine};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Initialize tracing for tests
pub fn init_test_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,nvdsync_ingest=debug")),
        )
        .with_test_writer()
        .try_init();
}

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

/// NVD document with `count` entries numbered from 1
pub fn feed_xml(count: usize) -> Vec<u8> {
    let mut xml = String::from(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<nvd xmlns="http://scap.nist.gov/schema/feed/vulnerability/2.0"
     xmlns:vuln="http://scap.nist.gov/schema/vulnerability/0.4"
     nvd_xml_version="2.0" pub_date="2014-07-26T03:00:00">
"#,
    );
    for n in 1..=count {
        xml.push_str(&format!(
            "  <entry id=\"{id}\"><vuln:cve-id>{id}</vuln:cve-id><vuln:summary>Issue {n}</vuln:summary></entry>\n",
            id = cve_id(n),
            n = n
        ));
    }
    xml.push_str("</nvd>\n");
    xml.into_bytes()
}

pub fn cve_id(n: usize) -> String {
    format!("CVE-2003-{:04}", n)
}

/// Serves one body and modification time per URL
#[derive(Default)]
pub struct StubTransport {
    feeds: Mutex<HashMap<String, (DateTime<Utc>, Vec<u8>)>>,
    heads: AtomicUsize,
    fetches: AtomicUsize,
}

impl StubTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serve(&self, url: &str, last_modified: DateTime<Utc>, body: Vec<u8>) {
        self.feeds.lock().unwrap().insert(url.to_string(), (last_modified, body));
    }

    pub fn heads(&self) -> usize {
        self.heads.load(Ordering::SeqCst)
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FeedTransport for StubTransport {
    async fn head_last_modified(&self, url: &str) -> Result<DateTime<Utc>, TransportError> {
        self.heads.fetch_add(1, Ordering::SeqCst);
        self.feeds
            .lock()
            .unwrap()
            .get(url)
            .map(|(last_modified, _)| *last_modified)
            .ok_or_else(|| TransportError::Status {
                url: url.to_string(),
                status: 404,
            })
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>, TransportError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.feeds
            .lock()
            .unwrap()
            .get(url)
            .map(|(_, body)| body.clone())
            .ok_or_else(|| TransportError::Status {
                url: url.to_string(),
                status: 404,
            })
    }
}

pub fn feed_url(name: &str) -> String {
    format!("http://feeds.test/{}.xml", name)
}

/// Memory-backed configuration with one feed per name
pub fn engine_config(feeds: &[&str], bulk: BulkConfig, poll_interval: Duration) -> EngineConfig {
    EngineConfig {
        feeds: feeds
            .iter()
            .map(|name| FeedSource::new(*name, feed_url(name), poll_interval))
            .collect(),
        bulk,
        store: StoreConfig::Memory,
        ..EngineConfig::default()
    }
}

pub fn bulk(batch_size: usize, flush_interval: Duration, max_concurrent_batches: usize) -> BulkConfig {
    BulkConfig {
        batch_size,
        flush_interval,
        max_concurrent_batches,
    }
}

pub fn engine(config: EngineConfig, store: &Arc<MemoryDocumentStore>, transport: &Arc<StubTransport>) -> SyncEngine {
    SyncEngine::with_parts(config, store.clone(), transport.clone(), Arc::new(NvdXmlDecoder))
}
