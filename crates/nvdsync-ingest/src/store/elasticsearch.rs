//! Elasticsearch document store over the REST API
//!
//! Collections map to indices. Writes go through `POST /_bulk` as NDJSON
//! `index` actions; versioned operations use `version_type=external` so a stale
//! checkpoint snapshot is rejected by the cluster instead of overwriting a
//! newer one. Mapping types no longer exist in current clusters, so
//! `WriteOperation::doc_type` is not sent.

use async_trait::async_trait;
use nvdsync_common::WriteError;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use super::{BulkItemResult, BulkResponse, DocumentStore, WriteOperation};

/// Default cluster address
pub const DEFAULT_ELASTICSEARCH_URL: &str = "http://localhost:9200";

const ALREADY_EXISTS: &str = "resource_already_exists_exception";

/// [`DocumentStore`] backed by an Elasticsearch cluster
#[derive(Debug, Clone)]
pub struct ElasticsearchStore {
    client: Client,
    base: Url,
}

#[derive(Debug, Deserialize)]
struct BulkReply {
    #[serde(default)]
    errors: bool,
    #[serde(default)]
    items: Vec<HashMap<String, BulkReplyItem>>,
}

#[derive(Debug, Deserialize)]
struct BulkReplyItem {
    #[serde(rename = "_index", default)]
    index: String,
    #[serde(rename = "_id", default)]
    id: String,
    #[serde(default)]
    status: u16,
    error: Option<Value>,
}

impl ElasticsearchStore {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, WriteError> {
        let base = Url::parse(base_url)
            .map_err(|e| WriteError::Transport(format!("invalid Elasticsearch URL '{}': {}", base_url, e)))?;
        if base.cannot_be_a_base() {
            return Err(WriteError::Transport(format!("invalid Elasticsearch URL '{}'", base_url)));
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| WriteError::Transport(e.to_string()))?;

        Ok(Self { client, base })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, WriteError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| WriteError::Transport(format!("invalid Elasticsearch URL '{}'", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn bulk_body(operations: &[WriteOperation]) -> Result<String, WriteError> {
        let mut body = String::new();

        for op in operations {
            let mut action = json!({ "_index": op.collection, "_id": op.id });
            if let Some(version) = op.version {
                action["version"] = json!(version);
                action["version_type"] = json!("external");
            }

            body.push_str(&serde_json::to_string(&json!({ "index": action }))?);
            body.push('\n');
            body.push_str(&serde_json::to_string(&op.payload)?);
            body.push('\n');
        }

        Ok(body)
    }

    fn item_results(operations: &[WriteOperation], reply: BulkReply) -> BulkResponse {
        let items = reply
            .items
            .into_iter()
            .zip(operations)
            .map(|(mut entry, op)| {
                let Some(item) = entry.remove("index").or_else(|| entry.into_values().next()) else {
                    return BulkItemResult::failed(&op.collection, &op.id, "missing bulk item result");
                };

                let collection = if item.index.is_empty() { op.collection.clone() } else { item.index };
                let id = if item.id.is_empty() { op.id.clone() } else { item.id };

                match item.error {
                    Some(error) => BulkItemResult::failed(collection, id, error_reason(&error)),
                    None if item.status >= 300 => {
                        BulkItemResult::failed(collection, id, format!("status {}", item.status))
                    },
                    None => BulkItemResult::ok(collection, id),
                }
            })
            .collect();

        BulkResponse { items }
    }
}

fn error_reason(error: &Value) -> String {
    match (error.get("type").and_then(Value::as_str), error.get("reason").and_then(Value::as_str)) {
        (Some(kind), Some(reason)) => format!("{}: {}", kind, reason),
        (Some(kind), None) => kind.to_string(),
        (None, Some(reason)) => reason.to_string(),
        (None, None) => error.to_string(),
    }
}

fn transport(err: reqwest::Error) -> WriteError {
    WriteError::Transport(err.to_string())
}

#[async_trait]
impl DocumentStore for ElasticsearchStore {
    async fn create_collection(&self, name: &str) -> Result<(), WriteError> {
        let url = self.endpoint(&[name])?;
        let response = self.client.put(url).send().await.map_err(transport)?;

        let status = response.status();
        if status.is_success() {
            debug!(index = %name, "Index created");
            return Ok(());
        }

        let body = response.text().await.map_err(transport)?;
        if status == StatusCode::BAD_REQUEST && body.contains(ALREADY_EXISTS) {
            return Err(WriteError::CollectionExists(name.to_string()));
        }

        Err(WriteError::Rejected {
            status: status.as_u16(),
            reason: body,
        })
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, WriteError> {
        let url = self.endpoint(&[collection, "_doc", id])?;
        let response = self.client.get(url).send().await.map_err(transport)?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let reason = response.text().await.map_err(transport)?;
            return Err(WriteError::Rejected {
                status: status.as_u16(),
                reason,
            });
        }

        let mut document: Value = response.json().await.map_err(transport)?;
        Ok(document.get_mut("_source").map(Value::take))
    }

    async fn bulk(&self, operations: &[WriteOperation]) -> Result<BulkResponse, WriteError> {
        if operations.is_empty() {
            return Ok(BulkResponse::default());
        }

        let url = self.endpoint(&["_bulk"])?;
        let body = Self::bulk_body(operations)?;

        let response = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(body)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if !status.is_success() {
            let reason = response.text().await.map_err(transport)?;
            return Err(WriteError::Rejected {
                status: status.as_u16(),
                reason,
            });
        }

        let reply: BulkReply = response.json().await.map_err(transport)?;
        if reply.items.len() != operations.len() {
            warn!(
                expected = operations.len(),
                received = reply.items.len(),
                "Bulk response item count mismatch"
            );
        }

        let errors = reply.errors;
        let results = Self::item_results(operations, reply);
        debug!(operations = operations.len(), errors, "Bulk request completed");

        Ok(results)
    }
}
