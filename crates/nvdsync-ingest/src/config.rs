//! Configuration management
//!
//! Settings come from an optional file (TOML, JSON or YAML, picked by
//! extension) layered with `NVDSYNC__`-prefixed environment variables, e.g.
//! `NVDSYNC__INDEX__BULK_SIZE=50`. Example:
//!
//! ```toml
//! name = "nvd"
//!
//! [[nvd.streams]]
//! name = "nvdcve-2.0-2003"
//! url = "https://nvd.nist.gov/feeds/xml/cve/nvdcve-2.0-2003.xml.gz"
//! update_rate = "12h"
//!
//! [index]
//! index = "nvd"
//! bulk_size = 100
//! flush_interval = "5s"
//! max_concurrent_bulk = 1
//!
//! [store]
//! kind = "elasticsearch"
//! url = "http://localhost:9200"
//! ```

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

use crate::feed::transport::{is_supported_url, DEFAULT_REQUEST_TIMEOUT};
use crate::feed::{FeedSource, DEFAULT_POLL_INTERVAL};
use crate::pipeline::{BulkConfig, DEFAULT_BATCH_SIZE, DEFAULT_FLUSH_INTERVAL, DEFAULT_MAX_CONCURRENT_BATCHES};
use crate::store::elasticsearch::DEFAULT_ELASTICSEARCH_URL;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Default engine instance name
pub const DEFAULT_NAME: &str = "nvd";

/// Default feed when no stream is configured
pub const DEFAULT_FEED_NAME: &str = "nvdcve-2.0-modified";

/// URL of the default feed
pub const DEFAULT_FEED_URL: &str = "http://static.nvd.nist.gov/feeds/xml/cve/nvdcve-2.0-modified.xml";

/// Bulk size used when an `index` section exists but does not set one
pub const DEFAULT_SECTION_BULK_SIZE: usize = 25;

/// Default collection holding the checkpoint document
pub const DEFAULT_CHECKPOINT_COLLECTION: &str = "nvdsync-checkpoints";

/// Default PostgreSQL pool size
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 5;

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "NVDSYNC";

// ============================================================================
// Raw (file / environment) representation
// ============================================================================

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    name: Option<String>,
    #[serde(default)]
    nvd: RawNvd,
    index: Option<RawIndex>,
    #[serde(default)]
    store: RawStore,
    #[serde(default)]
    checkpoint: RawCheckpoint,
}

#[derive(Debug, Default, Deserialize)]
struct RawNvd {
    streams: Option<Vec<RawStream>>,
    request_timeout: Option<DurationValue>,
}

#[derive(Debug, Deserialize)]
struct RawStream {
    name: Option<String>,
    url: String,
    update_rate: Option<DurationValue>,
}

#[derive(Debug, Default, Deserialize)]
struct RawIndex {
    index: Option<String>,
    bulk_size: Option<usize>,
    flush_interval: Option<DurationValue>,
    max_concurrent_bulk: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct RawStore {
    kind: Option<StoreKind>,
    url: Option<String>,
    max_connections: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct RawCheckpoint {
    index: Option<String>,
    id: Option<String>,
}

/// A duration written either as milliseconds or as `500ms`, `5s`, `10m`,
/// `12h`, `1d`
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum DurationValue {
    Millis(u64),
    Text(String),
}

impl DurationValue {
    fn resolve(&self, field: &str) -> anyhow::Result<Duration> {
        match self {
            DurationValue::Millis(ms) => Ok(Duration::from_millis(*ms)),
            DurationValue::Text(text) => {
                parse_duration(text).with_context(|| format!("Invalid duration for {}: '{}'", field, text))
            },
        }
    }
}

// ============================================================================
// Resolved configuration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Elasticsearch,
    Memory,
    Postgres,
}

/// Document store backend selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StoreConfig {
    Elasticsearch { url: String },
    Memory,
    Postgres { url: String, max_connections: u32 },
}

/// Where the checkpoint document lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckpointConfig {
    pub collection: String,
    pub document_id: String,
}

/// Fully resolved engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineConfig {
    /// Engine instance name
    pub name: String,
    pub feeds: Vec<FeedSource>,
    /// Collection receiving feed records
    pub index: String,
    pub bulk: BulkConfig,
    pub store: StoreConfig,
    pub checkpoint: CheckpointConfig,
    #[serde(serialize_with = "serialize_secs")]
    pub request_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_NAME.to_string(),
            feeds: vec![default_feed()],
            index: DEFAULT_NAME.to_string(),
            bulk: BulkConfig::default(),
            store: StoreConfig::Elasticsearch {
                url: DEFAULT_ELASTICSEARCH_URL.to_string(),
            },
            checkpoint: CheckpointConfig {
                collection: DEFAULT_CHECKPOINT_COLLECTION.to_string(),
                document_id: format!("{}_meta", DEFAULT_NAME),
            },
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl EngineConfig {
    /// Load from an optional file plus environment overrides
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            if !path.exists() {
                bail!("Configuration file not found: {}", path.display());
            }
            builder = builder.add_source(config::File::from(path));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read configuration")?;

        let raw: RawConfig = settings
            .try_deserialize()
            .context("Failed to parse configuration")?;

        Self::resolve(raw)
    }

    /// Parse a TOML document (no environment overrides)
    pub fn from_toml(source: &str) -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(source, config::FileFormat::Toml))
            .build()
            .context("Failed to read configuration")?;

        let raw: RawConfig = settings
            .try_deserialize()
            .context("Failed to parse configuration")?;

        Self::resolve(raw)
    }

    fn resolve(raw: RawConfig) -> anyhow::Result<Self> {
        let name = raw.name.unwrap_or_else(|| DEFAULT_NAME.to_string());

        let feeds = match raw.nvd.streams {
            Some(streams) if !streams.is_empty() => streams
                .into_iter()
                .map(resolve_stream)
                .collect::<anyhow::Result<Vec<_>>>()?,
            _ => {
                warn!(
                    feed = DEFAULT_FEED_NAME,
                    url = DEFAULT_FEED_URL,
                    "No feed streams configured, using the default feed"
                );
                vec![default_feed()]
            },
        };

        let (index, bulk) = match raw.index {
            Some(section) => (
                section.index.unwrap_or_else(|| name.clone()),
                BulkConfig {
                    batch_size: section.bulk_size.unwrap_or(DEFAULT_SECTION_BULK_SIZE),
                    flush_interval: section
                        .flush_interval
                        .map(|v| v.resolve("index.flush_interval"))
                        .transpose()?
                        .unwrap_or(DEFAULT_FLUSH_INTERVAL),
                    max_concurrent_batches: section
                        .max_concurrent_bulk
                        .unwrap_or(DEFAULT_MAX_CONCURRENT_BATCHES),
                },
            ),
            None => (
                name.clone(),
                BulkConfig {
                    batch_size: DEFAULT_BATCH_SIZE,
                    flush_interval: DEFAULT_FLUSH_INTERVAL,
                    max_concurrent_batches: DEFAULT_MAX_CONCURRENT_BATCHES,
                },
            ),
        };

        let store = match raw.store.kind.unwrap_or(StoreKind::Elasticsearch) {
            StoreKind::Elasticsearch => StoreConfig::Elasticsearch {
                url: raw
                    .store
                    .url
                    .unwrap_or_else(|| DEFAULT_ELASTICSEARCH_URL.to_string()),
            },
            StoreKind::Memory => StoreConfig::Memory,
            StoreKind::Postgres => StoreConfig::Postgres {
                url: raw
                    .store
                    .url
                    .context("store.url is required for the postgres store")?,
                max_connections: raw
                    .store
                    .max_connections
                    .unwrap_or(DEFAULT_DATABASE_MAX_CONNECTIONS),
            },
        };

        let checkpoint = CheckpointConfig {
            collection: raw
                .checkpoint
                .index
                .unwrap_or_else(|| DEFAULT_CHECKPOINT_COLLECTION.to_string()),
            document_id: raw.checkpoint.id.unwrap_or_else(|| format!("{}_meta", name)),
        };

        let request_timeout = raw
            .nvd
            .request_timeout
            .map(|v| v.resolve("nvd.request_timeout"))
            .transpose()?
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT);

        let config = Self {
            name,
            feeds,
            index,
            bulk,
            store,
            checkpoint,
            request_timeout,
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.name.trim().is_empty() {
            bail!("Engine name cannot be empty");
        }

        if self.index.trim().is_empty() {
            bail!("index.index cannot be empty");
        }

        if self.checkpoint.collection.trim().is_empty() || self.checkpoint.document_id.trim().is_empty() {
            bail!("checkpoint.index and checkpoint.id cannot be empty");
        }

        if self.bulk.batch_size == 0 {
            bail!("index.bulk_size must be greater than 0");
        }

        if self.bulk.max_concurrent_batches == 0 {
            bail!("index.max_concurrent_bulk must be greater than 0");
        }

        if self.bulk.flush_interval.is_zero() {
            bail!("index.flush_interval must be greater than 0");
        }

        if self.request_timeout.is_zero() {
            bail!("nvd.request_timeout must be greater than 0");
        }

        let mut names = HashSet::new();
        for feed in &self.feeds {
            if !names.insert(feed.name.as_str()) {
                bail!("Duplicate feed name '{}'", feed.name);
            }

            if !is_supported_url(&feed.url) {
                bail!("Feed '{}' has an unsupported URL: {}", feed.name, feed.url);
            }

            if feed.poll_interval.is_zero() {
                bail!("Feed '{}' update_rate must be greater than 0", feed.name);
            }
        }

        if let StoreConfig::Elasticsearch { url } | StoreConfig::Postgres { url, .. } = &self.store {
            if url.trim().is_empty() {
                bail!("store.url cannot be empty");
            }
        }

        Ok(())
    }
}

fn default_feed() -> FeedSource {
    FeedSource::new(DEFAULT_FEED_NAME, DEFAULT_FEED_URL, DEFAULT_POLL_INTERVAL)
}

fn resolve_stream(raw: RawStream) -> anyhow::Result<FeedSource> {
    let name = match raw.name {
        Some(name) if !name.trim().is_empty() => name,
        _ => feed_name_from_url(&raw.url)
            .with_context(|| format!("Cannot derive a feed name from '{}', set one explicitly", raw.url))?,
    };

    let poll_interval = raw
        .update_rate
        .map(|v| v.resolve("update_rate"))
        .transpose()?
        .unwrap_or(DEFAULT_POLL_INTERVAL);

    Ok(FeedSource::new(name, raw.url, poll_interval))
}

/// `.../nvdcve-2.0-2003.xml.gz` becomes `nvdcve-2.0-2003`
pub fn feed_name_from_url(raw: &str) -> Option<String> {
    let url = url::Url::parse(raw).ok()?;
    let file = url.path_segments()?.filter(|segment| !segment.is_empty()).last()?;

    let stem = file.strip_suffix(".gz").unwrap_or(file);
    let stem = stem.strip_suffix(".xml").unwrap_or(stem);

    (!stem.is_empty()).then(|| stem.to_string())
}

/// Parse `500ms`, `5s`, `10m`, `12h`, `1d` or a bare millisecond count
pub fn parse_duration(text: &str) -> anyhow::Result<Duration> {
    let text = text.trim();
    let split = text.find(|c: char| !c.is_ascii_digit()).unwrap_or(text.len());
    let (digits, unit) = text.split_at(split);

    if digits.is_empty() {
        bail!("missing number");
    }
    let value: u64 = digits.parse().context("number out of range")?;

    let millis_per_unit: u64 = match unit.trim() {
        "" | "ms" => 1,
        "s" => 1_000,
        "m" => 60 * 1_000,
        "h" => 60 * 60 * 1_000,
        "d" => 24 * 60 * 60 * 1_000,
        other => bail!("unknown unit '{}'", other),
    };

    value
        .checked_mul(millis_per_unit)
        .map(Duration::from_millis)
        .context("duration out of range")
}

fn serialize_secs<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format!("{}s", value.as_secs()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_without_any_settings() {
        let config = EngineConfig::from_toml("").unwrap();

        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.feeds[0].name, "nvdcve-2.0-modified");
        assert_eq!(config.feeds[0].poll_interval, Duration::from_secs(720 * 60));
        assert_eq!(config.bulk.batch_size, 100);
        assert_eq!(config.checkpoint.document_id, "nvd_meta");
    }

    #[test]
    fn test_index_section_without_bulk_size_uses_25() {
        let config = EngineConfig::from_toml(
            r#"
            [index]
            index = "cves"
            "#,
        )
        .unwrap();

        assert_eq!(config.index, "cves");
        assert_eq!(config.bulk.batch_size, 25);
        assert_eq!(config.bulk.flush_interval, Duration::from_secs(5));
        assert_eq!(config.bulk.max_concurrent_batches, 1);
    }

    #[test]
    fn test_full_configuration() {
        let config = EngineConfig::from_toml(
            r#"
            name = "vulns"

            [nvd]
            request_timeout = "30s"

            [[nvd.streams]]
            url = "https://nvd.nist.gov/feeds/xml/cve/nvdcve-2.0-2003.xml.gz"
            update_rate = 10000

            [[nvd.streams]]
            name = "recent"
            url = "https://nvd.nist.gov/feeds/xml/cve/nvdcve-2.0-recent.xml"
            update_rate = "1h"

            [index]
            bulk_size = 50
            flush_interval = "500ms"
            max_concurrent_bulk = 4

            [store]
            kind = "memory"

            [checkpoint]
            index = "_river"
            "#,
        )
        .unwrap();

        assert_eq!(config.name, "vulns");
        assert_eq!(config.index, "vulns");
        assert_eq!(config.feeds.len(), 2);
        assert_eq!(config.feeds[0].name, "nvdcve-2.0-2003");
        assert_eq!(config.feeds[0].poll_interval, Duration::from_secs(10));
        assert_eq!(config.feeds[1].name, "recent");
        assert_eq!(config.feeds[1].poll_interval, Duration::from_secs(3600));
        assert_eq!(
            config.bulk,
            BulkConfig {
                batch_size: 50,
                flush_interval: Duration::from_millis(500),
                max_concurrent_batches: 4,
            }
        );
        assert_eq!(config.store, StoreConfig::Memory);
        assert_eq!(config.checkpoint.collection, "_river");
        assert_eq!(config.checkpoint.document_id, "vulns_meta");
        assert_eq!(config.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_duplicate_feed_names_are_rejected() {
        let err = EngineConfig::from_toml(
            r#"
            [[nvd.streams]]
            url = "https://nvd.nist.gov/feeds/xml/cve/nvdcve-2.0-2003.xml"

            [[nvd.streams]]
            url = "file:///mirror/nvdcve-2.0-2003.xml"
            "#,
        )
        .unwrap_err();

        assert!(err.to_string().contains("Duplicate feed name"));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(EngineConfig::from_toml("[index]\nbulk_size = 0").is_err());
        assert!(EngineConfig::from_toml("[index]\nmax_concurrent_bulk = 0").is_err());
        assert!(EngineConfig::from_toml("[index]\nflush_interval = \"soon\"").is_err());
        assert!(EngineConfig::from_toml("[[nvd.streams]]\nurl = \"ftp://mirror/nvd.xml\"").is_err());
        assert!(EngineConfig::from_toml("[store]\nkind = \"postgres\"").is_err());
        assert!(EngineConfig::from_toml("[store]\nkind = \"cassandra\"").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "name = \"from-file\"\n[store]\nkind = \"memory\"").unwrap();

        let config = EngineConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.name, "from-file");
        assert_eq!(config.store, StoreConfig::Memory);

        assert!(EngineConfig::load(Some(Path::new("/nonexistent/nvdsync.toml"))).is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("720m").unwrap(), Duration::from_secs(720 * 60));
        assert_eq!(parse_duration("12h").unwrap(), Duration::from_secs(12 * 3600));
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86_400));
        assert_eq!(parse_duration("250").unwrap(), Duration::from_millis(250));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("h").is_err());
        assert!(parse_duration("5 weeks").is_err());
    }

    #[test]
    fn test_feed_name_from_url() {
        assert_eq!(
            feed_name_from_url("https://nvd.nist.gov/feeds/xml/cve/nvdcve-2.0-2003.xml.gz").as_deref(),
            Some("nvdcve-2.0-2003")
        );
        assert_eq!(
            feed_name_from_url("file:///var/lib/nvd/nvdcve-2.0-modified.xml").as_deref(),
            Some("nvdcve-2.0-modified")
        );
        assert_eq!(feed_name_from_url("https://nvd.nist.gov/").as_deref(), None);
    }
}
