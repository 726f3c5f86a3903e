//! Feed sources and the records decoded from them
//!
//! - **transport**: remote modification time and body retrieval (HTTP, file://)
//! - **decoder**: NVD XML feed to [`Record`] conversion

pub mod decoder;
pub mod transport;

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use decoder::{FeedDecoder, NvdXmlDecoder};
pub use transport::{FeedClient, FeedTransport};

/// Default poll interval for a feed (12 hours)
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(720 * 60);

/// One configured feed. Immutable once the registry is loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedSource {
    /// Unique feed name, also the checkpoint key
    pub name: String,
    /// Location of the feed document
    pub url: String,
    /// Time between two checks of this feed
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,
}

impl FeedSource {
    pub fn new(name: impl Into<String>, url: impl Into<String>, poll_interval: Duration) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            poll_interval,
        }
    }
}

/// One decoded feed entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Feed-assigned identifier, e.g. `CVE-2003-0001`
    pub id: String,
    /// Document content
    pub payload: serde_json::Value,
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
