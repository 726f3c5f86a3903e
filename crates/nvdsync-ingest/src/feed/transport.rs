//! Remote feed access
//!
//! [`FeedClient`] answers two questions about a feed URL: when was it last
//! modified, and what are its bytes. `http`/`https` URLs go through `reqwest`
//! (`HEAD` for the `Last-Modified` header, `GET` for the body). `file` URLs are
//! served from the local filesystem with the file's modification time.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nvdsync_common::time::parse_http_date;
use nvdsync_common::TransportError;
use reqwest::header::LAST_MODIFIED;
use reqwest::Client;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Default timeout for a single feed request
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

const USER_AGENT: &str = concat!("nvdsync/", env!("CARGO_PKG_VERSION"));

/// Access to remote feed documents
#[async_trait]
pub trait FeedTransport: Send + Sync {
    /// Modification instant of the feed, without downloading it
    async fn head_last_modified(&self, url: &str) -> Result<DateTime<Utc>, TransportError>;

    /// Full feed body
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, TransportError>;
}

/// HTTP and local file transport
#[derive(Debug, Clone)]
pub struct FeedClient {
    client: Client,
}

impl FeedClient {
    /// Create a client with the given per-request timeout
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| TransportError::Request {
                url: String::new(),
                message: e.to_string(),
            })?;

        Ok(Self { client })
    }

    async fn http_last_modified(&self, url: Url) -> Result<DateTime<Utc>, TransportError> {
        let response = self
            .client
            .head(url.clone())
            .send()
            .await
            .map_err(|e| request_error(&url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let header = response
            .headers()
            .get(LAST_MODIFIED)
            .ok_or_else(|| TransportError::MissingLastModified {
                url: url.to_string(),
            })?;

        let value = String::from_utf8_lossy(header.as_bytes()).into_owned();
        debug!(url = %url, last_modified = %value, "Feed HEAD response");

        parse_http_date(&value).ok_or(TransportError::InvalidLastModified {
            url: url.to_string(),
            value,
        })
    }

    async fn http_fetch(&self, url: Url) -> Result<Vec<u8>, TransportError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| request_error(&url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response.bytes().await.map_err(|e| request_error(&url, e))?;
        debug!(url = %url, bytes = body.len(), "Feed downloaded");

        Ok(body.to_vec())
    }
}

#[async_trait]
impl FeedTransport for FeedClient {
    async fn head_last_modified(&self, url: &str) -> Result<DateTime<Utc>, TransportError> {
        match FeedLocation::parse(url)? {
            FeedLocation::Http(url) => self.http_last_modified(url).await,
            FeedLocation::File(path) => {
                let metadata = tokio::fs::metadata(&path).await.map_err(|e| io_error(&path, e))?;
                let modified = metadata.modified().map_err(|e| io_error(&path, e))?;
                Ok(DateTime::<Utc>::from(modified))
            },
        }
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>, TransportError> {
        match FeedLocation::parse(url)? {
            FeedLocation::Http(url) => self.http_fetch(url).await,
            FeedLocation::File(path) => tokio::fs::read(&path).await.map_err(|e| io_error(&path, e)),
        }
    }
}

/// Where a feed URL points
#[derive(Debug)]
enum FeedLocation {
    Http(Url),
    File(PathBuf),
}

impl FeedLocation {
    fn parse(raw: &str) -> Result<Self, TransportError> {
        let url = Url::parse(raw).map_err(|_| TransportError::UnsupportedUrl(raw.to_string()))?;

        match url.scheme() {
            "http" | "https" => Ok(FeedLocation::Http(url)),
            "file" => url
                .to_file_path()
                .map(FeedLocation::File)
                .map_err(|_| TransportError::UnsupportedUrl(raw.to_string())),
            _ => Err(TransportError::UnsupportedUrl(raw.to_string())),
        }
    }
}

/// Whether a URL uses a scheme [`FeedClient`] can serve
pub fn is_supported_url(raw: &str) -> bool {
    FeedLocation::parse(raw).is_ok()
}

fn request_error(url: &Url, err: reqwest::Error) -> TransportError {
    TransportError::Request {
        url: url.to_string(),
        message: err.to_string(),
    }
}

fn io_error(path: &std::path::Path, source: std::io::Error) -> TransportError {
    TransportError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io::Write;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client() -> FeedClient {
        FeedClient::new(Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_http_last_modified() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/feeds/nvdcve-2.0-modified.xml"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Last-Modified", "Sat, 26 Jul 2014 15:55:03 GMT"),
            )
            .mount(&server)
            .await;

        let url = format!("{}/feeds/nvdcve-2.0-modified.xml", server.uri());
        let modified = client().head_last_modified(&url).await.unwrap();

        assert_eq!(modified, Utc.with_ymd_and_hms(2014, 7, 26, 15, 55, 3).unwrap());
    }

    #[tokio::test]
    async fn test_missing_last_modified_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let err = client().head_last_modified(&server.uri()).await.unwrap_err();
        assert!(matches!(err, TransportError::MissingLastModified { .. }));
    }

    #[tokio::test]
    async fn test_unparsable_last_modified_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(200).insert_header("Last-Modified", "last tuesday"))
            .mount(&server)
            .await;

        let err = client().head_last_modified(&server.uri()).await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::InvalidLastModified { value, .. } if value == "last tuesday"
        ));
    }

    #[tokio::test]
    async fn test_http_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = client().fetch(&server.uri()).await.unwrap_err();
        assert!(matches!(err, TransportError::Status { status: 503, .. }));
    }

    #[tokio::test]
    async fn test_http_fetch_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/nvd.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"<nvd/>".to_vec()))
            .mount(&server)
            .await;

        let body = client().fetch(&format!("{}/nvd.xml", server.uri())).await.unwrap();
        assert_eq!(body, b"<nvd/>");
    }

    #[tokio::test]
    async fn test_file_url() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"<nvd/>").unwrap();
        let url = Url::from_file_path(file.path()).unwrap().to_string();

        let transport = client();
        let modified = transport.head_last_modified(&url).await.unwrap();
        let expected: DateTime<Utc> = file.as_file().metadata().unwrap().modified().unwrap().into();
        assert_eq!(modified, expected);
        assert_eq!(transport.fetch(&url).await.unwrap(), b"<nvd/>");
    }

    #[tokio::test]
    async fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let url = Url::from_file_path(dir.path().join("absent.xml")).unwrap().to_string();

        let err = client().fetch(&url).await.unwrap_err();
        assert!(matches!(err, TransportError::Io { .. }));
    }

    #[test]
    fn test_supported_schemes() {
        assert!(is_supported_url("http://static.nvd.nist.gov/feeds/xml/cve/nvdcve-2.0-modified.xml"));
        assert!(is_supported_url("https://nvd.nist.gov/feeds/xml/cve/nvdcve-2.0-2003.xml.gz"));
        assert!(is_supported_url("file:///var/lib/nvd/nvdcve-2.0-2003.xml"));
        assert!(!is_supported_url("ftp://ftp.example.org/nvd.xml"));
        assert!(!is_supported_url("not a url"));
    }
}
