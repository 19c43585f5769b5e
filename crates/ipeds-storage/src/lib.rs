//! HTTP fetch, archive parsing, and snapshot cache for IPEDS survey files.

use std::time::Duration;

use anyhow::Context;
use ipeds_core::{ColumnTypes, Table};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use tracing::{info, info_span, warn, Instrument};

pub mod archive;
pub mod cache;

pub use archive::{parse_archive, parse_delimited, select_entry, REVISED_MARKER};
pub use cache::{load, save, CacheError, SnapshotCache};

pub const CRATE_NAME: &str = "ipeds-storage";

/// Literal IPEDS uses for a suppressed or missing cell.
pub const MISSING_VALUE: &str = ".";

/// How often and how patiently a download is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; 0 disables retrying.
    pub retries: u32,
    pub first_delay: Duration,
    pub delay_cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            first_delay: Duration::from_millis(500),
            delay_cap: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Pause before retry number `retry` (0-based): doubles each time, never above the cap.
    pub fn pause_before(&self, retry: u32) -> Duration {
        2u32.checked_pow(retry)
            .and_then(|factor| self.first_delay.checked_mul(factor))
            .map_or(self.delay_cap, |pause| pause.min(self.delay_cap))
    }
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub request_timeout: Duration,
    pub user_agent: String,
    pub retry: RetryPolicy,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(120),
            user_agent: format!("ipeds-etl/{}", env!("CARGO_PKG_VERSION")),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} answered {status}")]
    Status { url: String, status: StatusCode },
    #[error("reading zip archive: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("zip archive contains no data file")]
    NoDataFile,
    #[error("reading archive entry {entry}: {source}")]
    Io {
        entry: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing delimited text: {0}")]
    Csv(#[from] csv::Error),
    #[error("line {line}, column {column}: cannot read {value:?} as {expected}")]
    InvalidValue {
        line: u64,
        column: String,
        value: String,
        expected: &'static str,
    },
    #[error(transparent)]
    Table(#[from] ipeds_core::TableError),
}

impl FetchError {
    /// Server-side trouble, throttling, timeouts, and refused connections are
    /// worth another attempt; anything else will fail the same way again.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Status { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            FetchError::Request { source, .. } => {
                source.is_timeout() || source.is_connect() || source.is_request()
            }
            _ => false,
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: FetcherConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent)
            .timeout(config.request_timeout)
            .gzip(true)
            .brotli(true)
            .build()
            .context("building the survey download client")?;
        Ok(Self {
            client,
            retry: config.retry,
        })
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let request_failed = |source| FetchError::Request {
            url: url.to_string(),
            source,
        };
        let response = self.client.get(url).send().await.map_err(request_failed)?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: response.url().to_string(),
                status,
            });
        }
        let body = response.bytes().await.map_err(request_failed)?;
        Ok(body.to_vec())
    }

    /// Whole response body of `url`, retrying transient failures per the policy.
    pub async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let mut retry = 0;
        loop {
            match self.download(url).await {
                Ok(body) => return Ok(body),
                Err(err) if err.is_transient() && retry < self.retry.retries => {
                    let pause = self.retry.pause_before(retry);
                    warn!(error = %err, retry = retry + 1, ?pause, "transient download failure");
                    tokio::time::sleep(pause).await;
                    retry += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Download a zipped survey file and parse its canonical data entry.
    pub async fn fetch_table(
        &self,
        url: &str,
        column_types: &ColumnTypes,
        missing_value: &str,
    ) -> Result<Table, FetchError> {
        let span = info_span!("fetch_table", url);
        async move {
            let body = self.fetch_bytes(url).await?;
            let (entry, table) = parse_archive(&body, column_types, missing_value)?;
            info!(
                entry = %entry,
                bytes = body.len(),
                sha256 = %content_digest(&body),
                rows = table.row_count(),
                columns = table.width(),
                "fetched survey file"
            );
            Ok(table)
        }
        .instrument(span)
        .await
    }
}

/// Hex sha256 of a downloaded archive, logged so reruns can tell whether the
/// provider republished a file.
pub fn content_digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Answers successive requests with `replies` in order, repeating the last
    /// one. Returns the file URL and a request counter.
    async fn serve(replies: Vec<(u16, Vec<u8>)>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(AtomicUsize::new(0));
        let counter = requests.clone();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                let (code, body) = replies[n.min(replies.len() - 1)].clone();

                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(read) => head.extend_from_slice(&buf[..read]),
                    }
                }

                let response = format!(
                    "HTTP/1.1 {code} Test\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.write_all(&body).await;
                let _ = socket.shutdown().await;
            }
        });
        (format!("http://{addr}/HD2015.zip"), requests)
    }

    fn fetcher(retries: u32) -> HttpFetcher {
        HttpFetcher::new(FetcherConfig {
            request_timeout: Duration::from_secs(5),
            retry: RetryPolicy {
                retries,
                first_delay: Duration::from_millis(1),
                delay_cap: Duration::from_millis(5),
            },
            ..Default::default()
        })
        .expect("fetcher")
    }

    fn hd_archive() -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        writer
            .start_file("hd2015.csv", zip::write::SimpleFileOptions::default())
            .expect("start entry");
        writer
            .write_all(b"UNITID,INSTNM,LOCALE\r\n100001,Test U,23\r\n100002,Other,.\r\n")
            .expect("write entry");
        writer.finish().expect("finish zip").into_inner()
    }

    #[tokio::test]
    async fn unavailable_server_is_retried_until_it_answers() {
        let (url, requests) = serve(vec![(503, b"busy".to_vec()), (200, b"ok".to_vec())]).await;
        let body = fetcher(3).fetch_bytes(&url).await.expect("fetch");
        assert_eq!(body, b"ok");
        assert_eq!(requests.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn missing_file_fails_without_retrying() {
        let (url, requests) = serve(vec![(404, Vec::new())]).await;
        let err = fetcher(3).fetch_bytes(&url).await.unwrap_err();
        assert!(matches!(err, FetchError::Status { status, .. } if status == StatusCode::NOT_FOUND));
        assert_eq!(requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn persistent_server_errors_stop_after_the_last_retry() {
        let (url, requests) = serve(vec![(503, Vec::new())]).await;
        let err = fetcher(2).fetch_bytes(&url).await.unwrap_err();
        assert!(matches!(
            err,
            FetchError::Status { status, .. } if status == StatusCode::SERVICE_UNAVAILABLE
        ));
        assert_eq!(requests.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn served_archive_is_parsed_into_a_table() {
        let (url, _) = serve(vec![(200, hd_archive())]).await;
        let hints = ColumnTypes::new()
            .with("unitid", ipeds_core::ColumnType::Int)
            .with("locale", ipeds_core::ColumnType::Int);
        let table = fetcher(0)
            .fetch_table(&url, &hints, MISSING_VALUE)
            .await
            .expect("fetch table");

        assert_eq!(table.column_names(), vec!["unitid", "instnm", "locale"]);
        assert_eq!(table.row_count(), 2);
        assert_eq!(table.column("unitid").unwrap().i64_at(1), Some(100002));
        assert_eq!(table.column("locale").unwrap().i64_at(0), Some(23));
        assert!(table.column("locale").unwrap().is_null(1));
    }

    fn status(code: u16) -> FetchError {
        FetchError::Status {
            url: "https://nces.ed.gov/ipeds/datacenter/data/HD2015.zip".to_string(),
            status: StatusCode::from_u16(code).unwrap(),
        }
    }

    #[test]
    fn digest_of_empty_input() {
        assert_eq!(
            content_digest(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn pauses_double_until_the_cap() {
        let policy = RetryPolicy {
            retries: 4,
            first_delay: Duration::from_millis(250),
            delay_cap: Duration::from_secs(1),
        };
        let pauses: Vec<_> = (0..4).map(|r| policy.pause_before(r)).collect();
        assert_eq!(
            pauses,
            [250, 500, 1000, 1000].map(Duration::from_millis).to_vec()
        );
        assert_eq!(policy.pause_before(64), Duration::from_secs(1));
    }

    #[test]
    fn only_server_side_statuses_are_transient() {
        assert!(status(503).is_transient());
        assert!(status(429).is_transient());
        assert!(!status(404).is_transient());
        assert!(!status(403).is_transient());
        assert!(!FetchError::NoDataFile.is_transient());
    }
}
