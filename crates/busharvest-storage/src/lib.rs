//! HTTP page fetching with bounded retry, plus snapshot object storage sinks.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "busharvest-storage";

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
AppleWebKit/537.36 (KHTML, like Gecko) Chrome/114.0.0.0 Safari/537.36";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Number of identical attempts made for one URL. Attempts are re-issued immediately.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("gave up on {url} after {attempts} attempts: {last}")]
    Exhausted {
        url: String,
        attempts: usize,
        #[source]
        last: Box<FetchError>,
    },
}

/// Run `attempt` up to `policy.max_attempts` times, returning the first success.
///
/// Every failure is treated as retryable. Exhaustion is reported as
/// [`FetchError::Exhausted`] carrying the last underlying error.
pub async fn with_retries<T, F, Fut>(
    url: &str,
    policy: RetryPolicy,
    mut attempt: F,
) -> Result<T, FetchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut last_error = None;

    for attempt_no in 1..=max_attempts {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                warn!(url, attempt = attempt_no, max_attempts, error = %err, "fetch attempt failed");
                last_error = Some(err);
            }
        }
    }

    let last = last_error.map(Box::new).unwrap_or_else(|| {
        Box::new(FetchError::HttpStatus {
            status: 0,
            url: url.to_string(),
        })
    });
    Err(FetchError::Exhausted {
        url: url.to_string(),
        attempts: max_attempts,
        last,
    })
}

/// Anything that can return the body of a catalog or detail page.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_text(&self, url: &str) -> Result<String, FetchError>;
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent)
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            retry: config.retry,
        })
    }

    async fn fetch_once(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let body = resp.bytes().await?.to_vec();
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        with_retries(url, self.retry, || self.fetch_once(url))
            .instrument(span)
            .await
    }
}

#[async_trait]
impl PageSource for HttpFetcher {
    async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        let resp = self.fetch_bytes(url).await?;
        debug!(url, final_url = %resp.final_url, bytes = resp.body.len(), "fetched page");
        Ok(String::from_utf8_lossy(&resp.body).into_owned())
    }
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("serializing snapshot: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("writing snapshot {key}: {source}")]
    Write {
        key: String,
        #[source]
        source: anyhow::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSnapshot {
    pub key: String,
    pub sha256: String,
    pub byte_size: usize,
}

/// Object-storage write primitive used by the snapshot exporter.
#[async_trait]
pub trait SnapshotSink: Send + Sync {
    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str)
        -> Result<StoredSnapshot, ExportError>;
}

#[derive(Debug, Clone)]
pub struct S3SinkConfig {
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone)]
pub struct S3SnapshotSink {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3SnapshotSink {
    /// Build a client from the default AWS credential chain.
    pub async fn new(config: S3SinkConfig) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()));
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(config.endpoint.is_some())
            .build();

        info!(bucket = %config.bucket, region = %config.region, "snapshot sink initialized");
        Self {
            client: aws_sdk_s3::Client::from_conf(s3_config),
            bucket: config.bucket,
        }
    }
}

#[async_trait]
impl SnapshotSink for S3SnapshotSink {
    async fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<StoredSnapshot, ExportError> {
        let sha256 = sha256_hex(&body);
        let byte_size = body.len();
        debug!("uploading {} bytes to s3://{}/{}", byte_size, self.bucket, key);

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|err| ExportError::Write {
                key: key.to_string(),
                source: anyhow::Error::new(err).context(format!("put_object s3://{}/{key}", self.bucket)),
            })?;

        info!(bucket = %self.bucket, key, byte_size, %sha256, "snapshot uploaded");
        Ok(StoredSnapshot {
            key: key.to_string(),
            sha256,
            byte_size,
        })
    }
}

/// Writes snapshots under a local directory, replacing the previous object atomically.
#[derive(Debug, Clone)]
pub struct FsSnapshotSink {
    root: PathBuf,
}

impl FsSnapshotSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn write_atomic(&self, key: &str, bytes: &[u8]) -> anyhow::Result<PathBuf> {
        let absolute_path = self.root.join(key);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating snapshot directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp snapshot file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp snapshot file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp snapshot file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp snapshot {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }
        Ok(absolute_path)
    }
}

#[async_trait]
impl SnapshotSink for FsSnapshotSink {
    async fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        _content_type: &str,
    ) -> Result<StoredSnapshot, ExportError> {
        let path = self
            .write_atomic(key, &body)
            .await
            .map_err(|source| ExportError::Write {
                key: key.to_string(),
                source,
            })?;
        info!(path = %path.display(), bytes = body.len(), "snapshot written");
        Ok(StoredSnapshot {
            key: key.to_string(),
            sha256: sha256_hex(&body),
            byte_size: body.len(),
        })
    }
}
