//! HTTP fetch client, content hashing and the content-addressed raw body
//! archive used by the OfferWatch ingestion pipeline.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{header, redirect, StatusCode};
use serde::Serialize;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "offerwatch-storage";

pub const DEFAULT_USER_AGENT: &str = "OfferWatchBot/0.1 (+catalog freshness checker)";
pub const ACCEPT_HTML: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Serializes a value as JSON with object keys sorted at every depth, so equal
/// observations always produce identical bytes.
pub fn canonical_json<T: Serialize>(value: &T) -> serde_json::Result<String> {
    let value = serde_json::to_value(value)?;
    serde_json::to_string(&sort_keys(value))
}

fn sort_keys(value: JsonValue) -> JsonValue {
    match value {
        JsonValue::Object(map) => {
            let sorted: BTreeMap<String, JsonValue> =
                map.into_iter().map(|(k, v)| (k, sort_keys(v))).collect();
            let mut out = serde_json::Map::new();
            for (k, v) in sorted {
                out.insert(k, v);
            }
            JsonValue::Object(out)
        }
        JsonValue::Array(items) => JsonValue::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

pub fn stable_hash<T: Serialize>(value: &T) -> serde_json::Result<String> {
    Ok(sha256_hex(canonical_json(value)?.as_bytes()))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchivedBody {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Content-addressed on-disk archive of fetched document bodies.
#[derive(Debug, Clone)]
pub struct RawArchive {
    root: PathBuf,
}

impl RawArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn extension_for(content_type: Option<&str>) -> &'static str {
        let mime = content_type
            .and_then(|ct| ct.split(';').next())
            .map(|ct| ct.trim().to_ascii_lowercase())
            .unwrap_or_default();
        match mime.as_str() {
            "text/html" | "application/xhtml+xml" => "html",
            "application/json" | "application/ld+json" => "json",
            "text/plain" => "txt",
            "application/xml" | "text/xml" => "xml",
            _ => "bin",
        }
    }

    pub fn relative_path_for(
        fetched_at: DateTime<Utc>,
        source_slug: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        PathBuf::from(fetched_at.format("%Y%m%d_%H%M%S").to_string())
            .join(source_slug)
            .join(format!("{content_hash}.{extension}"))
    }

    /// Writes `bytes` under its hash-addressed path; an existing file at that
    /// path means the body was already archived.
    pub async fn archive(
        &self,
        fetched_at: DateTime<Utc>,
        source_slug: &str,
        content_type: Option<&str>,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedBody> {
        let content_hash = sha256_hex(bytes);
        let relative_path = Self::relative_path_for(
            fetched_at,
            source_slug,
            &content_hash,
            Self::extension_for(content_type),
        );
        let target = self.root.join(&relative_path);
        let Some(dir) = target.parent().map(Path::to_path_buf) else {
            anyhow::bail!("archive path {} has no parent", target.display());
        };
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating archive directory {}", dir.display()))?;

        let deduplicated = if fs::try_exists(&target)
            .await
            .with_context(|| format!("checking archive path {}", target.display()))?
        {
            true
        } else {
            write_atomically(&dir, &target, bytes).await?
        };

        Ok(ArchivedBody {
            content_hash,
            relative_path,
            byte_size: bytes.len(),
            deduplicated,
        })
    }
}

/// Returns `true` when a concurrent writer won the rename race.
async fn write_atomically(dir: &Path, target: &Path, bytes: &[u8]) -> anyhow::Result<bool> {
    let temp_path = dir.join(format!(".{}.partial", Uuid::new_v4()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing {}", temp_path.display()))?;
    drop(file);

    match fs::rename(&temp_path, target).await {
        Ok(()) => Ok(false),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            let _ = fs::remove_file(&temp_path).await;
            Ok(true)
        }
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(err).with_context(|| format!("renaming archive body into {}", target.display()))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Capped exponential backoff, shared by fetch retries and job re-queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Policy used to push `run_after` forward when a job attempt fails.
    pub fn job_retry() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60 * 60),
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub max_redirects: usize,
    pub max_body_bytes: usize,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            max_redirects: 10,
            max_body_bytes: 4 * 1024 * 1024,
            global_concurrency: 16,
            per_source_concurrency: 2,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// A response was received. Non-2xx statuses are still documents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchedDocument {
    pub requested_url: String,
    pub final_url: String,
    pub status: u16,
    pub content_type: Option<String>,
    #[serde(skip)]
    pub body: Vec<u8>,
    pub truncated: bool,
    pub fetched_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

impl FetchedDocument {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transport failure for {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("invalid url {url}: {message}")]
    InvalidUrl { url: String, message: String },
    #[error("fetcher is shutting down")]
    Closed,
    #[error("no recorded response for {url}")]
    NotRecorded { url: String },
}

#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(
        &self,
        source_slug: &str,
        url: &str,
        timeout: Duration,
    ) -> Result<FetchedDocument, FetchError>;
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    default_timeout: Duration,
    max_body_bytes: usize,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::ACCEPT, header::HeaderValue::from_static(ACCEPT_HTML));

        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
            .redirect(redirect::Policy::limited(config.max_redirects))
            .timeout(config.timeout)
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            default_timeout: config.timeout,
            max_body_bytes: config.max_body_bytes.max(1),
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    async fn per_source_semaphore(&self, source_slug: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_slug.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    async fn read_capped(&self, mut resp: reqwest::Response, url: &str) -> Result<(Vec<u8>, bool), FetchError> {
        let mut body = Vec::new();
        loop {
            let chunk = resp.chunk().await.map_err(|source| FetchError::Transport {
                url: url.to_string(),
                source,
            })?;
            let Some(chunk) = chunk else {
                return Ok((body, false));
            };
            let room = self.max_body_bytes - body.len();
            if chunk.len() > room {
                body.extend_from_slice(&chunk[..room]);
                return Ok((body, true));
            }
            body.extend_from_slice(&chunk);
        }
    }

    async fn fetch_with_retries(&self, url: &str, timeout: Duration) -> Result<FetchedDocument, FetchError> {
        let started = Instant::now();
        let mut attempt = 0usize;
        loop {
            let result = self.client.get(url).timeout(timeout).send().await;
            match result {
                Ok(resp) => {
                    let status = resp.status();
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(status = status.as_u16(), attempt, "retryable status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    let final_url = resp.url().to_string();
                    let content_type = resp
                        .headers()
                        .get(header::CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok())
                        .map(ToString::to_string);
                    let (body, truncated) = self.read_capped(resp, url).await?;
                    if truncated {
                        warn!(bytes = body.len(), "response body truncated");
                    }
                    return Ok(FetchedDocument {
                        requested_url: url.to_string(),
                        final_url,
                        status: status.as_u16(),
                        content_type,
                        body,
                        truncated,
                        fetched_at: Utc::now(),
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(error = %err, attempt, "retryable transport error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Transport {
                        url: url.to_string(),
                        source: err,
                    });
                }
            }
        }
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(
        &self,
        source_slug: &str,
        url: &str,
        timeout: Duration,
    ) -> Result<FetchedDocument, FetchError> {
        if reqwest::Url::parse(url).is_err() {
            return Err(FetchError::InvalidUrl {
                url: url.to_string(),
                message: "not an absolute url".to_string(),
            });
        }
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;
        let per_source = self.per_source_semaphore(source_slug).await;
        let _source = per_source.acquire().await.map_err(|_| FetchError::Closed)?;

        let span = info_span!("http_fetch", source = source_slug, url);
        self.fetch_with_retries(url, timeout).instrument(span).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn sha256_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn canonical_json_ignores_key_order() {
        let a = json!({"b": 1, "a": {"y": true, "x": [ {"k": 2, "j": 1} ]}});
        let b = json!({"a": {"x": [ {"j": 1, "k": 2} ], "y": true}, "b": 1});
        assert_eq!(canonical_json(&a).unwrap(), canonical_json(&b).unwrap());
        assert_eq!(
            canonical_json(&a).unwrap(),
            r#"{"a":{"x":[{"j":1,"k":2}],"y":true},"b":1}"#
        );
        assert_eq!(stable_hash(&a).unwrap(), stable_hash(&b).unwrap());
    }

    #[tokio::test]
    async fn archive_deduplicates_identical_bodies() {
        let dir = tempdir().expect("tempdir");
        let archive = RawArchive::new(dir.path());
        let fetched_at = Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).unwrap();

        let first = archive
            .archive(fetched_at, "aquashop", Some("text/html; charset=utf-8"), b"<html>same</html>")
            .await
            .expect("first archive");
        let second = archive
            .archive(fetched_at, "aquashop", Some("text/html"), b"<html>same</html>")
            .await
            .expect("second archive");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.relative_path.to_string_lossy().ends_with(".html"));
        assert!(archive.root().join(&first.relative_path).exists());
    }

    #[test]
    fn extension_follows_mime_type() {
        assert_eq!(RawArchive::extension_for(Some("application/json")), "json");
        assert_eq!(RawArchive::extension_for(Some("image/png")), "bin");
        assert_eq!(RawArchive::extension_for(None), "bin");
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));

        let jobs = BackoffPolicy::job_retry();
        assert_eq!(jobs.delay_for_attempt(0), Duration::from_secs(60));
        assert_eq!(jobs.delay_for_attempt(10), Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn invalid_urls_are_rejected_before_any_request() {
        let fetcher = HttpFetcher::new(HttpClientConfig::default()).expect("client");
        let err = fetcher
            .fetch("aquashop", "/relative/path", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::InvalidUrl { .. }));
    }
}
