//! HTTP fetch utilities and the persistent seen-offer cache for dealwatch.

use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use dealwatch_core::RawOffer;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "dealwatch-storage";

pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/115.0.0.0 Safari/537.36";

const CACHE_FORMAT_VERSION: u32 = 1;
const ZSTD_LEVEL: i32 = 10;

/// Throttling and server-side failures are worth another attempt.
pub fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

pub fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

/// `Retry-After` in delta-seconds form; HTTP-date values are ignored.
fn retry_after(resp: &reqwest::Response) -> Option<Duration> {
    let value = resp.headers().get(reqwest::header::RETRY_AFTER)?;
    value.to_str().ok()?.trim().parse().ok().map(Duration::from_secs)
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Wait before retry `attempt` (0-based): doubling from `base_delay` unless the
    /// server named a delay, always capped at `max_delay`.
    pub fn delay(&self, attempt: usize, server_hint: Option<Duration>) -> Duration {
        let doubled = self
            .base_delay
            .saturating_mul(1u32.checked_shl(attempt as u32).unwrap_or(u32::MAX));
        server_hint.unwrap_or(doubled).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
    /// Upper bound on in-flight requests across all tasks sharing the fetcher.
    pub concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            concurrency: 8,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("fetcher is shutting down")]
    Closed,
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
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
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(&self, source_id: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", source_id, url);
        self.execute(|| self.client.get(url)).instrument(span).await
    }

    /// POSTs a JSON body and returns the response as text.
    pub async fn post_json_text(
        &self,
        source_id: &str,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<String, FetchError> {
        let span = info_span!("http_post", source_id, url);
        let resp = self
            .execute(|| self.client.post(url).json(body))
            .instrument(span)
            .await?;
        Ok(String::from_utf8_lossy(&resp.body).into_owned())
    }

    /// Follows redirects with a HEAD request. Any failure keeps the original URL.
    pub async fn resolve_redirect(&self, url: &str) -> String {
        let Ok(_permit) = self.limit.acquire().await else {
            return url.to_string();
        };
        let result = self
            .client
            .head(url)
            .send()
            .await
            .and_then(|resp| resp.error_for_status());
        match result {
            Ok(resp) => resp.url().to_string(),
            Err(err) => {
                debug!(url, error = %err, "HEAD failed; keeping original link");
                url.to_string()
            }
        }
    }

    async fn execute<F>(&self, build: F) -> Result<FetchedResponse, FetchError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let _permit = self.limit.acquire().await.map_err(|_| FetchError::Closed)?;
        let mut attempt = 0usize;

        loop {
            let retry_in = match build().send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }
                    if !is_retryable_status(status) || attempt >= self.backoff.max_retries {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        });
                    }
                    debug!(attempt, %status, "retrying after server status");
                    self.backoff.delay(attempt, retry_after(&resp))
                }
                Err(err) => {
                    if !is_retryable_error(&err) || attempt >= self.backoff.max_retries {
                        return Err(FetchError::Request(err));
                    }
                    debug!(attempt, error = %err, "retrying request");
                    self.backoff.delay(attempt, None)
                }
            };
            tokio::time::sleep(retry_in).await;
            attempt += 1;
        }
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache io at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cache encoding: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    version: u32,
    entries: BTreeSet<String>,
}

/// Set of offers already reported in earlier runs, persisted as zstd-compressed JSON.
///
/// The cache is a scoped resource: call [`SeenCache::flush`] on the success path to
/// observe write errors. Dropping a dirty cache flushes it on every other exit path
/// (early return, `?`, unwinding).
#[derive(Debug)]
pub struct SeenCache {
    path: PathBuf,
    entries: BTreeSet<String>,
    dirty: bool,
}

impl SeenCache {
    /// Loads the cache at `path`. Missing or unreadable files start an empty cache.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match read_cache_file(&path) {
            Ok(Some(entries)) => {
                debug!(path = %path.display(), entries = entries.len(), "loaded seen-offer cache");
                entries
            }
            Ok(None) => {
                debug!(path = %path.display(), "no seen-offer cache yet");
                BTreeSet::new()
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to load cache; starting empty");
                BTreeSet::new()
            }
        };
        Self {
            path,
            entries,
            dirty: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn fingerprint(offer: &RawOffer) -> String {
        let mut hasher = Sha256::new();
        hasher.update(offer.source_id.as_bytes());
        hasher.update([0x1f]);
        hasher.update(offer.link.as_bytes());
        hasher.update([0x1f]);
        hasher.update(offer.title.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn contains(&self, offer: &RawOffer) -> bool {
        self.entries.contains(&Self::fingerprint(offer))
    }

    /// Records the offer; returns `true` when it was not seen before.
    pub fn insert(&mut self, offer: &RawOffer) -> bool {
        let inserted = self.entries.insert(Self::fingerprint(offer));
        self.dirty |= inserted;
        inserted
    }

    /// Keeps only offers not seen before and records them as seen.
    pub fn retain_unseen(&mut self, offers: Vec<RawOffer>) -> Vec<RawOffer> {
        let before = self.entries.len();
        let fresh: Vec<RawOffer> = offers.into_iter().filter(|o| self.insert(o)).collect();
        debug!(
            added = self.entries.len() - before,
            size = self.entries.len(),
            "seen-offer cache updated"
        );
        fresh
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Writes the cache if it changed since the last flush. Returns whether a write happened.
    pub fn flush(&mut self) -> Result<bool, CacheError> {
        if !self.dirty {
            return Ok(false);
        }
        write_cache_file(&self.path, &self.entries)?;
        self.dirty = false;
        debug!(path = %self.path.display(), entries = self.entries.len(), "saved seen-offer cache");
        Ok(true)
    }
}

impl Drop for SeenCache {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            warn!(path = %self.path.display(), error = %err, "failed to save cache on drop");
        }
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> CacheError + '_ {
    move |source| CacheError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn read_cache_file(path: &Path) -> Result<Option<BTreeSet<String>>, CacheError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read(path).map_err(io_err(path))?;
    let json = zstd::decode_all(raw.as_slice()).map_err(io_err(path))?;
    let file: CacheFile = serde_json::from_slice(&json)?;
    if file.version != CACHE_FORMAT_VERSION {
        warn!(version = file.version, "unknown cache version; starting empty");
        return Ok(Some(BTreeSet::new()));
    }
    Ok(Some(file.entries))
}

/// Atomic temp-file + rename so a crash never leaves a half-written cache.
fn write_cache_file(path: &Path, entries: &BTreeSet<String>) -> Result<(), CacheError> {
    let json = serde_json::to_vec(&CacheFile {
        version: CACHE_FORMAT_VERSION,
        entries: entries.clone(),
    })?;
    let compressed = zstd::encode_all(json.as_slice(), ZSTD_LEVEL).map_err(io_err(path))?;

    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).map_err(io_err(&parent))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), compressed.len()));
    let write_result = fs::File::create(&temp_path).and_then(|mut file| {
        file.write_all(&compressed)?;
        file.sync_all()
    });
    if let Err(err) = write_result {
        let _ = fs::remove_file(&temp_path);
        return Err(io_err(&temp_path)(err));
    }
    if let Err(err) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(io_err(path)(err));
    }
    Ok(())
}
