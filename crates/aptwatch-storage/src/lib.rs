//! Snapshot persistence + HTTP fetch utilities for aptwatch.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use anyhow::Context;
use aptwatch_core::{Listing, ListingError};
use async_trait::async_trait;
use chrono::{Local, NaiveDateTime};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "aptwatch-storage";

const SNAPSHOT_PREFIX: &str = "cache_";
const SNAPSHOT_SUFFIX: &str = ".json";
const LOCK_FILE_NAME: &str = ".aptwatch.lock";
/// `YYYY_MM_DD_HH`
const SNAPSHOT_STAMP_LEN: usize = 13;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("reading snapshot {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing snapshot {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("encoding snapshot: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("refusing to save listing #{index}: {source}")]
    InvalidListing {
        index: usize,
        #[source]
        source: ListingError,
    },
    #[error("writing snapshot {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("snapshot store is locked by another run ({path}); remove it if no scan is running")]
    Locked { path: PathBuf },
    #[error("{0}")]
    Message(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedSnapshot {
    pub location: String,
    pub listings: usize,
    pub content_hash: String,
}

/// Single-writer lease held for one load-merge-save cycle.
#[derive(Debug)]
pub struct SnapshotLease {
    lock_path: Option<PathBuf>,
}

impl SnapshotLease {
    pub fn unlocked() -> Self {
        Self { lock_path: None }
    }
}

impl Drop for SnapshotLease {
    fn drop(&mut self) {
        if let Some(path) = self.lock_path.take() {
            if let Err(err) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), error = %err, "failed to release snapshot lock");
            }
        }
    }
}

/// Prior-state boundary of the merge engine: the single most recent
/// snapshot in, a full replacement snapshot out.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Most recent snapshot, or empty when nothing has been persisted yet.
    /// An unreadable latest snapshot is an error, never an empty result.
    async fn load_latest(&self) -> Result<Vec<Listing>, SnapshotError>;

    async fn save(&self, listings: &[Listing]) -> Result<SavedSnapshot, SnapshotError>;

    async fn acquire(&self) -> Result<SnapshotLease, SnapshotError>;

    fn describe(&self) -> String;
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Pretty JSON array with 4-space indentation. Listings that could not be
/// loaded back are rejected up front.
pub fn encode_snapshot(listings: &[Listing]) -> Result<Vec<u8>, SnapshotError> {
    for (index, listing) in listings.iter().enumerate() {
        listing
            .validate()
            .map_err(|source| SnapshotError::InvalidListing { index, source })?;
    }
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    listings.serialize(&mut ser)?;
    Ok(buf)
}

/// Directory of hour-stamped `cache_YYYY_MM_DD_HH.json` files.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    root: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn file_name_for(stamp: NaiveDateTime) -> String {
        format!(
            "{SNAPSHOT_PREFIX}{}{SNAPSHOT_SUFFIX}",
            stamp.format("%Y_%m_%d_%H")
        )
    }

    /// Hour stamp encoded in a `cache_YYYY_MM_DD_HH.json` name, if it has one.
    pub fn snapshot_stamp(name: &str) -> Option<NaiveDateTime> {
        let stamp = name
            .strip_prefix(SNAPSHOT_PREFIX)?
            .strip_suffix(SNAPSHOT_SUFFIX)?;
        if stamp.len() != SNAPSHOT_STAMP_LEN {
            return None;
        }
        NaiveDateTime::parse_from_str(&format!("{stamp}_00"), "%Y_%m_%d_%H_%M").ok()
    }

    pub fn is_snapshot_file_name(name: &str) -> bool {
        Self::snapshot_stamp(name).is_some()
    }

    /// Snapshot file names in ascending order; the last one is the latest.
    pub async fn snapshot_files(&self) -> Result<Vec<String>, SnapshotError> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(SnapshotError::Read {
                    path: self.root.clone(),
                    source,
                })
            }
        };

        let mut names = Vec::new();
        loop {
            let entry = entries.next_entry().await.map_err(|source| SnapshotError::Read {
                path: self.root.clone(),
                source,
            })?;
            let Some(entry) = entry else { break };
            let name = entry.file_name().to_string_lossy().to_string();
            if Self::is_snapshot_file_name(&name) {
                names.push(name);
            } else if name.starts_with(SNAPSHOT_PREFIX) {
                warn!(file = %name, "ignoring file that is not an hour-stamped snapshot");
            }
        }
        names.sort();
        Ok(names)
    }

    pub async fn latest_path(&self) -> Result<Option<PathBuf>, SnapshotError> {
        Ok(self
            .snapshot_files()
            .await?
            .pop()
            .map(|name| self.root.join(name)))
    }

    pub async fn read_snapshot(&self, path: &Path) -> Result<Vec<Listing>, SnapshotError> {
        let bytes = fs::read(path).await.map_err(|source| SnapshotError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|source| SnapshotError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Writes via temp file + rename; a second save in the same hour
    /// replaces that hour's file.
    pub async fn save_at(
        &self,
        listings: &[Listing],
        stamp: NaiveDateTime,
    ) -> Result<SavedSnapshot, SnapshotError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|source| SnapshotError::Write {
                path: self.root.clone(),
                source,
            })?;

        let bytes = encode_snapshot(listings)?;
        let path = self.root.join(Self::file_name_for(stamp));
        let temp_path = self.root.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let write_err = |source: std::io::Error| SnapshotError::Write {
            path: temp_path.clone(),
            source,
        };

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(write_err)?;
        file.write_all(&bytes).await.map_err(write_err)?;
        file.flush().await.map_err(write_err)?;
        file.sync_all().await.map_err(write_err)?;
        drop(file);

        if let Err(source) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(SnapshotError::Write { path, source });
        }

        info!(path = %path.display(), listings = listings.len(), "saved snapshot");
        Ok(SavedSnapshot {
            location: path.display().to_string(),
            listings: listings.len(),
            content_hash: sha256_hex(&bytes),
        })
    }

    fn lock_path(&self) -> PathBuf {
        self.root.join(LOCK_FILE_NAME)
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn load_latest(&self) -> Result<Vec<Listing>, SnapshotError> {
        let Some(path) = self.latest_path().await? else {
            info!(root = %self.root.display(), "no snapshot found; starting empty");
            return Ok(Vec::new());
        };
        info!(path = %path.display(), "using snapshot as cache");
        self.read_snapshot(&path).await
    }

    async fn save(&self, listings: &[Listing]) -> Result<SavedSnapshot, SnapshotError> {
        self.save_at(listings, Local::now().naive_local()).await
    }

    async fn acquire(&self) -> Result<SnapshotLease, SnapshotError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|source| SnapshotError::Write {
                path: self.root.clone(),
                source,
            })?;
        let path = self.lock_path();
        let mut file = match fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                return Err(SnapshotError::Locked { path })
            }
            Err(source) => return Err(SnapshotError::Write { path, source }),
        };
        let lease = SnapshotLease {
            lock_path: Some(path.clone()),
        };
        file.write_all(std::process::id().to_string().as_bytes())
            .await
            .map_err(|source| SnapshotError::Write { path, source })?;
        debug!(root = %self.root.display(), "acquired snapshot lock");
        Ok(lease)
    }

    fn describe(&self) -> String {
        self.root.display().to_string()
    }
}

/// Keeps every saved snapshot in memory; the last one is the latest.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    history: StdMutex<Vec<Vec<Listing>>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(listings: Vec<Listing>) -> Self {
        Self {
            history: StdMutex::new(vec![listings]),
        }
    }

    pub fn history(&self) -> Vec<Vec<Listing>> {
        self.history.lock().map(|h| h.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn load_latest(&self) -> Result<Vec<Listing>, SnapshotError> {
        let history = self
            .history
            .lock()
            .map_err(|_| SnapshotError::Message("memory snapshot store poisoned".into()))?;
        Ok(history.last().cloned().unwrap_or_default())
    }

    async fn save(&self, listings: &[Listing]) -> Result<SavedSnapshot, SnapshotError> {
        let bytes = encode_snapshot(listings)?;
        let mut history = self
            .history
            .lock()
            .map_err(|_| SnapshotError::Message("memory snapshot store poisoned".into()))?;
        history.push(listings.to_vec());
        Ok(SavedSnapshot {
            location: format!("memory#{}", history.len()),
            listings: listings.len(),
            content_hash: sha256_hex(&bytes),
        })
    }

    async fn acquire(&self) -> Result<SnapshotLease, SnapshotError> {
        Ok(SnapshotLease::unlocked())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

/// Retry schedule for the search endpoint: `attempts` extra tries after the
/// first, waiting `first_delay` doubled per try and capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub first_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            first_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    pub fn delay(&self, retry: u32) -> Duration {
        let doubled = self
            .first_delay
            .checked_mul(1u32.checked_shl(retry).unwrap_or(u32::MAX))
            .unwrap_or(self.max_delay);
        doubled.min(self.max_delay)
    }

    /// Throttling and server-side failures; anything else is final.
    pub fn is_transient_status(status: StatusCode) -> bool {
        status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
    }

    pub fn is_transient_error(err: &reqwest::Error) -> bool {
        err.is_timeout() || err.is_connect()
    }
}

/// Enforces a minimum gap between consecutive requests.
#[derive(Debug)]
pub struct RequestPacer {
    min_interval: Duration,
    last_sent: Mutex<Option<Instant>>,
}

impl RequestPacer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_sent: Mutex::new(None),
        }
    }

    pub async fn wait_turn(&self) {
        let mut last_sent = self.last_sent.lock().await;
        if let Some(at) = *last_sent {
            let since = at.elapsed();
            if since < self.min_interval {
                tokio::time::sleep(self.min_interval - since).await;
            }
        }
        *last_sent = Some(Instant::now());
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub default_headers: Vec<(String, String)>,
    pub retry: RetryPolicy,
    pub min_request_interval: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            default_headers: Vec::new(),
            retry: RetryPolicy::default(),
            min_request_interval: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("search request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("search endpoint {url} answered {status}")]
    Status { status: u16, url: String },
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    pacer: RequestPacer,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in &config.default_headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("invalid header name {name}"))?;
            let value = HeaderValue::from_str(value)
                .with_context(|| format!("invalid value for header {name}"))?;
            headers.insert(name, value);
        }

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.as_str());
        }

        Ok(Self {
            client: builder.build().context("building search http client")?,
            pacer: RequestPacer::new(config.min_request_interval),
            retry: config.retry,
        })
    }

    /// POSTs a JSON body. Transient failures are retried per [`RetryPolicy`];
    /// the last failure is returned once retries run out.
    pub async fn post_json(
        &self,
        run_id: Uuid,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_post", %run_id, url);
        async move {
            let mut retry = 0u32;
            loop {
                self.pacer.wait_turn().await;
                let failure = match self.client.post(url).json(body).send().await {
                    Ok(resp) if resp.status().is_success() => {
                        let status = resp.status();
                        let body = resp.bytes().await?.to_vec();
                        debug!(status = status.as_u16(), bytes = body.len(), "search response");
                        return Ok(FetchedResponse { status, body });
                    }
                    Ok(resp) => {
                        let status = resp.status();
                        let err = FetchError::Status {
                            status: status.as_u16(),
                            url: url.to_string(),
                        };
                        (RetryPolicy::is_transient_status(status), err)
                    }
                    Err(err) => (RetryPolicy::is_transient_error(&err), FetchError::from(err)),
                };

                let (transient, err) = failure;
                if !transient || retry >= self.retry.attempts {
                    return Err(err);
                }
                let wait = self.retry.delay(retry);
                warn!(error = %err, retry, wait_ms = wait.as_millis() as u64, "retrying search request");
                tokio::time::sleep(wait).await;
                retry += 1;
            }
        }
        .instrument(span)
        .await
    }
}
