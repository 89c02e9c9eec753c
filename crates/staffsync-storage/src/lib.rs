//! Atomic staff-data persistence + HTTP fetch utilities for staffsync.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use staffsync_core::{BiosRecord, RosterSnapshot};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "staffsync-storage";

pub const ROSTER_FILE_NAME: &str = "canvas-staff.json";
pub const BIOS_FILE_NAME: &str = "instructor-bio.json";

pub const DEFAULT_MAX_PAGES: usize = 100;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("creating directory {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("writing temp file {}: {source}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("replacing {}: {source}", path.display())]
    Replace {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("backing up {}: {source}", path.display())]
    Backup {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("serializing {what}: {source}")]
    Serialize {
        what: &'static str,
        source: serde_json::Error,
    },
}

/// Replace `path` with `bytes` so readers only ever see the old or the new
/// contents: write a temp file beside it, fsync, then rename over.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PersistError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .map_err(|source| PersistError::CreateDir {
            path: parent.clone(),
            source,
        })?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    if let Err(source) = write_temp_file(&temp_path, bytes).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(PersistError::Write {
            path: temp_path,
            source,
        });
    }

    if let Err(source) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(PersistError::Replace {
            path: path.to_path_buf(),
            source,
        });
    }

    Ok(())
}

async fn write_temp_file(temp_path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(temp_path)
        .await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await?;
    Ok(())
}

fn to_pretty_json<T: Serialize>(value: &T, what: &'static str) -> Result<Vec<u8>, PersistError> {
    serde_json::to_vec_pretty(value).map_err(|source| PersistError::Serialize { what, source })
}

/// Outcome of reading the bios file. A missing or broken file is not an error;
/// the reconciler starts from an empty record.
#[derive(Debug, Clone, PartialEq)]
pub enum BiosLoad {
    Missing,
    Loaded(BiosRecord),
    Unparsable { reason: String },
}

impl BiosLoad {
    pub fn into_record(self) -> BiosRecord {
        match self {
            BiosLoad::Loaded(record) => record,
            BiosLoad::Missing | BiosLoad::Unparsable { .. } => BiosRecord::default(),
        }
    }

    pub fn is_unparsable(&self) -> bool {
        matches!(self, BiosLoad::Unparsable { .. })
    }
}

/// The two JSON files the site reads, rooted at its data directory.
#[derive(Debug, Clone)]
pub struct StaffDataStore {
    root: PathBuf,
}

impl StaffDataStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn roster_path(&self) -> PathBuf {
        self.root.join(ROSTER_FILE_NAME)
    }

    pub fn bios_path(&self) -> PathBuf {
        self.root.join(BIOS_FILE_NAME)
    }

    pub fn bios_backup_path(&self) -> PathBuf {
        self.root.join(format!("{BIOS_FILE_NAME}.unparsable.bak"))
    }

    pub async fn save_roster(&self, roster: &RosterSnapshot) -> Result<PathBuf, PersistError> {
        let path = self.roster_path();
        write_atomic(&path, &to_pretty_json(roster, "roster snapshot")?).await?;
        Ok(path)
    }

    /// Reads the persisted roster; `None` when nothing has been written yet.
    pub async fn load_roster(&self) -> anyhow::Result<Option<RosterSnapshot>> {
        let path = self.roster_path();
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", path.display()));
            }
        };
        let roster = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(roster))
    }

    pub async fn load_bios(&self) -> BiosLoad {
        let path = self.bios_path();
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return BiosLoad::Missing,
            Err(err) => {
                return BiosLoad::Unparsable {
                    reason: format!("reading {}: {err}", path.display()),
                }
            }
        };
        match serde_json::from_str(&text) {
            Ok(record) => BiosLoad::Loaded(record),
            Err(err) => BiosLoad::Unparsable {
                reason: format!("parsing {}: {err}", path.display()),
            },
        }
    }

    pub async fn save_bios(&self, record: &BiosRecord) -> Result<PathBuf, PersistError> {
        let path = self.bios_path();
        write_atomic(&path, &to_pretty_json(record, "bios record")?).await?;
        Ok(path)
    }

    /// Keeps a copy of a bios file we could not parse before it is replaced.
    pub async fn backup_bios(&self) -> Result<PathBuf, PersistError> {
        let source_path = self.bios_path();
        let backup_path = self.bios_backup_path();
        let bytes = fs::read(&source_path)
            .await
            .map_err(|source| PersistError::Backup {
                path: source_path.clone(),
                source,
            })?;
        write_atomic(&backup_path, &bytes).await?;
        Ok(backup_path)
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
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
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
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub bearer_token: Option<String>,
    pub backoff: BackoffPolicy,
    /// Upper bound on pages followed by `fetch_all_pages`.
    pub max_pages: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            bearer_token: None,
            backoff: BackoffPolicy::default(),
            max_pages: DEFAULT_MAX_PAGES,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("credentials rejected (http {status}) for {url}")]
    Unauthorized { status: u16, url: String },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        source: serde_json::Error,
    },
    #[error("course {query:?} could not be resolved")]
    CourseNotFound { query: String },
    #[error("course {query:?} is ambiguous; matches: {}", candidates.join(", "))]
    AmbiguousCourse {
        query: String,
        candidates: Vec<String>,
    },
    #[error("invalid url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("pagination from {url} exceeded {limit} pages")]
    TooManyPages { url: String, limit: usize },
    #[error("refusing to follow next-page link to another origin: {url}")]
    ForeignNextLink { url: String },
    #[error("invalid authorization header: {0}")]
    InvalidHeader(#[from] header::InvalidHeaderValue),
    #[error("building http client: {0}")]
    Client(#[source] reqwest::Error),
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Unauthorized { status, .. } | FetchError::HttpStatus { status, .. } => {
                Some(*status)
            }
            FetchError::Request(err) => err.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
    pub next_page: Option<String>,
}

impl FetchedResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, FetchError> {
        serde_json::from_slice(&self.body).map_err(|source| FetchError::Decode {
            url: self.final_url.clone(),
            source,
        })
    }
}

/// Pulls the `rel="next"` target out of an RFC 8288 `Link` header value.
pub fn parse_next_link(value: &str) -> Option<String> {
    value.split(',').find_map(|link| {
        let mut parts = link.split(';');
        let target = parts.next()?.trim();
        let is_next = parts.any(|param| {
            let param = param.trim();
            param.eq_ignore_ascii_case("rel=\"next\"") || param.eq_ignore_ascii_case("rel=next")
        });
        let target = target.strip_prefix('<')?.strip_suffix('>')?;
        is_next.then(|| target.to_string())
    })
}

fn next_page_link(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::LINK)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find_map(parse_next_link)
}

/// Resolves `link` against the page it came from and keeps it only when it
/// shares the origin of the first page.
fn same_origin_link(first: &Url, current: &Url, link: &str) -> Result<Url, FetchError> {
    let next = current.join(link).map_err(|err| FetchError::InvalidUrl {
        url: link.to_string(),
        reason: err.to_string(),
    })?;
    if next.origin() != first.origin() {
        return Err(FetchError::ForeignNextLink {
            url: next.to_string(),
        });
    }
    Ok(next)
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
    max_pages: usize,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, FetchError> {
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        if let Some(token) = &config.bearer_token {
            let mut value = HeaderValue::from_str(&format!("Bearer {token}"))?;
            value.set_sensitive(true);
            headers.insert(header::AUTHORIZATION, value);
        }

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().map_err(FetchError::Client)?;

        Ok(Self {
            client,
            backoff: config.backoff,
            max_pages: config.max_pages,
        })
    }

    /// GET with retries on transient failures. Non-success statuses that are
    /// not worth retrying come back as errors.
    pub async fn fetch_bytes(&self, run_id: Uuid, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let next_page = next_page_link(resp.headers());
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                            next_page,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(status = status.as_u16(), attempt, "retrying after http status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                        return Err(FetchError::Unauthorized {
                            status: status.as_u16(),
                            url: final_url,
                        });
                    }
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(error = %err, attempt, "retrying after request error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }

    pub async fn fetch_json<T: DeserializeOwned>(
        &self,
        run_id: Uuid,
        url: &str,
    ) -> Result<T, FetchError> {
        self.fetch_bytes(run_id, url).await?.json()
    }

    /// Follows `Link` pagination from `url`, concatenating every page's array.
    ///
    /// Next links must stay on the origin of `url`, since every request
    /// carries the bearer token, and at most `max_pages` pages are read.
    pub async fn fetch_all_pages<T: DeserializeOwned>(
        &self,
        run_id: Uuid,
        url: &str,
    ) -> Result<Vec<T>, FetchError> {
        let first = Url::parse(url).map_err(|err| FetchError::InvalidUrl {
            url: url.to_string(),
            reason: err.to_string(),
        })?;
        let mut items = Vec::new();
        let mut next = Some(first.clone());
        let mut pages = 0usize;
        while let Some(page_url) = next.take() {
            if pages >= self.max_pages {
                return Err(FetchError::TooManyPages {
                    url: url.to_string(),
                    limit: self.max_pages,
                });
            }
            let response = self.fetch_bytes(run_id, page_url.as_str()).await?;
            let mut page: Vec<T> = response.json()?;
            items.append(&mut page);
            pages += 1;
            next = response
                .next_page
                .map(|link| same_origin_link(&first, &page_url, &link))
                .transpose()?;
        }
        debug!(url, pages, items = items.len(), "fetched paginated listing");
        Ok(items)
    }

    /// Single attempt with its own timeout; any status is returned to the caller.
    pub async fn probe(&self, url: &str, timeout: Duration) -> Result<FetchedResponse, FetchError> {
        let resp = self.client.get(url).timeout(timeout).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        let next_page = next_page_link(resp.headers());
        let body = resp.bytes().await?.to_vec();
        Ok(FetchedResponse {
            status,
            final_url,
            body,
            next_page,
        })
    }
}
