use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use reqwest::Client;
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use url::Url;

use crate::events::{Event, SegmentDescriptor};
use crate::layout::{StoragePaths, KEY_FILE};
use crate::retry::{retry_async, Backoff, Retryable};

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("network error fetching {url}: {message}")]
    Network { url: String, message: String },
    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("segment {index} size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        index: usize,
        expected: u64,
        actual: u64,
    },
    #[error("{url} ended after {actual} of {expected} bytes")]
    Truncated {
        url: String,
        expected: u64,
        actual: u64,
    },
    #[error("segment {index} downloaded empty")]
    Empty { index: usize },
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("event {event_id}: {failed} of {total} segments failed ({first_error})")]
    Incomplete {
        event_id: String,
        failed: usize,
        total: usize,
        first_error: String,
    },
}

impl Retryable for DownloadError {
    fn is_transient(&self) -> bool {
        match self {
            DownloadError::Network { .. }
            | DownloadError::Truncated { .. }
            | DownloadError::SizeMismatch { .. }
            | DownloadError::Empty { .. } => true,
            DownloadError::Status { status, .. } => {
                *status >= 500 || *status == 429 || *status == 408
            }
            _ => false,
        }
    }
}

pub type DownloadResult<T> = std::result::Result<T, DownloadError>;

/// Moves bytes from a URL into a local file.
#[async_trait]
pub trait MediaTransport: Send + Sync {
    /// Writes the resource at `url` to `path` and returns the byte count.
    async fn fetch_to_file(&self, url: &str, path: &Path) -> DownloadResult<u64>;
}

/// Streams `http(s)://` responses to disk and copies `file://` sources.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> DownloadResult<Self> {
        let client = Client::builder()
            .user_agent(concat!("doorbell-archiver/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|err| DownloadError::Network {
                url: String::new(),
                message: err.to_string(),
            })?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MediaTransport for HttpTransport {
    async fn fetch_to_file(&self, url: &str, path: &Path) -> DownloadResult<u64> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| DownloadError::Io {
                    source,
                    path: parent.to_path_buf(),
                })?;
        }
        let parsed = Url::parse(url).map_err(|err| DownloadError::InvalidUrl {
            url: url.to_string(),
            reason: err.to_string(),
        })?;
        if parsed.scheme() == "file" {
            let source_path = parsed
                .to_file_path()
                .map_err(|_| DownloadError::InvalidUrl {
                    url: url.to_string(),
                    reason: "not a local path".into(),
                })?;
            return fs::copy(&source_path, path)
                .await
                .map_err(|source| DownloadError::Io {
                    source,
                    path: source_path.clone(),
                });
        }

        let network = |err: reqwest::Error| DownloadError::Network {
            url: url.to_string(),
            message: err.to_string(),
        };
        let response = self.client.get(parsed).send().await.map_err(network)?;
        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        let expected = response.content_length();
        let mut stream = response.bytes_stream();
        let mut file = fs::File::create(path)
            .await
            .map_err(|source| DownloadError::Io {
                source,
                path: path.to_path_buf(),
            })?;
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let data = chunk.map_err(network)?;
            file.write_all(&data)
                .await
                .map_err(|source| DownloadError::Io {
                    source,
                    path: path.to_path_buf(),
                })?;
            written += data.len() as u64;
        }
        file.flush().await.map_err(|source| DownloadError::Io {
            source,
            path: path.to_path_buf(),
        })?;
        match expected {
            Some(expected) if expected != written => Err(DownloadError::Truncated {
                url: url.to_string(),
                expected,
                actual: written,
            }),
            _ => Ok(written),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DownloadSettings {
    pub concurrency: usize,
    pub backoff: Backoff,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadedSegment {
    pub index: usize,
    pub path: PathBuf,
    pub bytes: u64,
    pub duration: f64,
    pub reused: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadOutcome {
    /// Ordered by segment index.
    pub segments: Vec<DownloadedSegment>,
    pub key_path: Option<PathBuf>,
    pub fetched: usize,
    pub reused: usize,
}

impl DownloadOutcome {
    pub fn total_bytes(&self) -> u64 {
        self.segments.iter().map(|segment| segment.bytes).sum()
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.segments
            .iter()
            .map(|segment| segment.path.clone())
            .collect()
    }
}

/// Fetches one event's segments with bounded concurrency, resuming what is already on disk.
pub struct SegmentDownloader {
    transport: Arc<dyn MediaTransport>,
    settings: DownloadSettings,
}

impl SegmentDownloader {
    pub fn new(transport: Arc<dyn MediaTransport>, settings: DownloadSettings) -> Self {
        Self {
            transport,
            settings,
        }
    }

    pub async fn download(&self, event: &Event, dir: &Path) -> DownloadResult<DownloadOutcome> {
        fs::create_dir_all(dir)
            .await
            .map_err(|source| DownloadError::Io {
                source,
                path: dir.to_path_buf(),
            })?;

        let key_path = match &event.encryption {
            Some(key) => Some(self.fetch_key(&key.uri, dir).await?),
            None => None,
        };

        let fetches: Vec<_> = event
            .segments
            .iter()
            .map(|segment| async move { (segment.index, self.fetch_segment(segment, dir).await) })
            .collect();
        let mut results: Vec<(usize, DownloadResult<DownloadedSegment>)> =
            stream::iter(fetches)
                .buffer_unordered(self.settings.concurrency.max(1))
                .collect()
                .await;
        results.sort_by_key(|(index, _)| *index);

        let total = results.len();
        let mut segments = Vec::with_capacity(total);
        let mut failures = Vec::new();
        for (index, result) in results {
            match result {
                Ok(segment) => segments.push(segment),
                Err(err) => {
                    warn!(event_id = %event.event_id, segment = index, error = %err, "segment download failed");
                    failures.push(err);
                }
            }
        }
        if let Some(first) = failures.first() {
            return Err(DownloadError::Incomplete {
                event_id: event.event_id.clone(),
                failed: failures.len(),
                total,
                first_error: first.to_string(),
            });
        }

        let reused = segments.iter().filter(|segment| segment.reused).count();
        let outcome = DownloadOutcome {
            fetched: segments.len() - reused,
            reused,
            segments,
            key_path,
        };
        info!(
            event_id = %event.event_id,
            fetched = outcome.fetched,
            reused = outcome.reused,
            bytes = outcome.total_bytes(),
            "segments downloaded"
        );
        Ok(outcome)
    }

    async fn fetch_segment(
        &self,
        segment: &SegmentDescriptor,
        dir: &Path,
    ) -> DownloadResult<DownloadedSegment> {
        let path = StoragePaths::segment_file(dir, segment.index);
        if let Some(bytes) = existing_complete(&path, segment.size).await {
            debug!(segment = segment.index, bytes, "reusing segment already on disk");
            return Ok(DownloadedSegment {
                index: segment.index,
                path,
                bytes,
                duration: segment.duration,
                reused: true,
            });
        }

        let part = path.with_extension("ts.part");
        let bytes = retry_async(&self.settings.backoff, "segment download", |_attempt| {
            self.fetch_verified(segment, &part, &path)
        })
        .await?;
        Ok(DownloadedSegment {
            index: segment.index,
            path,
            bytes,
            duration: segment.duration,
            reused: false,
        })
    }

    async fn fetch_verified(
        &self,
        segment: &SegmentDescriptor,
        part: &Path,
        path: &Path,
    ) -> DownloadResult<u64> {
        let bytes = self.transport.fetch_to_file(&segment.uri, part).await?;
        let verdict = match segment.size {
            Some(expected) if expected != bytes => Err(DownloadError::SizeMismatch {
                index: segment.index,
                expected,
                actual: bytes,
            }),
            _ if bytes == 0 => Err(DownloadError::Empty {
                index: segment.index,
            }),
            _ => Ok(()),
        };
        if let Err(err) = verdict {
            let _ = fs::remove_file(part).await;
            return Err(err);
        }
        fs::rename(part, path)
            .await
            .map_err(|source| DownloadError::Io {
                source,
                path: path.to_path_buf(),
            })?;
        Ok(bytes)
    }

    async fn fetch_key(&self, uri: &str, dir: &Path) -> DownloadResult<PathBuf> {
        let path = dir.join(KEY_FILE);
        if existing_complete(&path, None).await.is_some() {
            return Ok(path);
        }
        let part = path.with_extension("bin.part");
        let (part_ref, path_ref) = (&part, &path);
        retry_async(&self.settings.backoff, "key download", |_attempt| async move {
            let bytes = self.transport.fetch_to_file(uri, part_ref).await?;
            if bytes == 0 {
                return Err(DownloadError::Empty { index: 0 });
            }
            fs::rename(part_ref, path_ref)
                .await
                .map_err(|source| DownloadError::Io {
                    source,
                    path: path_ref.clone(),
                })
        })
        .await?;
        Ok(path)
    }
}

/// Size of a finished segment file, if it is there and looks complete.
async fn existing_complete(path: &Path, expected: Option<u64>) -> Option<u64> {
    let metadata = fs::metadata(path).await.ok()?;
    if !metadata.is_file() {
        return None;
    }
    let len = metadata.len();
    match expected {
        Some(expected) if expected == len => Some(len),
        Some(_) => None,
        None if len > 0 => Some(len),
        None => None,
    }
}
