use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::catalog::{CatalogError, EventCatalog};
use crate::cleanup::cleanup_event;
use crate::clock::Clock;
use crate::cloud::{Device, FetchError, HttpCloudApi, HttpCloudSettings};
use crate::config::DoorbellConfig;
use crate::downloader::{DownloadError, DownloadSettings, HttpTransport, SegmentDownloader};
use crate::events::{Checkpoint, Event, EventStatus};
use crate::fetcher::{EventFetcher, FetcherSettings};
use crate::layout::StoragePaths;
use crate::merger::{bundle_segments, LocalKey, MergeRequest, Merger, MergerSettings};
use crate::retry::Backoff;
use crate::session::{
    AuthError, Authenticator, ExpiryPolicy, HttpLoginProvider, LoginMode, LoginRequest,
    SessionStore,
};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),
    #[error("event listing failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),
    #[error("download setup failed: {0}")]
    Download(#[from] DownloadError),
}

impl PipelineError {
    /// Errors that will recur every cycle until an operator intervenes.
    pub fn is_fatal(&self) -> bool {
        match self {
            PipelineError::Auth(err) | PipelineError::Fetch(FetchError::Auth(err)) => {
                err.is_fatal()
            }
            PipelineError::Catalog(err) => err.is_corruption(),
            _ => false,
        }
    }

    pub fn interaction_required(&self) -> bool {
        matches!(
            self,
            PipelineError::Auth(AuthError::InteractionRequired { .. })
                | PipelineError::Fetch(FetchError::Auth(AuthError::InteractionRequired { .. }))
        )
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub merge_enabled: bool,
    pub cleanup_segments: bool,
    pub max_event_attempts: u32,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            merge_enabled: true,
            cleanup_segments: true,
            max_event_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EventFailure {
    pub event_id: String,
    pub stage: &'static str,
    pub error: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub device: Option<String>,
    pub found: usize,
    pub downloaded: usize,
    pub merged: usize,
    pub bundled: usize,
    pub cleaned: usize,
    pub failed: usize,
    pub skipped: usize,
    pub segments_fetched: usize,
    pub segments_reused: usize,
    pub segments_removed: usize,
    pub aborted: bool,
    pub checkpoint: Option<String>,
    pub failures: Vec<EventFailure>,
}

impl CycleReport {
    fn new(cycle_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            cycle_id: cycle_id.to_string(),
            started_at,
            finished_at: None,
            device: None,
            found: 0,
            downloaded: 0,
            merged: 0,
            bundled: 0,
            cleaned: 0,
            failed: 0,
            skipped: 0,
            segments_fetched: 0,
            segments_reused: 0,
            segments_removed: 0,
            aborted: false,
            checkpoint: None,
            failures: Vec::new(),
        }
    }
}

/// Where an event stands once the cycle is done with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Progress {
    Done,
    Pending,
    GaveUp,
}

/// One poll, download, merge and cleanup pass over new events.
pub struct Pipeline {
    fetcher: EventFetcher,
    downloader: SegmentDownloader,
    merger: Merger,
    catalog: EventCatalog,
    layout: StoragePaths,
    clock: Arc<dyn Clock>,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        fetcher: EventFetcher,
        downloader: SegmentDownloader,
        merger: Merger,
        catalog: EventCatalog,
        layout: StoragePaths,
        clock: Arc<dyn Clock>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            fetcher,
            downloader,
            merger,
            catalog,
            layout,
            clock,
            settings,
        }
    }

    /// Wires the HTTP-backed components described by `config`.
    pub fn from_config(config: &DoorbellConfig, clock: Arc<dyn Clock>) -> PipelineResult<Self> {
        let timeout = Duration::from_secs(config.cloud.request_timeout_seconds);
        let cloud_backoff = Backoff::from_millis(
            config.cloud.max_retries,
            config.cloud.retry_base_ms,
            config.cloud.retry_max_ms,
        );

        let store = Arc::new(session_store(config, clock.clone()));
        let provider = Arc::new(HttpLoginProvider::new(
            config.cloud.account_base_url.clone(),
            timeout,
        )?);
        let request = LoginRequest {
            username: config.account.username.clone(),
            password: config.account.password.clone(),
            mode: if config.account.use_qr_login {
                LoginMode::QrCode
            } else {
                LoginMode::Password
            },
        };
        let auth = Arc::new(Authenticator::new(
            store,
            provider,
            request,
            Backoff::from_millis(
                config.session.login_attempts,
                config.cloud.retry_base_ms,
                config.cloud.retry_max_ms,
            ),
        ));

        let api = Arc::new(HttpCloudApi::new(HttpCloudSettings {
            api_base_url: config.cloud.api_base_url.clone(),
            region: config.cloud.region.clone(),
            language: config.cloud.language.clone(),
            timeout,
        })?);
        let fetcher = EventFetcher::new(
            api,
            auth,
            clock.clone(),
            FetcherSettings {
                page_size: config.cloud.page_size,
                lookback: chrono::Duration::hours(i64::from(config.cloud.lookback_hours)),
                backoff: cloud_backoff,
                device_did: config.cloud.device_did.clone(),
                device_models: config.cloud.device_models.clone(),
                ..FetcherSettings::default()
            },
        );

        let transport = Arc::new(HttpTransport::new(timeout)?);
        let downloader = SegmentDownloader::new(
            transport,
            DownloadSettings {
                concurrency: config.download.max_concurrent_segments,
                backoff: Backoff::from_millis(
                    config.download.max_retries,
                    config.download.retry_base_ms,
                    config.download.retry_max_ms,
                )
                .with_jitter(Duration::from_millis(config.download.jitter_ms)),
            },
        );

        let merger = Merger::new(
            MergerSettings {
                ffmpeg: PathBuf::from(&config.merge.ffmpeg),
                ffprobe: config.merge.ffprobe.as_ref().map(PathBuf::from),
                timeout: Duration::from_secs(config.merge.timeout_seconds),
                min_size_ratio: config.merge.min_size_ratio,
                duration_tolerance_percent: config.merge.duration_tolerance_percent,
                faststart: config.merge.faststart,
            },
            None,
        );

        let catalog = EventCatalog::new(config.catalog_db())?;
        catalog.initialize()?;

        Ok(Self::new(
            fetcher,
            downloader,
            merger,
            catalog,
            StoragePaths::new(config.save_path(), config.segments_dir()),
            clock,
            PipelineSettings {
                merge_enabled: config.merge.enabled,
                cleanup_segments: config.merge.cleanup_ts_files,
                max_event_attempts: config.events.max_event_attempts,
            },
        ))
    }

    pub fn catalog(&self) -> &EventCatalog {
        &self.catalog
    }

    pub fn authenticator(&self) -> &Authenticator {
        self.fetcher.authenticator()
    }

    /// Runs one full cycle. Stops between events once `shutdown` flips to `true`.
    pub async fn run_cycle(&self, shutdown: &watch::Receiver<bool>) -> PipelineResult<CycleReport> {
        let cycle_id = Uuid::new_v4();
        let span = info_span!("cycle", cycle_id = %cycle_id);
        self.cycle(cycle_id, shutdown).instrument(span).await
    }

    async fn cycle(
        &self,
        cycle_id: Uuid,
        shutdown: &watch::Receiver<bool>,
    ) -> PipelineResult<CycleReport> {
        let mut report = CycleReport::new(cycle_id, self.clock.now());
        info!("cycle started");

        self.fetcher.authenticator().get_credential().await?;
        let device = self.fetcher.discover_device().await?;
        self.catalog.record_device(&device)?;
        report.device = Some(device.name.clone());

        let checkpoint = self.catalog.checkpoint()?;
        let resume_from = self
            .catalog
            .oldest_unfinished(self.settings.max_event_attempts)?;
        let events = self
            .fetcher
            .list_events_from(&device, checkpoint.as_ref(), resume_from)
            .await?;
        report.found = events.len();
        info!(
            found = events.len(),
            checkpoint = ?checkpoint.as_ref().map(|c| c.event_id.as_str()),
            resume_from = ?resume_from,
            "new events listed"
        );

        let mut progress: Vec<(Checkpoint, Progress)> = Vec::with_capacity(events.len());
        for mut event in events {
            if *shutdown.borrow() {
                info!("shutdown requested, stopping between events");
                report.aborted = true;
                break;
            }
            let record = self.catalog.record_discovered(&event)?;
            let state = match record.status {
                EventStatus::Cleaned => {
                    report.skipped += 1;
                    Progress::Done
                }
                EventStatus::Failed if record.attempts >= self.settings.max_event_attempts => {
                    report.skipped += 1;
                    Progress::GaveUp
                }
                _ => match self.process_event(&device, &mut event, &mut report).await {
                    Ok(state) => state,
                    Err(err) => {
                        if let Err(settle) = self.settle_checkpoint(&progress) {
                            warn!(error = %settle, "checkpoint not saved before aborting cycle");
                        }
                        return Err(err);
                    }
                },
            };
            progress.push((event.checkpoint(), state));
        }

        self.settle_checkpoint(&progress)?;
        report.checkpoint = self.catalog.checkpoint()?.map(|c| c.event_id);
        report.finished_at = Some(self.clock.now());
        info!(
            found = report.found,
            downloaded = report.downloaded,
            merged = report.merged,
            cleaned = report.cleaned,
            failed = report.failed,
            skipped = report.skipped,
            aborted = report.aborted,
            checkpoint = ?report.checkpoint,
            "cycle finished"
        );
        Ok(report)
    }

    async fn process_event(
        &self,
        device: &Device,
        event: &mut Event,
        report: &mut CycleReport,
    ) -> PipelineResult<Progress> {
        if let Err(err) = self.fetcher.resolve_segments(device, event).await {
            if matches!(err, FetchError::Auth(_)) {
                warn!(event_id = %event.event_id, error = %err, "login unavailable, pausing cycle");
                return Err(err.into());
            }
            let err = PipelineError::from(err);
            let attempts = self.catalog.begin_attempt(&event.event_id, 0)?;
            return self.fail(event, "playlist", err.to_string(), attempts, report);
        }

        let attempts = self
            .catalog
            .begin_attempt(&event.event_id, event.segments.len())?;
        let dir = self.layout.segment_dir(event);
        info!(
            event_id = %event.event_id,
            kind = event.kind().tag(),
            segments = event.segments.len(),
            attempt = attempts,
            "processing event"
        );

        let downloaded = match self.downloader.download(event, &dir).await {
            Ok(downloaded) => downloaded,
            Err(err) => return self.fail(event, "download", err.to_string(), attempts, report),
        };
        report.downloaded += 1;
        report.segments_fetched += downloaded.fetched;
        report.segments_reused += downloaded.reused;

        let request = MergeRequest {
            event_id: event.event_id.clone(),
            work_dir: dir.clone(),
            segments: downloaded.segments.clone(),
            key: match (&event.encryption, &downloaded.key_path) {
                (Some(key), Some(path)) => Some(LocalKey {
                    path: path.clone(),
                    method: key.method.clone(),
                    iv: key.iv.clone(),
                }),
                _ => None,
            },
            output: self.claim_artifact(event, |n| {
                self.layout.merged_path_numbered(device, event, n)
            })?,
        };

        if self.settings.merge_enabled {
            match self.merger.merge(&request).await {
                Ok(merged) => {
                    self.catalog.mark_merged(
                        &event.event_id,
                        &merged.output,
                        Some(merged.sha256.as_str()),
                    )?;
                    report.merged += 1;
                }
                Err(err) => return self.fail(event, "merge", err.to_string(), attempts, report),
            }
        } else {
            let bundle_dir = self.claim_artifact(event, |n| {
                self.layout.bundle_dir_numbered(device, event, n)
            })?;
            match bundle_segments(&request, &bundle_dir).await {
                Ok(_) => {
                    self.catalog.mark_merged(&event.event_id, &bundle_dir, None)?;
                    report.bundled += 1;
                }
                Err(err) => return self.fail(event, "bundle", err.to_string(), attempts, report),
            }
        }

        if self.settings.cleanup_segments {
            let cleanup = cleanup_event(&dir, &downloaded.paths()).await;
            report.segments_removed += cleanup.segments_removed;
            if cleanup.errors > 0 {
                warn!(event_id = %event.event_id, errors = cleanup.errors, "cleanup left files behind");
            }
        }
        self.catalog.mark_cleaned(&event.event_id)?;
        report.cleaned += 1;
        info!(event_id = %event.event_id, "event archived");
        Ok(Progress::Done)
    }

    /// First candidate path that is free or already belongs to `event`.
    fn claim_artifact(
        &self,
        event: &Event,
        candidate: impl Fn(usize) -> PathBuf,
    ) -> PipelineResult<PathBuf> {
        let mut n = 0;
        loop {
            let path = candidate(n);
            match self.catalog.artifact_owner(&path)? {
                Some(owner) if owner == event.event_id => return Ok(path),
                None if !path.exists() => return Ok(path),
                _ => {
                    debug!(event_id = %event.event_id, taken = %path.display(), "artifact name taken");
                    n += 1;
                }
            }
        }
    }

    fn settle_checkpoint(&self, progress: &[(Checkpoint, Progress)]) -> PipelineResult<()> {
        if let Some(next) = contiguous_checkpoint(progress) {
            self.catalog.advance_checkpoint(next)?;
        }
        Ok(())
    }

    fn fail(
        &self,
        event: &Event,
        stage: &'static str,
        message: String,
        attempts: u32,
        report: &mut CycleReport,
    ) -> PipelineResult<Progress> {
        self.catalog.mark_failed(&event.event_id, &message)?;
        let gave_up = attempts >= self.settings.max_event_attempts;
        error!(
            event_id = %event.event_id,
            stage,
            attempts,
            gave_up,
            error = %message,
            "event failed"
        );
        report.failed += 1;
        report.failures.push(EventFailure {
            event_id: event.event_id.clone(),
            stage,
            error: message,
            attempts,
        });
        Ok(if gave_up {
            Progress::GaveUp
        } else {
            Progress::Pending
        })
    }
}

/// Newest finished event not preceded by one that may still be retried.
fn contiguous_checkpoint(progress: &[(Checkpoint, Progress)]) -> Option<&Checkpoint> {
    let mut candidate = None;
    for (checkpoint, state) in progress {
        match state {
            Progress::Done => candidate = Some(checkpoint),
            Progress::GaveUp => {}
            Progress::Pending => break,
        }
    }
    candidate
}

/// Session store described by `config`, for callers that only need the cached login.
pub fn session_store(config: &DoorbellConfig, clock: Arc<dyn Clock>) -> SessionStore {
    SessionStore::new(
        config.session_file(),
        ExpiryPolicy::from_hours(config.session.ttl_hours),
        clock,
    )
}
