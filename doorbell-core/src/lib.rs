pub mod catalog;
pub mod cleanup;
pub mod clock;
pub mod cloud;
pub mod config;
pub mod downloader;
pub mod error;
pub mod events;
pub mod fetcher;
pub mod layout;
pub mod merger;
pub mod pipeline;
pub mod retry;
pub mod scheduler;
pub mod session;
mod sqlite;

pub use catalog::{
    CatalogError, CatalogResult, EventCatalog, EventCatalogBuilder, EventFilter, EventRecord,
    StoredDevice,
};
pub use cleanup::{cleanup_event, CleanupReport};
pub use clock::{Clock, ManualClock, SystemClock};
pub use cloud::{
    select_device, CloudApi, Device, DeviceKind, EventPage, EventPageQuery, FetchError,
    FetchResult, HttpCloudApi, HttpCloudSettings, MediaPlaylist, PlaylistDocument,
};
pub use config::{load_config, parse_config, DoorbellConfig};
pub use downloader::{
    DownloadError, DownloadOutcome, DownloadResult, DownloadSettings, DownloadedSegment,
    HttpTransport, MediaTransport, SegmentDownloader,
};
pub use error::{ConfigError, Result};
pub use events::{Checkpoint, EncryptionKey, Event, EventKind, EventStatus, SegmentDescriptor};
pub use fetcher::{EventFetcher, FetcherSettings};
pub use layout::{sanitize_device_name, StoragePaths, BUNDLE_PLAYLIST, KEY_FILE, MERGED_EXTENSION};
pub use merger::{
    bundle_segments, CommandExecutor, CommandOutput, LocalKey, MergeError, MergeOutcome,
    MergeRequest, MergeResult, Merger, MergerSettings, SystemCommandExecutor,
};
pub use pipeline::{
    session_store, CycleReport, EventFailure, Pipeline, PipelineError, PipelineResult,
    PipelineSettings,
};
pub use retry::{retry_async, Backoff, Retryable};
pub use scheduler::{
    CycleRunner, Scheduler, SchedulerError, SchedulerState, SchedulerStatus, TriggerOutcome,
};
pub use session::{
    AuthError, AuthResult, Authenticator, Credential, ExpiryPolicy, HttpLoginProvider, LoginGrant,
    LoginMode, LoginProvider, LoginRequest, SessionError, SessionResult, SessionStatus,
    SessionStore,
};
