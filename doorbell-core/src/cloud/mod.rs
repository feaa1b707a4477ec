mod device;
mod http;
mod playlist;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::events::Event;
use crate::retry::Retryable;
use crate::session::{AuthError, Credential};

pub use device::{select_device, Device, DeviceKind, DEFAULT_DEVICE_MODELS};
pub use http::{HttpCloudApi, HttpCloudSettings};
pub use playlist::{MediaPlaylist, PlaylistSegment};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("credential rejected by cloud service")]
    Unauthorized,
    #[error("network error: {0}")]
    Network(String),
    #[error("cloud service returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("cloud service returned code {code}: {message}")]
    Remote { code: i64, message: String },
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("no supported device found (available: {available})")]
    NoDevice { available: String },
    #[error(transparent)]
    Auth(#[from] AuthError),
}

impl Retryable for FetchError {
    fn is_transient(&self) -> bool {
        match self {
            FetchError::Network(_) => true,
            FetchError::Status { status, .. } => *status >= 500 || *status == 429,
            FetchError::Auth(err) => err.is_transient(),
            _ => false,
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            FetchError::Malformed(error.to_string())
        } else {
            FetchError::Network(error.to_string())
        }
    }
}

pub type FetchResult<T> = std::result::Result<T, FetchError>;

/// One request against the descending event list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventPageQuery {
    pub begin: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub limit: u32,
}

#[derive(Debug, Clone, Default)]
pub struct EventPage {
    pub events: Vec<Event>,
    /// Entries that could not be decoded.
    pub skipped: usize,
    pub has_more: bool,
    /// Cursor for the next page; becomes the next query's `end`.
    pub next_end: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct PlaylistDocument {
    pub url: String,
    pub body: String,
}

/// The vendor's cloud video service.
#[async_trait]
pub trait CloudApi: Send + Sync {
    async fn list_devices(&self, credential: &Credential) -> FetchResult<Vec<Device>>;

    async fn event_page(
        &self,
        credential: &Credential,
        device: &Device,
        query: &EventPageQuery,
    ) -> FetchResult<EventPage>;

    async fn segment_playlist(
        &self,
        credential: &Credential,
        device: &Device,
        event: &Event,
    ) -> FetchResult<PlaylistDocument>;
}
