use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::cloud::{
    select_device, CloudApi, Device, EventPageQuery, FetchError, FetchResult, MediaPlaylist,
};
use crate::events::{sort_chronologically, Checkpoint, Event};
use crate::retry::{retry_async, Backoff};
use crate::session::{Authenticator, Credential};

#[derive(Debug, Clone)]
pub struct FetcherSettings {
    pub page_size: u32,
    pub lookback: Duration,
    pub max_pages: usize,
    pub backoff: Backoff,
    pub device_did: Option<String>,
    pub device_models: Vec<String>,
}

impl Default for FetcherSettings {
    fn default() -> Self {
        Self {
            page_size: 10,
            lookback: Duration::hours(24),
            max_pages: 500,
            backoff: Backoff::from_millis(3, 1_000, 30_000),
            device_did: None,
            device_models: crate::cloud::DEFAULT_DEVICE_MODELS
                .iter()
                .map(|prefix| prefix.to_string())
                .collect(),
        }
    }
}

/// Lists what the cloud recorded since the last checkpoint.
pub struct EventFetcher {
    api: Arc<dyn CloudApi>,
    auth: Arc<Authenticator>,
    clock: Arc<dyn Clock>,
    settings: FetcherSettings,
}

impl EventFetcher {
    pub fn new(
        api: Arc<dyn CloudApi>,
        auth: Arc<Authenticator>,
        clock: Arc<dyn Clock>,
        settings: FetcherSettings,
    ) -> Self {
        Self {
            api,
            auth,
            clock,
            settings,
        }
    }

    pub fn authenticator(&self) -> &Authenticator {
        &self.auth
    }

    pub async fn discover_device(&self) -> FetchResult<Device> {
        let devices = self
            .with_reauth("device list", |credential| async move {
                self.api.list_devices(&credential).await
            })
            .await?;
        let device = select_device(
            &devices,
            self.settings.device_did.as_deref(),
            &self.settings.device_models,
        )?;
        debug!(did = %device.did, name = %device.name, model = %device.model, "device selected");
        Ok(device)
    }

    /// Events newer than `checkpoint`, oldest first. Every page is drained before returning.
    pub async fn list_new_events(
        &self,
        device: &Device,
        checkpoint: Option<&Checkpoint>,
    ) -> FetchResult<Vec<Event>> {
        self.list_events_from(device, checkpoint, None).await
    }

    /// Like [`list_new_events`](Self::list_new_events), with the window widened back to
    /// `resume_from` so unfinished events recorded earlier are listed again.
    ///
    /// The lookback only bounds a first run; once a checkpoint exists the window starts there.
    pub async fn list_events_from(
        &self,
        device: &Device,
        checkpoint: Option<&Checkpoint>,
        resume_from: Option<DateTime<Utc>>,
    ) -> FetchResult<Vec<Event>> {
        let now = self.clock.now();
        let mut begin = match checkpoint {
            Some(checkpoint) => checkpoint.event_time,
            None => now - self.settings.lookback,
        };
        if let Some(resume_from) = resume_from {
            begin = begin.min(resume_from);
        }

        let mut end = now;
        let mut seen = HashSet::new();
        let mut events = Vec::new();
        let mut skipped = 0usize;
        let mut pages = 0usize;
        loop {
            pages += 1;
            if pages > self.settings.max_pages {
                return Err(FetchError::Malformed(format!(
                    "event list still continuing after {} pages",
                    self.settings.max_pages
                )));
            }
            let query = EventPageQuery {
                begin,
                end,
                limit: self.settings.page_size,
            };
            let page = self
                .with_reauth("event list", |credential| {
                    let query = query.clone();
                    async move { self.api.event_page(&credential, device, &query).await }
                })
                .await?;
            skipped += page.skipped;
            for event in page.events {
                if seen.insert(event.event_id.clone()) {
                    events.push(event);
                }
            }
            if !page.has_more {
                break;
            }
            match page.next_end {
                Some(next) if next < begin => break,
                Some(next) if next < end => end = next,
                _ => {
                    return Err(FetchError::Malformed(
                        "event list cursor did not advance".into(),
                    ))
                }
            }
        }

        if let Some(checkpoint) = checkpoint {
            events.retain(|event| checkpoint.precedes(event));
        }
        sort_chronologically(&mut events);
        info!(
            did = %device.did,
            found = events.len(),
            skipped,
            pages,
            window_start = %begin,
            "event list fetched"
        );
        Ok(events)
    }

    /// Fills in the segment list and encryption key of `event` from its playlist.
    pub async fn resolve_segments(&self, device: &Device, event: &mut Event) -> FetchResult<()> {
        let document = {
            let snapshot: &Event = event;
            self.with_reauth("playlist", |credential| async move {
                self.api
                    .segment_playlist(&credential, device, snapshot)
                    .await
            })
            .await?
        };
        let playlist = MediaPlaylist::parse(&document.body).map_err(FetchError::Malformed)?;
        let (segments, key) = playlist
            .resolve(&document.url)
            .map_err(FetchError::Malformed)?;
        debug!(
            event_id = %event.event_id,
            segments = segments.len(),
            encrypted = key.is_some(),
            "playlist resolved"
        );
        event.segments = segments;
        event.encryption = key;
        Ok(())
    }

    /// Runs `call` with backoff; a rejected credential is dropped and the call retried once.
    async fn with_reauth<T, F, Fut>(&self, label: &str, mut call: F) -> FetchResult<T>
    where
        F: FnMut(Credential) -> Fut,
        Fut: Future<Output = FetchResult<T>>,
    {
        let credential = self.auth.get_credential().await?;
        let first = retry_async(&self.settings.backoff, label, |_attempt| {
            call(credential.clone())
        })
        .await;
        match first {
            Err(FetchError::Unauthorized) => {
                warn!(stage = label, "credential rejected, logging in again");
                self.auth.invalidate(&credential)?;
                let fresh = self.auth.get_credential().await?;
                retry_async(&self.settings.backoff, label, |_attempt| call(fresh.clone())).await
            }
            other => other,
        }
    }
}
