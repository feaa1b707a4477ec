#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use url::Url;

use doorbell_core::{
    AuthError, AuthResult, Authenticator, Backoff, CloudApi, CommandExecutor, CommandOutput,
    Credential, Device, Event, EventPage, EventPageQuery, ExpiryPolicy, FetchError, FetchResult,
    LoginGrant, LoginMode, LoginProvider, LoginRequest, ManualClock, PlaylistDocument,
    SessionStore,
};

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

pub fn grant(token: &str) -> LoginGrant {
    LoginGrant {
        user_id: "1234567".into(),
        service_token: token.into(),
        ssecurity: Some("ssecurity".into()),
        cuser_id: None,
        pass_token: None,
    }
}

/// Login provider that hands out `token-1`, `token-2`, ... unless scripted otherwise.
#[derive(Default)]
pub struct FakeLogin {
    calls: AtomicUsize,
    delay: Duration,
    script: Mutex<VecDeque<AuthResult<LoginGrant>>>,
}

impl FakeLogin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn push(&self, result: AuthResult<LoginGrant>) {
        self.script.lock().unwrap().push_back(result);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LoginProvider for FakeLogin {
    async fn login(&self, _request: &LoginRequest) -> AuthResult<LoginGrant> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let scripted = self.script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| Ok(grant(&format!("token-{call}"))))
    }
}

pub fn authenticator(dir: &Path, clock: Arc<ManualClock>, login: Arc<FakeLogin>) -> Arc<Authenticator> {
    let store = Arc::new(SessionStore::new(
        dir.join("session.json"),
        ExpiryPolicy::from_hours(24),
        clock,
    ));
    Arc::new(Authenticator::new(
        store,
        login,
        LoginRequest {
            username: "alice".into(),
            password: "secret".into(),
            mode: LoginMode::Password,
        },
        Backoff::from_millis(3, 0, 0),
    ))
}

pub fn front_door() -> Device {
    Device {
        did: "1001".into(),
        name: "Front Door".into(),
        model: "madv.cateye.miowlv2".into(),
    }
}

/// In-memory cloud: events paged newest first, playlists served from memory.
pub struct FakeCloud {
    devices: Vec<Device>,
    events: Mutex<Vec<(Event, String)>>,
    rejected_tokens: Mutex<HashSet<String>>,
    reject_all: AtomicBool,
    stuck_cursor: AtomicBool,
    reject_playlists: AtomicBool,
    pub page_calls: AtomicUsize,
    pub playlist_calls: AtomicUsize,
}

impl FakeCloud {
    pub fn new() -> Self {
        Self {
            devices: vec![
                Device {
                    did: "2002".into(),
                    name: "Living Room Speaker".into(),
                    model: "xiaomi.wifispeaker.x08c".into(),
                },
                front_door(),
            ],
            events: Mutex::new(Vec::new()),
            rejected_tokens: Mutex::new(HashSet::new()),
            reject_all: AtomicBool::new(false),
            stuck_cursor: AtomicBool::new(false),
            reject_playlists: AtomicBool::new(false),
            page_calls: AtomicUsize::new(0),
            playlist_calls: AtomicUsize::new(0),
        }
    }

    pub fn add_event(&self, event: Event, playlist: String) {
        self.events.lock().unwrap().push((event, playlist));
    }

    pub fn reject_token(&self, token: &str) {
        self.rejected_tokens.lock().unwrap().insert(token.to_string());
    }

    pub fn reject_everything(&self) {
        self.reject_all.store(true, Ordering::SeqCst);
    }

    /// Playlist requests answer 401 while `on`, whatever the credential.
    pub fn reject_playlists(&self, on: bool) {
        self.reject_playlists.store(on, Ordering::SeqCst);
    }

    pub fn stick_cursor(&self) {
        self.stuck_cursor.store(true, Ordering::SeqCst);
    }

    fn check(&self, credential: &Credential) -> FetchResult<()> {
        if self.reject_all.load(Ordering::SeqCst)
            || self
                .rejected_tokens
                .lock()
                .unwrap()
                .contains(&credential.service_token)
        {
            return Err(FetchError::Unauthorized);
        }
        Ok(())
    }
}

#[async_trait]
impl CloudApi for FakeCloud {
    async fn list_devices(&self, credential: &Credential) -> FetchResult<Vec<Device>> {
        self.check(credential)?;
        Ok(self.devices.clone())
    }

    async fn event_page(
        &self,
        credential: &Credential,
        _device: &Device,
        query: &EventPageQuery,
    ) -> FetchResult<EventPage> {
        self.page_calls.fetch_add(1, Ordering::SeqCst);
        self.check(credential)?;
        let mut matching: Vec<Event> = self
            .events
            .lock()
            .unwrap()
            .iter()
            .map(|(event, _)| event.clone())
            .filter(|event| event.occurred_at >= query.begin && event.occurred_at <= query.end)
            .collect();
        matching.sort_by(|a, b| b.occurred_at.cmp(&a.occurred_at));
        let has_more = matching.len() > query.limit as usize;
        matching.truncate(query.limit as usize);
        let next_end = if self.stuck_cursor.load(Ordering::SeqCst) {
            Some(query.end)
        } else {
            matching
                .last()
                .map(|event| event.occurred_at - chrono::Duration::milliseconds(1))
        };
        Ok(EventPage {
            events: matching,
            skipped: 0,
            has_more,
            next_end,
        })
    }

    async fn segment_playlist(
        &self,
        credential: &Credential,
        _device: &Device,
        event: &Event,
    ) -> FetchResult<PlaylistDocument> {
        self.playlist_calls.fetch_add(1, Ordering::SeqCst);
        self.check(credential)?;
        if self.reject_playlists.load(Ordering::SeqCst) {
            return Err(FetchError::Unauthorized);
        }
        let events = self.events.lock().unwrap();
        let (_, body) = events
            .iter()
            .find(|(known, _)| known.event_id == event.event_id)
            .ok_or_else(|| FetchError::Status {
                status: 404,
                body: format!("unknown file {}", event.event_id),
            })?;
        Ok(PlaylistDocument {
            url: format!("https://cloud.test/common/app/m3u8?fileId={}", event.event_id),
            body: body.clone(),
        })
    }
}

/// Writes fake `.ts` payloads under `root/<event_id>/` and returns their paths.
pub fn write_remote_segments(root: &Path, event_id: &str, payloads: &[&[u8]]) -> Vec<PathBuf> {
    let dir = root.join(event_id);
    std::fs::create_dir_all(&dir).unwrap();
    payloads
        .iter()
        .enumerate()
        .map(|(index, payload)| {
            let path = dir.join(format!("seg{index}.ts"));
            std::fs::write(&path, payload).unwrap();
            path
        })
        .collect()
}

pub fn file_url(path: &Path) -> String {
    Url::from_file_path(path).unwrap().to_string()
}

/// HLS playlist pointing at local files through `file://` URLs.
pub fn playlist_for(paths: &[PathBuf]) -> String {
    let mut body = String::from("#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:4\n");
    for path in paths {
        body.push_str("#EXTINF:4.000,\n");
        body.push_str(&file_url(path));
        body.push('\n');
    }
    body.push_str("#EXT-X-ENDLIST\n");
    body
}

/// Stands in for ffmpeg by concatenating the listed inputs, and for ffprobe by echoing a duration.
#[derive(Default)]
pub struct ConcatExecutor {
    pub calls: Mutex<Vec<(PathBuf, Vec<String>)>>,
    failures_left: AtomicUsize,
    truncate_output: AtomicBool,
    probe_duration: Mutex<Option<f64>>,
}

impl ConcatExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, times: usize) {
        self.failures_left.store(times, Ordering::SeqCst);
    }

    pub fn truncate_output(&self) {
        self.truncate_output.store(true, Ordering::SeqCst);
    }

    pub fn report_duration(&self, seconds: f64) {
        *self.probe_duration.lock().unwrap() = Some(seconds);
    }

    pub fn ffmpeg_runs(&self) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(program, _)| !program.to_string_lossy().contains("ffprobe"))
            .count()
    }

    fn inputs(list: &Path) -> Vec<PathBuf> {
        let content = std::fs::read_to_string(list).unwrap();
        if list.extension().map(|ext| ext == "m3u8").unwrap_or(false) {
            let base = list.parent().unwrap();
            content
                .lines()
                .filter(|line| !line.starts_with('#') && !line.trim().is_empty())
                .map(|line| base.join(line.trim()))
                .collect()
        } else {
            content
                .lines()
                .filter_map(|line| line.strip_prefix("file '"))
                .map(|rest| PathBuf::from(rest.trim_end_matches('\'').replace("'\\''", "'")))
                .collect()
        }
    }
}

#[async_trait]
impl CommandExecutor for ConcatExecutor {
    async fn run(&self, program: &Path, args: &[String]) -> std::io::Result<CommandOutput> {
        self.calls
            .lock()
            .unwrap()
            .push((program.to_path_buf(), args.to_vec()));

        if program.to_string_lossy().contains("ffprobe") {
            let duration = self.probe_duration.lock().unwrap().unwrap_or(0.0);
            return Ok(CommandOutput {
                success: true,
                code: Some(0),
                stdout: format!("{duration:.6}\n"),
                stderr: String::new(),
            });
        }

        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
        {
            return Ok(CommandOutput {
                success: false,
                code: Some(1),
                stdout: String::new(),
                stderr: "Invalid data found when processing input".into(),
            });
        }

        let input_at = args.iter().position(|arg| arg == "-i").unwrap() + 1;
        let output = PathBuf::from(args.last().unwrap());
        let mut merged = Vec::new();
        for input in Self::inputs(Path::new(&args[input_at])) {
            merged.extend(std::fs::read(&input)?);
        }
        if self.truncate_output.load(Ordering::SeqCst) {
            merged.truncate(1);
        }
        std::fs::write(&output, merged)?;
        Ok(CommandOutput {
            success: true,
            code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
        })
    }
}

pub fn interaction_required() -> AuthError {
    AuthError::InteractionRequired {
        message: "scan the QR code".into(),
        login_url: Some("https://account.test/qr/abc".into()),
    }
}
