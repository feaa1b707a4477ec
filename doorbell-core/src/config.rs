use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

const ENV_PREFIX: &str = "DOORBELL_";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DoorbellConfig {
    pub account: AccountSection,
    pub paths: PathsSection,
    pub schedule: ScheduleSection,
    #[serde(default)]
    pub cloud: CloudSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub download: DownloadSection,
    pub merge: MergeSection,
    #[serde(default)]
    pub events: EventsSection,
}

impl DoorbellConfig {
    /// Relative paths are anchored at `paths.save_path`.
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.paths.save_path).join(path)
        }
    }

    pub fn save_path(&self) -> PathBuf {
        PathBuf::from(&self.paths.save_path)
    }

    pub fn segments_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.segments_dir)
    }

    pub fn session_file(&self) -> PathBuf {
        self.resolve_path(&self.paths.session_file)
    }

    pub fn catalog_db(&self) -> PathBuf {
        self.resolve_path(&self.paths.catalog_db)
    }

    pub fn schedule_period(&self) -> Duration {
        Duration::from_secs(self.schedule.schedule_minutes * 60)
    }

    /// Applies `DOORBELL_*` overrides using the supplied lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));
        if let Some(username) = var("USERNAME") {
            self.account.username = username;
        }
        if let Some(password) = var("PASSWORD") {
            self.account.password = password;
        }
        if let Some(save_path) = var("SAVE_PATH") {
            self.paths.save_path = save_path;
        }
        if let Some(ffmpeg) = var("FFMPEG") {
            self.merge.ffmpeg = ffmpeg;
        }
        if let Some(minutes) = var("SCHEDULE_MINUTES") {
            self.schedule.schedule_minutes = minutes.trim().parse().map_err(|_| {
                ConfigError::invalid("schedule.schedule_minutes", format!("not a number: {minutes}"))
            })?;
        }
        if let Some(flag) = var("USE_QR_LOGIN") {
            self.account.use_qr_login = parse_flag("account.use_qr_login", &flag)?;
        }
        if let Some(flag) = var("MERGE") {
            self.merge.enabled = parse_flag("merge.enabled", &flag)?;
        }
        Ok(())
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    pub fn validate(&self) -> Result<()> {
        if self.account.username.trim().is_empty() {
            return Err(ConfigError::invalid("account.username", "must not be empty"));
        }
        if !self.account.use_qr_login && self.account.password.is_empty() {
            return Err(ConfigError::invalid(
                "account.password",
                "required unless use_qr_login is enabled",
            ));
        }
        if self.paths.save_path.trim().is_empty() {
            return Err(ConfigError::invalid("paths.save_path", "must not be empty"));
        }
        if self.schedule.schedule_minutes == 0 {
            return Err(ConfigError::invalid(
                "schedule.schedule_minutes",
                "must be greater than zero",
            ));
        }
        if self.download.max_concurrent_segments == 0 {
            return Err(ConfigError::invalid(
                "download.max_concurrent_segments",
                "must be greater than zero",
            ));
        }
        if self.download.max_retries == 0 {
            return Err(ConfigError::invalid(
                "download.max_retries",
                "must be greater than zero",
            ));
        }
        if self.merge.enabled && self.merge.ffmpeg.trim().is_empty() {
            return Err(ConfigError::invalid(
                "merge.ffmpeg",
                "required when merging is enabled",
            ));
        }
        if !(0.0..=1.0).contains(&self.merge.min_size_ratio) {
            return Err(ConfigError::invalid(
                "merge.min_size_ratio",
                "must be between 0.0 and 1.0",
            ));
        }
        if self.events.max_event_attempts == 0 {
            return Err(ConfigError::invalid(
                "events.max_event_attempts",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountSection {
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub use_qr_login: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    pub save_path: String,
    #[serde(default = "default_segments_dir")]
    pub segments_dir: String,
    #[serde(default = "default_session_file")]
    pub session_file: String,
    #[serde(default = "default_catalog_db")]
    pub catalog_db: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleSection {
    pub schedule_minutes: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CloudSection {
    pub account_base_url: String,
    pub api_base_url: String,
    pub region: String,
    pub language: String,
    pub page_size: u32,
    pub lookback_hours: u32,
    pub request_timeout_seconds: u64,
    pub max_retries: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub device_did: Option<String>,
    pub device_models: Vec<String>,
}

impl Default for CloudSection {
    fn default() -> Self {
        Self {
            account_base_url: "https://account.xiaomi.com".to_string(),
            api_base_url: "https://business.smartcamera.api.io.mi.com".to_string(),
            region: "cn".to_string(),
            language: "en_US".to_string(),
            page_size: 10,
            lookback_hours: 24,
            request_timeout_seconds: 30,
            max_retries: 3,
            retry_base_ms: 500,
            retry_max_ms: 10_000,
            device_did: None,
            device_models: vec!["madv.cateye.".to_string(), "xiaomi.lock.".to_string()],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub ttl_hours: u32,
    pub login_attempts: u32,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            ttl_hours: 24,
            login_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DownloadSection {
    pub max_concurrent_segments: usize,
    pub max_retries: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub jitter_ms: u64,
}

impl Default for DownloadSection {
    fn default() -> Self {
        Self {
            max_concurrent_segments: 4,
            max_retries: 4,
            retry_base_ms: 500,
            retry_max_ms: 15_000,
            jitter_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MergeSection {
    #[serde(alias = "merge", default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub cleanup_ts_files: bool,
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: String,
    #[serde(default)]
    pub ffprobe: Option<String>,
    #[serde(default = "default_merge_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_min_size_ratio")]
    pub min_size_ratio: f64,
    #[serde(default = "default_duration_tolerance")]
    pub duration_tolerance_percent: u32,
    #[serde(default = "default_true")]
    pub faststart: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EventsSection {
    pub max_event_attempts: u32,
}

impl Default for EventsSection {
    fn default() -> Self {
        Self {
            max_event_attempts: 5,
        }
    }
}

fn default_segments_dir() -> String {
    "segments".to_string()
}

fn default_session_file() -> String {
    "auth_cache.json".to_string()
}

fn default_catalog_db() -> String {
    "catalog.sqlite".to_string()
}

fn default_ffmpeg() -> String {
    "ffmpeg".to_string()
}

fn default_merge_timeout() -> u64 {
    600
}

fn default_min_size_ratio() -> f64 {
    0.5
}

fn default_duration_tolerance() -> u32 {
    10
}

fn default_true() -> bool {
    true
}

fn parse_flag(field: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::invalid(field, format!("not a boolean: {other}"))),
    }
}

/// Loads the TOML file, applies environment overrides and validates the result.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<DoorbellConfig> {
    let mut config: DoorbellConfig = load_toml(path)?;
    config.apply_env_overrides()?;
    config.validate()?;
    Ok(config)
}

pub fn parse_config(content: &str, origin: &Path) -> Result<DoorbellConfig> {
    toml::from_str(content).map_err(|source| ConfigError::Parse {
        source,
        path: origin.to_path_buf(),
    })
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
