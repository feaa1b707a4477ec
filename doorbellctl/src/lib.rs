use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::info;

use doorbell_core::{
    load_config, session_store, CatalogError, Checkpoint, ConfigError, CycleReport,
    DoorbellConfig, EventCatalog, EventFilter, EventRecord, EventStatus, Pipeline, PipelineError,
    Scheduler, SchedulerError, SchedulerStatus, SessionError, SessionStatus, StoredDevice,
    SystemClock,
};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("{0}")]
    Catalog(#[from] CatalogError),
    #[error("session cache error: {0}")]
    Session(#[from] SessionError),
    #[error("{0}")]
    Pipeline(#[from] PipelineError),
    #[error("{0}")]
    Scheduler(#[from] SchedulerError),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("required resource missing: {0}")]
    MissingResource(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Doorbell recording archiver", long_about = None)]
pub struct Cli {
    /// Path to doorbell.toml
    #[arg(long, default_value = "configs/doorbell.toml")]
    pub config: PathBuf,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Archive new recordings every schedule period until interrupted
    Run,
    /// Run a single archive cycle
    Once,
    /// Inspect or drop the cached login
    #[command(subcommand)]
    Session(SessionCommands),
    /// Inspect the event catalog
    #[command(subcommand)]
    Events(EventsCommands),
    /// Show the processing checkpoint and per-status counts
    Checkpoint,
    /// Check config paths, ffmpeg and catalog integrity
    Health,
}

#[derive(Subcommand, Debug)]
pub enum SessionCommands {
    /// Show the cached credential's age and expiry
    Status,
    /// Delete the cached credential, forcing a fresh login
    Clear,
}

#[derive(Subcommand, Debug)]
pub enum EventsCommands {
    /// List recorded events, newest first
    List(EventListArgs),
}

#[derive(Args, Debug)]
pub struct EventListArgs {
    /// Only events in this status (discovered, downloading, merged, cleaned, failed)
    #[arg(long)]
    pub status: Option<String>,
    /// Maximum number of rows
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

pub fn run(cli: Cli) -> Result<()> {
    init_tracing();
    let context = AppContext::new(&cli)?;

    match &cli.command {
        Commands::Run => {
            let status = context.run_forever()?;
            render(&status, cli.format)?;
        }
        Commands::Once => {
            let report = context.run_once()?;
            render(&report, cli.format)?;
        }
        Commands::Session(SessionCommands::Status) => {
            let status = context.session_status()?;
            render(&status, cli.format)?;
        }
        Commands::Session(SessionCommands::Clear) => {
            let cleared = context.session_clear()?;
            render(&cleared, cli.format)?;
        }
        Commands::Events(EventsCommands::List(args)) => {
            let list = context.event_list(args)?;
            render(&list, cli.format)?;
        }
        Commands::Checkpoint => {
            let report = context.checkpoint_report()?;
            render(&report, cli.format)?;
        }
        Commands::Health => {
            let report = context.health_check();
            render(&report, cli.format)?;
            if report
                .iter()
                .any(|entry| matches!(entry.status, CheckStatus::Error))
            {
                return Err(AppError::MissingResource(
                    "one or more health checks failed".to_string(),
                ));
            }
        }
    }

    Ok(())
}

/// Logs go to stderr so `--format json` output stays parseable.
fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

/// Flips to `true` on Ctrl+C; cycles stop between events.
fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received, finishing current event");
            let _ = shutdown_tx.send(true);
        }
    });
    shutdown_rx
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
struct AppContext {
    config: DoorbellConfig,
    config_path: PathBuf,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let config = load_config(&cli.config)?;
        Ok(Self {
            config,
            config_path: cli.config.clone(),
        })
    }

    fn runtime(&self) -> Result<tokio::runtime::Runtime> {
        Ok(tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?)
    }

    fn pipeline(&self) -> Result<Pipeline> {
        Ok(Pipeline::from_config(&self.config, Arc::new(SystemClock))?)
    }

    fn run_forever(&self) -> Result<SchedulerStatus> {
        self.runtime()?.block_on(self.schedule())
    }

    fn run_once(&self) -> Result<CycleReport> {
        self.runtime()?.block_on(self.single_cycle())
    }

    async fn schedule(&self) -> Result<SchedulerStatus> {
        let pipeline = self.pipeline()?;
        let scheduler = Arc::new(Scheduler::new(
            Arc::new(pipeline),
            self.config.schedule_period(),
        )?);
        let shutdown = shutdown_on_ctrl_c();
        Ok(scheduler.run_forever(shutdown).await?)
    }

    async fn single_cycle(&self) -> Result<CycleReport> {
        let pipeline = self.pipeline()?;
        let shutdown = shutdown_on_ctrl_c();
        Ok(pipeline.run_cycle(&shutdown).await?)
    }

    fn session_status(&self) -> Result<SessionStatus> {
        let store = session_store(&self.config, Arc::new(SystemClock));
        Ok(store.status()?)
    }

    fn session_clear(&self) -> Result<SessionCleared> {
        let store = session_store(&self.config, Arc::new(SystemClock));
        let removed = store.clear()?;
        Ok(SessionCleared {
            path: store.path().to_path_buf(),
            removed,
        })
    }

    fn open_catalog(&self) -> Result<EventCatalog> {
        let path = self.config.catalog_db();
        if !path.exists() {
            return Err(AppError::MissingResource(format!(
                "catalog not found at {}",
                path.display()
            )));
        }
        Ok(EventCatalog::builder()
            .path(&path)
            .create_if_missing(false)
            .build()?)
    }

    fn event_list(&self, args: &EventListArgs) -> Result<EventList> {
        let status = args
            .status
            .as_deref()
            .map(str::parse::<EventStatus>)
            .transpose()
            .map_err(AppError::InvalidArgument)?;
        let catalog = self.open_catalog()?;
        let rows = catalog.list(&EventFilter {
            status,
            limit: Some(args.limit),
        })?;
        Ok(EventList { rows })
    }

    fn checkpoint_report(&self) -> Result<CheckpointReport> {
        let catalog = self.open_catalog()?;
        Ok(CheckpointReport {
            checkpoint: catalog.checkpoint()?,
            device: catalog.device()?,
            counts: catalog.counts()?,
        })
    }

    fn health_check(&self) -> Vec<HealthEntry> {
        let mut results = Vec::new();
        results.push(self.check_path("doorbell.toml", &self.config_path));
        results.push(self.check_directory("save_path", &self.config.save_path()));
        results.push(self.check_directory("segments", &self.config.segments_dir()));
        if self.config.merge.enabled {
            results.push(self.check_binary("ffmpeg", &self.config.merge.ffmpeg));
        }
        if let Some(ffprobe) = &self.config.merge.ffprobe {
            results.push(self.check_binary("ffprobe", ffprobe));
        }
        results.push(self.check_catalog());
        results.push(self.check_session());
        results
    }

    fn check_path(&self, name: &str, path: &Path) -> HealthEntry {
        if path.exists() {
            HealthEntry::ok(name, format!("{}", path.display()))
        } else {
            HealthEntry::error(name, format!("{path} missing", path = path.display()))
        }
    }

    fn check_directory(&self, name: &str, path: &Path) -> HealthEntry {
        match fs::metadata(path) {
            Ok(meta) if meta.is_dir() => HealthEntry::ok(name, format!("{}", path.display())),
            Ok(_) => HealthEntry::error(
                name,
                format!("{path} is not a directory", path = path.display()),
            ),
            Err(_) => HealthEntry::warn(
                name,
                format!("{path} not created yet", path = path.display()),
            ),
        }
    }

    fn check_binary(&self, name: &str, program: &str) -> HealthEntry {
        let output = Command::new(program)
            .arg("-version")
            .stdin(Stdio::null())
            .output();
        match output {
            Ok(output) if output.status.success() => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let version = stdout.lines().next().unwrap_or(program).trim().to_string();
                HealthEntry::ok(name, version)
            }
            Ok(output) => HealthEntry::error(
                name,
                format!("{program} exited with {:?}", output.status.code()),
            ),
            Err(err) => HealthEntry::error(name, format!("{program} not runnable: {err}")),
        }
    }

    fn check_catalog(&self) -> HealthEntry {
        let path = self.config.catalog_db();
        if !path.exists() {
            return HealthEntry::warn(
                "catalog",
                format!("{path} not created yet", path = path.display()),
            );
        }
        match self.open_catalog().and_then(|catalog| Ok(catalog.integrity()?)) {
            Ok(None) => HealthEntry::ok("catalog", "integrity ok"),
            Ok(Some(reason)) => HealthEntry::error("catalog", format!("quick_check: {reason}")),
            Err(err) => HealthEntry::error("catalog", format!("failed to open: {err}")),
        }
    }

    fn check_session(&self) -> HealthEntry {
        match self.session_status() {
            Ok(status) if !status.present => HealthEntry::warn("session", "no cached login"),
            Ok(status) if status.expired => {
                HealthEntry::warn("session", "cached login expired, next cycle logs in again")
            }
            Ok(status) => HealthEntry::ok(
                "session",
                format!(
                    "cached for {}",
                    status.username.as_deref().unwrap_or("<unknown>")
                ),
            ),
            Err(err) => HealthEntry::error("session", err.to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SessionCleared {
    pub path: PathBuf,
    pub removed: bool,
}

#[derive(Debug, Serialize)]
pub struct EventList {
    pub rows: Vec<EventRecord>,
}

#[derive(Debug, Serialize)]
pub struct CheckpointReport {
    pub checkpoint: Option<Checkpoint>,
    pub device: Option<StoredDevice>,
    pub counts: BTreeMap<String, u64>,
}

impl DisplayFallback for CycleReport {
    fn display(&self) -> String {
        let mut lines = vec![format!(
            "Cycle {} on {}",
            self.cycle_id,
            self.device.as_deref().unwrap_or("<no device>")
        )];
        lines.push(format!(
            "  found={} merged={} bundled={} cleaned={} failed={} skipped={}",
            self.found, self.merged, self.bundled, self.cleaned, self.failed, self.skipped
        ));
        lines.push(format!(
            "  segments fetched={} reused={} removed={}",
            self.segments_fetched, self.segments_reused, self.segments_removed
        ));
        if self.aborted {
            lines.push("  stopped early on shutdown".to_string());
        }
        lines.push(format!(
            "  checkpoint: {}",
            self.checkpoint.as_deref().unwrap_or("-")
        ));
        for failure in &self.failures {
            lines.push(format!(
                "  ! {} ({} attempt {}): {}",
                failure.event_id, failure.stage, failure.attempts, failure.error
            ));
        }
        lines.join("\n")
    }
}

impl DisplayFallback for SchedulerStatus {
    fn display(&self) -> String {
        let mut line = format!(
            "Scheduler stopped: {} completed, {} failed, {} skipped",
            self.cycles_completed, self.cycles_failed, self.cycles_skipped
        );
        if let Some(error) = &self.last_error {
            line.push_str(&format!("\nLast error: {error}"));
        }
        line
    }
}

impl DisplayFallback for SessionStatus {
    fn display(&self) -> String {
        if !self.present {
            return format!("No cached login at {}", self.path.display());
        }
        let expires = self
            .expires_at
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        let age = self
            .age_seconds
            .map(|secs| format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60))
            .unwrap_or_else(|| "-".to_string());
        format!(
            "{} | age={} | expires={}{}",
            self.username.as_deref().unwrap_or("<unknown>"),
            age,
            expires,
            if self.expired { " (expired)" } else { "" }
        )
    }
}

impl DisplayFallback for SessionCleared {
    fn display(&self) -> String {
        if self.removed {
            format!("Removed {}", self.path.display())
        } else {
            "No cached login to remove".to_string()
        }
    }
}

impl DisplayFallback for EventList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "No events recorded".to_string();
        }
        let mut lines = Vec::new();
        for entry in &self.rows {
            let mut line = format!(
                "{} | {} | {} | status={} | attempts={}",
                entry.event_id,
                entry.event_time.format("%Y-%m-%d %H:%M:%S"),
                entry.event_type,
                entry.status,
                entry.attempts
            );
            if let Some(path) = &entry.artifact_path {
                line.push_str(&format!(" | {path}"));
            }
            if let Some(error) = &entry.last_error {
                line.push_str(&format!(" | error={error}"));
            }
            lines.push(line);
        }
        lines.join("\n")
    }
}

impl DisplayFallback for CheckpointReport {
    fn display(&self) -> String {
        let mut lines = vec![match &self.checkpoint {
            Some(checkpoint) => format!(
                "Checkpoint: {} at {}",
                checkpoint.event_id,
                checkpoint.event_time.to_rfc3339()
            ),
            None => "Checkpoint: none".to_string(),
        }];
        if let Some(device) = &self.device {
            lines.push(format!(
                "Device: {} ({}, did {})",
                device.name, device.model, device.did
            ));
        }
        if !self.counts.is_empty() {
            lines.push("Events:".to_string());
            for (status, count) in &self.counts {
                lines.push(format!("  - {status}: {count}"));
            }
        }
        lines.join("\n")
    }
}

impl DisplayFallback for Vec<HealthEntry> {
    fn display(&self) -> String {
        self.iter()
            .map(DisplayFallback::display)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct HealthEntry {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

#[derive(Debug, Serialize)]
pub enum CheckStatus {
    #[serde(rename = "ok")]
    Ok,
    #[serde(rename = "warn")]
    Warn,
    #[serde(rename = "error")]
    Error,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CheckStatus::Ok => "OK",
            CheckStatus::Warn => "WARN",
            CheckStatus::Error => "ERROR",
        };
        write!(f, "{}", label)
    }
}

impl HealthEntry {
    fn ok(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Ok,
            detail: detail.into(),
        }
    }

    fn warn(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Warn,
            detail: detail.into(),
        }
    }

    fn error(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Error,
            detail: detail.into(),
        }
    }
}

impl DisplayFallback for HealthEntry {
    fn display(&self) -> String {
        format!(
            "[{status}] {name}: {detail}",
            status = self.status,
            name = self.name,
            detail = self.detail
        )
    }
}
