use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hex::encode as hex_encode;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::downloader::DownloadedSegment;
use crate::layout::{BUNDLE_PLAYLIST, CONCAT_LIST, KEY_FILE, LOCAL_PLAYLIST};

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("segment {index} missing or empty at {path}")]
    MissingSegment { index: usize, path: PathBuf },
    #[error("no segments to merge")]
    NothingToMerge,
    #[error("{program} exited with {code:?}: {stderr}")]
    CommandFailure {
        program: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("{program} did not finish within {after:?}")]
    Timeout { program: String, after: Duration },
    #[error("merged output failed verification: {0}")]
    Verification(String),
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
}

impl MergeError {
    /// Failures that another run over the same segments might not repeat.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MergeError::CommandFailure { .. }
                | MergeError::Timeout { .. }
                | MergeError::Verification(_)
        )
    }
}

pub type MergeResult<T> = std::result::Result<T, MergeError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(&self, program: &Path, args: &[String]) -> std::io::Result<CommandOutput>;
}

pub struct SystemCommandExecutor;

#[async_trait]
impl CommandExecutor for SystemCommandExecutor {
    async fn run(&self, program: &Path, args: &[String]) -> std::io::Result<CommandOutput> {
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;
        Ok(CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct MergerSettings {
    pub ffmpeg: PathBuf,
    pub ffprobe: Option<PathBuf>,
    pub timeout: Duration,
    pub min_size_ratio: f64,
    pub duration_tolerance_percent: u32,
    pub faststart: bool,
}

impl Default for MergerSettings {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: None,
            timeout: Duration::from_secs(600),
            min_size_ratio: 0.5,
            duration_tolerance_percent: 10,
            faststart: true,
        }
    }
}

/// AES-128 key already fetched next to the segments.
#[derive(Debug, Clone)]
pub struct LocalKey {
    pub path: PathBuf,
    pub method: String,
    pub iv: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MergeRequest {
    pub event_id: String,
    pub work_dir: PathBuf,
    pub segments: Vec<DownloadedSegment>,
    pub key: Option<LocalKey>,
    pub output: PathBuf,
}

impl MergeRequest {
    pub fn expected_duration(&self) -> f64 {
        self.segments.iter().map(|segment| segment.duration).sum()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeOutcome {
    pub output: PathBuf,
    pub bytes: u64,
    pub duration: Option<f64>,
    pub sha256: String,
    pub attempts: u32,
}

pub struct Merger {
    settings: MergerSettings,
    executor: Arc<dyn CommandExecutor>,
}

impl Merger {
    pub fn new(settings: MergerSettings, executor: Option<Arc<dyn CommandExecutor>>) -> Self {
        Self {
            settings,
            executor: executor.unwrap_or_else(|| Arc::new(SystemCommandExecutor)),
        }
    }

    pub fn settings(&self) -> &MergerSettings {
        &self.settings
    }

    /// Concatenates the segments losslessly into `request.output`.
    pub async fn merge(&self, request: &MergeRequest) -> MergeResult<MergeOutcome> {
        let input_bytes = verify_segments(&request.segments).await?;
        let first = match self.attempt(request, input_bytes).await {
            Ok(outcome) => return Ok(outcome),
            Err(err) => err,
        };
        if !first.is_retryable() {
            return Err(first);
        }
        warn!(event_id = %request.event_id, error = %first, "merge failed, re-checking segments and retrying once");
        let input_bytes = verify_segments(&request.segments).await?;
        let mut outcome = self.attempt(request, input_bytes).await?;
        outcome.attempts = 2;
        Ok(outcome)
    }

    async fn attempt(&self, request: &MergeRequest, input_bytes: u64) -> MergeResult<MergeOutcome> {
        if let Some(parent) = request.output.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| MergeError::Io {
                    source,
                    path: parent.to_path_buf(),
                })?;
        }
        let part = part_path(&request.output);
        remove_if_present(&part).await;

        let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error", "-y"]
            .iter()
            .map(|arg| arg.to_string())
            .collect();
        match &request.key {
            Some(key) => {
                let playlist = request.work_dir.join(LOCAL_PLAYLIST);
                write_file(&playlist, &local_playlist(&request.segments, key)).await?;
                args.extend(
                    [
                        "-allowed_extensions",
                        "ALL",
                        "-protocol_whitelist",
                        "file,crypto,data",
                        "-i",
                    ]
                    .iter()
                    .map(|arg| arg.to_string()),
                );
                args.push(playlist.to_string_lossy().into_owned());
            }
            None => {
                let list = request.work_dir.join(CONCAT_LIST);
                write_file(&list, &concat_list(&request.segments)).await?;
                args.extend(
                    ["-f", "concat", "-safe", "0", "-i"]
                        .iter()
                        .map(|arg| arg.to_string()),
                );
                args.push(list.to_string_lossy().into_owned());
            }
        }
        args.extend(["-c", "copy"].iter().map(|arg| arg.to_string()));
        if self.settings.faststart {
            args.extend(["-movflags", "+faststart"].iter().map(|arg| arg.to_string()));
        }
        args.extend(["-f", "mp4"].iter().map(|arg| arg.to_string()));
        args.push(part.to_string_lossy().into_owned());

        debug!(event_id = %request.event_id, segments = request.segments.len(), "running ffmpeg");
        let output = self.run_tool(&self.settings.ffmpeg, &args).await?;
        if !output.success {
            remove_if_present(&part).await;
            return Err(MergeError::CommandFailure {
                program: self.settings.ffmpeg.display().to_string(),
                code: output.code,
                stderr: tail(&output.stderr),
            });
        }

        let verified = self.verify_output(&part, input_bytes, request.expected_duration()).await;
        let (bytes, duration) = match verified {
            Ok(values) => values,
            Err(err) => {
                remove_if_present(&part).await;
                return Err(err);
            }
        };
        fs::rename(&part, &request.output)
            .await
            .map_err(|source| MergeError::Io {
                source,
                path: request.output.clone(),
            })?;
        let sha256 = compute_sha256(&request.output).await?;
        info!(
            event_id = %request.event_id,
            output = %request.output.display(),
            bytes,
            duration = ?duration,
            "segments merged"
        );
        Ok(MergeOutcome {
            output: request.output.clone(),
            bytes,
            duration,
            sha256,
            attempts: 1,
        })
    }

    async fn verify_output(
        &self,
        path: &Path,
        input_bytes: u64,
        expected_duration: f64,
    ) -> MergeResult<(u64, Option<f64>)> {
        let bytes = match fs::metadata(path).await {
            Ok(metadata) => metadata.len(),
            Err(err) => {
                return Err(MergeError::Verification(format!(
                    "output unreadable: {err}"
                )))
            }
        };
        if bytes == 0 {
            return Err(MergeError::Verification("output is empty".into()));
        }
        let minimum = (input_bytes as f64 * self.settings.min_size_ratio) as u64;
        if bytes < minimum {
            return Err(MergeError::Verification(format!(
                "output has {bytes} bytes, expected at least {minimum}"
            )));
        }

        let Some(ffprobe) = &self.settings.ffprobe else {
            return Ok((bytes, None));
        };
        let duration = self.probe_duration(ffprobe, path).await?;
        if expected_duration > 0.0 {
            let tolerance =
                expected_duration * f64::from(self.settings.duration_tolerance_percent) / 100.0;
            if (duration - expected_duration).abs() > tolerance {
                return Err(MergeError::Verification(format!(
                    "duration {duration:.2}s differs from expected {expected_duration:.2}s"
                )));
            }
        }
        Ok((bytes, Some(duration)))
    }

    async fn probe_duration(&self, ffprobe: &Path, path: &Path) -> MergeResult<f64> {
        let args = vec![
            "-v".to_string(),
            "error".to_string(),
            "-show_entries".to_string(),
            "format=duration".to_string(),
            "-of".to_string(),
            "default=noprint_wrappers=1:nokey=1".to_string(),
            path.to_string_lossy().into_owned(),
        ];
        let output = self.run_tool(ffprobe, &args).await?;
        if !output.success {
            return Err(MergeError::Verification(format!(
                "ffprobe could not read output: {}",
                tail(&output.stderr)
            )));
        }
        output
            .stdout
            .trim()
            .parse::<f64>()
            .map_err(|_| MergeError::Verification(format!("unparseable duration {:?}", output.stdout.trim())))
    }

    async fn run_tool(&self, program: &Path, args: &[String]) -> MergeResult<CommandOutput> {
        match timeout(self.settings.timeout, self.executor.run(program, args)).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(source)) => Err(MergeError::Spawn {
                program: program.display().to_string(),
                source,
            }),
            Err(_) => Err(MergeError::Timeout {
                program: program.display().to_string(),
                after: self.settings.timeout,
            }),
        }
    }
}

/// Copies the raw segments into `dir` with an `index.m3u8`, for setups that keep segments instead of merging.
pub async fn bundle_segments(request: &MergeRequest, dir: &Path) -> MergeResult<PathBuf> {
    verify_segments(&request.segments).await?;
    fs::create_dir_all(dir)
        .await
        .map_err(|source| MergeError::Io {
            source,
            path: dir.to_path_buf(),
        })?;
    for segment in &request.segments {
        let Some(name) = segment.path.file_name() else {
            return Err(MergeError::MissingSegment {
                index: segment.index,
                path: segment.path.clone(),
            });
        };
        let target = dir.join(name);
        fs::copy(&segment.path, &target)
            .await
            .map_err(|source| MergeError::Io {
                source,
                path: target.clone(),
            })?;
    }
    let bundle_key = match &request.key {
        Some(key) => {
            let target = dir.join(KEY_FILE);
            fs::copy(&key.path, &target)
                .await
                .map_err(|source| MergeError::Io {
                    source,
                    path: target.clone(),
                })?;
            Some(LocalKey {
                path: target,
                ..key.clone()
            })
        }
        None => None,
    };
    let playlist = match &bundle_key {
        Some(key) => local_playlist(&request.segments, key),
        None => plain_playlist(&request.segments),
    };
    let index = dir.join(BUNDLE_PLAYLIST);
    write_file(&index, &playlist).await?;
    info!(event_id = %request.event_id, dir = %dir.display(), "segments kept as bundle");
    Ok(index)
}

/// Checks every segment is present and non-empty; returns their total size.
async fn verify_segments(segments: &[DownloadedSegment]) -> MergeResult<u64> {
    if segments.is_empty() {
        return Err(MergeError::NothingToMerge);
    }
    let mut total = 0u64;
    for segment in segments {
        match fs::metadata(&segment.path).await {
            Ok(metadata) if metadata.len() > 0 => total += metadata.len(),
            _ => {
                return Err(MergeError::MissingSegment {
                    index: segment.index,
                    path: segment.path.clone(),
                })
            }
        }
    }
    Ok(total)
}

fn concat_list(segments: &[DownloadedSegment]) -> String {
    let mut list = String::new();
    for segment in segments {
        let path = segment.path.to_string_lossy().replace('\'', "'\\''");
        list.push_str(&format!("file '{path}'\n"));
    }
    list
}

fn playlist_header(segments: &[DownloadedSegment]) -> String {
    let target = segments
        .iter()
        .map(|segment| segment.duration.ceil() as u64)
        .max()
        .unwrap_or(1)
        .max(1);
    format!("#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:{target}\n#EXT-X-MEDIA-SEQUENCE:0\n")
}

fn playlist_body(playlist: &mut String, segments: &[DownloadedSegment]) {
    for segment in segments {
        let name = segment
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        playlist.push_str(&format!("#EXTINF:{:.3},\n{name}\n", segment.duration));
    }
    playlist.push_str("#EXT-X-ENDLIST\n");
}

fn plain_playlist(segments: &[DownloadedSegment]) -> String {
    let mut playlist = playlist_header(segments);
    playlist_body(&mut playlist, segments);
    playlist
}

/// Playlist next to the segments that points ffmpeg at the local key.
fn local_playlist(segments: &[DownloadedSegment], key: &LocalKey) -> String {
    let mut playlist = playlist_header(segments);
    playlist.push_str(&format!(
        "#EXT-X-KEY:METHOD={},URI=\"{}\"",
        key.method,
        key.path.to_string_lossy()
    ));
    if let Some(iv) = &key.iv {
        playlist.push_str(&format!(",IV={iv}"));
    }
    playlist.push('\n');
    playlist_body(&mut playlist, segments);
    playlist
}

fn part_path(output: &Path) -> PathBuf {
    let mut name = output
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    output.with_file_name(name)
}

async fn write_file(path: &Path, content: &str) -> MergeResult<()> {
    fs::write(path, content)
        .await
        .map_err(|source| MergeError::Io {
            source,
            path: path.to_path_buf(),
        })
}

async fn remove_if_present(path: &Path) {
    if let Err(err) = fs::remove_file(path).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %err, "failed to remove partial output");
        }
    }
}

fn tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.lines().collect();
    lines[lines.len().saturating_sub(5)..].join("\n")
}

pub async fn compute_sha256(path: &Path) -> MergeResult<String> {
    let io_error = |source| MergeError::Io {
        source,
        path: path.to_path_buf(),
    };
    let mut file = fs::File::open(path).await.map_err(io_error)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer).await.map_err(io_error)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}
