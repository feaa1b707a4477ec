use std::path::{Path, PathBuf};

use crate::cloud::Device;
use crate::events::{sanitize_component, Event};

const MAX_DEVICE_NAME_CHARS: usize = 50;
const UNKNOWN_DEVICE: &str = "unknown_device";

pub const MERGED_EXTENSION: &str = "mp4";
pub const BUNDLE_PLAYLIST: &str = "index.m3u8";
pub const KEY_FILE: &str = "key.bin";
pub const CONCAT_LIST: &str = "filelist.txt";
pub const LOCAL_PLAYLIST: &str = "local.m3u8";

/// Where raw segments and finished artifacts live on disk.
#[derive(Debug, Clone)]
pub struct StoragePaths {
    pub save_path: PathBuf,
    pub segments_root: PathBuf,
}

impl StoragePaths {
    pub fn new(save_path: impl Into<PathBuf>, segments_root: impl Into<PathBuf>) -> Self {
        Self {
            save_path: save_path.into(),
            segments_root: segments_root.into(),
        }
    }

    /// Scratch directory for one event's raw segments.
    pub fn segment_dir(&self, event: &Event) -> PathBuf {
        self.segments_root.join(safe_event_dir(&event.event_id))
    }

    pub fn segment_file(dir: &Path, index: usize) -> PathBuf {
        dir.join(format!("{index:04}.ts"))
    }

    pub fn day_dir(&self, device: &Device, event: &Event) -> PathBuf {
        let [year, month, day] = event.date_components();
        self.save_path
            .join(sanitize_device_name(&device.name))
            .join(year)
            .join(month)
            .join(day)
    }

    pub fn merged_path(&self, device: &Device, event: &Event) -> PathBuf {
        self.merged_path_numbered(device, event, 0)
    }

    /// [`merged_path`](Self::merged_path) with `_<n>` after the stem when `n > 0`.
    pub fn merged_path_numbered(&self, device: &Device, event: &Event, n: usize) -> PathBuf {
        self.day_dir(device, event)
            .join(format!("{}.{MERGED_EXTENSION}", numbered_stem(event, n)))
    }

    /// Directory holding the raw segments as the delivered artifact when merging is off.
    pub fn bundle_dir(&self, device: &Device, event: &Event) -> PathBuf {
        self.bundle_dir_numbered(device, event, 0)
    }

    pub fn bundle_dir_numbered(&self, device: &Device, event: &Event, n: usize) -> PathBuf {
        self.day_dir(device, event).join(numbered_stem(event, n))
    }
}

fn numbered_stem(event: &Event, n: usize) -> String {
    match n {
        0 => event.output_stem(),
        n => format!("{}_{n}", event.output_stem()),
    }
}

fn safe_event_dir(event_id: &str) -> String {
    let cleaned = sanitize_component(event_id);
    let trimmed = cleaned.trim_matches('.');
    if trimmed.is_empty() {
        "_".to_string()
    } else {
        trimmed.to_string()
    }
}

pub fn sanitize_device_name(name: &str) -> String {
    let cleaned = sanitize_component(name);
    let trimmed = cleaned.trim_matches(|c| c == ' ' || c == '.');
    let truncated: String = trimmed.chars().take(MAX_DEVICE_NAME_CHARS).collect();
    let truncated = truncated.trim_end_matches(|c| c == ' ' || c == '.');
    if truncated.is_empty() {
        UNKNOWN_DEVICE.to_string()
    } else {
        truncated.to_string()
    }
}
