use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::fs;
use tracing::{debug, warn};

use crate::layout::{CONCAT_LIST, KEY_FILE, LOCAL_PLAYLIST};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub segments_removed: usize,
    pub auxiliary_removed: usize,
    pub errors: usize,
    pub dir_removed: bool,
}

/// Deletes an event's raw segments and scratch files. Only call once the final artifact is verified.
///
/// Failures are logged and counted, never returned.
pub async fn cleanup_event(dir: &Path, segments: &[PathBuf]) -> CleanupReport {
    let mut report = CleanupReport::default();
    for segment in segments {
        match remove(segment).await {
            Removal::Removed => report.segments_removed += 1,
            Removal::Missing => {}
            Removal::Failed => report.errors += 1,
        }
    }

    let mut auxiliary: Vec<PathBuf> = [KEY_FILE, CONCAT_LIST, LOCAL_PLAYLIST]
        .iter()
        .map(|name| dir.join(name))
        .collect();
    auxiliary.extend(leftover_parts(dir).await);
    for path in auxiliary {
        match remove(&path).await {
            Removal::Removed => report.auxiliary_removed += 1,
            Removal::Missing => {}
            Removal::Failed => report.errors += 1,
        }
    }

    match fs::remove_dir(dir).await {
        Ok(()) => report.dir_removed = true,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => {
            debug!(dir = %dir.display(), error = %err, "segment directory left in place");
        }
    }
    debug!(
        dir = %dir.display(),
        segments = report.segments_removed,
        auxiliary = report.auxiliary_removed,
        errors = report.errors,
        "cleanup finished"
    );
    report
}

enum Removal {
    Removed,
    Missing,
    Failed,
}

async fn remove(path: &Path) -> Removal {
    match fs::remove_file(path).await {
        Ok(()) => Removal::Removed,
        Err(err) if err.kind() == io::ErrorKind::NotFound => Removal::Missing,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "failed to remove intermediate file");
            Removal::Failed
        }
    }
}

async fn leftover_parts(dir: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let Ok(mut entries) = fs::read_dir(dir).await else {
        return found;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.extension().map(|ext| ext == "part").unwrap_or(false) {
            found.push(path);
        }
    }
    found
}
