mod common;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;

use doorbell_core::{
    bundle_segments, DownloadedSegment, LocalKey, MergeError, MergeRequest, Merger,
    MergerSettings, BUNDLE_PLAYLIST,
};

use common::ConcatExecutor;

fn segments(dir: &Path, payloads: &[&[u8]]) -> Vec<DownloadedSegment> {
    payloads
        .iter()
        .enumerate()
        .map(|(index, payload)| {
            let path = dir.join(format!("{index:04}.ts"));
            std::fs::write(&path, payload).unwrap();
            DownloadedSegment {
                index,
                path,
                bytes: payload.len() as u64,
                duration: 4.0,
                reused: false,
            }
        })
        .collect()
}

fn request(work_dir: &Path, output: PathBuf, segments: Vec<DownloadedSegment>) -> MergeRequest {
    MergeRequest {
        event_id: "E1".into(),
        work_dir: work_dir.to_path_buf(),
        segments,
        key: None,
        output,
    }
}

fn merger(executor: Arc<ConcatExecutor>, ffprobe: bool) -> Merger {
    Merger::new(
        MergerSettings {
            ffprobe: ffprobe.then(|| PathBuf::from("ffprobe")),
            ..MergerSettings::default()
        },
        Some(executor),
    )
}

#[tokio::test]
async fn merges_segments_in_index_order() {
    let temp = TempDir::new().unwrap();
    let executor = Arc::new(ConcatExecutor::new());
    let output = temp.path().join("out/120000_pass_E1.mp4");
    let req = request(
        temp.path(),
        output.clone(),
        segments(temp.path(), &[b"aaaa", b"bbbb", b"cccc"]),
    );

    let outcome = merger(executor.clone(), false).merge(&req).await.unwrap();

    assert_eq!(std::fs::read(&output).unwrap(), b"aaaabbbbcccc");
    assert_eq!(outcome.bytes, 12);
    assert_eq!(outcome.attempts, 1);
    assert_eq!(outcome.sha256.len(), 64);
    assert!(!output.with_extension("mp4.part").exists());

    let calls = executor.calls.lock().unwrap();
    let args = &calls[0].1;
    assert!(args.windows(2).any(|pair| pair[0] == "-c" && pair[1] == "copy"));
    assert!(args.iter().any(|arg| arg == "concat"));
}

#[tokio::test]
async fn one_failed_run_is_retried() {
    let temp = TempDir::new().unwrap();
    let executor = Arc::new(ConcatExecutor::new());
    executor.fail_next(1);
    let output = temp.path().join("merged.mp4");
    let req = request(temp.path(), output.clone(), segments(temp.path(), &[b"xx", b"yy"]));

    let outcome = merger(executor.clone(), false).merge(&req).await.unwrap();

    assert_eq!(outcome.attempts, 2);
    assert_eq!(executor.ffmpeg_runs(), 2);
    assert_eq!(std::fs::read(&output).unwrap(), b"xxyy");
}

#[tokio::test]
async fn second_failure_is_reported_and_segments_stay() {
    let temp = TempDir::new().unwrap();
    let executor = Arc::new(ConcatExecutor::new());
    executor.fail_next(2);
    let output = temp.path().join("merged.mp4");
    let segs = segments(temp.path(), &[b"xx", b"yy"]);
    let req = request(temp.path(), output.clone(), segs.clone());

    let err = merger(executor.clone(), false).merge(&req).await.unwrap_err();

    assert!(matches!(err, MergeError::CommandFailure { code: Some(1), .. }));
    assert_eq!(executor.ffmpeg_runs(), 2);
    assert!(!output.exists());
    assert!(segs.iter().all(|segment| segment.path.exists()));
}

#[tokio::test]
async fn undersized_output_fails_verification() {
    let temp = TempDir::new().unwrap();
    let executor = Arc::new(ConcatExecutor::new());
    executor.truncate_output();
    let output = temp.path().join("merged.mp4");
    let req = request(temp.path(), output.clone(), segments(temp.path(), &[b"aaaa", b"bbbb"]));

    let err = merger(executor, false).merge(&req).await.unwrap_err();

    assert!(matches!(err, MergeError::Verification(_)));
    assert!(!output.exists());
}

#[tokio::test]
async fn probed_duration_must_match_segments() {
    let temp = TempDir::new().unwrap();
    let executor = Arc::new(ConcatExecutor::new());
    executor.report_duration(3.0);
    let req = request(
        temp.path(),
        temp.path().join("merged.mp4"),
        segments(temp.path(), &[b"aaaa", b"bbbb"]),
    );

    let err = merger(executor.clone(), true).merge(&req).await.unwrap_err();
    assert!(matches!(err, MergeError::Verification(_)));

    executor.report_duration(8.1);
    let outcome = merger(executor, true).merge(&req).await.unwrap();
    assert_eq!(outcome.duration, Some(8.1));
}

#[tokio::test]
async fn missing_segment_stops_before_ffmpeg() {
    let temp = TempDir::new().unwrap();
    let executor = Arc::new(ConcatExecutor::new());
    let segs = segments(temp.path(), &[b"aaaa", b"bbbb"]);
    std::fs::remove_file(&segs[1].path).unwrap();
    let req = request(temp.path(), temp.path().join("merged.mp4"), segs);

    let err = merger(executor.clone(), false).merge(&req).await.unwrap_err();

    assert!(matches!(err, MergeError::MissingSegment { index: 1, .. }));
    assert_eq!(executor.ffmpeg_runs(), 0);
}

#[tokio::test]
async fn encrypted_segments_go_through_a_local_playlist() {
    let temp = TempDir::new().unwrap();
    let executor = Arc::new(ConcatExecutor::new());
    let key_path = temp.path().join("key.bin");
    std::fs::write(&key_path, [1u8; 16]).unwrap();
    let mut req = request(
        temp.path(),
        temp.path().join("merged.mp4"),
        segments(temp.path(), &[b"aaaa", b"bbbb"]),
    );
    req.key = Some(LocalKey {
        path: key_path,
        method: "AES-128".into(),
        iv: Some("0x00000000000000000000000000000001".into()),
    });

    merger(executor.clone(), false).merge(&req).await.unwrap();

    let calls = executor.calls.lock().unwrap();
    let args = &calls[0].1;
    assert!(args.iter().any(|arg| arg == "file,crypto,data"));
    let playlist = std::fs::read_to_string(temp.path().join("local.m3u8")).unwrap();
    assert!(playlist.contains("#EXT-X-KEY:METHOD=AES-128"));
    assert!(playlist.contains("IV=0x00000000000000000000000000000001"));
}

#[tokio::test]
async fn bundle_copies_segments_with_a_playlist() {
    let temp = TempDir::new().unwrap();
    let work = temp.path().join("work");
    std::fs::create_dir_all(&work).unwrap();
    let req = request(&work, PathBuf::new(), segments(&work, &[b"aaaa", b"bbbb"]));
    let target = temp.path().join("bundle");

    let playlist = bundle_segments(&req, &target).await.unwrap();

    assert_eq!(playlist, target.join(BUNDLE_PLAYLIST));
    assert_eq!(std::fs::read(target.join("0001.ts")).unwrap(), b"bbbb");
    let body = std::fs::read_to_string(&playlist).unwrap();
    assert!(body.starts_with("#EXTM3U"));
    assert!(body.contains("0000.ts"));
    assert!(body.trim_end().ends_with("#EXT-X-ENDLIST"));
}
