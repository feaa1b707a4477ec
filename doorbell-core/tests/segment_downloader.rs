use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tempfile::TempDir;

use doorbell_core::{
    Backoff, DownloadError, DownloadResult, DownloadSettings, EncryptionKey, Event,
    HttpTransport, MediaTransport, SegmentDescriptor, SegmentDownloader, StoragePaths, KEY_FILE,
};

/// Serves canned payloads; URLs can be slowed down or made to fail a number of times.
#[derive(Default)]
struct ScriptedTransport {
    payloads: HashMap<String, Vec<u8>>,
    delays: HashMap<String, Duration>,
    failures: Mutex<HashMap<String, usize>>,
    short_reads: Mutex<HashMap<String, usize>>,
    requests: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    fn serve(mut self, url: &str, payload: &[u8]) -> Self {
        self.payloads.insert(url.to_string(), payload.to_vec());
        self
    }

    fn slow(mut self, url: &str, delay: Duration) -> Self {
        self.delays.insert(url.to_string(), delay);
        self
    }

    fn fail(self, url: &str, times: usize) -> Self {
        self.failures.lock().unwrap().insert(url.to_string(), times);
        self
    }

    fn truncate(self, url: &str, times: usize) -> Self {
        self.short_reads.lock().unwrap().insert(url.to_string(), times);
        self
    }

    fn requests_for(&self, url: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|requested| requested.as_str() == url)
            .count()
    }

    fn total_requests(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn take(map: &Mutex<HashMap<String, usize>>, url: &str) -> bool {
        let mut map = map.lock().unwrap();
        match map.get_mut(url) {
            Some(left) if *left > 0 => {
                *left -= 1;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl MediaTransport for ScriptedTransport {
    async fn fetch_to_file(&self, url: &str, path: &Path) -> DownloadResult<u64> {
        self.requests.lock().unwrap().push(url.to_string());
        if let Some(delay) = self.delays.get(url) {
            tokio::time::sleep(*delay).await;
        }
        if Self::take(&self.failures, url) {
            return Err(DownloadError::Network {
                url: url.to_string(),
                message: "connection reset".into(),
            });
        }
        let Some(payload) = self.payloads.get(url) else {
            return Err(DownloadError::Status {
                url: url.to_string(),
                status: 404,
            });
        };
        let mut payload = payload.clone();
        if Self::take(&self.short_reads, url) {
            payload.truncate(payload.len() / 2);
        }
        tokio::fs::write(path, &payload).await.unwrap();
        Ok(payload.len() as u64)
    }
}

fn url(index: usize) -> String {
    format!("https://media.test/E1/seg{index}.ts")
}

fn event(sizes: &[Option<u64>]) -> Event {
    let mut event = Event::new(
        "E1",
        Utc.with_ymd_and_hms(2024, 5, 1, 11, 0, 0).unwrap(),
        "Pass",
    );
    event.segments = sizes
        .iter()
        .enumerate()
        .map(|(index, size)| SegmentDescriptor {
            index,
            uri: url(index),
            size: *size,
            duration: 4.0,
        })
        .collect();
    event
}

fn downloader(transport: Arc<ScriptedTransport>, concurrency: usize) -> SegmentDownloader {
    SegmentDownloader::new(
        transport,
        DownloadSettings {
            concurrency,
            backoff: Backoff::from_millis(3, 0, 0),
        },
    )
}

#[tokio::test]
async fn results_come_back_in_segment_order() {
    let temp = TempDir::new().unwrap();
    let transport = Arc::new(
        ScriptedTransport::default()
            .serve(&url(0), b"zero")
            .serve(&url(1), b"one")
            .serve(&url(2), b"two")
            .slow(&url(0), Duration::from_millis(60))
            .slow(&url(1), Duration::from_millis(30)),
    );

    let outcome = downloader(transport, 3)
        .download(&event(&[None, None, None]), temp.path())
        .await
        .unwrap();

    let indexes: Vec<_> = outcome.segments.iter().map(|s| s.index).collect();
    assert_eq!(indexes, vec![0, 1, 2]);
    assert_eq!(outcome.fetched, 3);
    assert_eq!(outcome.total_bytes(), 10);
    assert_eq!(
        std::fs::read(StoragePaths::segment_file(temp.path(), 1)).unwrap(),
        b"one"
    );
}

#[tokio::test]
async fn segments_already_on_disk_are_not_fetched_again() {
    let temp = TempDir::new().unwrap();
    std::fs::write(StoragePaths::segment_file(temp.path(), 0), b"zero").unwrap();
    std::fs::write(StoragePaths::segment_file(temp.path(), 1), b"one").unwrap();
    let transport = Arc::new(
        ScriptedTransport::default()
            .serve(&url(0), b"zero")
            .serve(&url(1), b"one")
            .serve(&url(2), b"two"),
    );

    let outcome = downloader(transport.clone(), 2)
        .download(&event(&[Some(4), Some(3), Some(3)]), temp.path())
        .await
        .unwrap();

    assert_eq!(transport.total_requests(), 1);
    assert_eq!(transport.requests_for(&url(2)), 1);
    assert_eq!(outcome.reused, 2);
    assert_eq!(outcome.fetched, 1);
    assert!(outcome.segments[0].reused);
    assert!(!outcome.segments[2].reused);
}

#[tokio::test]
async fn partial_file_with_wrong_size_is_replaced() {
    let temp = TempDir::new().unwrap();
    std::fs::write(StoragePaths::segment_file(temp.path(), 0), b"ze").unwrap();
    let transport = Arc::new(ScriptedTransport::default().serve(&url(0), b"zero"));

    let outcome = downloader(transport.clone(), 1)
        .download(&event(&[Some(4)]), temp.path())
        .await
        .unwrap();

    assert_eq!(transport.requests_for(&url(0)), 1);
    assert_eq!(outcome.segments[0].bytes, 4);
    assert_eq!(
        std::fs::read(StoragePaths::segment_file(temp.path(), 0)).unwrap(),
        b"zero"
    );
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let temp = TempDir::new().unwrap();
    let transport = Arc::new(
        ScriptedTransport::default()
            .serve(&url(0), b"zero")
            .serve(&url(1), b"one")
            .fail(&url(0), 2)
            .truncate(&url(1), 1),
    );

    let outcome = downloader(transport.clone(), 2)
        .download(&event(&[Some(4), Some(3)]), temp.path())
        .await
        .unwrap();

    assert_eq!(transport.requests_for(&url(0)), 3);
    assert_eq!(transport.requests_for(&url(1)), 2);
    assert_eq!(outcome.fetched, 2);
}

#[tokio::test]
async fn failed_segment_keeps_the_others_on_disk() {
    let temp = TempDir::new().unwrap();
    let transport = Arc::new(
        ScriptedTransport::default()
            .serve(&url(0), b"zero")
            .serve(&url(2), b"two"),
    );

    let err = downloader(transport.clone(), 3)
        .download(&event(&[None, None, None]), temp.path())
        .await
        .unwrap_err();

    match err {
        DownloadError::Incomplete { failed, total, .. } => {
            assert_eq!(failed, 1);
            assert_eq!(total, 3);
        }
        other => panic!("expected incomplete download, got {other:?}"),
    }
    // 404 is permanent
    assert_eq!(transport.requests_for(&url(1)), 1);
    assert!(StoragePaths::segment_file(temp.path(), 0).exists());
    assert!(!StoragePaths::segment_file(temp.path(), 1).exists());
    assert!(StoragePaths::segment_file(temp.path(), 2).exists());
}

#[tokio::test]
async fn encryption_key_is_stored_next_to_segments() {
    let temp = TempDir::new().unwrap();
    let key_url = "https://media.test/E1/key";
    let transport = Arc::new(
        ScriptedTransport::default()
            .serve(&url(0), b"zero")
            .serve(key_url, &[7u8; 16]),
    );
    let mut encrypted = event(&[None]);
    encrypted.encryption = Some(EncryptionKey {
        method: "AES-128".into(),
        uri: key_url.into(),
        iv: None,
    });

    let outcome = downloader(transport, 1)
        .download(&encrypted, temp.path())
        .await
        .unwrap();

    let key_path = outcome.key_path.unwrap();
    assert_eq!(key_path, temp.path().join(KEY_FILE));
    assert_eq!(std::fs::read(key_path).unwrap(), vec![7u8; 16]);
}

#[tokio::test]
async fn http_transport_copies_file_urls() {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("source.ts");
    std::fs::write(&source, b"local bytes").unwrap();
    let target = temp.path().join("copy.ts");
    let url = url::Url::from_file_path(&source).unwrap().to_string();

    let transport = HttpTransport::new(Duration::from_secs(5)).unwrap();
    let bytes = transport.fetch_to_file(&url, &target).await.unwrap();

    assert_eq!(bytes, 11);
    assert_eq!(std::fs::read(target).unwrap(), b"local bytes");
}
