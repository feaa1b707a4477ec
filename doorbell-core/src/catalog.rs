use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, ErrorCode, OpenFlags, OptionalExtension};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::cloud::Device;
use crate::events::{Checkpoint, Event, EventStatus};
use crate::sqlite::{configure_connection, quick_check};

const CATALOG_SCHEMA: &str = include_str!("../../sql/catalog.sql");

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("catalog path not configured")]
    MissingStore,
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("failed to open catalog at {path}: {source}")]
    OpenDatabase {
        path: PathBuf,
        source: rusqlite::Error,
    },
    #[error("catalog at {path} is corrupted: {reason}")]
    Corrupted { path: PathBuf, reason: String },
    #[error("event {event_id} not found")]
    NotFound { event_id: String },
    #[error("checkpoint cannot move to {event_id}: {reason}")]
    CheckpointRejected { event_id: String, reason: String },
}

impl CatalogError {
    /// True when the catalog content can no longer be trusted.
    pub fn is_corruption(&self) -> bool {
        match self {
            CatalogError::Corrupted { .. } => true,
            CatalogError::Database(err) | CatalogError::OpenDatabase { source: err, .. } => {
                matches!(
                    err,
                    rusqlite::Error::SqliteFailure(failure, _)
                        if matches!(failure.code, ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase)
                )
            }
            _ => false,
        }
    }
}

pub type CatalogResult<T> = std::result::Result<T, CatalogError>;

#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub event_id: String,
    pub event_time: DateTime<Utc>,
    pub event_type: String,
    pub status: EventStatus,
    pub attempts: u32,
    pub segment_count: Option<u32>,
    pub artifact_path: Option<String>,
    pub artifact_sha256: Option<String>,
    pub last_error: Option<String>,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoredDevice {
    pub did: String,
    pub name: String,
    pub model: String,
    pub kind: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub status: Option<EventStatus>,
    pub limit: Option<usize>,
}

struct RawRecord {
    event_id: String,
    event_time_ms: i64,
    event_type: String,
    status: String,
    attempts: i64,
    segment_count: Option<i64>,
    artifact_path: Option<String>,
    artifact_sha256: Option<String>,
    last_error: Option<String>,
    updated_at: String,
}

impl RawRecord {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            event_id: row.get("event_id")?,
            event_time_ms: row.get("event_time_ms")?,
            event_type: row.get("event_type")?,
            status: row.get("status")?,
            attempts: row.get("attempts")?,
            segment_count: row.get("segment_count")?,
            artifact_path: row.get("artifact_path")?,
            artifact_sha256: row.get("artifact_sha256")?,
            last_error: row.get("last_error")?,
            updated_at: row.get("updated_at")?,
        })
    }

    fn into_record(self, path: &Path) -> CatalogResult<EventRecord> {
        let status = self.status.parse::<EventStatus>().map_err(|reason| {
            CatalogError::Corrupted {
                path: path.to_path_buf(),
                reason: format!("event {}: {reason}", self.event_id),
            }
        })?;
        let event_time = millis_to_utc(path, self.event_time_ms)?;
        Ok(EventRecord {
            event_id: self.event_id,
            event_time,
            event_type: self.event_type,
            status,
            attempts: u32::try_from(self.attempts).unwrap_or(0),
            segment_count: self.segment_count.and_then(|count| u32::try_from(count).ok()),
            artifact_path: self.artifact_path,
            artifact_sha256: self.artifact_sha256,
            last_error: self.last_error,
            updated_at: self.updated_at,
        })
    }
}

const RECORD_COLUMNS: &str = "event_id, event_time_ms, event_type, status, attempts, segment_count, \
     artifact_path, artifact_sha256, last_error, updated_at";

#[derive(Debug, Clone)]
pub struct EventCatalogBuilder {
    path: Option<PathBuf>,
    create_if_missing: bool,
}

impl Default for EventCatalogBuilder {
    fn default() -> Self {
        Self {
            path: None,
            create_if_missing: true,
        }
    }
}

impl EventCatalogBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> CatalogResult<EventCatalog> {
        let path = self.path.ok_or(CatalogError::MissingStore)?;
        let mut flags = OpenFlags::SQLITE_OPEN_READ_WRITE;
        if self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        Ok(EventCatalog { path, flags })
    }
}

/// Durable record of every observed event and the processing checkpoint.
#[derive(Debug, Clone)]
pub struct EventCatalog {
    path: PathBuf,
    flags: OpenFlags,
}

impl EventCatalog {
    pub fn builder() -> EventCatalogBuilder {
        EventCatalogBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> CatalogResult<Self> {
        EventCatalogBuilder::new().path(path).build()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> CatalogResult<Connection> {
        if self.flags.contains(OpenFlags::SQLITE_OPEN_CREATE) {
            if let Some(parent) = self.path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|source| CatalogError::Io {
                        source,
                        path: parent.to_path_buf(),
                    })?;
                }
            }
        }
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            CatalogError::OpenDatabase {
                path: self.path.clone(),
                source,
            }
        })?;
        configure_connection(&conn).map_err(|source| CatalogError::OpenDatabase {
            path: self.path.clone(),
            source,
        })?;
        Ok(conn)
    }

    /// Creates the schema and refuses to continue on a damaged file.
    pub fn initialize(&self) -> CatalogResult<()> {
        let conn = self.open()?;
        conn.execute_batch(CATALOG_SCHEMA)?;
        if let Some(reason) = quick_check(&conn)? {
            return Err(CatalogError::Corrupted {
                path: self.path.clone(),
                reason,
            });
        }
        Ok(())
    }

    pub fn integrity(&self) -> CatalogResult<Option<String>> {
        let conn = self.open()?;
        Ok(quick_check(&conn)?)
    }

    /// Inserts the event if unseen; an existing row keeps its status and attempts.
    pub fn record_discovered(&self, event: &Event) -> CatalogResult<EventRecord> {
        let conn = self.open()?;
        let inserted = conn.execute(
            "INSERT INTO events (event_id, event_time_ms, event_type, status)
             VALUES (?1, ?2, ?3, 'discovered')
             ON CONFLICT(event_id) DO NOTHING",
            params![
                &event.event_id,
                event.occurred_at.timestamp_millis(),
                &event.event_type,
            ],
        )?;
        if inserted > 0 {
            debug!(event_id = %event.event_id, "event discovered");
        }
        self.fetch(&conn, &event.event_id)?
            .ok_or_else(|| CatalogError::NotFound {
                event_id: event.event_id.clone(),
            })
    }

    pub fn get(&self, event_id: &str) -> CatalogResult<Option<EventRecord>> {
        let conn = self.open()?;
        self.fetch(&conn, event_id)
    }

    fn fetch(&self, conn: &Connection, event_id: &str) -> CatalogResult<Option<EventRecord>> {
        let raw = conn
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM events WHERE event_id = ?1"),
                params![event_id],
                RawRecord::from_row,
            )
            .optional()?;
        raw.map(|raw| raw.into_record(&self.path)).transpose()
    }

    /// Moves the event to `downloading` and returns the new attempt count.
    pub fn begin_attempt(&self, event_id: &str, segment_count: usize) -> CatalogResult<u32> {
        let conn = self.open()?;
        let updated = conn.execute(
            "UPDATE events SET status = 'downloading', attempts = attempts + 1,
                 segment_count = ?2, last_error = NULL, updated_at = CURRENT_TIMESTAMP
             WHERE event_id = ?1",
            params![event_id, segment_count as i64],
        )?;
        self.require_updated(updated, event_id)?;
        let attempts: i64 = conn.query_row(
            "SELECT attempts FROM events WHERE event_id = ?1",
            params![event_id],
            |row| row.get(0),
        )?;
        Ok(u32::try_from(attempts).unwrap_or(u32::MAX))
    }

    pub fn mark_failed(&self, event_id: &str, error: &str) -> CatalogResult<()> {
        let conn = self.open()?;
        let updated = conn.execute(
            "UPDATE events SET status = 'failed', last_error = ?2, updated_at = CURRENT_TIMESTAMP
             WHERE event_id = ?1",
            params![event_id, error],
        )?;
        self.require_updated(updated, event_id)
    }

    pub fn mark_merged(
        &self,
        event_id: &str,
        artifact_path: &Path,
        sha256: Option<&str>,
    ) -> CatalogResult<()> {
        let conn = self.open()?;
        let updated = conn.execute(
            "UPDATE events SET status = 'merged', artifact_path = ?2, artifact_sha256 = ?3,
                 last_error = NULL, updated_at = CURRENT_TIMESTAMP
             WHERE event_id = ?1",
            params![event_id, artifact_path.to_string_lossy(), sha256],
        )?;
        self.require_updated(updated, event_id)
    }

    pub fn mark_cleaned(&self, event_id: &str) -> CatalogResult<()> {
        let conn = self.open()?;
        let updated = conn.execute(
            "UPDATE events SET status = 'cleaned', updated_at = CURRENT_TIMESTAMP
             WHERE event_id = ?1",
            params![event_id],
        )?;
        self.require_updated(updated, event_id)
    }

    fn require_updated(&self, updated: usize, event_id: &str) -> CatalogResult<()> {
        if updated == 0 {
            return Err(CatalogError::NotFound {
                event_id: event_id.to_string(),
            });
        }
        Ok(())
    }

    pub fn checkpoint(&self) -> CatalogResult<Option<Checkpoint>> {
        let conn = self.open()?;
        read_checkpoint(&conn, &self.path)
    }

    /// Moves the checkpoint forward to a cleaned event. Returns `false` when it would not advance.
    pub fn advance_checkpoint(&self, checkpoint: &Checkpoint) -> CatalogResult<bool> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let status: Option<String> = tx
            .query_row(
                "SELECT status FROM events WHERE event_id = ?1",
                params![&checkpoint.event_id],
                |row| row.get(0),
            )
            .optional()?;
        match status.as_deref() {
            Some("cleaned") => {}
            Some(other) => {
                return Err(CatalogError::CheckpointRejected {
                    event_id: checkpoint.event_id.clone(),
                    reason: format!("event is {other}, not cleaned"),
                })
            }
            None => {
                return Err(CatalogError::NotFound {
                    event_id: checkpoint.event_id.clone(),
                })
            }
        }
        if let Some(current) = read_checkpoint(&tx, &self.path)? {
            if *checkpoint <= current {
                return Ok(false);
            }
        }
        tx.execute(
            "INSERT INTO checkpoint (id, event_id, event_time_ms, updated_at)
             VALUES (1, ?1, ?2, CURRENT_TIMESTAMP)
             ON CONFLICT(id) DO UPDATE SET
                 event_id = excluded.event_id,
                 event_time_ms = excluded.event_time_ms,
                 updated_at = excluded.updated_at",
            params![&checkpoint.event_id, checkpoint.event_time.timestamp_millis()],
        )?;
        tx.commit()?;
        info!(event_id = %checkpoint.event_id, event_time = %checkpoint.event_time, "checkpoint advanced");
        Ok(true)
    }

    pub fn list(&self, filter: &EventFilter) -> CatalogResult<Vec<EventRecord>> {
        let conn = self.open()?;
        let limit = filter
            .limit
            .map(|limit| i64::try_from(limit).unwrap_or(i64::MAX))
            .unwrap_or(-1);
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM events
             WHERE (?1 IS NULL OR status = ?1)
             ORDER BY event_time_ms DESC, event_id DESC
             LIMIT ?2"
        ))?;
        let rows = stmt.query_map(
            params![filter.status.map(|status| status.as_str()), limit],
            RawRecord::from_row,
        )?;
        let mut records = Vec::new();
        for raw in rows {
            records.push(raw?.into_record(&self.path)?);
        }
        Ok(records)
    }

    /// Event whose recorded artifact is `path`, if any.
    pub fn artifact_owner(&self, path: &Path) -> CatalogResult<Option<String>> {
        let conn = self.open()?;
        Ok(conn
            .query_row(
                "SELECT event_id FROM events WHERE artifact_path = ?1 LIMIT 1",
                params![path.to_string_lossy()],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Time of the oldest event not yet cleaned that still has attempts left.
    pub fn oldest_unfinished(&self, max_attempts: u32) -> CatalogResult<Option<DateTime<Utc>>> {
        let conn = self.open()?;
        let millis: Option<i64> = conn.query_row(
            "SELECT MIN(event_time_ms) FROM events
             WHERE status != 'cleaned' AND attempts < ?1",
            params![i64::from(max_attempts)],
            |row| row.get(0),
        )?;
        Ok(millis.and_then(|millis| Utc.timestamp_millis_opt(millis).single()))
    }

    pub fn counts(&self) -> CatalogResult<BTreeMap<String, u64>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM events GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut counts = BTreeMap::new();
        for row in rows {
            let (status, count) = row?;
            counts.insert(status, u64::try_from(count).unwrap_or(0));
        }
        Ok(counts)
    }

    /// Stores the active device. Returns `true` when it differs from the previous one.
    pub fn record_device(&self, device: &Device) -> CatalogResult<bool> {
        let previous = self.device()?;
        let changed = previous
            .as_ref()
            .map(|stored| stored.did != device.did || stored.name != device.name)
            .unwrap_or(true);
        if !changed {
            return Ok(false);
        }
        if let Some(stored) = &previous {
            info!(
                previous = %stored.name,
                current = %device.name,
                did = %device.did,
                "active device changed"
            );
        }
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO device (id, did, name, model, kind, updated_at)
             VALUES (1, ?1, ?2, ?3, ?4, CURRENT_TIMESTAMP)
             ON CONFLICT(id) DO UPDATE SET
                 did = excluded.did,
                 name = excluded.name,
                 model = excluded.model,
                 kind = excluded.kind,
                 updated_at = excluded.updated_at",
            params![&device.did, &device.name, &device.model, device.kind().as_str()],
        )?;
        Ok(true)
    }

    pub fn device(&self) -> CatalogResult<Option<StoredDevice>> {
        let conn = self.open()?;
        let device = conn
            .query_row(
                "SELECT did, name, model, kind, updated_at FROM device WHERE id = 1",
                [],
                |row| {
                    Ok(StoredDevice {
                        did: row.get(0)?,
                        name: row.get(1)?,
                        model: row.get(2)?,
                        kind: row.get(3)?,
                        updated_at: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(device)
    }
}

fn read_checkpoint(conn: &Connection, path: &Path) -> CatalogResult<Option<Checkpoint>> {
    let row: Option<(String, i64)> = conn
        .query_row(
            "SELECT event_id, event_time_ms FROM checkpoint WHERE id = 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    row.map(|(event_id, millis)| {
        Ok(Checkpoint {
            event_id,
            event_time: millis_to_utc(path, millis)?,
        })
    })
    .transpose()
}

fn millis_to_utc(path: &Path, millis: i64) -> CatalogResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| CatalogError::Corrupted {
            path: path.to_path_buf(),
            reason: format!("timestamp {millis} out of range"),
        })
}
