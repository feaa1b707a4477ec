use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Local, TimeZone, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Discovered,
    Downloading,
    Merged,
    Cleaned,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Discovered => "discovered",
            EventStatus::Downloading => "downloading",
            EventStatus::Merged => "merged",
            EventStatus::Cleaned => "cleaned",
            EventStatus::Failed => "failed",
        }
    }

    pub fn terminal(&self) -> bool {
        matches!(self, EventStatus::Cleaned | EventStatus::Failed)
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "discovered" => Ok(EventStatus::Discovered),
            "downloading" => Ok(EventStatus::Downloading),
            "merged" => Ok(EventStatus::Merged),
            "cleaned" => Ok(EventStatus::Cleaned),
            "failed" => Ok(EventStatus::Failed),
            other => Err(format!("unknown event status: {other}")),
        }
    }
}

/// What the camera saw, as reported by the `eventType` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Pass,
    Stay,
    Bell,
    Other(String),
}

impl EventKind {
    pub fn from_wire(raw: &str) -> Self {
        match raw {
            "Pass" => EventKind::Pass,
            "Stay" | "Pass:Stay" => EventKind::Stay,
            "Bell" | "Pass:Bell" => EventKind::Bell,
            other => EventKind::Other(other.to_string()),
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            EventKind::Pass => "pass",
            EventKind::Stay => "stay",
            EventKind::Bell => "bell",
            EventKind::Other(_) => "unknown",
        }
    }

    pub fn description(&self) -> String {
        match self {
            EventKind::Pass => "someone passed by the door".to_string(),
            EventKind::Stay => "someone stayed at the door".to_string(),
            EventKind::Bell => "someone rang the doorbell".to_string(),
            EventKind::Other(raw) => raw.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SegmentDescriptor {
    pub index: usize,
    pub uri: String,
    /// Byte size when the remote side advertises it.
    pub size: Option<u64>,
    pub duration: f64,
}

/// `#EXT-X-KEY` parameters for AES-128 protected segments.
#[derive(Debug, Clone, PartialEq)]
pub struct EncryptionKey {
    pub method: String,
    pub uri: String,
    pub iv: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub event_id: String,
    pub occurred_at: DateTime<Utc>,
    pub event_type: String,
    pub segments: Vec<SegmentDescriptor>,
    pub encryption: Option<EncryptionKey>,
    pub status: EventStatus,
}

impl Event {
    pub fn new(
        event_id: impl Into<String>,
        occurred_at: DateTime<Utc>,
        event_type: impl Into<String>,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            occurred_at,
            event_type: event_type.into(),
            segments: Vec::new(),
            encryption: None,
            status: EventStatus::Discovered,
        }
    }

    pub fn from_millis(
        event_id: impl Into<String>,
        millis: i64,
        event_type: impl Into<String>,
    ) -> Option<Self> {
        let occurred_at = Utc.timestamp_millis_opt(millis).single()?;
        Some(Self::new(event_id, occurred_at, event_type))
    }

    pub fn kind(&self) -> EventKind {
        EventKind::from_wire(&self.event_type)
    }

    pub fn describe(&self) -> String {
        format!(
            "{} {}",
            self.occurred_at
                .with_timezone(&Local)
                .format("%Y-%m-%d %H:%M:%S"),
            self.kind().description()
        )
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            event_id: self.event_id.clone(),
            event_time: self.occurred_at,
        }
    }

    pub fn total_duration(&self) -> f64 {
        self.segments.iter().map(|segment| segment.duration).sum()
    }

    /// `HHMMSS_<tag>_<last six characters of the id>`, in local time.
    pub fn output_stem(&self) -> String {
        let time = self.occurred_at.with_timezone(&Local).format("%H%M%S");
        let chars: Vec<char> = self.event_id.chars().collect();
        let short: String = chars[chars.len().saturating_sub(6)..].iter().collect();
        format!("{time}_{}_{}", self.kind().tag(), sanitize_component(&short))
    }

    /// `YYYY/MM/DD` directory components, in local time.
    pub fn date_components(&self) -> [String; 3] {
        let local = self.occurred_at.with_timezone(&Local);
        [
            local.format("%Y").to_string(),
            local.format("%m").to_string(),
            local.format("%d").to_string(),
        ]
    }

    fn order_key(&self) -> (DateTime<Utc>, &str) {
        (self.occurred_at, self.event_id.as_str())
    }
}

/// Orders events oldest first, ties broken by id.
pub fn sort_chronologically(events: &mut [Event]) {
    events.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
}

/// Newest fully processed event; bounds the next fetch window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub event_id: String,
    pub event_time: DateTime<Utc>,
}

impl Checkpoint {
    /// True when `event` is strictly newer than this checkpoint.
    pub fn precedes(&self, event: &Event) -> bool {
        (event.occurred_at, event.event_id.as_str()) > (self.event_time, self.event_id.as_str())
    }
}

impl PartialOrd for Checkpoint {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Checkpoint {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.event_time, &self.event_id).cmp(&(other.event_time, &other.event_id))
    }
}

/// Replaces characters that are unsafe in a single path component.
pub fn sanitize_component(raw: &str) -> String {
    raw.chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}
