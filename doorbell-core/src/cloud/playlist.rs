use std::sync::OnceLock;

use regex::Regex;
use url::Url;

use crate::events::{EncryptionKey, SegmentDescriptor};

#[derive(Debug, Clone, PartialEq)]
pub struct PlaylistSegment {
    pub duration: f64,
    pub uri: String,
}

/// A single-rendition HLS playlist as served for one event.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaPlaylist {
    pub target_duration: f64,
    pub segments: Vec<PlaylistSegment>,
    pub key: Option<EncryptionKey>,
}

impl MediaPlaylist {
    pub fn parse(contents: &str) -> Result<Self, String> {
        if !contents.trim_start().starts_with("#EXTM3U") {
            return Err("missing #EXTM3U header".into());
        }
        let mut target_duration = 0.0f64;
        let mut key = None;
        let mut segments = Vec::new();
        let mut pending_duration: Option<f64> = None;
        for line in contents.lines().map(str::trim) {
            if let Some(value) = line.strip_prefix("#EXT-X-TARGETDURATION:") {
                target_duration = value
                    .parse()
                    .map_err(|_| "invalid EXT-X-TARGETDURATION")?;
            } else if let Some(value) = line.strip_prefix("#EXT-X-KEY:") {
                key = parse_key(value)?;
            } else if let Some(value) = line.strip_prefix("#EXTINF:") {
                let duration = value
                    .split(',')
                    .next()
                    .unwrap_or_default()
                    .trim()
                    .parse()
                    .map_err(|_| "invalid EXTINF duration")?;
                pending_duration = Some(duration);
            } else if line.starts_with('#') || line.is_empty() {
                continue;
            } else {
                segments.push(PlaylistSegment {
                    duration: pending_duration.take().unwrap_or(target_duration),
                    uri: line.to_string(),
                });
            }
        }
        if segments.is_empty() {
            return Err("playlist missing segments".into());
        }
        Ok(Self {
            target_duration,
            segments,
            key,
        })
    }

    /// Resolves relative URIs against the playlist location.
    pub fn resolve(
        &self,
        base: &str,
    ) -> Result<(Vec<SegmentDescriptor>, Option<EncryptionKey>), String> {
        let segments = self
            .segments
            .iter()
            .enumerate()
            .map(|(index, segment)| {
                Ok(SegmentDescriptor {
                    index,
                    uri: resolve_uri(base, &segment.uri)?,
                    size: None,
                    duration: segment.duration,
                })
            })
            .collect::<Result<Vec<_>, String>>()?;
        let key = match &self.key {
            Some(key) => Some(EncryptionKey {
                uri: resolve_uri(base, &key.uri)?,
                ..key.clone()
            }),
            None => None,
        };
        Ok((segments, key))
    }
}

fn key_attribute_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r#"([A-Z0-9-]+)=("[^"]*"|[^,]*)"#).expect("valid regex"))
}

fn parse_key(attributes: &str) -> Result<Option<EncryptionKey>, String> {
    let mut method = None;
    let mut uri = None;
    let mut iv = None;
    for capture in key_attribute_pattern().captures_iter(attributes) {
        let value = capture[2].trim_matches('"').to_string();
        match &capture[1] {
            "METHOD" => method = Some(value),
            "URI" => uri = Some(value),
            "IV" => iv = Some(value),
            _ => {}
        }
    }
    match method.as_deref() {
        None => Err("EXT-X-KEY without METHOD".into()),
        Some("NONE") => Ok(None),
        Some(method) => {
            let uri = uri.ok_or("EXT-X-KEY without URI")?;
            Ok(Some(EncryptionKey {
                method: method.to_string(),
                uri,
                iv,
            }))
        }
    }
}

fn resolve_uri(base: &str, uri: &str) -> Result<String, String> {
    if let Ok(parsed) = Url::parse(uri) {
        if matches!(parsed.scheme(), "file" | "http" | "https") {
            return Ok(uri.to_string());
        }
    }
    let base = Url::parse(base).map_err(|err| format!("invalid playlist url {base}: {err}"))?;
    base.join(uri)
        .map(|joined| joined.to_string())
        .map_err(|err| format!("cannot resolve {uri}: {err}"))
}
