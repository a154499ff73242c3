use std::fmt;

use serde::{Deserialize, Serialize};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StationId(pub String);

impl StationId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for StationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for StationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Persisted broadcast status. Only the reconciler writes `Live`/`Ended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StationStatus {
    Idle,
    Live,
    Ended,
}

impl StationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StationStatus::Idle => "idle",
            StationStatus::Live => "live",
            StationStatus::Ended => "ended",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "live" => StationStatus::Live,
            "ended" => StationStatus::Ended,
            _ => StationStatus::Idle,
        }
    }
}

impl fmt::Display for StationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Station {
    pub id: StationId,
    pub name: String,
    pub description: Option<String>,
    /// `/slug`, fixed at creation.
    pub mount_point: String,
    pub port: Option<u16>,
    #[serde(skip_serializing)]
    pub source_password: String,
    pub auto_dj_enabled: bool,
    pub default_playlist_id: Option<String>,
    pub record_broadcasts: bool,
    /// Broadcasting was requested (startBroadcast) and not stopped since.
    pub is_active: bool,
    pub status: StationStatus,
    pub actual_start: Option<String>,
    pub actual_end: Option<String>,
    pub created_at: String,
}

impl Station {
    /// Mount point without its leading slash; the key the origin reports.
    pub fn mount_key(&self) -> &str {
        mount_key(&self.mount_point)
    }
}

pub fn mount_key(mount: &str) -> &str {
    mount.trim().trim_start_matches('/')
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewStation {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub auto_dj_enabled: bool,
    #[serde(default)]
    pub record_broadcasts: bool,
}

fn default_true() -> bool {
    true
}

/// Partial settings update. The mount point is intentionally absent.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StationSettings {
    pub name: Option<String>,
    /// `None` keeps the value, `Some(None)` (JSON `null`) clears it.
    #[serde(default, deserialize_with = "present")]
    pub description: Option<Option<String>>,
    pub auto_dj_enabled: Option<bool>,
    #[serde(default, deserialize_with = "present")]
    pub default_playlist_id: Option<Option<String>>,
    pub record_broadcasts: Option<bool>,
}

/// A field that is present in the body, even as `null`.
fn present<'de, D, T>(de: D) -> std::result::Result<Option<Option<T>>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(de).map(Some)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    pub id: String,
    pub title: String,
    pub artist: String,
    pub path: String,
    pub duration_sec: u32,
}

#[derive(Debug, Clone)]
pub struct DjCredential {
    pub id: String,
    pub station_id: StationId,
    pub username: String,
    /// bcrypt hash; the plaintext is never stored.
    pub password_hash: String,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NowPlaying {
    pub station_id: StationId,
    pub track_id: Option<String>,
    pub live_source: Option<String>,
    pub title: String,
    pub artist: String,
    pub is_live: bool,
    pub updated_at: String,
}

impl NowPlaying {
    pub fn track(station_id: &StationId, track: &Track) -> Self {
        Self {
            station_id: station_id.clone(),
            track_id: Some(track.id.clone()),
            live_source: None,
            title: track.title.clone(),
            artist: track.artist.clone(),
            is_live: false,
            updated_at: now_rfc3339(),
        }
    }

    pub fn live(station_id: &StationId, source: &str) -> Self {
        Self {
            station_id: station_id.clone(),
            track_id: None,
            live_source: Some(source.to_string()),
            title: "Live".into(),
            artist: source.to_string(),
            is_live: true,
            updated_at: now_rfc3339(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    AutoDj,
    Live,
}

impl SessionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionKind::AutoDj => "autodj",
            SessionKind::Live => "live",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: String,
    pub station_id: StationId,
    pub kind: String,
    pub source: String,
    pub started_at: String,
    pub ended_at: String,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastStatus {
    pub auto_dj_running: bool,
    pub live_dj_connected: bool,
    pub now_playing: Option<NowPlaying>,
}

pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| OffsetDateTime::now_utc().unix_timestamp().to_string())
}

/// Lowercase ASCII slug used to derive mount points from station names.
pub fn slugify(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_dash = true;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    if out.is_empty() {
        out.push_str("station");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_collapses_punctuation() {
        assert_eq!(slugify("Radio Nova 99.1 FM!"), "radio-nova-99-1-fm");
        assert_eq!(slugify("  --Jazz--  "), "jazz");
        assert_eq!(slugify("???"), "station");
    }

    #[test]
    fn mount_key_strips_leading_slash() {
        assert_eq!(mount_key("/foo"), "foo");
        assert_eq!(mount_key("foo"), "foo");
    }
}
