//! Station entity, identities and the input shapes that create or edit it.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Longest note a station may carry, in characters.
pub const NOTE_MAX_CHARS: usize = 100;

/// Number of quick-access preset slots.
pub const PRESET_SLOTS: u8 = 6;

// ── identities ────────────────────────────────────────────────────────────────

/// Locally generated station id.  Random 128-bit, so an id freed by a
/// deletion is never handed out again in practice; the store still checks
/// for collisions before assigning one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StationId(String);

impl StationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(format!("{:032x}", rand::random::<u128>()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The key deciding whether two entries are the same station: the upstream
/// catalog id when there is one, otherwise the stream URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DedupKey(String);

impl DedupKey {
    pub fn from_parts(remote_id: Option<&str>, stream_url: &str) -> Self {
        match remote_id.map(str::trim).filter(|r| !r.is_empty()) {
            Some(remote) => Self(remote.to_string()),
            None => Self(stream_url.trim().to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One of the six preset positions.  Construction is checked, so an
/// out-of-range slot cannot reach the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct PresetSlot(u8);

impl PresetSlot {
    pub fn new(slot: u8) -> Option<Self> {
        (1..=PRESET_SLOTS).contains(&slot).then_some(Self(slot))
    }

    pub fn get(self) -> u8 {
        self.0
    }

    pub fn all() -> impl Iterator<Item = PresetSlot> {
        (1..=PRESET_SLOTS).map(PresetSlot)
    }
}

impl TryFrom<u8> for PresetSlot {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value).ok_or_else(|| format!("preset slot must be 1..={PRESET_SLOTS}, got {value}"))
    }
}

impl From<PresetSlot> for u8 {
    fn from(slot: PresetSlot) -> Self {
        slot.0
    }
}

// ── record ────────────────────────────────────────────────────────────────────

/// A station in the user's library.  Serialized as the `stations` value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StationRecord {
    pub id: StationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
    pub stream_url: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_name: Option<String>,
    #[serde(default)]
    pub favicon_url: Option<String>,
    #[serde(default)]
    pub homepage_url: Option<String>,
    #[serde(default)]
    pub bitrate_kbps: Option<u32>,
    #[serde(default)]
    pub country_code: Option<String>,
    #[serde(default)]
    pub vote_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub date_added: DateTime<Utc>,
    #[serde(default)]
    pub play_count: u64,
    #[serde(default)]
    pub last_played_at: Option<DateTime<Utc>>,
    /// Filled from the listening ledger on read; never authoritative here.
    #[serde(default)]
    pub total_listening_time_ms: u64,
    #[serde(default)]
    pub preset_slot: Option<PresetSlot>,
}

impl StationRecord {
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey::from_parts(self.remote_id.as_deref(), &self.stream_url)
    }

    /// Name shown to the user: the custom override if set.
    pub fn name(&self) -> &str {
        self.custom_name
            .as_deref()
            .filter(|n| !n.is_empty())
            .unwrap_or(&self.display_name)
    }
}

// ── candidate ─────────────────────────────────────────────────────────────────

/// A station that is not (yet) part of the library: manual adds, starter
/// pack entries, share-link and export imports.  Carries no id and no
/// preset; those are only ever assigned by the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StationCandidate {
    pub remote_id: Option<String>,
    pub stream_url: String,
    pub display_name: String,
    pub custom_name: Option<String>,
    pub favicon_url: Option<String>,
    pub homepage_url: Option<String>,
    pub bitrate_kbps: Option<u32>,
    pub country_code: Option<String>,
    pub vote_count: Option<u32>,
    pub note: Option<String>,
    pub date_added: Option<DateTime<Utc>>,
    pub play_count: u64,
    pub last_played_at: Option<DateTime<Utc>>,
}

impl StationCandidate {
    pub fn new(stream_url: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            stream_url: stream_url.into(),
            display_name: display_name.into(),
            ..Self::default()
        }
    }

    pub fn dedup_key(&self) -> DedupKey {
        DedupKey::from_parts(self.remote_id.as_deref(), &self.stream_url)
    }

    /// Trim text fields, drop empty optionals and cut the note to
    /// [`NOTE_MAX_CHARS`].
    pub fn normalized(mut self) -> Self {
        self.stream_url = self.stream_url.trim().to_string();
        self.display_name = self.display_name.trim().to_string();
        self.remote_id = non_empty(self.remote_id);
        self.custom_name = non_empty(self.custom_name);
        self.favicon_url = non_empty(self.favicon_url);
        self.homepage_url = non_empty(self.homepage_url);
        self.country_code = non_empty(self.country_code).map(|c| c.to_ascii_uppercase());
        self.note = non_empty(self.note).map(|n| truncate_chars(&n, NOTE_MAX_CHARS));
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.stream_url.trim().is_empty() {
            return Err("stream URL is empty".to_string());
        }
        if !is_http_url(&self.stream_url) {
            return Err(format!("stream URL must be http(s): {}", self.stream_url));
        }
        if self.display_name.trim().is_empty() {
            return Err(format!("station name is empty for {}", self.stream_url));
        }
        Ok(())
    }

    /// Materialize as a library record.  The preset slot always starts empty.
    pub fn into_record(self, id: StationId, now: DateTime<Utc>) -> StationRecord {
        StationRecord {
            id,
            remote_id: self.remote_id,
            stream_url: self.stream_url,
            display_name: self.display_name,
            custom_name: self.custom_name,
            favicon_url: self.favicon_url,
            homepage_url: self.homepage_url,
            bitrate_kbps: self.bitrate_kbps,
            country_code: self.country_code,
            vote_count: self.vote_count,
            note: self.note,
            date_added: self.date_added.unwrap_or(now),
            play_count: self.play_count,
            last_played_at: self.last_played_at,
            total_listening_time_ms: 0,
            preset_slot: None,
        }
    }
}

impl From<&StationRecord> for StationCandidate {
    fn from(record: &StationRecord) -> Self {
        Self {
            remote_id: record.remote_id.clone(),
            stream_url: record.stream_url.clone(),
            display_name: record.display_name.clone(),
            custom_name: record.custom_name.clone(),
            favicon_url: record.favicon_url.clone(),
            homepage_url: record.homepage_url.clone(),
            bitrate_kbps: record.bitrate_kbps,
            country_code: record.country_code.clone(),
            vote_count: record.vote_count,
            note: record.note.clone(),
            date_added: Some(record.date_added),
            play_count: record.play_count,
            last_played_at: record.last_played_at,
        }
    }
}

// ── patch ─────────────────────────────────────────────────────────────────────

/// Partial update for [`crate::LibraryStore::update`].  There is deliberately
/// no preset field; slots only move through `set_preset`/`clear_preset`.
/// For the optional text fields an empty string clears the value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StationPatch {
    pub display_name: Option<String>,
    pub custom_name: Option<String>,
    pub stream_url: Option<String>,
    pub favicon_url: Option<String>,
    pub homepage_url: Option<String>,
    pub bitrate_kbps: Option<u32>,
    pub country_code: Option<String>,
    pub vote_count: Option<u32>,
    pub note: Option<String>,
}

impl StationPatch {
    pub fn note(note: impl Into<String>) -> Self {
        Self {
            note: Some(note.into()),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

// ── helpers ───────────────────────────────────────────────────────────────────

pub(crate) fn is_http_url(url: &str) -> bool {
    let lower = url.trim().to_ascii_lowercase();
    (lower.starts_with("http://") && lower.len() > "http://".len())
        || (lower.starts_with("https://") && lower.len() > "https://".len())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub(crate) fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}
