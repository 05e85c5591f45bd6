use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::{CatalogQuery, CatalogStation};
use crate::merge::{ImportMode, ImportReport};
use crate::model::{PresetSlot, StationCandidate, StationId, StationPatch, StationRecord};
use crate::session::{Phase, StationRef};
use crate::view::SortOption;

/// Current protocol version.  Bump this when the wire format changes in a
/// breaking way.  Clients check this on connect and can refuse to talk to
/// an incompatible daemon.
pub const PROTOCOL_VERSION: u32 = 1;

/// Messages sent from a client to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum Command {
    // playback
    Play { id: StationId },
    PlayPreset { slot: PresetSlot },
    Stop,
    Pause,
    Resume,
    TogglePause,
    Volume { value: f32 },
    ToggleMute,

    // library
    AddStation { station: StationCandidate },
    RemoveStation { id: StationId },
    UpdateStation { id: StationId, patch: StationPatch },
    SetPreset { id: StationId, slot: PresetSlot },
    ClearPreset { slot: PresetSlot },
    ClearLibrary,
    /// Explicit save; failures are reported back, unlike implicit writes.
    Save,

    // view
    SetSort { sort: SortOption },
    /// A keystroke in the filter box; applied after the debounce delay.
    FilterInput { query: String },
    /// Apply the pending filter immediately.
    SubmitFilter,

    // exchange
    ImportShare { link: String },
    ImportExport { json: String, mode: ImportMode },
    Export,
    /// Share the given stations, or the whole library when `ids` is empty.
    MakeShareLink {
        #[serde(default)]
        ids: Vec<StationId>,
        #[serde(default)]
        name: Option<String>,
    },
    CatalogSearch { query: CatalogQuery },

    GetState,
}

/// Messages sent from the daemon to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "broadcast")]
pub enum Broadcast {
    /// Sent immediately on connect: daemon version + full state snapshot.
    Hello {
        protocol_version: u32,
        daemon_rev: u64,
        state: DaemonState,
    },
    State {
        data: DaemonState,
    },
    /// Something the user should see once (e.g. "added 3 stations").
    Notice {
        message: String,
    },
    Error {
        message: String,
    },
    ImportReport {
        report: ImportReport,
    },
    Exported {
        json: String,
    },
    ShareLink {
        url: String,
    },
    SearchResults {
        stations: Vec<CatalogStation>,
    },
    Log {
        message: String,
    },
}

/// Health of the mpv process as observed by the daemon.
///
/// Transitions:
///   Absent -> Starting -> Running -> Dead -> Restarting -> Starting ...
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub enum MpvHealth {
    /// mpv process does not exist yet (before first use).
    #[default]
    Absent,
    /// Process is spawning / socket not yet available.
    Starting,
    Running,
    /// Process exited or socket closed.
    Dead,
    Restarting,
}

impl MpvHealth {
    pub fn is_unhealthy(&self) -> bool {
        matches!(self, MpvHealth::Dead | MpvHealth::Restarting)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PresetEntry {
    pub slot: PresetSlot,
    pub station_id: Option<StationId>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PlaybackState {
    pub phase: Phase,
    pub station: Option<StationRef>,
    /// URL actually being played, after any https upgrade or fallback.
    pub stream_url: Option<String>,
    pub volume: f32,
    pub muted: bool,
    pub session_started_at: Option<DateTime<Utc>>,
}

/// Full state of the daemon.  `rev` is a monotonically increasing counter
/// incremented every time the state changes.  Clients can use it to detect
/// missed updates and request a resync.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DaemonState {
    #[serde(default)]
    pub rev: u64,
    /// The library as currently sorted and filtered.
    pub stations: Vec<StationRecord>,
    pub library_size: usize,
    pub presets: Vec<PresetEntry>,
    pub sort: SortOption,
    pub filter: String,
    pub playback: PlaybackState,
    #[serde(default)]
    pub mpv_health: MpvHealth,
}

/// Wrapper for socket communication
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Command(Command),
    Broadcast(Broadcast),
}

impl Message {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let len = json.len() as u32;
        let mut result = Vec::with_capacity(4 + json.len());
        result.extend_from_slice(&len.to_be_bytes());
        result.extend_from_slice(&json);
        Ok(result)
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<(Self, usize)> {
        if data.len() < 4 {
            anyhow::bail!("Insufficient data for length header");
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if data.len() < 4 + len {
            anyhow::bail!("Insufficient data for message");
        }
        let msg: Self = serde_json::from_slice(&data[4..4 + len])?;
        Ok((msg, 4 + len))
    }
}
