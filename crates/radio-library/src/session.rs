//! PlaybackSession: single-stream state machine.
//!
//! ```text
//!   Idle ──load──▶ Loading ──ready──▶ Playing ◀──play/pause──▶ Paused
//!                     │
//!                     └──failure (fallback exhausted)──▶ Error
//!   any ──stop / load──▶ Idle | Loading
//! ```
//!
//! The session owns the only [`StreamBackend`].  Every call to `open` is
//! stamped with a fresh [`LoadToken`]; asynchronous outcomes come back as
//! [`StreamSignal`]s carrying that token and are dropped unless it matches
//! the current attempt.  This is the only guard against late signals from a
//! load the user already abandoned, so it is checked on every signal.
//!
//! Stations are referenced by identity ([`StationRef`]), never owned; the
//! owner re-resolves them against the library after each mutation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::model::{DedupKey, StationId, StationRecord};

// ── public types ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    #[default]
    Idle,
    Loading,
    Playing,
    Paused,
    Error,
}

/// Generation counter identifying one attempt to open a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LoadToken(u64);

impl LoadToken {
    pub fn get(self) -> u64 {
        self.0
    }
}

/// What the session knows about the station it plays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StationRef {
    pub id: StationId,
    pub key: DedupKey,
    pub stream_url: String,
    pub name: String,
}

impl From<&StationRecord> for StationRef {
    fn from(record: &StationRecord) -> Self {
        Self {
            id: record.id.clone(),
            key: record.dedup_key(),
            stream_url: record.stream_url.clone(),
            name: record.name().to_string(),
        }
    }
}

/// The single underlying stream resource.  Calls are fire-and-forget;
/// outcomes are reported back through [`PlaybackSession::on_signal`].
pub trait StreamBackend {
    /// Start loading `url`.  All signals for this attempt carry `token`.
    fn open(&mut self, token: LoadToken, url: &str);
    /// Stop playback and detach from the current stream, if any.
    fn close(&mut self);
    fn set_paused(&mut self, paused: bool);
    fn set_volume(&mut self, volume: f32, muted: bool);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// The pipeline aborted the load, e.g. because it was superseded.
    Cancelled,
    Network,
    Unsupported,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFailure {
    pub kind: FailureKind,
    /// Whether audio was already usably buffered when the failure fired.
    pub buffered: bool,
    pub detail: String,
}

impl StreamFailure {
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            buffered: false,
            detail: detail.into(),
        }
    }

    pub fn buffered(mut self, buffered: bool) -> Self {
        self.buffered = buffered;
        self
    }

    /// A cancellation that arrived while the stream was playable anyway.
    /// Heuristic: the pipeline names both cases the same, so readiness is
    /// the only thing telling them apart.
    pub fn is_benign(&self) -> bool {
        self.kind == FailureKind::Cancelled && self.buffered
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalKind {
    Ready,
    Failed(StreamFailure),
    /// The stream ended on its own.  For a live radio stream that is a drop.
    Ended,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSignal {
    pub token: LoadToken,
    pub kind: SignalKind,
}

impl StreamSignal {
    pub fn ready(token: LoadToken) -> Self {
        Self {
            token,
            kind: SignalKind::Ready,
        }
    }

    pub fn failed(token: LoadToken, failure: StreamFailure) -> Self {
        Self {
            token,
            kind: SignalKind::Failed(failure),
        }
    }

    pub fn ended(token: LoadToken) -> Self {
        Self {
            token,
            kind: SignalKind::Ended,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SessionEvent {
    PhaseChanged {
        from: Phase,
        to: Phase,
        station: Option<StationRef>,
    },
    /// Emitted once per load on the first transition into `Playing`.
    Started { station: StationRef },
    /// Emitted once per failed load, after fallback was exhausted.
    Failed { station: StationRef, message: String },
    VolumeChanged { volume: f32, muted: bool },
}

/// Session-level settings, persisted under `player-settings`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlayerSettings {
    pub volume: f32,
    pub muted: bool,
}

impl Default for PlayerSettings {
    fn default() -> Self {
        Self {
            volume: 0.5,
            muted: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    /// Try `https://` first for `http://` stations, falling back once.
    pub prefer_https: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self { prefer_https: true }
    }
}

// ── session ───────────────────────────────────────────────────────────────────

struct Attempt {
    token: LoadToken,
    station: StationRef,
    url: String,
    upgraded: bool,
    started: bool,
    notified: bool,
}

pub struct PlaybackSession<B: StreamBackend> {
    backend: B,
    options: SessionOptions,
    phase: Phase,
    station: Option<StationRef>,
    attempt: Option<Attempt>,
    last_token: u64,
    volume: f32,
    muted: bool,
    session_started_at: Option<DateTime<Utc>>,
    events: broadcast::Sender<SessionEvent>,
}

impl<B: StreamBackend> PlaybackSession<B> {
    pub fn new(backend: B, options: SessionOptions, settings: PlayerSettings) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            backend,
            options,
            phase: Phase::Idle,
            station: None,
            attempt: None,
            last_token: 0,
            volume: settings.volume.clamp(0.0, 1.0),
            muted: settings.muted,
            session_started_at: None,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn station(&self) -> Option<&StationRef> {
        self.station.as_ref()
    }

    pub fn current_token(&self) -> Option<LoadToken> {
        self.attempt.as_ref().map(|a| a.token)
    }

    /// URL of the attempt in flight (after any https upgrade or fallback).
    pub fn current_url(&self) -> Option<&str> {
        self.attempt.as_ref().map(|a| a.url.as_str())
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    pub fn muted(&self) -> bool {
        self.muted
    }

    pub fn settings(&self) -> PlayerSettings {
        PlayerSettings {
            volume: self.volume,
            muted: self.muted,
        }
    }

    pub fn session_started_at(&self) -> Option<DateTime<Utc>> {
        self.session_started_at
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// For the driver that wires the backend to its transport.  Stream
    /// control must still go through the session.
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    // ── commands ──────────────────────────────────────────────────────────────

    /// Begin playing `station`, tearing down whatever was loaded before.
    pub fn load(&mut self, station: StationRef) -> LoadToken {
        if self.attempt.is_some() {
            debug!("session: tearing down previous stream before load");
            self.backend.close();
        }

        let original = station.stream_url.trim().to_string();
        let (url, upgraded) = match upgrade_to_https(&original) {
            Some(https) if self.options.prefer_https => (https, true),
            _ => (original, false),
        };

        let token = self.next_token();
        info!("session: load '{}' ({}) token={}", station.name, url, token.0);
        self.attempt = Some(Attempt {
            token,
            station: station.clone(),
            url: url.clone(),
            upgraded,
            started: false,
            notified: false,
        });
        self.station = Some(station);
        self.session_started_at = Some(Utc::now());
        self.set_phase(Phase::Loading);
        self.backend.set_volume(self.volume, self.muted);
        self.backend.open(token, &url);
        token
    }

    /// Resume from `Paused`.  Returns whether anything changed.
    pub fn play(&mut self) -> bool {
        if self.phase != Phase::Paused {
            return false;
        }
        self.backend.set_paused(false);
        self.set_phase(Phase::Playing);
        true
    }

    /// Pause from `Playing`.  Returns whether anything changed.
    pub fn pause(&mut self) -> bool {
        if self.phase != Phase::Playing {
            return false;
        }
        self.backend.set_paused(true);
        self.set_phase(Phase::Paused);
        true
    }

    pub fn toggle_pause(&mut self) -> bool {
        match self.phase {
            Phase::Playing => self.pause(),
            Phase::Paused => self.play(),
            _ => false,
        }
    }

    /// Tear down the stream and return to `Idle`.
    pub fn stop(&mut self) -> bool {
        if self.attempt.is_none() && self.phase == Phase::Idle {
            return false;
        }
        info!("session: stop");
        self.backend.close();
        self.attempt = None;
        self.station = None;
        self.session_started_at = None;
        self.set_phase(Phase::Idle);
        true
    }

    pub fn set_volume(&mut self, volume: f32) {
        self.volume = volume.clamp(0.0, 1.0);
        self.backend.set_volume(self.volume, self.muted);
        self.emit(SessionEvent::VolumeChanged {
            volume: self.volume,
            muted: self.muted,
        });
    }

    pub fn toggle_mute(&mut self) -> bool {
        self.muted = !self.muted;
        self.backend.set_volume(self.volume, self.muted);
        self.emit(SessionEvent::VolumeChanged {
            volume: self.volume,
            muted: self.muted,
        });
        self.muted
    }

    /// Point the session at an updated copy of the same station (e.g. the
    /// record got a new id after a replace import).  Ignored unless the
    /// identity and stream URL are unchanged.
    pub fn refresh_station(&mut self, station: StationRef) {
        if let Some(current) = self.station.as_mut() {
            if current.key == station.key && current.stream_url == station.stream_url {
                *current = station.clone();
                if let Some(attempt) = self.attempt.as_mut() {
                    attempt.station = station;
                }
            }
        }
    }

    // ── async resumption ──────────────────────────────────────────────────────

    /// Apply an asynchronous outcome from the backend.
    pub fn on_signal(&mut self, signal: StreamSignal) {
        let Some(current) = self.attempt.as_ref().map(|a| a.token) else {
            debug!("session: dropping signal for token={}, nothing loaded", signal.token.0);
            return;
        };
        if signal.token != current {
            debug!(
                "session: dropping stale signal token={} (current={})",
                signal.token.0, current.0
            );
            return;
        }

        match signal.kind {
            SignalKind::Ready => {
                if self.phase == Phase::Loading {
                    self.mark_started();
                }
            }
            SignalKind::Failed(failure) => self.handle_failure(failure),
            SignalKind::Ended => {
                if matches!(self.phase, Phase::Loading | Phase::Playing | Phase::Paused) {
                    self.handle_failure(StreamFailure::new(FailureKind::Network, "stream ended"));
                }
            }
        }
    }

    fn handle_failure(&mut self, failure: StreamFailure) {
        if !matches!(self.phase, Phase::Loading | Phase::Playing | Phase::Paused) {
            return;
        }

        if failure.is_benign() {
            debug!("session: cancellation with buffered audio, treating as ready");
            if self.phase == Phase::Loading {
                self.mark_started();
            }
            return;
        }

        if self.phase == Phase::Loading && self.try_fallback() {
            return;
        }

        self.fail(failure.detail);
    }

    /// Retry an upgraded https attempt on the original http URL.  Happens at
    /// most once per load: the retry is not itself upgraded.
    fn try_fallback(&mut self) -> bool {
        let Some(attempt) = self.attempt.as_ref() else {
            return false;
        };
        if !attempt.upgraded {
            return false;
        }
        let original = attempt.station.stream_url.trim().to_string();

        self.backend.close();
        let token = self.next_token();
        if let Some(attempt) = self.attempt.as_mut() {
            warn!(
                "session: https attempt failed for '{}', falling back to {}",
                attempt.station.name, original
            );
            attempt.token = token;
            attempt.url = original.clone();
            attempt.upgraded = false;
        }
        self.backend.open(token, &original);
        true
    }

    fn fail(&mut self, message: String) {
        self.backend.close();
        let station = self.station.take();
        self.session_started_at = None;
        self.set_phase(Phase::Error);

        let Some(attempt) = self.attempt.as_mut() else {
            return;
        };
        if attempt.notified {
            return;
        }
        attempt.notified = true;
        let station = station.unwrap_or_else(|| attempt.station.clone());
        warn!("session: '{}' failed: {}", station.name, message);
        self.emit(SessionEvent::Failed { station, message });
    }

    fn mark_started(&mut self) {
        self.set_phase(Phase::Playing);
        let Some(attempt) = self.attempt.as_mut() else {
            return;
        };
        if attempt.started {
            return;
        }
        attempt.started = true;
        let station = attempt.station.clone();
        info!("session: playing '{}'", station.name);
        self.emit(SessionEvent::Started { station });
    }

    // ── helpers ───────────────────────────────────────────────────────────────

    fn next_token(&mut self) -> LoadToken {
        self.last_token += 1;
        LoadToken(self.last_token)
    }

    fn set_phase(&mut self, to: Phase) {
        let from = self.phase;
        if from == to {
            return;
        }
        debug!("session: {:?} → {:?}", from, to);
        self.phase = to;
        let station = self
            .station
            .clone()
            .or_else(|| self.attempt.as_ref().map(|a| a.station.clone()));
        self.emit(SessionEvent::PhaseChanged { from, to, station });
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// `http://host/path` → `https://host/path`; `None` for anything else.
pub fn upgrade_to_https(url: &str) -> Option<String> {
    let trimmed = url.trim();
    let scheme = trimmed.get(..7)?;
    if scheme.eq_ignore_ascii_case("http://") {
        Some(format!("https://{}", &trimmed[7..]))
    } else {
        None
    }
}

// ── test backend ──────────────────────────────────────────────────────────────

/// Records every backend call.  Used by unit and integration tests.
#[derive(Debug, Default)]
pub struct RecordingBackend {
    pub calls: Vec<BackendCall>,
    open_streams: usize,
    pub max_open_streams: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BackendCall {
    Open { token: LoadToken, url: String },
    Close,
    SetPaused(bool),
    SetVolume { volume: f32, muted: bool },
}

impl RecordingBackend {
    pub fn opens(&self) -> Vec<(LoadToken, String)> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                BackendCall::Open { token, url } => Some((*token, url.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn open_streams(&self) -> usize {
        self.open_streams
    }
}

impl StreamBackend for RecordingBackend {
    fn open(&mut self, token: LoadToken, url: &str) {
        self.open_streams += 1;
        self.max_open_streams = self.max_open_streams.max(self.open_streams);
        self.calls.push(BackendCall::Open {
            token,
            url: url.to_string(),
        });
    }

    fn close(&mut self) {
        self.open_streams = self.open_streams.saturating_sub(1);
        self.calls.push(BackendCall::Close);
    }

    fn set_paused(&mut self, paused: bool) {
        self.calls.push(BackendCall::SetPaused(paused));
    }

    fn set_volume(&mut self, volume: f32, muted: bool) {
        self.calls.push(BackendCall::SetVolume { volume, muted });
    }
}
