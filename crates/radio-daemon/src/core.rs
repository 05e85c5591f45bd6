/// DaemonCore: single-owner event loop for all mutable state.
///
/// The library, the playback session and the listening ledger live here and
/// nowhere else.  Servers, the mpv worker and timers send `DaemonEvent`s in;
/// after each event the core drains the library and session notifications,
/// reacts to them, and publishes a fresh snapshot through `StateManager`
/// followed by `BroadcastMessage::StateUpdated`.
///
/// Cross-component reactions:
/// - session `Started` → `LibraryStore::record_play`
/// - session phase changes → `ListeningTimeAccumulator::on_phase`
/// - a library change that removes or re-points the playing station stops
///   the session, after the mutation has committed
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use radio_library::catalog::{StationCatalog, DEFAULT_SEARCH_LIMIT};
use radio_library::config::Config;
use radio_library::debounce::Debouncer;
use radio_library::export::{self, ExportFile};
use radio_library::kv::{self, keys, KeyValueStore};
use radio_library::listening::ListeningTimeAccumulator;
use radio_library::protocol::{Broadcast, Command, DaemonState, MpvHealth, PlaybackState, PresetEntry};
use radio_library::session::{PlayerSettings, SessionOptions, StreamBackend, StreamSignal};
use radio_library::share::{self, ShareImport};
use radio_library::{starter, view};
use radio_library::{
    ImportMode, LibraryEvent, LibraryStore, PlaybackSession, SessionEvent, SortOption,
    StationRecord, StationRef,
};
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::state::StateManager;
use crate::BroadcastMessage;

/// All inputs into the DaemonCore loop.
#[derive(Debug)]
pub enum DaemonEvent {
    /// A command from a TCP client or the HTTP API.
    ClientCommand(Command),
    /// Outcome of a stream load, tagged with its load token.
    Stream(StreamSignal),
    MpvHealth(MpvHealth),
    /// Share-link entries resolved against the catalog.
    ShareResolved(ShareImport),
    /// The filter debounce delay may have elapsed.
    FilterDeadline,
    ListeningTick,
    Shutdown,
}

/// Volume and mute from the last run, or the configured default.
pub fn load_player_settings(kv: &dyn KeyValueStore, config: &Config) -> PlayerSettings {
    let fallback = PlayerSettings {
        volume: config.mpv.default_volume.clamp(0.0, 1.0),
        muted: false,
    };
    match kv::load_json(kv, keys::PLAYER_SETTINGS) {
        Ok(Some(settings)) => settings,
        Ok(None) => fallback,
        Err(e) => {
            warn!("DaemonCore: ignoring stored player settings: {}", e);
            fallback
        }
    }
}

fn load_sort(kv: &dyn KeyValueStore) -> SortOption {
    match kv::load_json(kv, keys::SORT_PREFERENCE) {
        Ok(Some(sort)) => sort,
        Ok(None) => SortOption::default(),
        Err(e) => {
            warn!("DaemonCore: ignoring stored sort preference: {}", e);
            SortOption::default()
        }
    }
}

fn drain<T: Clone>(rx: &mut broadcast::Receiver<T>) -> Vec<T> {
    let mut out = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(evt) => out.push(evt),
            Err(TryRecvError::Lagged(n)) => warn!("DaemonCore: missed {} notifications", n),
            Err(_) => break,
        }
    }
    out
}

pub struct DaemonCore<B: StreamBackend> {
    config: Config,
    kv: Arc<dyn KeyValueStore>,
    library: LibraryStore,
    library_rx: broadcast::Receiver<LibraryEvent>,
    session: PlaybackSession<B>,
    session_rx: broadcast::Receiver<SessionEvent>,
    listening: ListeningTimeAccumulator,
    catalog: Arc<dyn StationCatalog>,
    filter_debounce: Debouncer<String>,
    sort: SortOption,
    filter: String,
    mpv_health: MpvHealth,
    /// No `stations` value existed at startup; seed the starter pack.
    fresh: bool,
    state: Arc<StateManager>,
    event_tx: mpsc::Sender<DaemonEvent>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
}

impl<B: StreamBackend> DaemonCore<B> {
    pub fn new(
        config: Config,
        kv: Arc<dyn KeyValueStore>,
        backend: B,
        settings: PlayerSettings,
        catalog: Arc<dyn StationCatalog>,
        broadcast_tx: broadcast::Sender<BroadcastMessage>,
        event_tx: mpsc::Sender<DaemonEvent>,
    ) -> Self {
        let fresh = !LibraryStore::is_initialized(kv.as_ref());
        let library = LibraryStore::load(kv.clone());
        let session = PlaybackSession::new(
            backend,
            SessionOptions {
                prefer_https: config.playback.prefer_https,
            },
            settings,
        );
        let listening = ListeningTimeAccumulator::load(kv.clone(), config.playback.listening_tick());
        info!(
            "DaemonCore: {} station(s), volume {:.2}{}",
            library.len(),
            settings.volume,
            if fresh { ", new library" } else { "" }
        );

        Self {
            library_rx: library.subscribe(),
            session_rx: session.subscribe(),
            filter_debounce: Debouncer::new(config.filter.debounce()),
            sort: load_sort(kv.as_ref()),
            filter: String::new(),
            mpv_health: MpvHealth::Absent,
            fresh,
            state: Arc::new(StateManager::new()),
            config,
            kv,
            library,
            session,
            listening,
            catalog,
            event_tx,
            broadcast_tx,
        }
    }

    pub fn state_manager(&self) -> Arc<StateManager> {
        Arc::clone(&self.state)
    }

    /// Run until `Shutdown` arrives or every sender is gone.
    pub async fn run(mut self, mut event_rx: mpsc::Receiver<DaemonEvent>) -> anyhow::Result<()> {
        info!("DaemonCore: starting event loop");
        if self.fresh {
            self.seed_starter_pack().await;
        }
        self.publish().await;

        let tick_tx = self.event_tx.clone();
        let period = self.listening.tick_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                interval.tick().await;
                if tick_tx.send(DaemonEvent::ListeningTick).await.is_err() {
                    break;
                }
            }
        });

        loop {
            match event_rx.recv().await {
                None => {
                    info!("DaemonCore: event channel closed, shutting down");
                    break;
                }
                Some(DaemonEvent::Shutdown) => {
                    info!("DaemonCore: shutdown requested");
                    break;
                }
                Some(evt) => self.handle_event(evt).await,
            }
        }

        self.shutdown();
        Ok(())
    }

    pub async fn handle_event(&mut self, evt: DaemonEvent) {
        match evt {
            DaemonEvent::ClientCommand(cmd) => {
                info!("DaemonCore: command {:?}", cmd);
                if let Err(e) = self.handle_command(cmd) {
                    warn!("DaemonCore: command failed: {}", e);
                    self.reply(Broadcast::Error {
                        message: e.to_string(),
                    });
                }
            }
            DaemonEvent::Stream(signal) => self.session.on_signal(signal),
            DaemonEvent::MpvHealth(health) => self.mpv_health = health,
            DaemonEvent::ShareResolved(import) => self.finish_share_import(import),
            DaemonEvent::FilterDeadline => {
                let Some(query) = self.filter_debounce.poll(Instant::now()) else {
                    return;
                };
                self.filter = query;
            }
            DaemonEvent::ListeningTick => {
                let ticked = self.listening.tick(Instant::now());
                let listening_sort = matches!(
                    self.sort,
                    SortOption::ListeningAsc | SortOption::ListeningDesc
                );
                if ticked.is_none() || !listening_sort {
                    return;
                }
            }
            DaemonEvent::Shutdown => {}
        }
        self.pump();
        self.publish().await;
    }

    // ── commands ──────────────────────────────────────────────────────────────

    fn handle_command(&mut self, cmd: Command) -> anyhow::Result<()> {
        match cmd {
            Command::Play { id } => {
                let station = self
                    .library
                    .get(&id)
                    .map(StationRef::from)
                    .ok_or_else(|| anyhow::anyhow!("No station with id {}", id))?;
                self.session.load(station);
            }
            Command::PlayPreset { slot } => {
                let station = self
                    .library
                    .preset(slot)
                    .map(StationRef::from)
                    .ok_or_else(|| anyhow::anyhow!("Preset {} is empty", slot.get()))?;
                self.session.load(station);
            }
            Command::Stop => {
                self.session.stop();
            }
            Command::Pause => {
                self.session.pause();
            }
            Command::Resume => {
                self.session.play();
            }
            Command::TogglePause => {
                self.session.toggle_pause();
            }
            Command::Volume { value } => self.session.set_volume(value),
            Command::ToggleMute => {
                self.session.toggle_mute();
            }

            Command::AddStation { station } => {
                let record = self.library.add(station)?;
                self.notice(format!("Added {}", record.name()));
            }
            Command::RemoveStation { id } => {
                if !self.library.remove(&id) {
                    anyhow::bail!("No station with id {}", id);
                }
            }
            Command::UpdateStation { id, patch } => {
                if !self.library.update(&id, patch)? {
                    anyhow::bail!("No station with id {}", id);
                }
            }
            Command::SetPreset { id, slot } => {
                if !self.library.set_preset(&id, slot) {
                    anyhow::bail!("No station with id {}", id);
                }
            }
            Command::ClearPreset { slot } => {
                self.library.clear_preset(slot);
            }
            Command::ClearLibrary => {
                self.library.clear();
                self.notice("Library cleared");
            }
            Command::Save => {
                self.library.save()?;
                self.notice("Library saved");
            }

            Command::SetSort { sort } => {
                self.sort = sort;
                if let Err(e) = kv::save_json(self.kv.as_ref(), keys::SORT_PREFERENCE, &sort) {
                    error!("DaemonCore: saving sort preference failed: {}", e);
                }
            }
            Command::FilterInput { query } => {
                let deadline = self.filter_debounce.input(query, Instant::now());
                let tx = self.event_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
                    let _ = tx.send(DaemonEvent::FilterDeadline).await;
                });
            }
            Command::SubmitFilter => {
                if let Some(query) = self.filter_debounce.flush() {
                    self.filter = query;
                }
            }

            Command::ImportShare { link } => {
                let payload = share::decode(&link)?;
                info!("DaemonCore: resolving shared list of {} entries", payload.i.len());
                let catalog = Arc::clone(&self.catalog);
                let tx = self.event_tx.clone();
                tokio::spawn(async move {
                    let import = share::resolve(&payload, catalog.as_ref()).await;
                    let _ = tx.send(DaemonEvent::ShareResolved(import)).await;
                });
            }
            Command::ImportExport { json, mode } => {
                let (candidates, version) = export::parse(&json)?;
                debug!("DaemonCore: importing export version {:?} ({:?})", version, mode);
                let outcome = self.library.import(candidates, mode)?;
                self.reply(Broadcast::ImportReport {
                    report: outcome.report(0),
                });
            }
            Command::Export => {
                let records = self.library.export_records(self.listening.ledger());
                let json = ExportFile::new(records).to_json()?;
                self.reply(Broadcast::Exported { json });
            }
            Command::MakeShareLink { ids, name } => {
                let records: Vec<StationRecord> = if ids.is_empty() {
                    self.library.records().to_vec()
                } else {
                    ids.iter()
                        .map(|id| {
                            self.library
                                .get(id)
                                .cloned()
                                .ok_or_else(|| anyhow::anyhow!("No station with id {}", id))
                        })
                        .collect::<anyhow::Result<_>>()?
                };
                if records.is_empty() {
                    anyhow::bail!("Nothing to share");
                }
                let payload =
                    share::build_payload(&self.config.share.username, name.as_deref(), &records);
                let url = share::share_link(&self.config.share.base_url, &payload)?;
                self.reply(Broadcast::ShareLink { url });
            }
            Command::CatalogSearch { query } => {
                let catalog = Arc::clone(&self.catalog);
                let tx = self.broadcast_tx.clone();
                tokio::spawn(async move {
                    let msg = match catalog.search(&query, DEFAULT_SEARCH_LIMIT).await {
                        Ok(stations) => Broadcast::SearchResults { stations },
                        Err(e) => {
                            warn!("DaemonCore: catalog search failed: {}", e);
                            Broadcast::Error {
                                message: format!("Catalog search failed: {}", e),
                            }
                        }
                    };
                    let _ = tx.send(BroadcastMessage::Reply(msg));
                });
            }

            Command::GetState => {}
        }
        Ok(())
    }

    fn finish_share_import(&mut self, import: ShareImport) {
        match self.library.import(import.candidates, ImportMode::Merge) {
            Ok(outcome) => {
                let report = outcome.report(import.failed);
                info!(
                    "DaemonCore: share import accepted={} duplicates={} failed={}",
                    report.accepted, report.duplicates, report.failed
                );
                self.reply(Broadcast::ImportReport { report });
            }
            Err(e) => {
                warn!("DaemonCore: share import rejected: {}", e);
                self.reply(Broadcast::Error {
                    message: e.to_string(),
                });
            }
        }
    }

    // ── notifications ─────────────────────────────────────────────────────────

    /// React to everything the library and session announced, until both
    /// are quiet.  Reactions may themselves produce notifications.
    fn pump(&mut self) {
        loop {
            let session_events = drain(&mut self.session_rx);
            let library_events = drain(&mut self.library_rx);
            if session_events.is_empty() && library_events.is_empty() {
                break;
            }
            for evt in session_events {
                self.on_session_event(evt);
            }
            for evt in library_events {
                self.on_library_event(evt);
            }
        }
    }

    fn on_session_event(&mut self, evt: SessionEvent) {
        match evt {
            SessionEvent::PhaseChanged { from, to, station } => {
                self.listening
                    .on_phase(from, to, station.as_ref().map(|s| &s.key), Instant::now());
            }
            SessionEvent::Started { station } => {
                if !self.library.record_play(&station.key, Utc::now()) {
                    debug!("DaemonCore: '{}' is no longer in the library", station.name);
                }
            }
            SessionEvent::Failed { station, message } => {
                self.reply(Broadcast::Error {
                    message: format!("Could not play {}: {}", station.name, message),
                });
            }
            SessionEvent::VolumeChanged { .. } => {
                let settings = self.session.settings();
                if let Err(e) = kv::save_json(self.kv.as_ref(), keys::PLAYER_SETTINGS, &settings) {
                    error!("DaemonCore: saving player settings failed: {}", e);
                }
            }
        }
    }

    fn on_library_event(&mut self, evt: LibraryEvent) {
        match evt {
            LibraryEvent::Removed { .. }
            | LibraryEvent::Updated { .. }
            | LibraryEvent::Replaced { .. }
            | LibraryEvent::Cleared => self.reconcile_session(),
            _ => {}
        }
    }

    /// Keep the session pointed at a station that still exists with the
    /// same identity and stream URL; otherwise stop it.
    fn reconcile_session(&mut self) {
        let Some(current) = self.session.station().cloned() else {
            return;
        };
        let fresh = self
            .library
            .get(&current.id)
            .or_else(|| self.library.find_by_key(&current.key))
            .map(StationRef::from);
        match fresh {
            Some(station)
                if station.key == current.key && station.stream_url == current.stream_url =>
            {
                self.session.refresh_station(station);
            }
            _ => {
                info!("DaemonCore: '{}' changed in the library, stopping", current.name);
                self.session.stop();
            }
        }
    }

    fn notice(&self, message: impl Into<String>) {
        self.reply(Broadcast::Notice {
            message: message.into(),
        });
    }

    fn reply(&self, msg: Broadcast) {
        // no connected clients is fine
        let _ = self.broadcast_tx.send(BroadcastMessage::Reply(msg));
    }

    // ── state ─────────────────────────────────────────────────────────────────

    async fn publish(&mut self) {
        let library = self.library.export_records(self.listening.ledger());
        let stations = view::project(&library, self.sort, &self.filter, |r| {
            r.total_listening_time_ms
        });
        let presets = self
            .library
            .presets()
            .into_iter()
            .map(|(slot, holder)| PresetEntry {
                slot,
                station_id: holder.map(|r| r.id.clone()),
                name: holder.map(|r| r.name().to_string()),
            })
            .collect();

        let state = DaemonState {
            rev: 0,
            library_size: library.len(),
            stations,
            presets,
            sort: self.sort,
            filter: self.filter.clone(),
            playback: PlaybackState {
                phase: self.session.phase(),
                station: self.session.station().cloned(),
                stream_url: self.session.current_url().map(str::to_string),
                volume: self.session.volume(),
                muted: self.session.muted(),
                session_started_at: self.session.session_started_at(),
            },
            mpv_health: self.mpv_health.clone(),
        };
        let rev = self.state.publish(state, library).await;
        debug!("DaemonCore: published rev {}", rev);
        let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
    }

    async fn seed_starter_pack(&mut self) {
        let pack = starter::load_starter_pack(&self.config).await;
        let total = pack.len();
        let valid: Vec<_> = pack.into_iter().filter(|c| c.validate().is_ok()).collect();
        if valid.len() < total {
            warn!("DaemonCore: skipping {} invalid starter station(s)", total - valid.len());
        }

        if !valid.is_empty() {
            match self.library.import(valid, ImportMode::Merge) {
                Ok(outcome) => {
                    info!("DaemonCore: seeded {} starter station(s)", outcome.accepted.len());
                    self.fresh = false;
                    self.pump();
                    return;
                }
                Err(e) => warn!("DaemonCore: starter pack rejected: {}", e),
            }
        }
        // mark the library initialized so an empty pack is not retried
        if let Err(e) = self.library.save() {
            error!("DaemonCore: saving empty library failed: {}", e);
        }
        self.fresh = false;
    }

    fn shutdown(&mut self) {
        self.session.stop();
        self.pump();
        if let Err(e) = self.library.save() {
            error!("DaemonCore: final save failed: {}", e);
        }
    }
}
