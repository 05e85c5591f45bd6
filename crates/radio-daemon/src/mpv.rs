/// mpv IPC driver and the `StreamBackend` built on it.
///
/// ```text
///   PlaybackSession ──open/close/...──► MpvBackend ──MpvOp──► MpvWorker
///                                                               │
///                          MpvDriver::spawn_and_connect()  ◄────┤
///                                ├── writer_task  ← MpvHandle::send
///                                └── reader_task  → replies / MpvEvent
///                                                               │
///   DaemonCore ◄──DaemonEvent::Stream(StreamSignal)─────────────┘
/// ```
///
/// The session talks to mpv synchronously; every call is queued to the
/// worker task, which performs the IPC in order and reports outcomes back
/// as token-tagged signals.
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use radio_library::platform;
use radio_library::protocol::MpvHealth;
use radio_library::session::{
    FailureKind, LoadToken, PlayerSettings, StreamBackend, StreamFailure, StreamSignal,
};

use crate::core::DaemonEvent;

#[cfg(unix)]
use tokio::net::UnixStream;

#[cfg(windows)]
use tokio::net::windows::named_pipe::ClientOptions;

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

/// observe_property id for `core-idle`.
pub const OBS_CORE_IDLE: u64 = 1;

const IPC_TIMEOUT: Duration = Duration::from_secs(5);
const HEARTBEAT: Duration = Duration::from_secs(10);

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<anyhow::Result<Value>>>>>;

struct PendingRequest {
    req_id: u64,
    payload: String,
    reply: oneshot::Sender<anyhow::Result<Value>>,
}

/// An mpv event / property-change that arrived unsolicited (no request_id).
#[derive(Debug, Clone)]
pub struct MpvEvent {
    pub raw: Value,
}

impl MpvEvent {
    /// Returns `Some((obs_id, data))` if this is a property-change event.
    pub fn as_property_change(&self) -> Option<(u64, &Value)> {
        if self.event_name()? == "property-change" {
            let id = self.raw.get("id")?.as_u64()?;
            let data = self.raw.get("data").unwrap_or(&Value::Null);
            Some((id, data))
        } else {
            None
        }
    }

    pub fn event_name(&self) -> Option<&str> {
        self.raw.get("event")?.as_str()
    }

    pub fn playlist_entry_id(&self) -> Option<i64> {
        self.raw.get("playlist_entry_id")?.as_i64()
    }

    fn str_field(&self, key: &str) -> Option<&str> {
        self.raw.get(key)?.as_str()
    }
}

// ── handle ────────────────────────────────────────────────────────────────────

/// Cloneable handle to the mpv writer task.
#[derive(Clone)]
pub struct MpvHandle {
    tx: mpsc::Sender<PendingRequest>,
}

impl MpvHandle {
    pub async fn send(&self, command: Value) -> anyhow::Result<Value> {
        let req_id = NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed);
        let msg = json!({ "command": command, "request_id": req_id });
        let mut raw = serde_json::to_string(&msg)?;
        raw.push('\n');

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PendingRequest {
                req_id,
                payload: raw,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("mpv writer task gone"))?;

        tokio::time::timeout(IPC_TIMEOUT, reply_rx)
            .await
            .map_err(|_| anyhow::anyhow!("mpv IPC timeout for req={}", req_id))?
            .map_err(|_| anyhow::anyhow!("mpv reply channel dropped req={}", req_id))?
    }

    /// Replace the current file.  Returns the new playlist entry id when
    /// mpv reports one (0.38 and later).
    pub async fn load_stream(&self, url: &str) -> anyhow::Result<Option<i64>> {
        let resp = self.send(json!(["loadfile", url, "replace"])).await?;
        Ok(resp["data"]["playlist_entry_id"].as_i64())
    }

    pub async fn stop(&self) -> anyhow::Result<()> {
        self.send(json!(["stop"])).await?;
        Ok(())
    }

    pub async fn set_volume(&self, volume: f32, muted: bool) -> anyhow::Result<()> {
        self.send(json!(["set_property", "volume", volume_pct(volume)]))
            .await?;
        self.send(json!(["set_property", "mute", muted])).await?;
        Ok(())
    }

    pub async fn set_pause(&self, paused: bool) -> anyhow::Result<()> {
        self.send(json!(["set_property", "pause", paused])).await?;
        Ok(())
    }

    /// Must be called after every fresh connection.
    pub async fn observe_properties(&self) {
        match self
            .send(json!(["observe_property", OBS_CORE_IDLE, "core-idle"]))
            .await
        {
            Ok(_) => debug!("mpv: observing core-idle"),
            Err(e) => warn!("mpv: observe_property core-idle failed: {}", e),
        }
    }
}

fn volume_pct(volume: f32) -> f64 {
    (f64::from(volume) * 100.0).clamp(0.0, 100.0).round()
}

// ── driver ────────────────────────────────────────────────────────────────────

/// Owns the mpv child process and manages (re)connection.
pub struct MpvDriver {
    socket_name: String,
    process: Option<tokio::process::Child>,
    pub last_volume: f32,
    pub last_muted: bool,
}

impl MpvDriver {
    pub fn new(settings: PlayerSettings) -> Self {
        Self {
            socket_name: platform::mpv_socket_name(),
            process: None,
            last_volume: settings.volume,
            last_muted: settings.muted,
        }
    }

    pub fn process_alive(&mut self) -> bool {
        match self.process.as_mut() {
            Some(child) => child.try_wait().ok().flatten().is_none(),
            None => false,
        }
    }

    pub async fn kill(&mut self) {
        if let Some(mut p) = self.process.take() {
            let _ = p.kill().await;
        }
    }

    async fn spawn_process(&mut self) -> anyhow::Result<()> {
        self.kill().await;

        let mpv_binary =
            platform::find_mpv_binary().ok_or_else(|| anyhow::anyhow!("mpv binary not found"))?;
        info!("mpv: spawning {}", mpv_binary.display());

        let child = tokio::process::Command::new(mpv_binary)
            .arg("--no-video")
            .arg("--idle=yes")
            .arg("--quiet")
            .arg(platform::mpv_socket_arg())
            .arg(format!("--volume={}", volume_pct(self.last_volume)))
            .arg(format!("--mute={}", if self.last_muted { "yes" } else { "no" }))
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        self.process = Some(child);
        Ok(())
    }

    #[cfg(unix)]
    pub async fn spawn_and_connect(
        &mut self,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> anyhow::Result<MpvHandle> {
        let socket_path = std::path::PathBuf::from(&self.socket_name);
        let _ = tokio::fs::remove_file(&socket_path).await;
        self.spawn_process().await?;

        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if socket_path.exists() {
                break;
            }
        }
        if !socket_path.exists() {
            anyhow::bail!("mpv IPC socket did not appear");
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        let stream = UnixStream::connect(&socket_path).await?;
        info!("mpv: connected to IPC socket");
        let (read_half, write_half) = stream.into_split();
        Ok(start_io_tasks(read_half, write_half, event_tx))
    }

    /// Attach to an mpv left running by a previous daemon.
    #[cfg(unix)]
    pub async fn try_reconnect(&mut self, event_tx: mpsc::Sender<MpvEvent>) -> Option<MpvHandle> {
        let socket_path = std::path::PathBuf::from(&self.socket_name);
        if !socket_path.exists() {
            return None;
        }
        match UnixStream::connect(&socket_path).await {
            Ok(stream) => {
                info!("mpv: reconnected to existing IPC socket");
                let (read_half, write_half) = stream.into_split();
                Some(start_io_tasks(read_half, write_half, event_tx))
            }
            Err(e) => {
                debug!("mpv: stale socket {}: {}", socket_path.display(), e);
                None
            }
        }
    }

    #[cfg(windows)]
    pub async fn spawn_and_connect(
        &mut self,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> anyhow::Result<MpvHandle> {
        self.spawn_process().await?;

        let pipe_path = format!(r"\\.\pipe\{}", self.socket_name);
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if let Ok(client) = ClientOptions::new().open(&pipe_path) {
                info!("mpv: connected to named pipe");
                let (read_half, write_half) = tokio::io::split(client);
                return Ok(start_io_tasks(read_half, write_half, event_tx));
            }
        }
        anyhow::bail!("mpv named pipe did not appear")
    }

    #[cfg(windows)]
    pub async fn try_reconnect(&mut self, event_tx: mpsc::Sender<MpvEvent>) -> Option<MpvHandle> {
        let pipe_path = format!(r"\\.\pipe\{}", self.socket_name);
        match ClientOptions::new().open(&pipe_path) {
            Ok(client) => {
                info!("mpv: reconnected to named pipe");
                let (read_half, write_half) = tokio::io::split(client);
                Some(start_io_tasks(read_half, write_half, event_tx))
            }
            Err(e) => {
                debug!("mpv: no named pipe to reconnect to: {}", e);
                None
            }
        }
    }
}

fn start_io_tasks<R, W>(read_half: R, write_half: W, event_tx: mpsc::Sender<MpvEvent>) -> MpvHandle
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    // req_id → reply channel; the writer inserts, the reader resolves
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    let (cmd_tx, cmd_rx) = mpsc::channel::<PendingRequest>(64);

    tokio::spawn(writer_task(write_half, cmd_rx, pending.clone()));
    tokio::spawn(reader_task(BufReader::new(read_half), pending, event_tx));

    MpvHandle { tx: cmd_tx }
}

async fn fail_pending(pending: &PendingMap, reason: &str) {
    let mut map = pending.lock().await;
    for (_, tx) in map.drain() {
        let _ = tx.send(Err(anyhow::anyhow!("{}", reason)));
    }
}

async fn reader_task<R>(mut reader: BufReader<R>, pending: PendingMap, event_tx: mpsc::Sender<MpvEvent>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("mpv reader: connection closed");
                fail_pending(&pending, "mpv IPC connection closed").await;
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let val: Value = match serde_json::from_str(trimmed) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("mpv reader: invalid json '{}': {}", trimmed, e);
                        continue;
                    }
                };

                if let Some(req_id) = val.get("request_id").and_then(Value::as_u64) {
                    let mut map = pending.lock().await;
                    match map.remove(&req_id) {
                        Some(tx) => {
                            let result = if val["error"].as_str() == Some("success") {
                                Ok(val)
                            } else {
                                let err = val["error"].as_str().unwrap_or("unknown error");
                                debug!("mpv reader: req={} err={}", req_id, err);
                                Err(anyhow::anyhow!("mpv error: {}", err))
                            };
                            let _ = tx.send(result);
                        }
                        None => debug!("mpv reader: response for unknown req={}", req_id),
                    }
                } else {
                    debug!("mpv reader: event {}", trimmed);
                    if event_tx.send(MpvEvent { raw: val }).await.is_err() {
                        break;
                    }
                }
            }
            Err(e) => {
                warn!("mpv reader: read error: {}", e);
                fail_pending(&pending, "mpv IPC read error").await;
                break;
            }
        }
    }
}

async fn writer_task<W>(mut writer: W, mut rx: mpsc::Receiver<PendingRequest>, pending: PendingMap)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(req) = rx.recv().await {
        // registered before writing so the reader can always match the reply
        pending.lock().await.insert(req.req_id, req.reply);
        debug!("mpv writer: req={} {}", req.req_id, req.payload.trim());
        if let Err(e) = writer.write_all(req.payload.as_bytes()).await {
            warn!("mpv writer: write error: {}", e);
            if let Some(tx) = pending.lock().await.remove(&req.req_id) {
                let _ = tx.send(Err(anyhow::anyhow!("mpv write error: {}", e)));
            }
            break;
        }
    }
    debug!("mpv writer: task exiting");
}

// ── entry tracking ────────────────────────────────────────────────────────────

#[derive(Debug)]
struct CurrentEntry {
    token: LoadToken,
    entry_id: Option<i64>,
    audio_flowing: bool,
}

/// Maps mpv playlist entries to load tokens and turns mpv events into
/// stream signals.
#[derive(Debug, Default)]
pub struct EntryTracker {
    current: Option<CurrentEntry>,
    entries: HashMap<i64, LoadToken>,
}

impl EntryTracker {
    pub fn open(&mut self, token: LoadToken) {
        self.current = Some(CurrentEntry {
            token,
            entry_id: None,
            audio_flowing: false,
        });
    }

    pub fn loaded(&mut self, token: LoadToken, entry_id: Option<i64>) {
        let Some(id) = entry_id else { return };
        self.entries.insert(id, token);
        if let Some(current) = self.current.as_mut().filter(|c| c.token == token) {
            current.entry_id = Some(id);
        }
    }

    pub fn close(&mut self) {
        self.current = None;
    }

    pub fn current_token(&self) -> Option<LoadToken> {
        self.current.as_ref().map(|c| c.token)
    }

    pub fn translate(&mut self, evt: &MpvEvent) -> Option<StreamSignal> {
        if let Some((id, data)) = evt.as_property_change() {
            if id != OBS_CORE_IDLE || data.as_bool() != Some(false) {
                return None;
            }
            let current = self.current.as_mut()?;
            current.audio_flowing = true;
            return Some(StreamSignal::ready(current.token));
        }

        match evt.event_name()? {
            "start-file" => {
                // older mpv never reports entry ids in loadfile replies; and a
                // playlist URL expands into fresh entries after a redirect
                let id = evt.playlist_entry_id()?;
                if self.entries.contains_key(&id) {
                    return None;
                }
                let current = self.current.as_mut().filter(|c| c.entry_id.is_none())?;
                current.entry_id = Some(id);
                self.entries.insert(id, current.token);
                None
            }
            "end-file" => self.translate_end_file(evt),
            _ => None,
        }
    }

    fn translate_end_file(&mut self, evt: &MpvEvent) -> Option<StreamSignal> {
        let reason = evt.str_field("reason").unwrap_or("unknown");
        let known = evt.playlist_entry_id().and_then(|id| self.entries.remove(&id));

        if reason == "redirect" {
            if let Some(current) = self.current.as_mut().filter(|c| Some(c.token) == known) {
                current.entry_id = None;
            }
            return None;
        }

        let token = match known {
            Some(token) => token,
            // an unknown entry stopping is the tail of a replaced file
            None if reason == "stop" => return None,
            None => self.current.as_ref().filter(|c| c.entry_id.is_none())?.token,
        };
        let buffered = self
            .current
            .as_ref()
            .is_some_and(|c| c.token == token && c.audio_flowing);

        let signal = match reason {
            "eof" => StreamSignal::ended(token),
            "error" => {
                let detail = evt.str_field("file_error").unwrap_or("playback error");
                StreamSignal::failed(token, StreamFailure::new(error_kind(detail), detail))
            }
            "stop" | "quit" => StreamSignal::failed(
                token,
                StreamFailure::new(FailureKind::Cancelled, reason).buffered(buffered),
            ),
            other => {
                debug!("mpv: end-file with unhandled reason {}", other);
                return None;
            }
        };
        Some(signal)
    }
}

fn error_kind(file_error: &str) -> FailureKind {
    match file_error {
        "unrecognized file format" | "no audio or video data played" => FailureKind::Unsupported,
        "audio output initialization failed" => FailureKind::Other,
        _ => FailureKind::Network,
    }
}

// ── backend ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
enum MpvOp {
    Open { token: LoadToken, url: String },
    Close,
    SetPaused(bool),
    SetVolume { volume: f32, muted: bool },
}

/// `StreamBackend` over mpv.  Calls are queued to a worker task.
pub struct MpvBackend {
    ops: mpsc::UnboundedSender<MpvOp>,
}

impl MpvBackend {
    pub fn spawn(settings: PlayerSettings, core_tx: mpsc::Sender<DaemonEvent>) -> Self {
        let (ops, ops_rx) = mpsc::unbounded_channel();
        let (mpv_tx, mpv_rx) = mpsc::channel(256);
        let worker = MpvWorker {
            driver: MpvDriver::new(settings),
            handle: None,
            health: MpvHealth::Absent,
            tracker: EntryTracker::default(),
            core_tx,
            mpv_tx,
        };
        tokio::spawn(worker.run(ops_rx, mpv_rx));
        Self { ops }
    }

    fn queue(&self, op: MpvOp) {
        if self.ops.send(op).is_err() {
            warn!("mpv: worker gone, dropping command");
        }
    }
}

impl StreamBackend for MpvBackend {
    fn open(&mut self, token: LoadToken, url: &str) {
        self.queue(MpvOp::Open {
            token,
            url: url.to_string(),
        });
    }

    fn close(&mut self) {
        self.queue(MpvOp::Close);
    }

    fn set_paused(&mut self, paused: bool) {
        self.queue(MpvOp::SetPaused(paused));
    }

    fn set_volume(&mut self, volume: f32, muted: bool) {
        self.queue(MpvOp::SetVolume { volume, muted });
    }
}

struct MpvWorker {
    driver: MpvDriver,
    handle: Option<MpvHandle>,
    health: MpvHealth,
    tracker: EntryTracker,
    core_tx: mpsc::Sender<DaemonEvent>,
    mpv_tx: mpsc::Sender<MpvEvent>,
}

impl MpvWorker {
    async fn run(
        mut self,
        mut ops: mpsc::UnboundedReceiver<MpvOp>,
        mut mpv_rx: mpsc::Receiver<MpvEvent>,
    ) {
        let mut heartbeat = tokio::time::interval(HEARTBEAT);
        loop {
            tokio::select! {
                op = ops.recv() => match op {
                    Some(op) => self.apply(op).await,
                    None => break,
                },
                Some(evt) = mpv_rx.recv() => {
                    if let Some(signal) = self.tracker.translate(&evt) {
                        self.signal(signal).await;
                    }
                }
                _ = heartbeat.tick() => self.check_alive().await,
            }
        }
        info!("mpv: backend dropped, stopping player");
        self.driver.kill().await;
    }

    async fn apply(&mut self, op: MpvOp) {
        match op {
            MpvOp::Open { token, url } => {
                let Some(handle) = self.ensure_handle().await else {
                    self.signal(StreamSignal::failed(
                        token,
                        StreamFailure::new(FailureKind::Other, "mpv is not available"),
                    ))
                    .await;
                    return;
                };
                self.tracker.open(token);
                match handle.load_stream(&url).await {
                    Ok(entry_id) => {
                        debug!("mpv: token={} is entry {:?}", token.get(), entry_id);
                        self.tracker.loaded(token, entry_id);
                    }
                    Err(e) => {
                        warn!("mpv: loadfile {} failed: {}", url, e);
                        self.tracker.close();
                        self.signal(StreamSignal::failed(
                            token,
                            StreamFailure::new(FailureKind::Other, e.to_string()),
                        ))
                        .await;
                    }
                }
            }
            MpvOp::Close => {
                self.tracker.close();
                if let Some(handle) = &self.handle {
                    if let Err(e) = handle.stop().await {
                        warn!("mpv: stop failed: {}", e);
                    }
                }
            }
            MpvOp::SetPaused(paused) => {
                if let Some(handle) = &self.handle {
                    if let Err(e) = handle.set_pause(paused).await {
                        warn!("mpv: set pause failed: {}", e);
                    }
                }
            }
            MpvOp::SetVolume { volume, muted } => {
                self.driver.last_volume = volume;
                self.driver.last_muted = muted;
                if let Some(handle) = &self.handle {
                    if let Err(e) = handle.set_volume(volume, muted).await {
                        warn!("mpv: set volume failed: {}", e);
                    }
                }
            }
        }
    }

    async fn ensure_handle(&mut self) -> Option<MpvHandle> {
        if self.handle.is_some() && !self.driver.process_alive() {
            warn!("mpv: process died, dropping handle");
            self.handle = None;
            self.set_health(MpvHealth::Dead).await;
        }
        if let Some(handle) = &self.handle {
            return Some(handle.clone());
        }

        let handle = match self.driver.try_reconnect(self.mpv_tx.clone()).await {
            Some(h) => h,
            None => {
                let next = if self.health == MpvHealth::Dead {
                    MpvHealth::Restarting
                } else {
                    MpvHealth::Starting
                };
                self.set_health(next).await;
                match self.driver.spawn_and_connect(self.mpv_tx.clone()).await {
                    Ok(h) => h,
                    Err(e) => {
                        warn!("mpv: failed to start: {}", e);
                        self.set_health(MpvHealth::Dead).await;
                        return None;
                    }
                }
            }
        };

        handle.observe_properties().await;
        if let Err(e) = handle
            .set_volume(self.driver.last_volume, self.driver.last_muted)
            .await
        {
            warn!("mpv: initial volume failed: {}", e);
        }
        self.set_health(MpvHealth::Running).await;
        self.handle = Some(handle.clone());
        Some(handle)
    }

    async fn check_alive(&mut self) {
        if self.handle.is_none() || self.driver.process_alive() {
            return;
        }
        warn!("mpv: heartbeat found the process dead");
        self.handle = None;
        self.set_health(MpvHealth::Dead).await;
        if let Some(token) = self.tracker.current_token() {
            self.tracker.close();
            self.signal(StreamSignal::failed(
                token,
                StreamFailure::new(FailureKind::Network, "mpv exited"),
            ))
            .await;
        }
    }

    async fn set_health(&mut self, health: MpvHealth) {
        if self.health != health {
            info!("mpv: health {:?} → {:?}", self.health, health);
            self.health = health.clone();
            let _ = self.core_tx.send(DaemonEvent::MpvHealth(health)).await;
        }
    }

    async fn signal(&self, signal: StreamSignal) {
        debug!("mpv: signal {:?}", signal);
        let _ = self.core_tx.send(DaemonEvent::Stream(signal)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use radio_library::session::SignalKind;

    fn event(raw: Value) -> MpvEvent {
        MpvEvent { raw }
    }

    fn core_idle(idle: bool) -> MpvEvent {
        event(json!({"event": "property-change", "id": OBS_CORE_IDLE, "name": "core-idle", "data": idle}))
    }

    fn end_file(id: i64, reason: &str) -> MpvEvent {
        event(json!({"event": "end-file", "playlist_entry_id": id, "reason": reason}))
    }

    /// Tokens come from a session; a throwaway one hands them out here.
    fn tokens(n: usize) -> Vec<LoadToken> {
        use radio_library::session::{RecordingBackend, SessionOptions, StationRef};
        use radio_library::{DedupKey, PlaybackSession, StationId};

        let mut session = PlaybackSession::new(
            RecordingBackend::default(),
            SessionOptions { prefer_https: false },
            PlayerSettings::default(),
        );
        (0..n)
            .map(|i| {
                session.load(StationRef {
                    id: StationId::new(format!("s{i}")),
                    key: DedupKey::from_parts(None, "http://x/s"),
                    stream_url: "http://x/s".to_string(),
                    name: "x".to_string(),
                })
            })
            .collect()
    }

    #[test]
    fn audio_flowing_is_ready_for_current_token() {
        let t = tokens(1)[0];
        let mut tracker = EntryTracker::default();
        tracker.open(t);
        tracker.loaded(t, Some(3));

        assert_eq!(tracker.translate(&core_idle(true)), None);
        assert_eq!(tracker.translate(&core_idle(false)), Some(StreamSignal::ready(t)));
    }

    #[test]
    fn end_file_reasons_map_to_signals() {
        let t = tokens(1)[0];
        let mut tracker = EntryTracker::default();
        tracker.open(t);
        tracker.loaded(t, Some(1));
        assert_eq!(tracker.translate(&end_file(1, "eof")), Some(StreamSignal::ended(t)));

        tracker.open(t);
        tracker.loaded(t, Some(2));
        let failed = tracker
            .translate(&event(json!({
                "event": "end-file",
                "playlist_entry_id": 2,
                "reason": "error",
                "file_error": "unrecognized file format"
            })))
            .unwrap();
        match failed.kind {
            SignalKind::Failed(f) => assert_eq!(f.kind, FailureKind::Unsupported),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn stop_after_audio_is_a_buffered_cancellation() {
        let t = tokens(1)[0];
        let mut tracker = EntryTracker::default();
        tracker.open(t);
        tracker.loaded(t, Some(5));
        tracker.translate(&core_idle(false));

        let signal = tracker.translate(&end_file(5, "stop")).unwrap();
        match signal.kind {
            SignalKind::Failed(f) => assert!(f.is_benign()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn replaced_entry_keeps_its_own_token() {
        let ts = tokens(2);
        let mut tracker = EntryTracker::default();
        tracker.open(ts[0]);
        tracker.loaded(ts[0], Some(1));
        tracker.close();
        tracker.open(ts[1]);
        tracker.loaded(ts[1], Some(2));

        let late = tracker.translate(&end_file(1, "stop")).unwrap();
        assert_eq!(late.token, ts[0]);
        // unknown entries that merely stopped are ignored
        assert_eq!(tracker.translate(&end_file(99, "stop")), None);
    }

    #[test]
    fn entry_ids_learned_from_start_file() {
        let t = tokens(1)[0];
        let mut tracker = EntryTracker::default();
        tracker.open(t);
        tracker.loaded(t, None);

        tracker.translate(&event(json!({"event": "start-file", "playlist_entry_id": 7})));
        assert_eq!(tracker.translate(&end_file(7, "eof")), Some(StreamSignal::ended(t)));
    }

    #[test]
    fn playlist_redirect_follows_expanded_entries() {
        let t = tokens(1)[0];
        let mut tracker = EntryTracker::default();
        tracker.open(t);
        tracker.loaded(t, Some(1));

        assert_eq!(tracker.translate(&end_file(1, "redirect")), None);
        tracker.translate(&event(json!({"event": "start-file", "playlist_entry_id": 2})));
        let signal = tracker.translate(&end_file(2, "error")).unwrap();
        assert_eq!(signal.token, t);
    }

    #[test]
    fn nothing_open_means_no_signals() {
        let mut tracker = EntryTracker::default();
        assert_eq!(tracker.translate(&core_idle(false)), None);
        assert_eq!(tracker.translate(&end_file(1, "eof")), None);
    }
}
