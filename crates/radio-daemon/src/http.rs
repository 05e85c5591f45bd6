use crate::core::DaemonEvent;
use crate::state::StateManager;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use radio_library::protocol::{Command, DaemonState};
use radio_library::{view, PresetSlot, SortOption, StationId, StationRecord};
use serde::Deserialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

#[derive(Clone)]
struct HttpState {
    state: Arc<StateManager>,
    event_tx: mpsc::Sender<DaemonEvent>,
}

#[derive(Debug, Deserialize)]
struct StationsQuery {
    sort: Option<SortOption>,
    #[serde(default)]
    q: String,
}

pub fn start_server(
    bind_address: String,
    port: u16,
    state: Arc<StateManager>,
    event_tx: mpsc::Sender<DaemonEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(state, event_tx);

        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind HTTP server to {}: {}", addr, e);
                return;
            }
        };

        info!("HTTP API server listening on http://{}", addr);

        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    })
}

pub fn router(state: Arc<StateManager>, event_tx: mpsc::Sender<DaemonEvent>) -> Router {
    Router::new()
        .route("/api/state", get(get_state))
        .route("/api/stations", get(get_stations))
        .route("/api/play/:id", get(play_station).post(play_station))
        .route("/api/preset/:slot", get(play_preset).post(play_preset))
        .route("/api/stop", get(stop).post(stop))
        .route("/api/pause", get(toggle_pause).post(toggle_pause))
        .route("/api/volume/:pct", get(set_volume).post(set_volume))
        .route("/api/mute", get(toggle_mute).post(toggle_mute))
        .layer(CorsLayer::permissive())
        .with_state(HttpState { state, event_tx })
}

async fn get_state(State(state): State<HttpState>) -> Json<DaemonState> {
    Json(state.state.get_state().await)
}

/// The library sorted by `sort` (default: the shared sort) and filtered by
/// `q`, independent of the filter clients share.
async fn get_stations(
    State(state): State<HttpState>,
    Query(query): Query<StationsQuery>,
) -> Json<Vec<StationRecord>> {
    let sort = match query.sort {
        Some(sort) => sort,
        None => state.state.get_state().await.sort,
    };
    let library = state.state.library().await;
    Json(view::project(&library, sort, &query.q, |r| {
        r.total_listening_time_ms
    }))
}

async fn forward(state: &HttpState, cmd: Command) -> StatusCode {
    info!("HTTP API: {:?}", cmd);
    if state
        .event_tx
        .send(DaemonEvent::ClientCommand(cmd))
        .await
        .is_err()
    {
        error!("Failed to forward HTTP command");
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    StatusCode::ACCEPTED
}

async fn play_station(State(state): State<HttpState>, Path(id): Path<String>) -> StatusCode {
    let id = StationId::new(id);
    if state.state.library().await.iter().all(|r| r.id != id) {
        return StatusCode::NOT_FOUND;
    }
    forward(&state, Command::Play { id }).await
}

async fn play_preset(State(state): State<HttpState>, Path(slot): Path<u8>) -> StatusCode {
    match PresetSlot::new(slot) {
        Some(slot) => forward(&state, Command::PlayPreset { slot }).await,
        None => StatusCode::BAD_REQUEST,
    }
}

async fn stop(State(state): State<HttpState>) -> StatusCode {
    forward(&state, Command::Stop).await
}

async fn toggle_pause(State(state): State<HttpState>) -> StatusCode {
    forward(&state, Command::TogglePause).await
}

async fn set_volume(State(state): State<HttpState>, Path(pct): Path<u8>) -> StatusCode {
    if pct > 100 {
        return StatusCode::BAD_REQUEST;
    }
    let value = f32::from(pct) / 100.0;
    forward(&state, Command::Volume { value }).await
}

async fn toggle_mute(State(state): State<HttpState>) -> StatusCode {
    forward(&state, Command::ToggleMute).await
}
