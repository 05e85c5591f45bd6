#![allow(dead_code)]

use std::sync::Arc;

use radio_library::kv::{KeyValueStore, MemoryStore};
use radio_library::session::{PlayerSettings, RecordingBackend, SessionOptions};
use radio_library::{LibraryStore, PlaybackSession, StationCandidate, StationId, StationRef};

pub fn memory_kv() -> Arc<dyn KeyValueStore> {
    Arc::new(MemoryStore::new())
}

pub fn candidate(url: &str, name: &str) -> StationCandidate {
    StationCandidate::new(url, name)
}

pub fn catalog_candidate(uuid: &str, url: &str, name: &str) -> StationCandidate {
    StationCandidate {
        remote_id: Some(uuid.to_string()),
        ..StationCandidate::new(url, name)
    }
}

/// A library holding `n` stations at `http://s{i}/stream`.
pub fn library_with(n: usize) -> (LibraryStore, Vec<StationId>) {
    let mut store = LibraryStore::in_memory();
    let ids = (0..n)
        .map(|i| {
            store
                .add(candidate(&format!("http://s{i}/stream"), &format!("Station {i}")))
                .expect("fresh station")
                .id
        })
        .collect();
    (store, ids)
}

pub fn session() -> PlaybackSession<RecordingBackend> {
    PlaybackSession::new(
        RecordingBackend::default(),
        SessionOptions::default(),
        PlayerSettings::default(),
    )
}

pub fn station_ref(store: &LibraryStore, id: &StationId) -> StationRef {
    StationRef::from(store.get(id).expect("station in library"))
}
