//! LibraryStore: the canonical station collection.
//!
//! All mutation goes through the methods here; the backing list is never
//! handed out mutably.  Each mutation validates, applies in memory, writes
//! the whole `stations` value synchronously and only then notifies
//! subscribers.  A failed write is logged and the in-memory state stays
//! authoritative for the process lifetime; callers that need to know use
//! [`LibraryStore::save`].

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::error::{LibraryError, Result};
use crate::kv::{self, keys, KeyValueStore, MemoryStore};
use crate::listening::ListeningLedger;
use crate::merge::{ImportMode, MergeOutcome, MergeResolver};
use crate::model::{
    is_http_url, DedupKey, PresetSlot, StationCandidate, StationId, StationPatch, StationRecord,
    NOTE_MAX_CHARS,
};
use crate::view::{self, SortOption};

/// Change notifications.  Emitted after the mutation has been persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LibraryEvent {
    Added {
        station: StationRecord,
    },
    Removed {
        id: StationId,
        key: DedupKey,
    },
    Updated {
        id: StationId,
        /// Identity before the edit; differs from the current one when the
        /// stream URL of a station without a remote id changed.
        previous_key: DedupKey,
        url_changed: bool,
    },
    PresetChanged {
        slot: PresetSlot,
        id: Option<StationId>,
    },
    Replaced {
        count: usize,
    },
    Merged {
        accepted: usize,
        duplicates: usize,
    },
    Cleared,
    Played {
        id: StationId,
        play_count: u64,
    },
}

pub struct LibraryStore {
    /// Display order: most recently added first.
    stations: Vec<StationRecord>,
    kv: Arc<dyn KeyValueStore>,
    events: broadcast::Sender<LibraryEvent>,
}

impl LibraryStore {
    /// Load the `stations` value.  An unreadable value is copied to
    /// `stations-corrupt` and the library starts empty rather than failing.
    pub fn load(kv: Arc<dyn KeyValueStore>) -> Self {
        let stations = match kv::load_json::<Vec<StationRecord>>(kv.as_ref(), keys::STATIONS) {
            Ok(Some(stations)) => repair(stations),
            Ok(None) => Vec::new(),
            Err(e) => {
                error!("library: cannot read stored stations: {}", e);
                if let Ok(Some(raw)) = kv.get(keys::STATIONS) {
                    if let Err(e) = kv.set(keys::STATIONS_CORRUPT, &raw) {
                        error!("library: failed to back up unreadable stations: {}", e);
                    } else {
                        warn!("library: unreadable stations kept under '{}'", keys::STATIONS_CORRUPT);
                    }
                }
                Vec::new()
            }
        };
        info!("library: loaded {} station(s)", stations.len());

        let (events, _) = broadcast::channel(256);
        Self {
            stations,
            kv,
            events,
        }
    }

    pub fn in_memory() -> Self {
        Self::load(Arc::new(MemoryStore::new()))
    }

    /// Whether a `stations` value was ever written.  The starter pack is
    /// only seeded into a library that was never initialized.
    pub fn is_initialized(kv: &dyn KeyValueStore) -> bool {
        matches!(kv.get(keys::STATIONS), Ok(Some(_)))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LibraryEvent> {
        self.events.subscribe()
    }

    // ── queries ───────────────────────────────────────────────────────────────

    pub fn len(&self) -> usize {
        self.stations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stations.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StationRecord> {
        self.stations.iter()
    }

    pub fn records(&self) -> &[StationRecord] {
        &self.stations
    }

    pub fn get(&self, id: &StationId) -> Option<&StationRecord> {
        self.stations.iter().find(|s| &s.id == id)
    }

    pub fn find_by_key(&self, key: &DedupKey) -> Option<&StationRecord> {
        self.stations.iter().find(|s| &s.dedup_key() == key)
    }

    pub fn contains_key(&self, key: &DedupKey) -> bool {
        self.find_by_key(key).is_some()
    }

    pub fn preset(&self, slot: PresetSlot) -> Option<&StationRecord> {
        self.stations.iter().find(|s| s.preset_slot == Some(slot))
    }

    /// Every slot with its holder, in slot order.
    pub fn presets(&self) -> Vec<(PresetSlot, Option<&StationRecord>)> {
        PresetSlot::all().map(|slot| (slot, self.preset(slot))).collect()
    }

    /// Copies of the records, filtered and sorted, with listening totals
    /// read from `ledger`.  Stored order is untouched.
    pub fn sorted_filtered_view(
        &self,
        sort: SortOption,
        filter: &str,
        ledger: &ListeningLedger,
    ) -> Vec<StationRecord> {
        view::project(&self.stations, sort, filter, |r| ledger.total_ms(&r.dedup_key()))
    }

    /// Full records for an export file, listening totals refreshed.
    pub fn export_records(&self, ledger: &ListeningLedger) -> Vec<StationRecord> {
        self.stations
            .iter()
            .map(|r| {
                let mut copy = r.clone();
                copy.total_listening_time_ms = ledger.total_ms(&r.dedup_key());
                copy
            })
            .collect()
    }

    /// An id not held by any current record nor in `taken`.
    pub fn fresh_id(&self, taken: &HashSet<StationId>) -> StationId {
        loop {
            let id = StationId::generate();
            if !taken.contains(&id) && self.get(&id).is_none() {
                return id;
            }
        }
    }

    // ── mutations ─────────────────────────────────────────────────────────────

    pub fn add(&mut self, candidate: StationCandidate) -> Result<StationRecord> {
        let candidate = candidate.normalized();
        candidate.validate().map_err(LibraryError::Validation)?;

        let key = candidate.dedup_key();
        if self.contains_key(&key) {
            return Err(LibraryError::Duplicate {
                identity: key.to_string(),
            });
        }

        let id = self.fresh_id(&HashSet::new());
        let mut candidate = candidate;
        // play statistics only travel through imports
        candidate.date_added = None;
        candidate.play_count = 0;
        candidate.last_played_at = None;
        let record = candidate.into_record(id, Utc::now());
        info!("library: added '{}' ({})", record.name(), record.id);

        self.stations.insert(0, record.clone());
        self.commit(LibraryEvent::Added {
            station: record.clone(),
        });
        Ok(record)
    }

    pub fn remove(&mut self, id: &StationId) -> bool {
        let Some(pos) = self.stations.iter().position(|s| &s.id == id) else {
            return false;
        };
        let removed = self.stations.remove(pos);
        info!("library: removed '{}' ({})", removed.name(), removed.id);
        self.commit(LibraryEvent::Removed {
            id: removed.id.clone(),
            key: removed.dedup_key(),
        });
        true
    }

    /// Shallow-merge `patch` into the record.  `Ok(false)` when no record
    /// has that id.  Preset slots cannot be changed here.
    pub fn update(&mut self, id: &StationId, patch: StationPatch) -> Result<bool> {
        let Some(pos) = self.stations.iter().position(|s| &s.id == id) else {
            return Ok(false);
        };

        let before = &self.stations[pos];
        let updated = apply_patch(before.clone(), patch)?;
        if &updated == before {
            return Ok(true);
        }

        let previous_key = before.dedup_key();
        let new_key = updated.dedup_key();
        if new_key != previous_key
            && self
                .stations
                .iter()
                .any(|s| &s.id != id && s.dedup_key() == new_key)
        {
            return Err(LibraryError::Duplicate {
                identity: new_key.to_string(),
            });
        }

        let url_changed = before.stream_url != updated.stream_url;
        debug!("library: updated {} (url_changed={})", id, url_changed);
        self.stations[pos] = updated;
        self.commit(LibraryEvent::Updated {
            id: id.clone(),
            previous_key,
            url_changed,
        });
        Ok(true)
    }

    /// Give `slot` to `id`.  The current holder of the slot loses it and
    /// `id` loses any slot it held, before the assignment, so no two
    /// records ever share a slot and no record holds two.
    pub fn set_preset(&mut self, id: &StationId, slot: PresetSlot) -> bool {
        if self.get(id).is_none() {
            return false;
        }

        for station in self.stations.iter_mut() {
            if station.preset_slot == Some(slot) || &station.id == id {
                station.preset_slot = None;
            }
        }
        if let Some(station) = self.stations.iter_mut().find(|s| &s.id == id) {
            station.preset_slot = Some(slot);
        }

        info!("library: preset {} → {}", slot.get(), id);
        self.commit(LibraryEvent::PresetChanged {
            slot,
            id: Some(id.clone()),
        });
        true
    }

    pub fn clear_preset(&mut self, slot: PresetSlot) -> bool {
        let Some(holder) = self
            .stations
            .iter_mut()
            .find(|s| s.preset_slot == Some(slot))
        else {
            return false;
        };
        holder.preset_slot = None;
        info!("library: preset {} cleared", slot.get());
        self.commit(LibraryEvent::PresetChanged { slot, id: None });
        true
    }

    /// A playback of the station identified by `key` started.
    pub fn record_play(&mut self, key: &DedupKey, now: DateTime<Utc>) -> bool {
        let Some(station) = self.stations.iter_mut().find(|s| &s.dedup_key() == key) else {
            debug!("library: play of {} not in library", key);
            return false;
        };
        station.play_count = station.play_count.saturating_add(1);
        station.last_played_at = Some(now);
        let event = LibraryEvent::Played {
            id: station.id.clone(),
            play_count: station.play_count,
        };
        self.commit(event);
        true
    }

    /// Resolve `batch` against the library and apply it.  Nothing changes
    /// when any candidate is invalid.
    pub fn import(&mut self, batch: Vec<StationCandidate>, mode: ImportMode) -> Result<MergeOutcome> {
        let outcome = MergeResolver::resolve(self, batch, mode)?;
        self.apply(&outcome, mode);
        Ok(outcome)
    }

    /// Apply a resolved batch.  `Replace` swaps the whole collection;
    /// `Merge` puts the accepted records in front of the existing ones.
    pub fn apply(&mut self, outcome: &MergeOutcome, mode: ImportMode) {
        match mode {
            ImportMode::Replace => {
                info!(
                    "library: replaced {} station(s) with {}",
                    self.stations.len(),
                    outcome.accepted.len()
                );
                self.stations = outcome.accepted.clone();
                self.commit(LibraryEvent::Replaced {
                    count: outcome.accepted.len(),
                });
            }
            ImportMode::Merge => {
                info!(
                    "library: merged {} station(s), {} duplicate(s)",
                    outcome.accepted.len(),
                    outcome.duplicate_count
                );
                if outcome.accepted.is_empty() {
                    return;
                }
                let mut merged = outcome.accepted.clone();
                merged.append(&mut self.stations);
                self.stations = merged;
                self.commit(LibraryEvent::Merged {
                    accepted: outcome.accepted.len(),
                    duplicates: outcome.duplicate_count,
                });
            }
        }
    }

    pub fn clear(&mut self) -> bool {
        if self.stations.is_empty() {
            return false;
        }
        info!("library: cleared {} station(s)", self.stations.len());
        self.stations.clear();
        self.commit(LibraryEvent::Cleared);
        true
    }

    /// Explicit, user-triggered save.  Unlike the implicit write after each
    /// mutation, failures are returned.
    pub fn save(&self) -> Result<()> {
        kv::save_json(self.kv.as_ref(), keys::STATIONS, &self.stations)?;
        Ok(())
    }

    fn commit(&self, event: LibraryEvent) {
        if let Err(e) = self.save() {
            error!("library: failed to persist stations: {}", e);
        }
        let _ = self.events.send(event);
    }
}

fn apply_patch(mut record: StationRecord, patch: StationPatch) -> Result<StationRecord> {
    if let Some(name) = patch.display_name {
        let name = name.trim();
        if name.is_empty() {
            return Err(LibraryError::Validation("station name is empty".into()));
        }
        record.display_name = name.to_string();
    }
    if let Some(url) = patch.stream_url {
        let url = url.trim();
        if !is_http_url(url) {
            return Err(LibraryError::Validation(format!(
                "stream URL must be http(s): {url}"
            )));
        }
        record.stream_url = url.to_string();
    }
    if let Some(note) = patch.note {
        let count = note.trim().chars().count();
        if count > NOTE_MAX_CHARS {
            return Err(LibraryError::Validation(format!(
                "note is {count} characters, at most {NOTE_MAX_CHARS} allowed"
            )));
        }
        record.note = clearable(note);
    }
    if let Some(custom) = patch.custom_name {
        record.custom_name = clearable(custom);
    }
    if let Some(favicon) = patch.favicon_url {
        record.favicon_url = clearable(favicon);
    }
    if let Some(homepage) = patch.homepage_url {
        record.homepage_url = clearable(homepage);
    }
    if let Some(country) = patch.country_code {
        record.country_code = clearable(country).map(|c| c.to_ascii_uppercase());
    }
    if let Some(bitrate) = patch.bitrate_kbps {
        record.bitrate_kbps = Some(bitrate);
    }
    if let Some(votes) = patch.vote_count {
        record.vote_count = Some(votes);
    }
    Ok(record)
}

fn clearable(value: String) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

/// Restore the collection invariants on data read back from storage: ids
/// and identities unique (first wins), each slot held at most once.
fn repair(stations: Vec<StationRecord>) -> Vec<StationRecord> {
    let mut ids = HashSet::new();
    let mut identities = HashSet::new();
    let mut slots = HashSet::new();
    let mut out = Vec::with_capacity(stations.len());

    for mut station in stations {
        if !identities.insert(station.dedup_key()) {
            warn!("library: dropping stored duplicate of {}", station.dedup_key());
            continue;
        }
        if !ids.insert(station.id.clone()) {
            let mut id = StationId::generate();
            while ids.contains(&id) {
                id = StationId::generate();
            }
            warn!("library: re-keying stored duplicate id {} → {}", station.id, id);
            ids.insert(id.clone());
            station.id = id;
        }
        if let Some(slot) = station.preset_slot {
            if !slots.insert(slot) {
                warn!("library: preset {} held twice in storage, clearing", slot.get());
                station.preset_slot = None;
            }
        }
        out.push(station);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> LibraryStore {
        LibraryStore::in_memory()
    }

    fn add(store: &mut LibraryStore, url: &str, name: &str) -> StationId {
        store.add(StationCandidate::new(url, name)).unwrap().id
    }

    fn slot(n: u8) -> PresetSlot {
        PresetSlot::new(n).unwrap()
    }

    #[test]
    fn add_rejects_duplicate_identity() {
        let mut s = store();
        add(&mut s, "http://x/stream", "X");
        let err = s
            .add(StationCandidate::new(" http://x/stream ", "Other"))
            .unwrap_err();
        assert!(matches!(err, LibraryError::Duplicate { .. }));
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn add_uses_remote_id_as_identity() {
        let mut s = store();
        let mut a = StationCandidate::new("http://a/1", "A");
        a.remote_id = Some("uuid-1".into());
        s.add(a).unwrap();

        let mut b = StationCandidate::new("http://a/2", "A mirror");
        b.remote_id = Some("uuid-1".into());
        assert!(s.add(b).is_err());
        // same url, different remote id: distinct stations
        let mut c = StationCandidate::new("http://a/1", "A other");
        c.remote_id = Some("uuid-2".into());
        assert!(s.add(c).is_ok());
    }

    #[test]
    fn add_inserts_at_front_with_fresh_state() {
        let mut s = store();
        let first = add(&mut s, "http://a/s", "A");
        let mut c = StationCandidate::new("http://b/s", "B");
        c.play_count = 40;
        let second = s.add(c).unwrap();
        assert_eq!(second.play_count, 0);
        assert_eq!(s.records()[0].id, second.id);
        assert_eq!(s.records()[1].id, first);
        assert_ne!(first, second.id);
    }

    #[test]
    fn add_validates() {
        let mut s = store();
        assert!(matches!(
            s.add(StationCandidate::new("not a url", "X")),
            Err(LibraryError::Validation(_))
        ));
        assert!(s.is_empty());
    }

    #[test]
    fn remove_reports_existence() {
        let mut s = store();
        let mut rx = s.subscribe();
        let id = add(&mut s, "http://a/s", "A");
        assert!(s.remove(&id));
        assert!(!s.remove(&id));
        assert!(s.is_empty());
        assert!(matches!(rx.try_recv().unwrap(), LibraryEvent::Added { .. }));
        assert!(matches!(rx.try_recv().unwrap(), LibraryEvent::Removed { .. }));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn set_preset_moves_slot_between_stations() {
        let mut s = store();
        let a = add(&mut s, "http://a/s", "A");
        let b = add(&mut s, "http://b/s", "B");

        assert!(s.set_preset(&a, slot(2)));
        assert!(s.set_preset(&b, slot(2)));
        assert_eq!(s.get(&a).unwrap().preset_slot, None);
        assert_eq!(s.get(&b).unwrap().preset_slot, Some(slot(2)));
    }

    #[test]
    fn set_preset_moves_station_between_slots() {
        let mut s = store();
        let a = add(&mut s, "http://a/s", "A");
        s.set_preset(&a, slot(1));
        s.set_preset(&a, slot(4));
        assert!(s.preset(slot(1)).is_none());
        assert_eq!(s.preset(slot(4)).unwrap().id, a);
        assert!(!s.set_preset(&StationId::new("missing"), slot(3)));
        assert!(s.preset(slot(3)).is_none());
    }

    #[test]
    fn clear_preset_only_when_held() {
        let mut s = store();
        let a = add(&mut s, "http://a/s", "A");
        assert!(!s.clear_preset(slot(5)));
        s.set_preset(&a, slot(5));
        assert!(s.clear_preset(slot(5)));
        assert_eq!(s.get(&a).unwrap().preset_slot, None);
        assert_eq!(s.presets().iter().filter(|(_, h)| h.is_some()).count(), 0);
    }

    #[test]
    fn update_merges_fields_and_clears_with_empty() {
        let mut s = store();
        let id = add(&mut s, "http://a/s", "A");
        s.set_preset(&id, slot(3));

        let patch = StationPatch {
            custom_name: Some("Mine".into()),
            note: Some("late night".into()),
            ..StationPatch::default()
        };
        assert!(s.update(&id, patch).unwrap());
        let r = s.get(&id).unwrap();
        assert_eq!(r.name(), "Mine");
        assert_eq!(r.note.as_deref(), Some("late night"));
        assert_eq!(r.preset_slot, Some(slot(3)));

        assert!(s.update(&id, StationPatch::note("")).unwrap());
        assert_eq!(s.get(&id).unwrap().note, None);
        assert!(!s.update(&StationId::new("nope"), StationPatch::note("x")).unwrap());
    }

    #[test]
    fn update_rejects_long_note_without_change() {
        let mut s = store();
        let id = add(&mut s, "http://a/s", "A");
        let err = s.update(&id, StationPatch::note("x".repeat(101))).unwrap_err();
        assert!(matches!(err, LibraryError::Validation(_)));
        assert_eq!(s.get(&id).unwrap().note, None);
        assert!(s.update(&id, StationPatch::note("x".repeat(100))).unwrap());
    }

    #[test]
    fn update_url_to_existing_identity_is_duplicate() {
        let mut s = store();
        let a = add(&mut s, "http://a/s", "A");
        add(&mut s, "http://b/s", "B");
        let patch = StationPatch {
            stream_url: Some("http://b/s".into()),
            ..StationPatch::default()
        };
        assert!(matches!(
            s.update(&a, patch),
            Err(LibraryError::Duplicate { .. })
        ));
        assert_eq!(s.get(&a).unwrap().stream_url, "http://a/s");
    }

    #[test]
    fn update_reports_url_change() {
        let mut s = store();
        let a = add(&mut s, "http://a/s", "A");
        let mut rx = s.subscribe();
        let patch = StationPatch {
            stream_url: Some("https://a/s2".into()),
            ..StationPatch::default()
        };
        s.update(&a, patch).unwrap();
        match rx.try_recv().unwrap() {
            LibraryEvent::Updated {
                previous_key,
                url_changed,
                ..
            } => {
                assert!(url_changed);
                assert_eq!(previous_key.as_str(), "http://a/s");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn record_play_increments_once() {
        let mut s = store();
        let id = add(&mut s, "http://a/s", "A");
        let key = s.get(&id).unwrap().dedup_key();
        let now = Utc::now();
        assert!(s.record_play(&key, now));
        assert!(s.record_play(&key, now));
        let r = s.get(&id).unwrap();
        assert_eq!(r.play_count, 2);
        assert_eq!(r.last_played_at, Some(now));
        assert!(!s.record_play(&DedupKey::from_parts(None, "http://zzz"), now));
    }

    #[test]
    fn mutations_persist_and_reload() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let id = {
            let mut s = LibraryStore::load(kv.clone());
            let id = add(&mut s, "http://a/s", "A");
            s.set_preset(&id, slot(1));
            id
        };
        assert!(LibraryStore::is_initialized(kv.as_ref()));
        let s = LibraryStore::load(kv);
        assert_eq!(s.len(), 1);
        assert_eq!(s.preset(slot(1)).unwrap().id, id);
    }

    #[test]
    fn persistence_failure_keeps_memory_state() {
        let mem = Arc::new(MemoryStore::new());
        let mut s = LibraryStore::load(mem.clone());
        mem.set_read_only(true);
        let id = add(&mut s, "http://a/s", "A");
        assert!(s.get(&id).is_some());
        assert!(matches!(s.save(), Err(LibraryError::Persistence(_))));
    }

    #[test]
    fn corrupt_value_is_backed_up() {
        let kv = Arc::new(MemoryStore::new());
        kv.set(keys::STATIONS, "[{broken").unwrap();
        let s = LibraryStore::load(kv.clone());
        assert!(s.is_empty());
        assert_eq!(
            kv.get(keys::STATIONS_CORRUPT).unwrap().as_deref(),
            Some("[{broken")
        );
    }

    #[test]
    fn repair_enforces_invariants_on_stored_data() {
        let now = Utc::now();
        let mut a = StationCandidate::new("http://a/s", "A").into_record(StationId::new("1"), now);
        a.preset_slot = Some(slot(2));
        let mut b = StationCandidate::new("http://b/s", "B").into_record(StationId::new("1"), now);
        b.preset_slot = Some(slot(2));
        let dup = StationCandidate::new("http://a/s", "A again").into_record(StationId::new("3"), now);

        let out = repair(vec![a, b, dup]);
        assert_eq!(out.len(), 2);
        assert_ne!(out[0].id, out[1].id);
        assert_eq!(out[0].preset_slot, Some(slot(2)));
        assert_eq!(out[1].preset_slot, None);
    }

    #[test]
    fn view_reads_listening_from_ledger() {
        let mut s = store();
        add(&mut s, "http://a/s", "Alpha");
        add(&mut s, "http://b/s", "Beta");
        let view = s.sorted_filtered_view(SortOption::NameAsc, "", &ListeningLedger::default());
        assert_eq!(view[0].display_name, "Alpha");
        // stored order untouched
        assert_eq!(s.records()[0].display_name, "Beta");
    }

    #[test]
    fn clear_empties_library() {
        let mut s = store();
        assert!(!s.clear());
        add(&mut s, "http://a/s", "A");
        assert!(s.clear());
        assert!(s.is_empty());
    }
}
