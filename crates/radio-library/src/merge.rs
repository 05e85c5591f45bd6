//! MergeResolver: reconciles an incoming batch with the library.

use std::collections::HashSet;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{LibraryError, Result};
use crate::model::{StationCandidate, StationId, StationRecord};
use crate::store::LibraryStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportMode {
    Replace,
    #[default]
    Merge,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeOutcome {
    /// Records to add, with fresh ids and no presets, in batch order.
    pub accepted: Vec<StationRecord>,
    pub duplicate_count: usize,
}

impl MergeOutcome {
    pub fn report(&self, failed: usize) -> ImportReport {
        ImportReport {
            accepted: self.accepted.len(),
            duplicates: self.duplicate_count,
            failed,
        }
    }
}

/// What the user is told after an import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportReport {
    pub accepted: usize,
    pub duplicates: usize,
    /// Entries that could not be resolved (share links only).
    pub failed: usize,
}

pub struct MergeResolver;

impl MergeResolver {
    /// Decide which candidates enter the library.  Pure: the store is only
    /// read.  Fails without a result if any candidate is invalid.
    ///
    /// In `Merge` mode a candidate is dropped as a duplicate when its
    /// identity is already in the library or was accepted earlier in the
    /// batch.  In `Replace` mode only duplicates within the batch are
    /// dropped (first occurrence wins).
    pub fn resolve(
        library: &LibraryStore,
        batch: Vec<StationCandidate>,
        mode: ImportMode,
    ) -> Result<MergeOutcome> {
        let batch: Vec<StationCandidate> = batch.into_iter().map(StationCandidate::normalized).collect();
        for (index, candidate) in batch.iter().enumerate() {
            candidate
                .validate()
                .map_err(|e| LibraryError::Validation(format!("entry {}: {}", index + 1, e)))?;
        }

        let now = Utc::now();
        let mut seen = HashSet::new();
        let mut ids: HashSet<StationId> = HashSet::new();
        let mut outcome = MergeOutcome::default();

        for candidate in batch {
            let key = candidate.dedup_key();
            let in_library = mode == ImportMode::Merge && library.contains_key(&key);
            if in_library || !seen.insert(key.clone()) {
                debug!("merge: duplicate {}", key);
                outcome.duplicate_count += 1;
                continue;
            }
            let id = library.fresh_id(&ids);
            ids.insert(id.clone());
            outcome.accepted.push(candidate.into_record(id, now));
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PresetSlot;

    fn library() -> LibraryStore {
        let mut s = LibraryStore::in_memory();
        s.add(StationCandidate::new("http://x/stream", "X")).unwrap();
        s
    }

    #[test]
    fn merge_counts_library_and_batch_duplicates() {
        let lib = library();
        let batch = vec![
            StationCandidate::new("http://x/stream", "X again"),
            StationCandidate::new("http://y/stream", "Y"),
            StationCandidate::new("http://y/stream", "Y again"),
        ];
        let out = MergeResolver::resolve(&lib, batch, ImportMode::Merge).unwrap();
        assert_eq!(out.duplicate_count, 2);
        assert_eq!(out.accepted.len(), 1);
        assert_eq!(out.accepted[0].display_name, "Y");
    }

    #[test]
    fn replace_ignores_library_but_dedups_batch() {
        let lib = library();
        let batch = vec![
            StationCandidate::new("http://x/stream", "X new"),
            StationCandidate::new("http://x/stream", "X newer"),
        ];
        let out = MergeResolver::resolve(&lib, batch, ImportMode::Replace).unwrap();
        assert_eq!(out.accepted.len(), 1);
        assert_eq!(out.accepted[0].display_name, "X new");
        assert_eq!(out.duplicate_count, 1);
    }

    #[test]
    fn accepted_records_get_fresh_ids_and_no_preset() {
        let lib = library();
        let existing = lib.records()[0].id.clone();
        let batch = vec![
            StationCandidate::new("http://a/s", "A"),
            StationCandidate::new("http://b/s", "B"),
        ];
        let out = MergeResolver::resolve(&lib, batch, ImportMode::Merge).unwrap();
        let ids: HashSet<_> = out.accepted.iter().map(|r| r.id.clone()).collect();
        assert_eq!(ids.len(), 2);
        assert!(!ids.contains(&existing));
        assert!(out.accepted.iter().all(|r| r.preset_slot.is_none()));
    }

    #[test]
    fn untrusted_preset_in_json_is_dropped() {
        let json = r#"[{"streamUrl":"http://a/s","displayName":"A","id":"x","presetSlot":1}]"#;
        let batch: Vec<StationCandidate> = serde_json::from_str(json).unwrap();
        let out = MergeResolver::resolve(&library(), batch, ImportMode::Merge).unwrap();
        assert_eq!(out.accepted[0].preset_slot, None::<PresetSlot>);
        assert_ne!(out.accepted[0].id.as_str(), "x");
    }

    #[test]
    fn one_invalid_entry_aborts_the_batch() {
        let mut lib = library();
        let batch = vec![
            StationCandidate::new("http://a/s", "A"),
            StationCandidate::new("", "broken"),
        ];
        let err = lib.import(batch, ImportMode::Replace).unwrap_err();
        assert!(matches!(err, LibraryError::Validation(ref m) if m.contains("entry 2")));
        assert_eq!(lib.len(), 1);
        assert_eq!(lib.records()[0].stream_url, "http://x/stream");
    }

    #[test]
    fn import_keeps_statistics_but_not_presets() {
        let mut lib = LibraryStore::in_memory();
        let mut c = StationCandidate::new("http://a/s", "A");
        c.play_count = 7;
        c.note = Some("kept".into());
        lib.import(vec![c], ImportMode::Merge).unwrap();
        let r = &lib.records()[0];
        assert_eq!(r.play_count, 7);
        assert_eq!(r.note.as_deref(), Some("kept"));
    }
}
