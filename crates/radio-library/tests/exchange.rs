mod common;

use async_trait::async_trait;
use common::library::{candidate, catalog_candidate, library_with};
use radio_library::catalog::{self, CatalogQuery, CatalogStation, StationCatalog};
use radio_library::export::{self, ExportFile};
use radio_library::listening::ListeningLedger;
use radio_library::share;
use radio_library::{CatalogError, ImportMode, LibraryStore, PresetSlot};

struct Offline;

#[async_trait]
impl StationCatalog for Offline {
    async fn lookup_by_uuids(&self, _: &[String]) -> catalog::Result<Vec<CatalogStation>> {
        Err(CatalogError::Status(503))
    }

    async fn search(&self, _: &CatalogQuery, _: u32) -> catalog::Result<Vec<CatalogStation>> {
        Err(CatalogError::Status(503))
    }
}

#[tokio::test]
async fn share_link_round_trip_into_another_library() {
    let mut sender = LibraryStore::in_memory();
    sender.add(candidate("http://manual/s", "Manual")).unwrap();
    sender
        .add(catalog_candidate("uuid-1", "http://listed/s", "Listed"))
        .unwrap();

    let payload = share::build_payload("sam", Some("Faves"), sender.records());
    let link = share::share_link("https://radio.example/import", &payload).unwrap();

    // the receiver already has the manual station and cannot reach the catalog
    let (mut receiver, _) = library_with(1);
    receiver.add(candidate("http://manual/s", "Mine")).unwrap();
    let before = receiver.len();

    let decoded = share::decode(&link).unwrap();
    let resolved = share::resolve(&decoded, &Offline).await;
    assert_eq!(resolved.failed, 1);

    let outcome = receiver
        .import(resolved.candidates, ImportMode::Merge)
        .unwrap();
    let report = outcome.report(resolved.failed);
    assert_eq!((report.accepted, report.duplicates, report.failed), (0, 1, 1));
    assert_eq!(receiver.len(), before);
}

#[test]
fn export_then_replace_restores_library_without_presets() {
    let (mut store, ids) = library_with(3);
    store.set_preset(&ids[1], PresetSlot::new(4).unwrap());
    let key = store.get(&ids[2]).unwrap().dedup_key();
    store.record_play(&key, chrono::Utc::now());

    let json = ExportFile::new(store.export_records(&ListeningLedger::default()))
        .to_json()
        .unwrap();

    let mut restored = LibraryStore::in_memory();
    restored.add(candidate("http://gone/s", "Gone")).unwrap();
    let (candidates, version) = export::parse(&json).unwrap();
    assert_eq!(version.as_deref(), Some(export::EXPORT_VERSION));
    restored.import(candidates, ImportMode::Replace).unwrap();

    assert_eq!(restored.len(), 3);
    assert!(restored.find_by_key(&key).unwrap().play_count == 1);
    assert!(restored.iter().all(|r| r.preset_slot.is_none()));
    assert!(restored.iter().all(|r| !ids.contains(&r.id)));
    assert!(restored.iter().all(|r| r.stream_url != "http://gone/s"));
}

#[test]
fn malformed_export_leaves_library_untouched() {
    let (mut store, _) = library_with(2);
    let before = store.records().to_vec();

    let json = r#"{"stations":[{"streamUrl":"http://ok/s","displayName":"OK"},{"streamUrl":"","displayName":"bad"}],"version":"1.0"}"#;
    let (candidates, _) = export::parse(json).unwrap();
    assert!(store.import(candidates, ImportMode::Replace).is_err());
    assert_eq!(store.records(), before.as_slice());
}
