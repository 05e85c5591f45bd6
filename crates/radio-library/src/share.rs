//! Share links: a compact station list embedded in a URL.
//!
//! Wire format is the JSON payload `{u, i, name?}`, base64url encoded
//! without padding and carried in the `d` query parameter.  Entries in
//! `i` are either a bare catalog uuid or an inline station object.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::catalog::{CatalogStation, StationCatalog};
use crate::error::ImportError;
use crate::model::{is_http_url, StationCandidate, StationRecord};

pub const SHARE_QUERY_PARAM: &str = "d";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SharePayload {
    /// Sharing user's name.
    #[serde(default)]
    pub u: String,
    #[serde(default)]
    pub i: Vec<ShareEntry>,
    /// Optional list label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ShareEntry {
    Uuid(String),
    Inline(InlineStation),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InlineStation {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub favicon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub countrycode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl InlineStation {
    pub fn to_candidate(&self) -> StationCandidate {
        StationCandidate {
            stream_url: self.url.clone(),
            display_name: self.name.clone(),
            favicon_url: self.favicon.clone(),
            homepage_url: self.homepage.clone(),
            bitrate_kbps: self.bitrate,
            country_code: self.countrycode.clone(),
            note: self.note.clone(),
            ..StationCandidate::default()
        }
        .normalized()
    }
}

/// Build a payload for `records`.  Catalog stations travel as their uuid,
/// manually added ones inline.
pub fn build_payload(username: &str, name: Option<&str>, records: &[StationRecord]) -> SharePayload {
    let i = records
        .iter()
        .map(|r| match r.remote_id.as_deref().filter(|id| !id.trim().is_empty()) {
            Some(uuid) => ShareEntry::Uuid(uuid.to_string()),
            None => ShareEntry::Inline(InlineStation {
                url: r.stream_url.clone(),
                name: r.name().to_string(),
                favicon: r.favicon_url.clone(),
                homepage: r.homepage_url.clone(),
                bitrate: r.bitrate_kbps,
                countrycode: r.country_code.clone(),
                note: r.note.clone(),
            }),
        })
        .collect();
    SharePayload {
        u: username.to_string(),
        i,
        name: name.map(str::to_string).filter(|n| !n.trim().is_empty()),
    }
}

pub fn encode(payload: &SharePayload) -> Result<String, ImportError> {
    let json = serde_json::to_vec(payload)?;
    Ok(URL_SAFE_NO_PAD.encode(json))
}

pub fn share_link(base_url: &str, payload: &SharePayload) -> Result<String, ImportError> {
    let data = encode(payload)?;
    let sep = if base_url.contains('?') { '&' } else { '?' };
    Ok(format!("{base_url}{sep}{SHARE_QUERY_PARAM}={data}"))
}

/// Accepts a full link (`d=` parameter or `#` fragment), bare base64url
/// data, or the raw JSON payload.  The result is validated.
pub fn decode(input: &str) -> Result<SharePayload, ImportError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(ImportError::Validation("share data is empty".into()));
    }

    let payload: SharePayload = if input.starts_with('{') {
        serde_json::from_str(input)?
    } else {
        let data = extract_data(input);
        // tolerate padded or standard-alphabet input
        let data: String = data
            .trim_end_matches('=')
            .chars()
            .map(|c| match c {
                '+' => '-',
                '/' => '_',
                c => c,
            })
            .collect();
        let bytes = URL_SAFE_NO_PAD
            .decode(data.as_bytes())
            .map_err(|e| ImportError::Decode(e.to_string()))?;
        serde_json::from_slice(&bytes)?
    };

    validate(&payload)?;
    Ok(payload)
}

fn extract_data(input: &str) -> &str {
    let param = format!("{SHARE_QUERY_PARAM}=");
    if let Some((_, query)) = input.split_once('?') {
        let query = query.split('#').next().unwrap_or(query);
        if let Some(value) = query
            .split('&')
            .find_map(|pair| pair.strip_prefix(param.as_str()))
        {
            return value;
        }
    }
    if let Some((_, fragment)) = input.split_once('#') {
        return fragment.strip_prefix(param.as_str()).unwrap_or(fragment);
    }
    input
}

pub fn validate(payload: &SharePayload) -> Result<(), ImportError> {
    if payload.i.is_empty() {
        return Err(ImportError::Validation("share contains no stations".into()));
    }
    for (index, entry) in payload.i.iter().enumerate() {
        match entry {
            ShareEntry::Uuid(uuid) if uuid.trim().is_empty() => {
                return Err(ImportError::Validation(format!("entry {}: empty id", index + 1)));
            }
            ShareEntry::Inline(station) => {
                if !is_http_url(&station.url) {
                    return Err(ImportError::Validation(format!(
                        "entry {}: missing or invalid url",
                        index + 1
                    )));
                }
                if station.name.trim().is_empty() {
                    return Err(ImportError::Validation(format!("entry {}: missing name", index + 1)));
                }
            }
            ShareEntry::Uuid(_) => {}
        }
    }
    Ok(())
}

/// Candidates ready for a merge, in payload order, plus the number of
/// entries that were unresolved or invalid.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShareImport {
    pub candidates: Vec<StationCandidate>,
    pub failed: usize,
}

/// Resolve uuid entries in one catalog lookup.  A lookup failure fails
/// only those entries; inline entries come through unless invalid.
pub async fn resolve(payload: &SharePayload, catalog: &dyn StationCatalog) -> ShareImport {
    let uuids: Vec<String> = payload
        .i
        .iter()
        .filter_map(|e| match e {
            ShareEntry::Uuid(u) => Some(u.trim().to_string()),
            ShareEntry::Inline(_) => None,
        })
        .collect();

    let found = if uuids.is_empty() {
        Vec::new()
    } else {
        match catalog.lookup_by_uuids(&uuids).await {
            Ok(found) => found,
            Err(e) => {
                warn!("share: catalog lookup for {} station(s) failed: {}", uuids.len(), e);
                Vec::new()
            }
        }
    };
    debug!("share: resolved {}/{} uuid(s)", found.len(), uuids.len());

    let mut import = ShareImport::default();
    for entry in &payload.i {
        let candidate = match entry {
            ShareEntry::Uuid(uuid) => {
                let uuid = uuid.trim();
                found
                    .iter()
                    .find(|s| s.stationuuid.eq_ignore_ascii_case(uuid))
                    .map(CatalogStation::to_candidate)
            }
            ShareEntry::Inline(station) => Some(station.to_candidate()),
        };
        // an invalid entry counts as failed; the rest still merge
        match candidate.map(StationCandidate::normalized) {
            Some(candidate) => match candidate.validate() {
                Ok(()) => import.candidates.push(candidate),
                Err(reason) => {
                    warn!("share: skipping entry: {}", reason);
                    import.failed += 1;
                }
            },
            None => import.failed += 1,
        }
    }
    import
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{self, CatalogQuery, CatalogStation};
    use crate::error::CatalogError;
    use crate::model::StationId;
    use async_trait::async_trait;
    use chrono::Utc;

    struct FixedCatalog(Vec<CatalogStation>);

    #[async_trait]
    impl StationCatalog for FixedCatalog {
        async fn lookup_by_uuids(&self, uuids: &[String]) -> catalog::Result<Vec<CatalogStation>> {
            Ok(self
                .0
                .iter()
                .filter(|s| uuids.contains(&s.stationuuid))
                .cloned()
                .collect())
        }

        async fn search(&self, _: &CatalogQuery, _: u32) -> catalog::Result<Vec<CatalogStation>> {
            Ok(self.0.clone())
        }
    }

    struct DownCatalog;

    #[async_trait]
    impl StationCatalog for DownCatalog {
        async fn lookup_by_uuids(&self, _: &[String]) -> catalog::Result<Vec<CatalogStation>> {
            Err(CatalogError::Status(503))
        }

        async fn search(&self, _: &CatalogQuery, _: u32) -> catalog::Result<Vec<CatalogStation>> {
            Err(CatalogError::Status(503))
        }
    }

    fn catalog_station(uuid: &str) -> CatalogStation {
        CatalogStation {
            stationuuid: uuid.into(),
            name: format!("Station {uuid}"),
            url: format!("http://{uuid}/stream"),
            ..CatalogStation::default()
        }
    }

    fn mixed_payload() -> SharePayload {
        SharePayload {
            u: "sam".into(),
            i: vec![
                ShareEntry::Uuid("u1".into()),
                ShareEntry::Inline(InlineStation {
                    url: "http://inline/stream".into(),
                    name: "Inline".into(),
                    note: Some("from a friend".into()),
                    ..InlineStation::default()
                }),
                ShareEntry::Uuid("missing".into()),
            ],
            name: Some("Weekend".into()),
        }
    }

    #[test]
    fn link_decodes_back_to_payload() {
        let payload = mixed_payload();
        let link = share_link("https://radio.example/import", &payload).unwrap();
        assert!(link.starts_with("https://radio.example/import?d="));
        assert_eq!(decode(&link).unwrap(), payload);

        let data = encode(&payload).unwrap();
        assert_eq!(decode(&data).unwrap(), payload);
        assert_eq!(decode(&format!("https://x/#{data}")).unwrap(), payload);
        assert_eq!(decode(&format!("https://x/?a=1&d={data}#top")).unwrap(), payload);
    }

    #[test]
    fn raw_json_and_wire_shape() {
        let json = r#"{"u":"kim","i":["abc",{"url":"http://a/s","name":"A","bitrate":128}]}"#;
        let payload = decode(json).unwrap();
        assert_eq!(payload.u, "kim");
        assert_eq!(payload.i[0], ShareEntry::Uuid("abc".into()));
        match &payload.i[1] {
            ShareEntry::Inline(s) => assert_eq!(s.bitrate, Some(128)),
            other => panic!("expected inline entry, got {other:?}"),
        }
    }

    #[test]
    fn validation_rejects_bad_payloads() {
        assert!(matches!(decode("   "), Err(ImportError::Validation(_))));
        assert!(matches!(decode(r#"{"u":"x","i":[]}"#), Err(ImportError::Validation(_))));
        assert!(matches!(
            decode(r#"{"u":"x","i":[{"name":"no url"}]}"#),
            Err(ImportError::Validation(_))
        ));
        assert!(matches!(
            decode(r#"{"u":"x","i":[{"url":"http://a/s"}]}"#),
            Err(ImportError::Validation(_))
        ));
        assert!(matches!(decode("!!!not-base64!!!"), Err(ImportError::Decode(_))));
    }

    #[test]
    fn build_payload_inlines_manual_stations() {
        let now = Utc::now();
        let mut listed = StationCandidate::new("http://c/s", "C").into_record(StationId::new("1"), now);
        listed.remote_id = Some("uuid-c".into());
        let mut manual = StationCandidate::new("http://m/s", "M").into_record(StationId::new("2"), now);
        manual.custom_name = Some("Mine".into());

        let payload = build_payload("sam", Some(" "), &[listed, manual]);
        assert_eq!(payload.name, None);
        assert_eq!(payload.i[0], ShareEntry::Uuid("uuid-c".into()));
        match &payload.i[1] {
            ShareEntry::Inline(s) => {
                assert_eq!(s.name, "Mine");
                assert_eq!(s.url, "http://m/s");
            }
            other => panic!("expected inline entry, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn resolve_counts_unresolved_uuids() {
        let catalog = FixedCatalog(vec![catalog_station("u1")]);
        let import = resolve(&mixed_payload(), &catalog).await;
        assert_eq!(import.failed, 1);
        assert_eq!(import.candidates.len(), 2);
        assert_eq!(import.candidates[0].remote_id.as_deref(), Some("u1"));
        assert_eq!(import.candidates[1].note.as_deref(), Some("from a friend"));
    }

    #[tokio::test]
    async fn catalog_outage_keeps_inline_entries() {
        let import = resolve(&mixed_payload(), &DownCatalog).await;
        assert_eq!(import.failed, 2);
        assert_eq!(import.candidates.len(), 1);
        assert_eq!(import.candidates[0].display_name, "Inline");
    }

    #[tokio::test]
    async fn nameless_catalog_entry_fails_alone() {
        let mut nameless = catalog_station("u1");
        nameless.name = "  ".into();
        let import = resolve(&mixed_payload(), &FixedCatalog(vec![nameless])).await;
        assert_eq!(import.failed, 2);
        assert_eq!(import.candidates.len(), 1);
        assert_eq!(import.candidates[0].display_name, "Inline");

        let mut library = crate::store::LibraryStore::in_memory();
        let outcome = library
            .import(import.candidates, crate::merge::ImportMode::Merge)
            .unwrap();
        assert_eq!(outcome.report(import.failed).failed, 2);
        assert_eq!(library.len(), 1);
    }
}
