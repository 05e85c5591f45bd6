//! Backup files: `{stations: [StationRecord], version}`.
//!
//! Parsing is lenient so that older or hand-edited files import: entries
//! only need a stream URL and a name, everything else is optional.
//! Ids and preset slots in the file are read but never trusted.

use serde::{Deserialize, Serialize};

use crate::error::ImportError;
use crate::model::{StationCandidate, StationRecord};

pub const EXPORT_VERSION: &str = "1.0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportFile {
    pub stations: Vec<StationRecord>,
    pub version: String,
}

impl ExportFile {
    pub fn new(stations: Vec<StationRecord>) -> Self {
        Self {
            stations,
            version: EXPORT_VERSION.to_string(),
        }
    }

    pub fn to_json(&self) -> Result<String, ImportError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[derive(Deserialize)]
struct LenientExport {
    stations: Vec<StationCandidate>,
    #[serde(default)]
    version: Option<String>,
}

/// Read an export file into candidates for [`crate::LibraryStore::import`].
/// A bare JSON array of stations is accepted as well.
pub fn parse(json: &str) -> Result<(Vec<StationCandidate>, Option<String>), ImportError> {
    let value: serde_json::Value = serde_json::from_str(json.trim())?;
    let export: LenientExport = if value.is_array() {
        LenientExport {
            stations: serde_json::from_value(value)?,
            version: None,
        }
    } else if value.get("stations").is_some() {
        serde_json::from_value(value)?
    } else {
        return Err(ImportError::Validation(
            "expected an object with a \"stations\" array".into(),
        ));
    };

    if export.stations.is_empty() {
        return Err(ImportError::Validation("export contains no stations".into()));
    }
    Ok((export.stations, export.version))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PresetSlot, StationId};
    use chrono::Utc;

    #[test]
    fn export_parses_back_into_candidates() {
        let mut record = StationCandidate::new("http://a/s", "A").into_record(StationId::new("a"), Utc::now());
        record.play_count = 3;
        record.preset_slot = PresetSlot::new(1);
        record.custom_name = Some("Mine".into());

        let json = ExportFile::new(vec![record.clone()]).to_json().unwrap();
        assert!(json.contains("\"version\": \"1.0\""));

        let (candidates, version) = parse(&json).unwrap();
        assert_eq!(version.as_deref(), Some(EXPORT_VERSION));
        assert_eq!(candidates[0].play_count, 3);
        assert_eq!(candidates[0].custom_name.as_deref(), Some("Mine"));
        assert_eq!(candidates[0].date_added, Some(record.date_added));
    }

    #[test]
    fn minimal_and_bare_array_forms() {
        let (c, v) = parse(r#"{"stations":[{"streamUrl":"http://a/s","displayName":"A"}]}"#).unwrap();
        assert_eq!(c.len(), 1);
        assert_eq!(v, None);
        let (c, _) = parse(r#"[{"streamUrl":"http://b/s","displayName":"B"}]"#).unwrap();
        assert_eq!(c[0].display_name, "B");
    }

    #[test]
    fn rejects_wrong_shapes() {
        assert!(matches!(parse("{}"), Err(ImportError::Validation(_))));
        assert!(matches!(parse(r#"{"stations":[]}"#), Err(ImportError::Validation(_))));
        assert!(matches!(parse("nope"), Err(ImportError::Json(_))));
    }
}
