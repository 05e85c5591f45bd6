//! Starter pack: stations seeded into a fresh library.
//!
//! Sources, first hit wins: the configured TOML file, a `stations.toml`
//! beside the executable, the configured m3u URL or file.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{info, warn};

use crate::config::Config;
use crate::model::StationCandidate;

pub fn parse_m3u_from_str(content: &str) -> Vec<StationCandidate> {
    let mut stations = Vec::new();
    let mut pending: Option<(String, Option<String>)> = None;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(rest) = line.strip_prefix("#EXTINF:") {
            // the title starts at the first comma after any quoted attribute
            let attrs_end = rest.rfind('"').map(|i| i + 1).unwrap_or(0);
            if let Some(comma_idx) = rest[attrs_end..].find(',').map(|i| i + attrs_end) {
                let name = rest[comma_idx + 1..].trim().to_string();
                let logo = extinf_attr(&rest[..comma_idx], "tvg-logo");
                pending = Some((name, logo));
            }
            continue;
        }

        if line.starts_with('#') {
            continue;
        }

        let url = line.to_string();
        let (name, logo) = pending.take().unwrap_or_else(|| (url.clone(), None));
        let mut candidate = StationCandidate::new(url, name);
        candidate.favicon_url = logo;
        stations.push(candidate.normalized());
    }

    stations
}

/// `key="value"` from the attribute part of an `#EXTINF` line.
fn extinf_attr(attrs: &str, key: &str) -> Option<String> {
    let start = attrs.find(&format!("{key}=\""))? + key.len() + 2;
    let len = attrs[start..].find('"')?;
    Some(attrs[start..start + len].to_string())
}

pub fn load_stations_from_m3u(path: &Path) -> anyhow::Result<Vec<StationCandidate>> {
    let content = std::fs::read_to_string(path)?;
    Ok(parse_m3u_from_str(&content))
}

// ── TOML station file ─────────────────────────────────────────────────────────

/// Matches the `[[station]]` tables of a station file; kept apart from the
/// candidate type so the file schema stays short and stable.
#[derive(Debug, Deserialize)]
struct TomlStationFile {
    #[serde(default)]
    station: Vec<TomlStation>,
}

#[derive(Debug, Deserialize)]
struct TomlStation {
    name: String,
    url: String,
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default)]
    homepage: Option<String>,
    #[serde(default)]
    favicon: Option<String>,
    #[serde(default)]
    country: Option<String>,
    #[serde(default)]
    bitrate: Option<u32>,
    #[serde(default)]
    note: Option<String>,
}

pub fn parse_stations_from_toml_str(content: &str) -> anyhow::Result<Vec<StationCandidate>> {
    let file: TomlStationFile = toml::from_str(content)?;
    let stations = file
        .station
        .into_iter()
        .map(|s| {
            StationCandidate {
                remote_id: s.uuid,
                stream_url: s.url,
                display_name: s.name,
                homepage_url: s.homepage,
                favicon_url: s.favicon,
                country_code: s.country,
                bitrate_kbps: s.bitrate,
                note: s.note,
                ..StationCandidate::default()
            }
            .normalized()
        })
        .collect();
    Ok(stations)
}

pub fn load_stations_from_toml(path: &Path) -> anyhow::Result<Vec<StationCandidate>> {
    let content = std::fs::read_to_string(path)?;
    parse_stations_from_toml_str(&content)
}

async fn fetch_m3u_url(url: &str) -> anyhow::Result<Vec<StationCandidate>> {
    let response = reqwest::get(url).await?;
    if !response.status().is_success() {
        anyhow::bail!("HTTP {}", response.status());
    }
    let text = response.text().await?;
    Ok(parse_m3u_from_str(&text))
}

/// Gather the starter pack.  Never fails: an unavailable source is logged
/// and the next one tried, ending with an empty pack.
pub async fn load_starter_pack(config: &Config) -> Vec<StationCandidate> {
    let mut toml_paths = vec![config.library.starter_toml.clone()];
    if let Some(dir) = std::env::current_exe().ok().and_then(|e| e.parent().map(Path::to_path_buf)) {
        toml_paths.push(dir.join("stations.toml"));
    }

    for path in &toml_paths {
        if !path.exists() {
            continue;
        }
        match load_stations_from_toml(path) {
            Ok(s) => {
                info!("starter: {} station(s) from {}", s.len(), path.display());
                return s;
            }
            Err(e) => warn!("starter: cannot parse {}: {}", path.display(), e),
        }
    }

    let source = config.library.starter_m3u_url.trim();
    if source.is_empty() {
        info!("starter: no station source configured");
        return Vec::new();
    }

    if source.starts_with("http://") || source.starts_with("https://") {
        match fetch_m3u_url(source).await {
            Ok(s) => {
                info!("starter: {} station(s) from {}", s.len(), source);
                return s;
            }
            Err(e) => warn!("starter: fetching {} failed: {}", source, e),
        }
    } else {
        let path = PathBuf::from(source);
        match load_stations_from_m3u(&path) {
            Ok(s) => {
                info!("starter: {} station(s) from {}", s.len(), path.display());
                return s;
            }
            Err(e) => warn!("starter: cannot read {}: {}", path.display(), e),
        }
    }

    Vec::new()
}
