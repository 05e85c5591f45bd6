//! External station catalog (radio-browser compatible JSON API).
//!
//! Best effort only: every caller must cope with the service being down.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::CatalogError;
use crate::model::StationCandidate;

pub type Result<T> = std::result::Result<T, CatalogError>;

pub const DEFAULT_BASE_URL: &str = "https://de1.api.radio-browser.info";
pub const DEFAULT_SEARCH_LIMIT: u32 = 50;

/// One station as the catalog reports it.  Unknown fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogStation {
    pub stationuuid: String,
    pub name: String,
    pub url: String,
    pub url_resolved: String,
    pub favicon: String,
    pub homepage: String,
    pub bitrate: Option<u32>,
    pub countrycode: String,
    pub votes: Option<u32>,
    pub tags: String,
}

impl CatalogStation {
    /// The URL to play: the resolved one when the catalog followed
    /// playlists/redirects for us.
    pub fn stream_url(&self) -> &str {
        if self.url_resolved.trim().is_empty() {
            &self.url
        } else {
            &self.url_resolved
        }
    }

    pub fn to_candidate(&self) -> StationCandidate {
        StationCandidate {
            remote_id: Some(self.stationuuid.clone()),
            stream_url: self.stream_url().to_string(),
            display_name: self.name.clone(),
            favicon_url: Some(self.favicon.clone()),
            homepage_url: Some(self.homepage.clone()),
            bitrate_kbps: self.bitrate.filter(|b| *b > 0),
            country_code: Some(self.countrycode.clone()),
            vote_count: self.votes,
            ..StationCandidate::default()
        }
        .normalized()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", content = "value", rename_all = "lowercase")]
pub enum CatalogQuery {
    Name(String),
    Tag(String),
}

#[async_trait]
pub trait StationCatalog: Send + Sync {
    /// Resolve catalog ids.  Unknown ids are simply absent from the result.
    async fn lookup_by_uuids(&self, uuids: &[String]) -> Result<Vec<CatalogStation>>;

    async fn search(&self, query: &CatalogQuery, limit: u32) -> Result<Vec<CatalogStation>>;
}

pub struct RadioBrowserClient {
    http: reqwest::Client,
    base_url: String,
}

impl RadioBrowserClient {
    pub fn new(base_url: &str, timeout: Duration, user_agent: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get_stations(&self, path: &str, query: &[(&str, String)]) -> Result<Vec<CatalogStation>> {
        let url = format!("{}{}", self.base_url, path);
        debug!("catalog: GET {} {:?}", url, query);
        let response = self.http.get(&url).query(query).send().await?;
        let status = response.status();
        if !status.is_success() {
            warn!("catalog: {} returned {}", url, status);
            return Err(CatalogError::Status(status.as_u16()));
        }
        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| CatalogError::Decode(e.to_string()))
    }
}

#[async_trait]
impl StationCatalog for RadioBrowserClient {
    async fn lookup_by_uuids(&self, uuids: &[String]) -> Result<Vec<CatalogStation>> {
        if uuids.is_empty() {
            return Ok(Vec::new());
        }
        self.get_stations("/json/stations/byuuid", &[("uuids", uuids.join(","))])
            .await
    }

    async fn search(&self, query: &CatalogQuery, limit: u32) -> Result<Vec<CatalogStation>> {
        let (field, value) = match query {
            CatalogQuery::Name(v) => ("name", v),
            CatalogQuery::Tag(v) => ("tag", v),
        };
        self.get_stations(
            "/json/stations/search",
            &[
                (field, value.trim().to_string()),
                ("limit", limit.to_string()),
                ("hidebroken", "true".to_string()),
                ("order", "votes".to_string()),
                ("reverse", "true".to_string()),
            ],
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_catalog_json_and_prefers_resolved_url() {
        let json = r#"[{
            "stationuuid": "9617a958-0601-11e8-ae97-52543be04c81",
            "name": "SomaFM Groove Salad",
            "url": "http://somafm.com/groovesalad.pls",
            "url_resolved": "http://ice1.somafm.com/groovesalad-128-mp3",
            "favicon": "",
            "homepage": "https://somafm.com/",
            "bitrate": 128,
            "countrycode": "us",
            "votes": 4000,
            "codec": "MP3",
            "tags": "ambient,chillout"
        }]"#;
        let stations: Vec<CatalogStation> = serde_json::from_str(json).unwrap();
        let c = stations[0].to_candidate();
        assert_eq!(c.stream_url, "http://ice1.somafm.com/groovesalad-128-mp3");
        assert_eq!(c.remote_id.as_deref(), Some("9617a958-0601-11e8-ae97-52543be04c81"));
        assert_eq!(c.favicon_url, None);
        assert_eq!(c.country_code.as_deref(), Some("US"));
        assert_eq!(c.bitrate_kbps, Some(128));
        assert!(c.validate().is_ok());
    }

    #[test]
    fn falls_back_to_plain_url() {
        let s = CatalogStation {
            url: "http://a/s".into(),
            bitrate: Some(0),
            ..CatalogStation::default()
        };
        assert_eq!(s.stream_url(), "http://a/s");
        assert_eq!(s.to_candidate().bitrate_kbps, None);
    }

    #[tokio::test]
    #[ignore = "requires network access"]
    async fn live_search_returns_results() {
        let client =
            RadioBrowserClient::new(DEFAULT_BASE_URL, Duration::from_secs(10), "radio-library-tests")
                .unwrap();
        let results = client
            .search(&CatalogQuery::Tag("jazz".into()), 5)
            .await
            .unwrap();
        assert!(!results.is_empty());
    }
}
