use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::platform;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub mpv: MpvConfig,
    #[serde(default)]
    pub playback: PlaybackConfig,
    #[serde(default)]
    pub library: LibraryConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub share: ShareConfig,
    #[serde(default)]
    pub filter: FilterConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Directory of the key-value store (`stations.json`, ...).
    #[serde(default = "default_store_dir")]
    pub store_dir: PathBuf,
    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MpvConfig {
    /// Used until a volume has been persisted in `player-settings`.
    #[serde(default = "default_volume")]
    pub default_volume: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    /// Try `https://` first for `http://` stations.
    #[serde(default = "default_true")]
    pub prefer_https: bool,
    #[serde(default = "default_listening_tick_secs")]
    pub listening_tick_secs: u64,
}

/// Starter pack sources, used once on an uninitialized library.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryConfig {
    /// Local TOML station file (`[[station]]` tables), highest priority.
    #[serde(default = "default_starter_toml")]
    pub starter_toml: PathBuf,
    /// URL or file path of an m3u list.  Empty disables it.
    #[serde(default)]
    pub starter_m3u_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    #[serde(default = "default_catalog_url")]
    pub base_url: String,
    #[serde(default = "default_catalog_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareConfig {
    /// Page that share links point to.
    #[serde(default = "default_share_url")]
    pub base_url: String,
    /// Name written into the `u` field of shares.
    #[serde(default = "default_username")]
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            store_dir: default_store_dir(),
            log_file: default_log_file(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_http_enabled(),
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

impl Default for MpvConfig {
    fn default() -> Self {
        Self {
            default_volume: default_volume(),
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            prefer_https: default_true(),
            listening_tick_secs: default_listening_tick_secs(),
        }
    }
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            starter_toml: default_starter_toml(),
            starter_m3u_url: String::new(),
        }
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            base_url: default_catalog_url(),
            timeout_secs: default_catalog_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

impl Default for ShareConfig {
    fn default() -> Self {
        Self {
            base_url: default_share_url(),
            username: default_username(),
        }
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
        }
    }
}

impl PlaybackConfig {
    pub fn listening_tick(&self) -> Duration {
        Duration::from_secs(self.listening_tick_secs.max(1))
    }
}

impl CatalogConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

impl FilterConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

fn default_store_dir() -> PathBuf {
    platform::store_dir()
}

fn default_log_file() -> PathBuf {
    platform::data_dir().join("daemon.log")
}

fn default_http_enabled() -> bool {
    true
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8989
}

fn default_volume() -> f32 {
    0.5
}

fn default_true() -> bool {
    true
}

fn default_listening_tick_secs() -> u64 {
    30
}

fn default_starter_toml() -> PathBuf {
    platform::config_dir().join("stations.toml")
}

fn default_catalog_url() -> String {
    crate::catalog::DEFAULT_BASE_URL.to_string()
}

fn default_catalog_timeout() -> u64 {
    10
}

fn default_user_agent() -> String {
    format!("radio-organizer/{}", env!("CARGO_PKG_VERSION"))
}

fn default_share_url() -> String {
    "https://radio.localhost/import".to_string()
}

fn default_username() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "listener".to_string())
}

fn default_debounce_ms() -> u64 {
    300
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&config_path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.http.enabled);
        assert_eq!(config.http.port, 8989);
        assert_eq!(config.http.bind_address, "127.0.0.1");
        assert!(config.playback.prefer_https);
        assert_eq!(config.playback.listening_tick(), Duration::from_secs(30));
        assert_eq!(config.filter.debounce(), Duration::from_millis(300));
        assert!(config.library.starter_m3u_url.is_empty());
        assert!(config.daemon.store_dir.ends_with("store"));
    }

    #[test]
    fn partial_file_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [playback]
            prefer_https = false

            [share]
            username = "sam"
            "#,
        )
        .unwrap();
        assert!(!config.playback.prefer_https);
        assert_eq!(config.playback.listening_tick_secs, 30);
        assert_eq!(config.share.username, "sam");
        assert!(config.share.base_url.starts_with("https://"));
        assert_eq!(config.catalog.timeout(), Duration::from_secs(10));
    }

    #[test]
    fn default_config_round_trips_through_toml() {
        let text = toml::to_string_pretty(&Config::default()).unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(back.http.port, 8989);
        assert_eq!(back.filter.debounce_ms, 300);
    }
}
