use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use super::platform;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub playback: PlaybackConfig,
    #[serde(default)]
    pub mpv: MpvConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// SQLite file holding the recents and favorites tables.
    #[serde(default = "default_db_file")]
    pub db_file: PathBuf,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_tcp_port")]
    pub port: u16,
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
pub struct PlaybackConfig {
    /// Seconds to wait for a stream to start before giving up.  Kept as a
    /// string because that is how settings UIs hand it over.
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: String,
    /// Keep the status indicator visible (offering replay) after stopping.
    #[serde(default = "default_true")]
    pub persistent_notification: bool,
    /// Treat a connection timeout as cancellation and stop the decoder.
    #[serde(default = "default_true")]
    pub stop_on_timeout: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MpvConfig {
    #[serde(default = "default_volume")]
    pub default_volume: f32,
}

impl PlaybackConfig {
    /// Parsed connection timeout.  Garbage or zero falls back to the default.
    pub fn connection_timeout(&self) -> Duration {
        match self.connection_timeout.trim().parse::<u64>() {
            Ok(secs) if secs > 0 => Duration::from_secs(secs),
            _ => {
                warn!(
                    "invalid connection_timeout {:?}, using {}s",
                    self.connection_timeout, DEFAULT_CONNECTION_TIMEOUT_SECS
                );
                Duration::from_secs(DEFAULT_CONNECTION_TIMEOUT_SECS)
            }
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            db_file: default_db_file(),
            bind_address: default_bind_address(),
            port: default_tcp_port(),
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

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            connection_timeout: default_connection_timeout(),
            persistent_notification: true,
            stop_on_timeout: true,
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

const DEFAULT_CONNECTION_TIMEOUT_SECS: u64 = 10;

fn default_db_file() -> PathBuf {
    platform::data_dir().join("streamer.db")
}

fn default_http_enabled() -> bool {
    true
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_tcp_port() -> u16 {
    platform::DAEMON_TCP_PORT
}

fn default_port() -> u16 {
    8990
}

fn default_connection_timeout() -> String {
    DEFAULT_CONNECTION_TIMEOUT_SECS.to_string()
}

fn default_true() -> bool {
    true
}

fn default_volume() -> f32 {
    1.0
}

impl Config {
    /// Load from the default location, writing a default file on first run.
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save_to(&config_path)?;
            return Ok(config);
        }

        Self::load_from(&config_path)
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
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
        assert_eq!(config.http.port, 8990);
        assert_eq!(config.daemon.bind_address, "127.0.0.1");
        assert_eq!(config.playback.connection_timeout(), Duration::from_secs(10));
        assert!(config.playback.persistent_notification);
        assert!(config.playback.stop_on_timeout);
        assert!(config.daemon.db_file.ends_with("streamer/streamer.db"));
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [playback]
            connection_timeout = " 4 "
            persistent_notification = false
            "#,
        )
        .unwrap();
        assert_eq!(config.playback.connection_timeout(), Duration::from_secs(4));
        assert!(!config.playback.persistent_notification);
        assert!(config.playback.stop_on_timeout);
        assert_eq!(config.http.port, 8990);
    }

    #[test]
    fn test_bad_timeout_falls_back() {
        for raw in ["", "abc", "0", "-3"] {
            let playback = PlaybackConfig {
                connection_timeout: raw.to_string(),
                ..PlaybackConfig::default()
            };
            assert_eq!(playback.connection_timeout(), Duration::from_secs(10), "{raw:?}");
        }
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = Config::default();
        config.playback.connection_timeout = "25".into();
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.playback.connection_timeout(), Duration::from_secs(25));
    }
}
