use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub discovery: DiscoveryConfig,
    pub recorder: RecorderConfig,
    pub hls: HlsConfig,
    pub follow: FollowConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// Broadcast-discovery API access
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Base URL of the channel-view endpoint; the channel slug is appended.
    pub api_base_url: String,
    pub request_timeout_seconds: u64,
    /// Display-name aliases mapped to API slugs, applied after lowercasing.
    pub aliases: std::collections::HashMap<String, String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://apicdn.mixlr.com/v3/channel_view/".to_string(),
            request_timeout_seconds: 15,
            aliases: std::collections::HashMap::new(),
        }
    }
}

impl DiscoveryConfig {
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Channel slugs monitored by default.
    pub channels: Vec<String>,
    pub recordings_dir: PathBuf,
    pub check_interval_seconds: u64,
    pub stalled_check_interval_seconds: u64,
    pub stalled_timeout_seconds: u64,
    /// Grace period after a stop signal before escalating to a force kill.
    pub stop_grace_seconds: u64,
    /// Capture tool invoked per live broadcast.
    pub capture_command: String,
    /// Duration probe used when listing finished recordings.
    pub probe_command: String,
    /// Suffixes tried in order (against the planned file's stem) to locate
    /// the file the capture tool is actually writing. The tool's naming is
    /// an external contract, so the order lives in configuration.
    pub candidate_suffixes: Vec<String>,
    /// Start the monitoring loops at boot.
    pub autostart: bool,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            channels: Vec::new(),
            recordings_dir: PathBuf::from("recordings"),
            check_interval_seconds: 60,
            stalled_check_interval_seconds: 30,
            stalled_timeout_seconds: 60,
            stop_grace_seconds: 10,
            capture_command: "yt-dlp".to_string(),
            probe_command: "ffprobe".to_string(),
            candidate_suffixes: vec![
                "aac".to_string(),
                "aac.part".to_string(),
                "mp3".to_string(),
                "mp3.part".to_string(),
                "webm".to_string(),
                "webm.part".to_string(),
                "m4a".to_string(),
                "m4a.part".to_string(),
                "mp4".to_string(),
                "mp4.part".to_string(),
                "unknown_video".to_string(),
                "unknown_video.part".to_string(),
            ],
            autostart: true,
        }
    }
}

impl RecorderConfig {
    #[must_use]
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_seconds)
    }

    #[must_use]
    pub fn stalled_check_interval(&self) -> Duration {
        Duration::from_secs(self.stalled_check_interval_seconds)
    }

    #[must_use]
    pub fn stalled_timeout(&self) -> Duration {
        Duration::from_secs(self.stalled_timeout_seconds)
    }

    #[must_use]
    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HlsConfig {
    pub root_dir: PathBuf,
    pub idle_timeout_seconds: u64,
    pub segment_seconds: u32,
    pub playlist_window: u32,
    /// How long to wait for the first playlist file before failing the session.
    pub playlist_timeout_millis: u64,
    pub playlist_poll_millis: u64,
    pub transcode_command: String,
}

impl Default for HlsConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("hls"),
            idle_timeout_seconds: 600,
            segment_seconds: 4,
            playlist_window: 12,
            playlist_timeout_millis: 8000,
            playlist_poll_millis: 200,
            transcode_command: "ffmpeg".to_string(),
        }
    }
}

impl HlsConfig {
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }

    #[must_use]
    pub fn playlist_timeout(&self) -> Duration {
        Duration::from_millis(self.playlist_timeout_millis)
    }

    #[must_use]
    pub fn playlist_poll(&self) -> Duration {
        Duration::from_millis(self.playlist_poll_millis)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FollowConfig {
    /// Idle window with no file growth before a follow stream is ended.
    pub idle_timeout_seconds: u64,
    /// Delay between growth checks once the reader has caught up.
    pub poll_interval_millis: u64,
}

impl Default for FollowConfig {
    fn default() -> Self {
        Self {
            idle_timeout_seconds: 300,
            poll_interval_millis: 800,
        }
    }
}

impl FollowConfig {
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_millis)
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        // Load config file if provided
        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // Override with environment variables (AIRCHECK_SERVER_HOST, etc.)
        builder = builder.add_source(
            Environment::with_prefix("AIRCHECK")
                .separator("_")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Get HTTP address
    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.server.port, 3000);
        assert!(!config.discovery.api_base_url.is_empty());
        assert_eq!(config.recorder.check_interval(), Duration::from_secs(60));
        assert_eq!(
            config.recorder.stalled_check_interval(),
            Duration::from_secs(30)
        );
        assert_eq!(config.recorder.stalled_timeout(), Duration::from_secs(60));
        assert_eq!(config.hls.idle_timeout(), Duration::from_secs(600));
        assert_eq!(config.hls.playlist_timeout(), Duration::from_millis(8000));
        assert_eq!(config.follow.idle_timeout(), Duration::from_secs(300));
        assert_eq!(config.follow.poll_interval(), Duration::from_millis(800));
    }

    #[test]
    fn test_candidate_suffix_order() {
        let config = RecorderConfig::default();
        let first: Vec<&str> = config
            .candidate_suffixes
            .iter()
            .take(4)
            .map(String::as_str)
            .collect();
        assert_eq!(first, ["aac", "aac.part", "mp3", "mp3.part"]);
        assert!(config
            .candidate_suffixes
            .contains(&"unknown_video.part".to_string()));
    }

    #[test]
    fn test_http_address() {
        let config = Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
            },
            ..Config::default()
        };
        assert_eq!(config.http_address(), "0.0.0.0:8080");
    }

    #[test]
    fn test_env_overlay_beats_file_and_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("aircheck.toml");
        std::fs::write(
            &file,
            "[server]\nhost = \"0.0.0.0\"\nport = 9999\n\n[recorder]\ncheck_interval_seconds = 120\n",
        )
        .unwrap();

        std::env::set_var("AIRCHECK_SERVER_PORT", "4123");
        let config = Config::load(file.to_str()).unwrap();
        std::env::remove_var("AIRCHECK_SERVER_PORT");

        // Env wins over the file, the file wins over defaults.
        assert_eq!(config.server.port, 4123);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.recorder.check_interval(), Duration::from_secs(120));
        assert_eq!(config.hls.idle_timeout(), Duration::from_secs(600));
    }
}
