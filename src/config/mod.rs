//! Configuration management

use anyhow::Result;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::bluos::{FetchRetry, LongPoll, Player, PollSettings, DEFAULT_PLAYER_PORT};
use crate::lastfm::{LastFmCredentials, DEFAULT_BASE_URL};
use crate::scrobbler::{ScrobbleThreshold, ScrobblerOptions, SubmitRetry};

/// Config directory name under the platform config root
const APP_DIR_NAME: &str = "bluos-scrobbler";

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("lastfm.api_key is not set")]
    MissingApiKey,

    #[error("lastfm.api_secret is not set")]
    MissingApiSecret,

    #[error("scrobble.threshold must be in (0, 1], got {0}")]
    InvalidThreshold(f64),

    #[error("scrobble.fallback_track_length_secs must be positive, got {0}")]
    InvalidFallbackLength(f64),

    #[error("polling.long_poll_timeout_secs must be positive")]
    ZeroLongPollTimeout,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub lastfm: LastFmConfig,

    #[serde(default)]
    pub session: SessionConfig,

    /// Static players. Empty means discover them with LSDP.
    #[serde(default)]
    pub players: Vec<PlayerConfig>,

    #[serde(default)]
    pub polling: PollingConfig,

    #[serde(default)]
    pub scrobble: ScrobbleConfig,

    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// `stdout` or a file path
    #[serde(default = "default_log_destination")]
    pub destination: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            destination: default_log_destination(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_destination() -> String {
    "stdout".to_string()
}

/// Where log output goes
#[derive(Debug, Clone, PartialEq)]
pub enum LogDestination {
    Stdout,
    File(PathBuf),
}

impl LogConfig {
    pub fn destination(&self) -> LogDestination {
        if self.destination.is_empty() || self.destination == "stdout" {
            LogDestination::Stdout
        } else {
            LogDestination::File(PathBuf::from(&self.destination))
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LastFmConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
    #[serde(default = "default_lastfm_base_url")]
    pub base_url: String,
}

impl Default for LastFmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_secret: String::new(),
            base_url: default_lastfm_base_url(),
        }
    }
}

fn default_lastfm_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

impl LastFmConfig {
    pub fn credentials(&self) -> LastFmCredentials {
        LastFmCredentials {
            api_key: self.api_key.clone(),
            api_secret: self.api_secret.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionConfig {
    pub file_path: Option<PathBuf>,
}

impl SessionConfig {
    /// Session key file, `<config dir>/session` unless configured
    pub fn file_path(&self) -> PathBuf {
        self.file_path
            .clone()
            .unwrap_or_else(|| get_config_dir().join("session"))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PlayerConfig {
    pub host: String,
    #[serde(default = "default_player_port")]
    pub port: u16,
}

fn default_player_port() -> u16 {
    DEFAULT_PLAYER_PORT
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_long_poll_timeout")]
    pub long_poll_timeout_secs: u64,
    #[serde(default = "default_request_timeout_margin")]
    pub request_timeout_margin_secs: u64,
    #[serde(default = "default_poll_retry_delay")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_idle_delay")]
    pub idle_delay_secs: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            long_poll_timeout_secs: default_long_poll_timeout(),
            request_timeout_margin_secs: default_request_timeout_margin(),
            retry_delay_secs: default_poll_retry_delay(),
            idle_delay_secs: default_idle_delay(),
        }
    }
}

fn default_long_poll_timeout() -> u64 {
    100
}

fn default_request_timeout_margin() -> u64 {
    2
}

fn default_poll_retry_delay() -> u64 {
    10
}

fn default_idle_delay() -> u64 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScrobbleConfig {
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    #[serde(default = "default_fallback_track_length")]
    pub fallback_track_length_secs: f64,
    #[serde(default = "default_scrobble_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_scrobble_retry_delay")]
    pub retry_delay_secs: u64,
}

impl Default for ScrobbleConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            fallback_track_length_secs: default_fallback_track_length(),
            retry_count: default_scrobble_retry_count(),
            retry_delay_secs: default_scrobble_retry_delay(),
        }
    }
}

fn default_threshold() -> f64 {
    0.5
}

fn default_fallback_track_length() -> f64 {
    90.0
}

fn default_scrobble_retry_count() -> u32 {
    5
}

fn default_scrobble_retry_delay() -> u64 {
    20
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_query_interval")]
    pub query_interval_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            query_interval_secs: default_query_interval(),
        }
    }
}

fn default_query_interval() -> u64 {
    60
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lastfm.api_key.trim().is_empty() {
            return Err(ConfigError::MissingApiKey);
        }
        if self.lastfm.api_secret.trim().is_empty() {
            return Err(ConfigError::MissingApiSecret);
        }
        let threshold = self.scrobble.threshold;
        if threshold.is_nan() || threshold <= 0.0 || threshold > 1.0 {
            return Err(ConfigError::InvalidThreshold(threshold));
        }
        let fallback = self.scrobble.fallback_track_length_secs;
        if fallback.is_nan() || fallback <= 0.0 {
            return Err(ConfigError::InvalidFallbackLength(fallback));
        }
        if self.polling.long_poll_timeout_secs == 0 {
            return Err(ConfigError::ZeroLongPollTimeout);
        }
        Ok(())
    }

    pub fn static_players(&self) -> Vec<Player> {
        let mut players: Vec<Player> = self
            .players
            .iter()
            .map(|p| Player::new(p.host.clone(), p.port))
            .collect();
        players.sort();
        players.dedup();
        players
    }

    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            long_poll: LongPoll {
                timeout: Duration::from_secs(self.polling.long_poll_timeout_secs),
                request_margin: Duration::from_secs(self.polling.request_timeout_margin_secs),
            },
            retry: FetchRetry {
                delay: Duration::from_secs(self.polling.retry_delay_secs),
            },
            idle_delay: Duration::from_secs(self.polling.idle_delay_secs),
        }
    }

    pub fn scrobble_threshold(&self) -> ScrobbleThreshold {
        ScrobbleThreshold {
            ratio: self.scrobble.threshold,
            fallback_track_length: self.scrobble.fallback_track_length_secs,
        }
    }

    pub fn submit_retry(&self) -> SubmitRetry {
        SubmitRetry {
            max_retries: self.scrobble.retry_count,
            delay: Duration::from_secs(self.scrobble.retry_delay_secs),
        }
    }

    pub fn scrobbler_options(&self) -> ScrobblerOptions {
        ScrobblerOptions {
            poll: self.poll_settings(),
            threshold: self.scrobble_threshold(),
            submit_retry: self.submit_retry(),
        }
    }

    pub fn discovery_query_interval(&self) -> Duration {
        Duration::from_secs(self.discovery.query_interval_secs.max(1))
    }
}

/// Get config directory (BLU_SCROBBLER_CONFIG_DIR, XDG_CONFIG_HOME or
/// platform default)
pub fn get_config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("BLU_SCROBBLER_CONFIG_DIR") {
        return PathBuf::from(dir);
    }

    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library/Application Support")
                .join(APP_DIR_NAME);
        }
    }

    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
            return PathBuf::from(xdg).join(APP_DIR_NAME);
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".config").join(APP_DIR_NAME);
        }
    }

    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join(APP_DIR_NAME);
        }
    }

    PathBuf::from(".")
}

pub fn load_config() -> Result<Config> {
    let config_dir = get_config_dir();

    let mut builder = ::config::Config::builder()
        .set_default("log.level", default_log_level())?
        .set_default("log.destination", default_log_destination())?
        // Load from config file if it exists
        .add_source(
            ::config::File::with_name(&config_dir.join("config").to_string_lossy()).required(false),
        )
        // Override with environment variables (BLU_LASTFM__API_KEY, BLU_SCROBBLE__THRESHOLD, etc.)
        .add_source(
            ::config::Environment::with_prefix("BLU")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    // Flat variables kept from earlier releases win over everything else
    let legacy = [
        ("LOG_LEVEL", "log.level"),
        ("LOG_DEST", "log.destination"),
        ("LAST_FM_API_KEY", "lastfm.api_key"),
        ("LAST_FM_API_SECRET", "lastfm.api_secret"),
        ("SESSION_FILE", "session.file_path"),
    ];
    for (var, key) in legacy {
        if let Ok(value) = std::env::var(var) {
            builder = builder.set_override(key, value)?;
        }
    }

    let mut config: Config = builder.build()?.try_deserialize()?;

    // BLUOS_IP pins a single player and turns discovery off
    if let Ok(host) = std::env::var("BLUOS_IP") {
        let port = std::env::var("BLUOS_PORT")
            .ok()
            .and_then(|p| p.parse::<u16>().ok())
            .unwrap_or(DEFAULT_PLAYER_PORT);
        config.players = vec![PlayerConfig { host, port }];
    }

    Ok(config)
}
