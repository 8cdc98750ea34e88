//! Configuration file parser for ~/.config/podshelf/config.toml.
//!
//! The config file is optional: a missing file yields `Config::default()`.
//! Unknown keys are ignored by serde, though we log a warning when the file
//! contains potential typos.
use secrecy::SecretString;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::codec::Seconds;

/// Environment variable that overrides `[sync] password`.
pub const PASSWORD_ENV_VAR: &str = "PODSHELF_SYNC_PASSWORD";

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root directory for downloaded episodes. Defaults to `~/Podcasts`.
    pub library_dir: Option<PathBuf>,

    /// SQLite catalog location. Defaults to the data directory.
    pub database_path: Option<PathBuf>,

    /// Minutes after which a feed counts as stale.
    pub refresh_interval_minutes: u64,

    /// A playback report this close to the end marks the episode played.
    pub smart_mark_seconds: u32,

    pub sync: SyncConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            library_dir: None,
            database_path: None,
            refresh_interval_minutes: 60,
            smart_mark_seconds: 30,
            sync: SyncConfig::default(),
        }
    }
}

/// `[sync]` table: the remote subscription/episode-action service.
///
/// Custom Debug impl masks `password` to prevent secret leakage in logs,
/// error messages, and debug output.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub enabled: bool,

    /// Base URL of the service API, e.g. `https://sync.example.com/api/2`.
    pub server_url: Option<String>,

    pub username: Option<String>,

    /// Account password (alternative to the `PODSHELF_SYNC_PASSWORD` env
    /// var, which takes precedence).
    pub password: Option<String>,

    /// Identifies this installation to the service.
    pub device_id: String,

    /// Budget for one service call, retries and backoff included.
    pub timeout_secs: u64,

    /// Retries for 5xx and 429 responses.
    pub max_retries: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            server_url: None,
            username: None,
            password: None,
            device_id: "podshelf".to_string(),
            timeout_secs: 30,
            max_retries: 3,
        }
    }
}

impl std::fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncConfig")
            .field("enabled", &self.enabled)
            .field("server_url", &self.server_url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("device_id", &self.device_id)
            .field("timeout_secs", &self.timeout_secs)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

/// Resolved account credentials.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: SecretString,
}

impl SyncConfig {
    /// Username plus password, with the environment variable taking
    /// precedence over the file. `None` when either part is missing.
    pub fn credentials(&self) -> Option<Credentials> {
        self.credentials_with(std::env::var(PASSWORD_ENV_VAR).ok())
    }

    fn credentials_with(&self, env_password: Option<String>) -> Option<Credentials> {
        let username = self.username.clone().filter(|u| !u.is_empty())?;
        let password = env_password
            .filter(|p| !p.is_empty())
            .or_else(|| self.password.clone().filter(|p| !p.is_empty()))?;
        Some(Credentials {
            username,
            password: SecretString::from(password),
        })
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 5] = [
        "library_dir",
        "database_path",
        "refresh_interval_minutes",
        "smart_mark_seconds",
        "sync",
    ];

    const KNOWN_SYNC_KEYS: [&'static str; 7] = [
        "enabled",
        "server_url",
        "username",
        "password",
        "device_id",
        "timeout_secs",
        "max_retries",
    ];

    /// Default location: `$XDG_CONFIG_HOME/podshelf/config.toml`, falling
    /// back to `~/.config/podshelf/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        config_home().map(|dir| dir.join("podshelf").join("config.toml"))
    }

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        // Check file size before reading to prevent memory exhaustion
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File deleted between metadata and read
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            warn_unknown_keys(&raw);
        }

        let config: Config = toml::from_str(&content)?;
        tracing::info!(
            path = %path.display(),
            sync_enabled = config.sync.enabled,
            "Loaded configuration"
        );
        Ok(config)
    }

    /// `library_dir`, or `~/Podcasts`.
    pub fn library_dir(&self) -> PathBuf {
        self.library_dir
            .clone()
            .or_else(|| home_dir().map(|h| h.join("Podcasts")))
            .unwrap_or_else(|| PathBuf::from("Podcasts"))
    }

    /// `database_path`, or `$XDG_DATA_HOME/podshelf/library.db`.
    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .or_else(|| data_home().map(|d| d.join("podshelf").join("library.db")))
            .unwrap_or_else(|| PathBuf::from("podshelf.db"))
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_minutes.saturating_mul(60))
    }

    pub fn smart_mark(&self) -> Seconds {
        Seconds::new(self.smart_mark_seconds)
    }
}

fn warn_unknown_keys(raw: &toml::Table) {
    for key in raw.keys() {
        if !Config::KNOWN_KEYS.contains(&key.as_str()) {
            tracing::warn!(key = %key, "Unknown key in config file, ignoring");
        }
    }
    if let Some(toml::Value::Table(sync)) = raw.get("sync") {
        for key in sync.keys() {
            if !Config::KNOWN_SYNC_KEYS.contains(&key.as_str()) {
                tracing::warn!(key = %format!("sync.{key}"), "Unknown key in config file, ignoring");
            }
        }
    }
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .filter(|h| !h.is_empty())
        .map(PathBuf::from)
}

fn config_home() -> Option<PathBuf> {
    std::env::var_os("XDG_CONFIG_HOME")
        .filter(|d| !d.is_empty())
        .map(PathBuf::from)
        .or_else(|| home_dir().map(|h| h.join(".config")))
}

fn data_home() -> Option<PathBuf> {
    std::env::var_os("XDG_DATA_HOME")
        .filter(|d| !d.is_empty())
        .map(PathBuf::from)
        .or_else(|| home_dir().map(|h| h.join(".local").join("share")))
}

// ============================================================================
// Tests
// ============================================================================
