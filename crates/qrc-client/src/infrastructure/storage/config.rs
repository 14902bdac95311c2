//! TOML configuration for the QRC client.
//!
//! Read from the platform-appropriate file unless a path is given explicitly:
//! - Windows:  `%APPDATA%\QrcClient\config.toml`
//! - Linux:    `~/.config/qrc-client/config.toml`
//! - macOS:    `~/Library/Application Support/QrcClient/config.toml`
//!
//! Example:
//!
//! ```toml
//! [core]
//! host = "192.168.1.50"
//! port = 1710
//! redundant_host = "192.168.1.51"
//!
//! [credentials]
//! username = "operator"
//! password = "1234"
//!
//! [session]
//! request_timeout_secs = 5
//! idle_threshold_secs = 45
//! ```
//!
//! Every field has a default, so a missing file or a partial file both work.

use std::path::{Path, PathBuf};
use std::time::Duration;

use qrc_core::protocol::DEFAULT_PORT;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::infrastructure::network::{ConnectionConfig, KeepAlive};

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A value parsed but cannot be used.
    #[error("invalid config: {0}")]
    Invalid(String),
}

// ── Config schema types ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub core: CoreConfig,
    #[serde(default)]
    pub credentials: Credentials,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where the Core lives.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoreConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Backup Core of a redundant pair, tried when `host` is unreachable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redundant_host: Option<String>,
}

/// `Logon` credentials.  Absent on Cores with access control disabled.
#[derive(Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Credentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Timing of the session.  All values in seconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,
    #[serde(default = "default_idle_threshold_secs")]
    pub idle_threshold_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// `tracing` filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_request_timeout_secs() -> u64 {
    5
}
fn default_keepalive_interval_secs() -> u64 {
    5
}
fn default_idle_threshold_secs() -> u64 {
    45
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            redundant_host: None,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
            keepalive_interval_secs: default_keepalive_interval_secs(),
            idle_threshold_secs: default_idle_threshold_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl AppConfig {
    /// Rejects values that would make the session unusable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for an empty host or a zero duration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.core.host.trim().is_empty() {
            return Err(ConfigError::Invalid("core.host must not be empty".to_string()));
        }
        let session = &self.session;
        for (name, value) in [
            ("request_timeout_secs", session.request_timeout_secs),
            ("keepalive_interval_secs", session.keepalive_interval_secs),
            ("idle_threshold_secs", session.idle_threshold_secs),
            ("connect_timeout_secs", session.connect_timeout_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("session.{name} must be at least 1")));
            }
        }
        Ok(())
    }

    /// Connection settings for `host`, which is either the primary or the
    /// redundant Core.
    pub fn connection_config_for(&self, host: &str) -> ConnectionConfig {
        let session = &self.session;
        ConnectionConfig {
            host: host.to_string(),
            port: self.core.port,
            connect_timeout: Duration::from_secs(session.connect_timeout_secs),
            request_timeout: Duration::from_secs(session.request_timeout_secs),
            keepalive: KeepAlive {
                check_interval: Duration::from_secs(session.keepalive_interval_secs),
                idle_threshold: Duration::from_secs(session.idle_threshold_secs),
            },
            ..ConnectionConfig::default()
        }
    }

    /// Connection settings for the primary Core.
    pub fn connection_config(&self) -> ConnectionConfig {
        self.connection_config_for(&self.core.host)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.session.request_timeout_secs)
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Determines the platform-appropriate directory for the config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] when the base directory cannot
/// be determined from the environment.
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    platform_config_dir().ok_or(ConfigError::NoPlatformConfigDir)
}

pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.toml"))
}

/// Loads the config from the platform location, or defaults if absent.
///
/// # Errors
///
/// See [`load_config_from`].
pub fn load_config() -> Result<AppConfig, ConfigError> {
    load_config_from(&config_file_path()?)
}

/// Loads and validates the config at `path`, returning defaults when the
/// file does not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// [`ConfigError::Parse`] for malformed TOML and [`ConfigError::Invalid`] for
/// unusable values.
pub fn load_config_from(path: &Path) -> Result<AppConfig, ConfigError> {
    let config = match std::fs::read_to_string(path) {
        Ok(content) => toml::from_str::<AppConfig>(&content)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppConfig::default(),
        Err(source) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    config.validate()?;
    Ok(config)
}

/// Writes `config` to `path`, creating parent directories as needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config_to(config: &AppConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("QrcClient"))
    }

    #[cfg(target_os = "linux")]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("qrc-client"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("QrcClient")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
