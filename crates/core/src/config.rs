//! Configuration loading: TOML file, environment overrides, validation.
//!
//! The account section is required; every other section falls back to
//! defaults. Overrides from `PETREL_*` environment variables are
//! applied after parsing and before validation, so a required field
//! may be supplied by the environment alone.

use std::env;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Log levels accepted in `[logging] level`.
pub const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Endpoint schemes accepted in `[server] scheme`.
const VALID_SCHEMES: &[&str] = &["ws", "wss"];

/// Starter configuration written by [`create_default_config`].
pub const DEFAULT_CONFIG_TOML: &str = r#"# Petrel client configuration.
#
# Required before first sign-in: account.jid, account.password and
# server.host. Everything else has working defaults.

[account]
# Bare JID of the account, e.g. "alice@example.com".
jid = ""
password = ""
# Optional telephony identity; recorded on the session, never dialed.
# telephony_jid = "tel_alice@example.com"

[server]
# "wss" for TLS (recommended) or "ws" for plaintext.
scheme = "wss"
host = ""
port = 443
# Seconds allowed for connect, send, and close operations.
timeout_seconds = 30

[logging]
# One of: trace, debug, info, warn, error.
level = "info"

[event_bus]
# Events buffered per domain before slow subscribers start lagging.
channel_capacity = 1024
"#;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found at {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid TOML at line {line}, column {column}: {message}")]
    InvalidToml {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("Missing required fields: {}", fields.join(", "))]
    MissingRequiredFields { fields: Vec<String> },

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub account: AccountConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub event_bus: EventBusConfig,
}

impl Config {
    /// Checks the invariants a config must satisfy before sign-in.
    /// Missing required fields are collected into a single error so a
    /// user can fix them all at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut missing = Vec::new();
        if self.account.jid.is_empty() {
            missing.push("account.jid".to_string());
        }
        if self.account.password.is_empty() {
            missing.push("account.password".to_string());
        }
        if self.server.host.is_empty() {
            missing.push("server.host".to_string());
        }
        if !missing.is_empty() {
            return Err(ConfigError::MissingRequiredFields { fields: missing });
        }
        if !VALID_SCHEMES.contains(&self.server.scheme.as_str()) {
            return Err(ConfigError::InvalidValue {
                field: "server.scheme".to_string(),
                message: format!(
                    "must be one of: {} (got \"{}\")",
                    VALID_SCHEMES.join(", "),
                    self.server.scheme
                ),
            });
        }
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::InvalidValue {
                field: "logging.level".to_string(),
                message: format!(
                    "must be one of: {} (got \"{}\")",
                    VALID_LOG_LEVELS.join(", "),
                    self.logging.level
                ),
            });
        }
        Ok(())
    }
}

/// The account this client signs in as.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountConfig {
    pub jid: String,
    pub password: String,
    pub telephony_jid: Option<String>,
}

/// Where the XMPP-over-WebSocket endpoint lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    /// Applied to connect, send, and close; receiving waits as long
    /// as the session is idle.
    pub timeout_seconds: u64,
}

impl ServerConfig {
    /// The endpoint URL. The `/websocket` path is fixed by the
    /// service contract.
    pub fn websocket_url(&self) -> String {
        format!("{}://{}:{}/websocket", self.scheme, self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            scheme: default_scheme(),
            host: String::new(),
            port: default_port(),
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    pub channel_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}

fn default_scheme() -> String {
    "wss".to_string()
}

fn default_port() -> u16 {
    443
}

fn default_timeout_seconds() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_channel_capacity() -> usize {
    1024
}

/// Values pulled from the environment that replace file values.
#[derive(Debug, Default)]
struct ConfigOverrides {
    jid: Option<String>,
    password: Option<String>,
    host: Option<String>,
    log_level: Option<String>,
}

impl ConfigOverrides {
    fn from_env() -> Self {
        Self {
            jid: env::var("PETREL_JID").ok(),
            password: env::var("PETREL_PASSWORD").ok(),
            host: env::var("PETREL_HOST").ok(),
            log_level: env::var("PETREL_LOG_LEVEL").ok(),
        }
    }
}

/// Default on-disk location of the config file, when the platform has
/// a config directory convention.
pub fn config_path() -> Option<PathBuf> {
    ProjectDirs::from("im", "petrel", "petrel")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Loads, overrides, and validates a configuration file.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.to_path_buf(),
        });
    }
    let contents = std::fs::read_to_string(path)?;
    load_config_from_str(&contents)
}

/// Like [`load_config`] but from an in-memory TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    load_config_from_str_with_overrides(toml_str, &ConfigOverrides::from_env())
}

fn load_config_from_str_with_overrides(
    toml_str: &str,
    overrides: &ConfigOverrides,
) -> Result<Config, ConfigError> {
    let mut config: Config = toml::from_str(toml_str).map_err(|e| {
        let (line, column) = e
            .span()
            .map_or((0, 0), |span| position_of(toml_str, span.start));
        ConfigError::InvalidToml {
            line,
            column,
            message: e.message().to_string(),
        }
    })?;
    apply_overrides(&mut config, overrides);
    config.validate()?;
    Ok(config)
}

fn apply_overrides(config: &mut Config, overrides: &ConfigOverrides) {
    if let Some(jid) = &overrides.jid {
        config.account.jid = jid.clone();
    }
    if let Some(password) = &overrides.password {
        config.account.password = password.clone();
    }
    if let Some(host) = &overrides.host {
        config.server.host = host.clone();
    }
    if let Some(level) = &overrides.log_level {
        config.logging.level = level.clone();
    }
}

fn position_of(source: &str, offset: usize) -> (usize, usize) {
    let clamped = offset.min(source.len());
    let mut line = 1;
    let mut column = 1;
    for c in source[..clamped].chars() {
        if c == '\n' {
            line += 1;
            column = 1;
        } else {
            column += 1;
        }
    }
    (line, column)
}

/// Writes the starter config file unless one already exists.
pub fn create_default_config(path: &Path) -> Result<(), ConfigError> {
    if path.exists() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, DEFAULT_CONFIG_TOML)?;
    Ok(())
}
