//! Configuration management for the muxcast daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/muxcast/config.toml`.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::RegistryConfig;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("bind_addr must be a socket address like 127.0.0.1:7681, got {0}")]
    InvalidBindAddr(String),

    #[error("path_prefix must start with '/', got {0}")]
    InvalidPathPrefix(String),

    #[error("grace_period_secs must be between 1 and 86400, got {0}")]
    InvalidGracePeriod(u64),

    #[error("write_timeout_ms must be greater than 0, got {0}")]
    InvalidWriteTimeout(u64),

    #[error("default terminal size must be non-zero, got {0}x{1}")]
    InvalidTerminalSize(u16, u16),

    #[error("max_sessions must be between 1 and 10000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("history lines must be between 1 and 100000, got {0}")]
    InvalidHistoryLines(usize),

    #[error("capture_timeout_ms must be between 1 and 30000, got {0}")]
    InvalidCaptureTimeout(u64),

    #[error("tmux binary not found: {0}")]
    InvalidTmuxBinary(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the muxcast daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// Viewer listener configuration.
    pub server: ServerConfig,

    /// Session engine configuration.
    pub session: SessionConfig,

    /// Scrollback replay configuration.
    pub history: HistoryConfig,

    /// Per-session output logs.
    pub logging: LoggingConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory for daemon data (logs, session logs).
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Also write daemon logs to a daily file under `<data_dir>/logs`.
    pub log_file: bool,
}

/// Viewer listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the WebSocket listener binds to.
    pub bind_addr: String,

    /// Path prefix under which sessions are addressed.
    pub path_prefix: String,
}

/// Session engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// tmux executable.
    pub tmux_binary: String,

    /// Working directory when a viewer gives no usable hint.
    pub default_cwd: Option<PathBuf>,

    /// Seconds a session outlives its last viewer.
    pub grace_period_secs: u64,

    /// Milliseconds a viewer may take to accept one frame before eviction.
    pub write_timeout_ms: u64,

    /// Columns of newly attached sessions.
    pub default_cols: u16,

    /// Rows of newly attached sessions.
    pub default_rows: u16,

    /// Maximum number of concurrently attached sessions.
    pub max_sessions: usize,
}

/// Scrollback replay configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HistoryConfig {
    /// Replay scrollback to new viewers.
    pub enabled: bool,

    /// Lines of scrollback captured.
    pub lines: usize,

    /// Timeout of each capture attempt in milliseconds.
    pub capture_timeout_ms: u64,
}

/// Per-session output log configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Initial logging state of new sessions.
    pub enabled_by_default: bool,

    /// Directory for session logs. Defaults to `<data_dir>/session-logs`.
    pub log_dir: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
            log_file: false,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:7681".to_string(),
            path_prefix: "/sessions".to_string(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tmux_binary: "tmux".to_string(),
            default_cwd: None,
            grace_period_secs: 30,
            write_timeout_ms: 10_000,
            default_cols: 80,
            default_rows: 24,
            max_sessions: 64,
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            lines: 1000,
            capture_timeout_ms: 2000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled_by_default: true,
            log_dir: None,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("muxcast")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("muxcast")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - MUXCAST_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - MUXCAST_BIND_ADDR: Override the listener address
    /// - MUXCAST_TMUX_BINARY: Override the tmux executable
    pub fn apply_env_overrides(&mut self) {
        if let Some(level) = non_empty_env("MUXCAST_LOG_LEVEL") {
            tracing::info!("Overriding log_level from environment: {}", level);
            self.daemon.log_level = level;
        }

        if let Some(addr) = non_empty_env("MUXCAST_BIND_ADDR") {
            tracing::info!("Overriding bind_addr from environment: {}", addr);
            self.server.bind_addr = addr;
        }

        if let Some(binary) = non_empty_env("MUXCAST_TMUX_BINARY") {
            tracing::info!("Overriding tmux_binary from environment: {}", binary);
            self.session.tmux_binary = binary;
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        if self.server.bind_addr.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::InvalidBindAddr(self.server.bind_addr.clone()));
        }

        if !self.server.path_prefix.starts_with('/') {
            return Err(ConfigError::InvalidPathPrefix(self.server.path_prefix.clone()));
        }

        let session = &self.session;
        if session.grace_period_secs == 0 || session.grace_period_secs > 86_400 {
            return Err(ConfigError::InvalidGracePeriod(session.grace_period_secs));
        }

        if session.write_timeout_ms == 0 {
            return Err(ConfigError::InvalidWriteTimeout(session.write_timeout_ms));
        }

        if session.default_cols == 0 || session.default_rows == 0 {
            return Err(ConfigError::InvalidTerminalSize(
                session.default_cols,
                session.default_rows,
            ));
        }

        if session.max_sessions == 0 || session.max_sessions > 10_000 {
            return Err(ConfigError::InvalidMaxSessions(session.max_sessions));
        }

        if self.history.lines == 0 || self.history.lines > 100_000 {
            return Err(ConfigError::InvalidHistoryLines(self.history.lines));
        }

        if self.history.capture_timeout_ms == 0 || self.history.capture_timeout_ms > 30_000 {
            return Err(ConfigError::InvalidCaptureTimeout(
                self.history.capture_timeout_ms,
            ));
        }

        // Absolute paths must exist; bare names are looked up on PATH.
        let binary = Path::new(&session.tmux_binary);
        let found = if binary.is_absolute() {
            binary.exists()
        } else {
            which::which(&session.tmux_binary).is_ok()
        };
        if !found {
            return Err(ConfigError::InvalidTmuxBinary(session.tmux_binary.clone()));
        }

        Ok(())
    }

    /// The listener address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.server
            .bind_addr
            .parse()
            .with_context(|| format!("Invalid bind address: {}", self.server.bind_addr))
    }

    /// Directory for per-session output logs.
    pub fn session_log_dir(&self) -> PathBuf {
        self.logging
            .log_dir
            .clone()
            .unwrap_or_else(|| self.daemon.data_dir.join("session-logs"))
    }

    /// Directory for daemon log files.
    pub fn daemon_log_dir(&self) -> PathBuf {
        self.daemon.data_dir.join("logs")
    }

    /// Per-viewer write timeout.
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.session.write_timeout_ms)
    }

    /// Timeout of each scrollback capture attempt.
    pub fn capture_timeout(&self) -> Duration {
        Duration::from_millis(self.history.capture_timeout_ms)
    }

    /// Registry settings derived from this configuration.
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            grace_period: Duration::from_secs(self.session.grace_period_secs),
            write_timeout: self.write_timeout(),
            default_cols: self.session.default_cols,
            default_rows: self.session.default_rows,
            max_sessions: self.session.max_sessions,
            history_enabled: self.history.enabled,
            history_lines: self.history.lines,
            capture_timeout: self.capture_timeout(),
            logging_enabled_by_default: self.logging.enabled_by_default,
            log_dir: self.session_log_dir(),
        }
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.is_empty())
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    /// A config that validates on hosts without tmux.
    fn valid_config() -> Config {
        let mut config = Config::default();
        config.session.tmux_binary = "/bin/sh".to_string();
        config
    }

    fn clear_env() {
        std::env::remove_var("MUXCAST_LOG_LEVEL");
        std::env::remove_var("MUXCAST_BIND_ADDR");
        std::env::remove_var("MUXCAST_TMUX_BINARY");
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.daemon.log_level, "info");
        assert!(!config.daemon.log_file);
        assert_eq!(config.server.bind_addr, "127.0.0.1:7681");
        assert_eq!(config.server.path_prefix, "/sessions");
        assert_eq!(config.session.tmux_binary, "tmux");
        assert_eq!(config.session.grace_period_secs, 30);
        assert_eq!(config.session.write_timeout_ms, 10_000);
        assert_eq!(config.session.max_sessions, 64);
        assert!(config.history.enabled);
        assert_eq!(config.history.lines, 1000);
        assert_eq!(config.history.capture_timeout_ms, 2000);
        assert!(config.logging.enabled_by_default);
        assert_eq!(config.logging.log_dir, None);
    }

    #[test]
    fn test_default_daemon_config() {
        let config = DaemonConfig::default();
        assert_eq!(config.log_level, "info");
        assert!(config.data_dir.to_string_lossy().contains("muxcast"));
    }

    #[test]
    fn test_from_toml_empty() {
        // Empty TOML should use all defaults
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[daemon]
log_level = "debug"

[session]
grace_period_secs = 5
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.daemon.log_level, "debug");
        assert_eq!(config.session.grace_period_secs, 5);
        // Other values should be defaults
        assert_eq!(config.session.max_sessions, 64);
        assert_eq!(config.server.bind_addr, "127.0.0.1:7681");
    }

    #[test]
    fn test_from_toml_full() {
        let toml = r#"
[daemon]
data_dir = "/custom/data"
log_level = "trace"
log_file = true

[server]
bind_addr = "0.0.0.0:9000"
path_prefix = "/tty"

[session]
tmux_binary = "/usr/local/bin/tmux"
default_cwd = "/srv"
grace_period_secs = 60
write_timeout_ms = 2500
default_cols = 120
default_rows = 40
max_sessions = 8

[history]
enabled = false
lines = 200
capture_timeout_ms = 500

[logging]
enabled_by_default = false
log_dir = "/var/log/muxcast"
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.daemon.data_dir, PathBuf::from("/custom/data"));
        assert_eq!(config.daemon.log_level, "trace");
        assert!(config.daemon.log_file);
        assert_eq!(config.server.bind_addr, "0.0.0.0:9000");
        assert_eq!(config.server.path_prefix, "/tty");
        assert_eq!(config.session.tmux_binary, "/usr/local/bin/tmux");
        assert_eq!(config.session.default_cwd, Some(PathBuf::from("/srv")));
        assert_eq!(config.session.grace_period_secs, 60);
        assert_eq!(config.session.write_timeout_ms, 2500);
        assert_eq!(config.session.default_cols, 120);
        assert_eq!(config.session.default_rows, 40);
        assert_eq!(config.session.max_sessions, 8);
        assert!(!config.history.enabled);
        assert_eq!(config.history.lines, 200);
        assert_eq!(config.history.capture_timeout_ms, 500);
        assert!(!config.logging.enabled_by_default);
        assert_eq!(config.logging.log_dir, Some(PathBuf::from("/var/log/muxcast")));
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let toml = r#"
[daemon
log_level = "debug"
"#;
        let result = Config::from_toml(toml);
        assert!(result.is_err());
        let err = result.unwrap_err().to_string();
        assert!(err.contains("Invalid TOML"));
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let toml = r#"
[session]
max_sessions = "not a number"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let toml = r#"
[daemon]
log_level = "warn"
future_option = true

[unknown_section]
key = "value"
"#;
        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.daemon.log_level, "warn");
    }

    #[test]
    fn test_to_toml() {
        let toml = Config::default().to_toml().unwrap();

        assert!(toml.contains("[daemon]"));
        assert!(toml.contains("[server]"));
        assert!(toml.contains("[session]"));
        assert!(toml.contains("[history]"));
        assert!(toml.contains("[logging]"));
    }

    #[test]
    fn test_roundtrip() {
        let original = Config::default();
        let toml = original.to_toml().unwrap();
        assert_eq!(Config::from_toml(&toml).unwrap(), original);
    }

    #[test]
    fn test_roundtrip_custom() {
        let mut original = Config::default();
        original.daemon.log_level = "warn".to_string();
        original.session.default_cwd = Some(PathBuf::from("/work"));
        original.logging.log_dir = Some(PathBuf::from("/logs"));
        original.history.enabled = false;

        let toml = original.to_toml().unwrap();
        assert_eq!(Config::from_toml(&toml).unwrap(), original);
    }

    #[test]
    fn test_load_missing_file() {
        let config = Config::load("/nonexistent/path/config.toml").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.server.bind_addr = "127.0.0.1:9999".to_string();
        config.save(&path).unwrap();

        assert_eq!(Config::load(&path).unwrap(), config);
    }

    #[test]
    fn test_save_creates_directories() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("dir").join("config.toml");

        Config::default().save(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_load_invalid_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "this is [not valid toml").unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to parse config file"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.ends_with("muxcast/config.toml"));
    }

    #[test]
    fn test_derived_paths_and_durations() {
        let mut config = Config::default();
        config.daemon.data_dir = PathBuf::from("/data");

        assert_eq!(config.session_log_dir(), PathBuf::from("/data/session-logs"));
        assert_eq!(config.daemon_log_dir(), PathBuf::from("/data/logs"));

        config.logging.log_dir = Some(PathBuf::from("/elsewhere"));
        assert_eq!(config.session_log_dir(), PathBuf::from("/elsewhere"));

        assert_eq!(config.write_timeout(), Duration::from_secs(10));
        assert_eq!(config.capture_timeout(), Duration::from_secs(2));
        assert_eq!(
            config.bind_addr().unwrap(),
            "127.0.0.1:7681".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn test_registry_config() {
        let mut config = Config::default();
        config.session.grace_period_secs = 5;
        config.session.max_sessions = 3;
        config.history.enabled = false;
        config.logging.log_dir = Some(PathBuf::from("/logs"));

        let registry = config.registry_config();
        assert_eq!(registry.grace_period, Duration::from_secs(5));
        assert_eq!(registry.write_timeout, Duration::from_secs(10));
        assert_eq!(registry.max_sessions, 3);
        assert_eq!((registry.default_cols, registry.default_rows), (80, 24));
        assert!(!registry.history_enabled);
        assert_eq!(registry.history_lines, 1000);
        assert!(registry.logging_enabled_by_default);
        assert_eq!(registry.log_dir, PathBuf::from("/logs"));
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        clear_env();
        std::env::set_var("MUXCAST_LOG_LEVEL", "debug");
        std::env::set_var("MUXCAST_BIND_ADDR", "0.0.0.0:8080");
        std::env::set_var("MUXCAST_TMUX_BINARY", "/opt/tmux");

        let mut config = Config::default();
        config.apply_env_overrides();

        assert_eq!(config.daemon.log_level, "debug");
        assert_eq!(config.server.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.session.tmux_binary, "/opt/tmux");

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_override_empty_does_not_override() {
        clear_env();
        std::env::set_var("MUXCAST_LOG_LEVEL", "");
        std::env::set_var("MUXCAST_BIND_ADDR", "");

        let mut config = Config::default();
        config.apply_env_overrides();

        assert_eq!(config.daemon.log_level, "info");
        assert_eq!(config.server.bind_addr, "127.0.0.1:7681");

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_override_unset_does_not_override() {
        clear_env();

        let mut config = Config::default();
        config.apply_env_overrides();

        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_validate_default_config() {
        assert_eq!(valid_config().validate(), Ok(()));
    }

    #[test]
    fn test_validate_log_level() {
        for level in VALID_LOG_LEVELS {
            let mut config = valid_config();
            config.daemon.log_level = level.to_uppercase();
            assert!(config.validate().is_ok(), "{level} should be valid");
        }

        let mut config = valid_config();
        config.daemon.log_level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );
    }

    #[test]
    fn test_validate_bind_addr() {
        let mut config = valid_config();
        config.server.bind_addr = "localhost".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidBindAddr("localhost".to_string()))
        );

        config.server.bind_addr = "[::1]:7681".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_path_prefix() {
        let mut config = valid_config();
        config.server.path_prefix = "sessions".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidPathPrefix("sessions".to_string()))
        );
    }

    #[test]
    fn test_validate_grace_period_bounds() {
        let mut config = valid_config();
        config.session.grace_period_secs = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidGracePeriod(0)));

        config.session.grace_period_secs = 86_401;
        assert_eq!(config.validate(), Err(ConfigError::InvalidGracePeriod(86_401)));

        config.session.grace_period_secs = 1;
        assert!(config.validate().is_ok());
        config.session.grace_period_secs = 86_400;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_write_timeout_zero() {
        let mut config = valid_config();
        config.session.write_timeout_ms = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidWriteTimeout(0)));
    }

    #[test]
    fn test_validate_terminal_size() {
        let mut config = valid_config();
        config.session.default_rows = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidTerminalSize(80, 0)));
    }

    #[test]
    fn test_validate_max_sessions_bounds() {
        let mut config = valid_config();
        config.session.max_sessions = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxSessions(0)));

        config.session.max_sessions = 10_001;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxSessions(10_001)));
    }

    #[test]
    fn test_validate_history_bounds() {
        let mut config = valid_config();
        config.history.lines = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidHistoryLines(0)));

        let mut config = valid_config();
        config.history.capture_timeout_ms = 30_001;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidCaptureTimeout(30_001))
        );
    }

    #[test]
    fn test_validate_tmux_binary() {
        let mut config = valid_config();
        config.session.tmux_binary = "/nonexistent/tmux".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidTmuxBinary("/nonexistent/tmux".to_string()))
        );

        config.session.tmux_binary = "definitely-not-a-real-binary-12345".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidTmuxBinary(_))
        ));

        config.session.tmux_binary = "sh".to_string();
        assert!(config.validate().is_ok());
    }
}
