//! Configuration management for the shellmux agent.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/shellmux/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("data channel fds must be >= 3 (0-2 carry the control channel), got {0}")]
    InvalidDataFd(i32),

    #[error("data_in_fd and data_out_fd must differ, both are {0}")]
    SharedDataFd(i32),

    #[error("max_payload_size must be between 1024 and 4294967295, got {0}")]
    InvalidMaxPayloadSize(usize),

    #[error("input_queue_capacity must be between 1 and 65536, got {0}")]
    InvalidQueueCapacity(usize),

    #[error("read_buffer_size must be between 64 and 65536, got {0}")]
    InvalidReadBufferSize(usize),

    #[error("read_buffer_size {read_buffer_size} exceeds max_payload_size {max_payload_size}")]
    ReadBufferExceedsPayload {
        read_buffer_size: usize,
        max_payload_size: usize,
    },

    #[error("default terminal size must be positive, got {cols}x{rows}")]
    InvalidTerminalSize { cols: u16, rows: u16 },

    #[error("term must not be empty")]
    EmptyTerm,

    #[error("server_banner_markers must not be empty while verify_server_banner is set")]
    NoBannerMarkers,

    #[error("trust_overlay is off but no host_key_fingerprints are configured")]
    NoPinnedHostKeys,
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the shellmux agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General agent configuration.
    pub agent: AgentConfig,

    /// Data channel configuration.
    pub channels: ChannelConfig,

    /// Remote shell session configuration.
    pub shell: ShellConfig,

    /// Trust settings for remote SSH servers.
    pub trust: TrustConfig,
}

/// General agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// Data channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChannelConfig {
    /// Inherited descriptor carrying frames from the controller.
    pub data_in_fd: i32,

    /// Inherited descriptor carrying frames to the controller.
    pub data_out_fd: i32,

    /// Largest frame payload accepted on the data channel.
    pub max_payload_size: usize,
}

/// Remote shell session configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ShellConfig {
    /// Terminal type requested for the remote pty.
    pub term: String,

    /// Columns used when no resize arrived before the pty request.
    pub default_cols: u16,

    /// Rows used when no resize arrived before the pty request.
    pub default_rows: u16,

    /// Input chunks buffered per session before the data channel waits.
    pub input_queue_capacity: usize,

    /// Size of each stdout/stderr read, and so the largest outbound payload.
    pub read_buffer_size: usize,
}

/// Trust settings for remote SSH servers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrustConfig {
    /// Accept any SSH host key because the transport runs inside an
    /// already-authenticated private overlay network.
    pub trust_overlay: bool,

    /// Require the server identification line to contain one of
    /// `server_banner_markers`.
    pub verify_server_banner: bool,

    /// Substrings identifying a compatible SSH server implementation.
    pub server_banner_markers: Vec<String>,

    /// Accepted SHA-256 host key fingerprints when `trust_overlay` is off.
    pub host_key_fingerprints: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            data_in_fd: 3,
            data_out_fd: 4,
            max_payload_size: protocol::DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            term: "xterm-256color".to_string(),
            default_cols: 80,
            default_rows: 24,
            input_queue_capacity: 256,
            read_buffer_size: 1024,
        }
    }
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            trust_overlay: true,
            verify_server_banner: true,
            server_banner_markers: vec!["Tailscale".to_string()],
            host_key_fingerprints: Vec::new(),
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("shellmux")
        .join("config.toml")
}

/// Parse a boolean environment value the way shell users write them.
fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - SHELLMUX_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - SHELLMUX_DEBUG: When true, force the log level to debug
    /// - SHELLMUX_TRUST_OVERLAY: Override `trust.trust_overlay`
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("SHELLMUX_LOG_LEVEL") {
            if !level.is_empty() {
                self.agent.log_level = level;
            }
        }

        if let Ok(debug) = std::env::var("SHELLMUX_DEBUG") {
            if parse_bool(&debug) == Some(true) {
                self.agent.log_level = "debug".to_string();
            }
        }

        if let Ok(trust) = std::env::var("SHELLMUX_TRUST_OVERLAY") {
            if let Some(trust) = parse_bool(&trust) {
                self.trust.trust_overlay = trust;
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Validate log_level is a known value
        let level = self.agent.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.agent.log_level.clone()));
        }

        // Validate data channel descriptors
        for fd in [self.channels.data_in_fd, self.channels.data_out_fd] {
            if fd < 3 {
                return Err(ConfigError::InvalidDataFd(fd));
            }
        }
        if self.channels.data_in_fd == self.channels.data_out_fd {
            return Err(ConfigError::SharedDataFd(self.channels.data_in_fd));
        }

        // Validate max_payload_size: must fit in u32
        let max_payload = self.channels.max_payload_size;
        if !(1024..=u32::MAX as usize).contains(&max_payload) {
            return Err(ConfigError::InvalidMaxPayloadSize(max_payload));
        }

        // Validate session buffers
        if !(1..=65536).contains(&self.shell.input_queue_capacity) {
            return Err(ConfigError::InvalidQueueCapacity(
                self.shell.input_queue_capacity,
            ));
        }
        if !(64..=65536).contains(&self.shell.read_buffer_size) {
            return Err(ConfigError::InvalidReadBufferSize(self.shell.read_buffer_size));
        }
        // Each output read becomes one frame
        if self.shell.read_buffer_size > max_payload {
            return Err(ConfigError::ReadBufferExceedsPayload {
                read_buffer_size: self.shell.read_buffer_size,
                max_payload_size: max_payload,
            });
        }

        // Validate terminal defaults
        if self.shell.default_cols == 0 || self.shell.default_rows == 0 {
            return Err(ConfigError::InvalidTerminalSize {
                cols: self.shell.default_cols,
                rows: self.shell.default_rows,
            });
        }
        if self.shell.term.trim().is_empty() {
            return Err(ConfigError::EmptyTerm);
        }

        // Validate trust settings
        if self.trust.verify_server_banner && self.trust.server_banner_markers.is_empty() {
            return Err(ConfigError::NoBannerMarkers);
        }
        if !self.trust.trust_overlay && self.trust.host_key_fingerprints.is_empty() {
            return Err(ConfigError::NoPinnedHostKeys);
        }

        Ok(())
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
    ///
    /// The default path is `~/.config/shellmux/config.toml`.
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

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
