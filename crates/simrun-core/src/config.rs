//! Configuration parsing for the run orchestrator.
//!
//! Plain `key=value` lines, `#` comments, optional quotes around values.
//! Precedence: CLI flags > `--config` file > `~/.config/simrun/config` > defaults.

use crate::types::RecordLimits;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
    #[error("{key} must not be empty")]
    EmptyValue { key: String },
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    // Output capture
    pub output_tail_lines: usize,
    pub marker_hit_limit: usize,
    pub io_capture_timeout_ms: u64,
    pub heartbeat_sec: u64,

    // Cancellation
    /// Time between the polite stop request and the forced kill.
    pub cancel_grace_ms: u64,

    // SSH
    /// Client command prefix, split on whitespace (e.g. `ssh` or `/usr/bin/ssh -F cfg`).
    pub ssh_command: Vec<String>,
    pub ssh_config_path: PathBuf,
    pub ssh_control_dir: PathBuf,
    pub ssh_connect_timeout_sec: u64,
    pub ssh_connect_retries: u32,
    pub ssh_idle_timeout_sec: u64,
    pub ssh_max_channels_per_session: usize,
    pub ssh_max_sessions_per_target: usize,
    pub ssh_strict_host_key_checking: bool,

    // Notifications
    pub mail_command: Vec<String>,
    pub ntfy_server: String,
    pub notify_timeout_sec: u64,
    pub notify_subject: String,
    /// Saved preference used when a submission names no channels.
    pub notification_file: Option<PathBuf>,

    // Registry
    pub retention_sec: u64,
    pub maintenance_interval_sec: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output_tail_lines: 200,
            marker_hit_limit: 50,
            io_capture_timeout_ms: 5000,
            heartbeat_sec: 30,
            cancel_grace_ms: 5000,
            ssh_command: vec!["ssh".to_string()],
            ssh_config_path: dirs::home_dir()
                .map_or_else(|| PathBuf::from("~/.ssh/config"), |h| h.join(".ssh/config")),
            ssh_control_dir: dirs::runtime_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("simrun-ssh"),
            ssh_connect_timeout_sec: 10,
            ssh_connect_retries: 1,
            ssh_idle_timeout_sec: 300,
            ssh_max_channels_per_session: 8,
            ssh_max_sessions_per_target: 2,
            ssh_strict_host_key_checking: false,
            mail_command: vec!["mail".to_string()],
            ntfy_server: "https://ntfy.sh".to_string(),
            notify_timeout_sec: 10,
            notify_subject: "Simulation run notification".to_string(),
            notification_file: None,
            retention_sec: 86_400,
            maintenance_interval_sec: 30,
        }
    }
}

impl Config {
    /// Default location: `~/.config/simrun/config`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("simrun").join("config"))
    }

    /// Defaults merged with the user config file, if one exists.
    pub fn load_default() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(path) = Self::default_path().filter(|p| p.is_file()) {
            config.load_file(&path)?;
        }
        Ok(config)
    }

    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    /// Parse config content (key=value format).
    pub fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();

            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let key = key.trim();
            let value = Self::unquote(value.trim());

            self.apply_value(key, &value)?;
        }
        Ok(())
    }

    /// Remove surrounding quotes from a value.
    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    /// Apply a single config value.
    fn apply_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "output_tail_lines" => self.output_tail_lines = Self::parse_int(key, value)?,
            "marker_hit_limit" => self.marker_hit_limit = Self::parse_int(key, value)?,
            "io_capture_timeout_ms" => self.io_capture_timeout_ms = Self::parse_int(key, value)?,
            "heartbeat_sec" => self.heartbeat_sec = Self::parse_int(key, value)?,
            "cancel_grace_ms" => self.cancel_grace_ms = Self::parse_int(key, value)?,
            "ssh_command" => self.ssh_command = Self::parse_command(key, value)?,
            "ssh_config_path" => self.ssh_config_path = expand_home(value),
            "ssh_control_dir" => self.ssh_control_dir = expand_home(value),
            "ssh_connect_timeout_sec" => {
                self.ssh_connect_timeout_sec = Self::parse_int(key, value)?;
            }
            "ssh_connect_retries" => self.ssh_connect_retries = Self::parse_int(key, value)?,
            "ssh_idle_timeout_sec" => self.ssh_idle_timeout_sec = Self::parse_int(key, value)?,
            "ssh_max_channels_per_session" => {
                self.ssh_max_channels_per_session = Self::parse_int(key, value)?;
            }
            "ssh_max_sessions_per_target" => {
                self.ssh_max_sessions_per_target = Self::parse_int(key, value)?;
            }
            "ssh_strict_host_key_checking" => {
                self.ssh_strict_host_key_checking = Self::parse_bool(key, value)?;
            }
            "mail_command" => self.mail_command = Self::parse_command(key, value)?,
            "ntfy_server" => self.ntfy_server = value.trim_end_matches('/').to_string(),
            "notify_timeout_sec" => self.notify_timeout_sec = Self::parse_int(key, value)?,
            "notify_subject" => self.notify_subject = value.to_string(),
            "notification_file" => {
                self.notification_file = if value.is_empty() {
                    None
                } else {
                    Some(expand_home(value))
                }
            }
            "retention_sec" => self.retention_sec = Self::parse_int(key, value)?,
            "maintenance_interval_sec" => {
                self.maintenance_interval_sec = Self::parse_int(key, value)?;
            }
            _ => {
                // Warn but don't fail for unknown keys
                eprintln!("Warning: unknown config key: {key}");
            }
        }
        Ok(())
    }

    fn parse_int<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    fn parse_command(key: &str, value: &str) -> Result<Vec<String>, ConfigError> {
        let parts: Vec<String> = value.split_whitespace().map(str::to_string).collect();
        if parts.is_empty() {
            return Err(ConfigError::EmptyValue {
                key: key.to_string(),
            });
        }
        Ok(parts)
    }

    fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
        match value.to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Ok(true),
            "false" | "0" | "no" | "n" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    pub fn record_limits(&self) -> RecordLimits {
        RecordLimits {
            tail_lines: self.output_tail_lines,
            marker_hits: self.marker_hit_limit,
        }
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    pub fn io_capture_timeout(&self) -> Duration {
        Duration::from_millis(self.io_capture_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_sec.max(1))
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_sec)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_sec.max(1))
    }
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_home(value: &str) -> PathBuf {
    match value.strip_prefix("~/") {
        Some(rest) => dirs::home_dir().map_or_else(|| PathBuf::from(value), |h| h.join(rest)),
        None if value == "~" => dirs::home_dir().unwrap_or_else(|| PathBuf::from(value)),
        None => PathBuf::from(value),
    }
}
