use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Bounded waits applied to channel operations and connection setup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timeouts {
    /// Wait for a characteristic write acknowledgement.
    #[serde(default = "default_write_ack_ms")]
    pub write_ack_ms: u64,
    /// Wait for the data notification following an acknowledged write.
    #[serde(default = "default_response_ms")]
    pub response_ms: u64,
    /// Wait for the descriptor write during notification setup.
    #[serde(default = "default_descriptor_setup_ms")]
    pub descriptor_setup_ms: u64,
    /// Wait applied by callers to connect/ready/disconnect transitions.
    #[serde(default = "default_connect_ms")]
    pub connect_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            write_ack_ms: default_write_ack_ms(),
            response_ms: default_response_ms(),
            descriptor_setup_ms: default_descriptor_setup_ms(),
            connect_ms: default_connect_ms(),
        }
    }
}

impl Timeouts {
    pub fn write_ack(&self) -> Duration {
        Duration::from_millis(self.write_ack_ms)
    }
    pub fn response(&self) -> Duration {
        Duration::from_millis(self.response_ms)
    }
    pub fn descriptor_setup(&self) -> Duration {
        Duration::from_millis(self.descriptor_setup_ms)
    }
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }
}

fn default_write_ack_ms() -> u64 {
    10_000
}
fn default_response_ms() -> u64 {
    10_000
}
fn default_descriptor_setup_ms() -> u64 {
    3_000
}
fn default_connect_ms() -> u64 {
    4_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "simblee_ble".to_string()
}

/// Top-level settings for binaries built on the driver.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub timeouts: Timeouts,
    #[serde(default)]
    pub log_settings: LogSettings,
}

impl Settings {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let contents = serde_json::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Load from `path`, falling back to defaults if the file is absent
    /// or unreadable.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(path).unwrap_or_default()
    }
}
