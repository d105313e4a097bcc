use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// How often per-application aggregates are flushed to the store, in seconds.
pub const DEFAULT_SAVE_INTERVAL_SECS: u64 = 30;
const MIN_SAVE_INTERVAL_SECS: u64 = 5;
const MAX_SAVE_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub logging: LogSettings,
    #[serde(default = "default_save_interval")]
    pub save_interval_seconds: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LogSettings {
    #[serde(default = "enabled")]
    pub enable_error: bool,
    #[serde(default = "enabled")]
    pub enable_warning: bool,
    #[serde(default = "enabled")]
    pub enable_info: bool,
    #[serde(default)]
    pub enable_debug: bool,
    #[serde(default)]
    pub enable_trace: bool,
    #[serde(default = "enabled")]
    pub enable_console: bool,
    #[serde(default)]
    pub enable_file: bool,
    #[serde(default)]
    pub log_file_path: Option<String>,
    #[serde(default = "enabled")]
    pub use_colors: bool,
}

fn enabled() -> bool {
    true
}

fn default_save_interval() -> u64 {
    DEFAULT_SAVE_INTERVAL_SECS
}

impl Default for LogSettings {
    fn default() -> Self {
        LogSettings {
            enable_error: true,
            enable_warning: true,
            enable_info: true,
            enable_debug: false,
            enable_trace: false,
            enable_console: true,
            enable_file: false,
            log_file_path: None,
            use_colors: true,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            logging: LogSettings::default(),
            save_interval_seconds: DEFAULT_SAVE_INTERVAL_SECS,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// The flush interval, clamped to the supported [5s, 60s] range.
    pub fn save_interval(&self) -> Duration {
        Duration::from_secs(
            self.save_interval_seconds
                .clamp(MIN_SAVE_INTERVAL_SECS, MAX_SAVE_INTERVAL_SECS),
        )
    }
}
