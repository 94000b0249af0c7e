//! Persistent user settings for Cowstream
//!
//! Settings are stored in a TOML configuration file at:
//! - Linux: `~/.config/cowstream/cowstream_config.toml`
//! - macOS: `~/Library/Application Support/cowstream/cowstream_config.toml`
//! - Windows: `%APPDATA%\cowstream\cowstream_config.toml`
//!
//! # Example Configuration
//!
//! ```toml
//! [stream]
//! chunk_size = "512K"
//! speed = "0"
//! rewrite_chain = true
//!
//! [monitor]
//! greeting = true
//! ```

use crate::config::{parse_size, StreamConfig};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration file name
const CONFIG_FILE_NAME: &str = "cowstream_config.toml";

/// Application name for config directory
const APP_NAME: &str = "cowstream";

/// Default chunk size string
const DEFAULT_CHUNK_SIZE_STR: &str = "512K";

/// User settings loaded from configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Streaming job settings
    pub stream: StreamSettings,

    /// Control loop settings
    pub monitor: MonitorSettings,
}

/// Settings for streaming jobs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamSettings {
    /// Bytes copied per segment (e.g., "512K", "1M")
    pub chunk_size: String,

    /// Default speed limit per second (e.g., "0", "10M")
    pub speed: String,

    /// Drop streamed intermediate layers from the chain on completion
    pub rewrite_chain: bool,
}

/// Settings for the control loop
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MonitorSettings {
    /// Send a greeting banner to new clients
    pub greeting: bool,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE_STR.to_string(),
            speed: "0".to_string(),
            rewrite_chain: true,
        }
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self { greeting: true }
    }
}

impl Settings {
    /// Load settings from the configuration file
    ///
    /// Returns default settings if the file doesn't exist or can't be parsed
    pub fn load() -> Self {
        Self::load_from_path(Self::config_path())
    }

    /// Load settings from a specific path
    pub fn load_from_path(path: Option<PathBuf>) -> Self {
        let Some(path) = path else {
            tracing::debug!("No config path available, using defaults");
            return Self::default();
        };

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Self::default();
        }

        match std::fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(settings) => {
                    tracing::debug!("Loaded settings from {:?}", path);
                    settings
                }
                Err(e) => {
                    tracing::warn!("Failed to parse config file {:?}: {}", path, e);
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read config file {:?}: {}", path, e);
                Self::default()
            }
        }
    }

    /// Save settings to the configuration file
    pub fn save(&self) -> Result<PathBuf, SettingsError> {
        self.save_to_path(Self::config_path())
    }

    /// Save settings to a specific path
    pub fn save_to_path(&self, path: Option<PathBuf>) -> Result<PathBuf, SettingsError> {
        let path = path.ok_or(SettingsError::NoConfigDir)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SettingsError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let contents = toml::to_string_pretty(self).map_err(SettingsError::Serialize)?;

        std::fs::write(&path, contents).map_err(|e| SettingsError::Io {
            path: path.clone(),
            source: e,
        })?;

        tracing::info!("Saved settings to {:?}", path);
        Ok(path)
    }

    /// Get the path to the configuration file
    pub fn config_path() -> Option<PathBuf> {
        dirs_next::config_dir().map(|p| p.join(APP_NAME).join(CONFIG_FILE_NAME))
    }

    /// Check if a configuration file exists
    pub fn config_exists() -> bool {
        Self::config_path().is_some_and(|p| p.exists())
    }

    /// Generate a default configuration file content as a string
    pub fn default_config_string() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate default config"))
    }

    /// Build the runtime job configuration
    pub fn to_stream_config(&self) -> Result<StreamConfig, SettingsError> {
        let chunk_size = parse_size(&self.stream.chunk_size)
            .map_err(|e| SettingsError::Invalid(format!("stream.chunk_size: {}", e)))?;
        let speed = parse_size(&self.stream.speed)
            .map_err(|e| SettingsError::Invalid(format!("stream.speed: {}", e)))?;

        Ok(StreamConfig::new()
            .chunk_size(usize::try_from(chunk_size).unwrap_or(usize::MAX))
            .default_speed(speed)
            .rewrite_chain(self.stream.rewrite_chain))
    }
}

/// Errors that can occur when working with settings
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    /// No configuration directory available
    #[error("Could not determine configuration directory")]
    NoConfigDir,

    /// Failed to read or write config file
    #[error("I/O error for {path}: {source}")]
    Io {
        /// Path that caused the error
        path: PathBuf,
        /// The underlying error
        source: std::io::Error,
    },

    /// Failed to serialize settings
    #[error("Failed to serialize settings: {0}")]
    Serialize(toml::ser::Error),

    /// A setting has an unusable value
    #[error("Invalid setting {0}")]
    Invalid(String),
}
