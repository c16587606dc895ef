//! Configuration file support for picolink.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (PICOLINK_*)
//! 3. Local config file (./picolink.toml)
//! 4. Global config file (~/.config/picolink/config.toml)

use directories::ProjectDirs;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Preferred serial port (e.g., "/dev/ttyACM0" or "COM3").
    pub port: Option<String>,
    /// Default baud rate.
    pub baud: Option<u32>,
    /// USB Vendor ID to match during auto-detection.
    pub vid: Option<u16>,
    /// USB Product ID to match during auto-detection.
    pub pid: Option<u16>,
    /// Substring of the USB product string.
    pub product: Option<String>,
    /// Substring of the USB manufacturer string.
    pub manufacturer: Option<String>,
}

/// Recording configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordConfig {
    /// Directory for session log files.
    pub log_dir: Option<PathBuf>,
    /// Directory for data-line files (tee disabled when unset).
    pub data_dir: Option<PathBuf>,
    /// Session marker text.
    pub session_marker: Option<String>,
}

/// Firmware upload configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadFileConfig {
    /// Volume label of the bootloader drive.
    pub label: Option<String>,
    /// Directory holding firmware images.
    pub image_dir: Option<PathBuf>,
    /// Seconds to wait for the drive to appear.
    pub timeout_secs: Option<u64>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Recording settings.
    #[serde(default)]
    pub record: RecordConfig,
    /// Upload settings.
    #[serde(default)]
    pub upload: UploadFileConfig,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                if let Some(global_config) = Self::load_from_file(&global_path) {
                    debug!("Loaded global config from {}", global_path.display());
                    config.merge(global_config);
                }
            }
        }

        if let Some(local_config) = Self::load_from_file(Path::new("picolink.toml")) {
            debug!("Loaded local config from picolink.toml");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "picolink").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one; `other` wins where set.
    fn merge(&mut self, other: Self) {
        merge_option(&mut self.connection.port, other.connection.port);
        merge_option(&mut self.connection.baud, other.connection.baud);
        merge_option(&mut self.connection.vid, other.connection.vid);
        merge_option(&mut self.connection.pid, other.connection.pid);
        merge_option(&mut self.connection.product, other.connection.product);
        merge_option(&mut self.connection.manufacturer, other.connection.manufacturer);

        merge_option(&mut self.record.log_dir, other.record.log_dir);
        merge_option(&mut self.record.data_dir, other.record.data_dir);
        merge_option(&mut self.record.session_marker, other.record.session_marker);

        merge_option(&mut self.upload.label, other.upload.label);
        merge_option(&mut self.upload.image_dir, other.upload.image_dir);
        merge_option(&mut self.upload.timeout_secs, other.upload.timeout_secs);
    }
}

fn merge_option<T>(target: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *target = value;
    }
}
