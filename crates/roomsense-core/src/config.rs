//! Application configuration management.
//!
//! Handles loading, saving, and validating roomsense configuration:
//! - Which HCI adapter to use for low-energy scanning
//! - Classic inquiry time limits
//! - Entity update coalescing

use std::path::{Path, PathBuf};
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, RoomsenseError};

/// Environment variable overriding the low-energy adapter index.
pub const HCI_DEVICE_ENV: &str = "ROOMSENSE_HCI_DEVICE";

static MAC_ADDRESS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([0-9A-Fa-f]{2}:){5}[0-9A-Fa-f]{2}$").expect("valid regex"));

/// Whether a string is a colon-separated Bluetooth MAC address.
#[must_use]
pub fn is_valid_mac_address(address: &str) -> bool {
    MAC_ADDRESS.is_match(address)
}

/// Main roomsense configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomsenseConfig {
    /// HCI adapter index used for low-energy scanning (`hci<N>`).
    pub le_adapter: u16,

    /// Maximum duration of a single Classic RSSI inquiry, in seconds.
    /// The shell command is killed at twice this value as an outer bound.
    pub scan_time_limit_secs: u64,

    /// Bluetooth MAC addresses polled round-robin over Classic inquiries.
    #[serde(default)]
    pub classic_addresses: Vec<String>,
}

impl Default for RoomsenseConfig {
    fn default() -> Self {
        Self {
            le_adapter: 0,
            scan_time_limit_secs: 6,
            classic_addresses: Vec::new(),
        }
    }
}

impl RoomsenseConfig {
    /// Load configuration from the default path, falling back to defaults if
    /// the file does not exist. The `ROOMSENSE_HCI_DEVICE` environment
    /// variable, when set, overrides the configured low-energy adapter index.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be read or parsed, or if
    /// validation fails.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path())?;
        if let Ok(value) = std::env::var(HCI_DEVICE_ENV) {
            config.apply_adapter_override(&value)?;
        }
        Ok(config)
    }

    /// Load configuration from a specific path. Does not consult the
    /// environment; [`RoomsenseConfig::load`] layers the override on top.
    pub fn load_from(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content).map_err(|e| RoomsenseError::ConfigParse(e.to_string()))?
        } else {
            Self::default()
        };

        config.validate()?;
        Ok(config)
    }

    /// Apply an adapter-index override, e.g. from `ROOMSENSE_HCI_DEVICE`.
    pub fn apply_adapter_override(&mut self, value: &str) -> Result<()> {
        self.le_adapter = value.parse().map_err(|_| RoomsenseError::ConfigValidation {
            field: "le_adapter",
            message: format!("'{value}' is not a valid adapter index"),
        })?;
        Ok(())
    }

    /// Save configuration to disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be written.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| RoomsenseError::ConfigParse(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate configured values.
    pub fn validate(&self) -> Result<()> {
        if self.scan_time_limit_secs == 0 {
            return Err(RoomsenseError::ConfigValidation {
                field: "scan_time_limit_secs",
                message: "must be at least 1 second".into(),
            });
        }
        for address in &self.classic_addresses {
            if !is_valid_mac_address(address) {
                return Err(RoomsenseError::ConfigValidation {
                    field: "classic_addresses",
                    message: format!("'{address}' is not a valid MAC address"),
                });
            }
        }
        Ok(())
    }

    /// Classic inquiry time limit as a [`Duration`].
    #[must_use]
    pub fn scan_time_limit(&self) -> Duration {
        Duration::from_secs(self.scan_time_limit_secs)
    }

    /// Get the configuration file path.
    fn config_path() -> PathBuf {
        // On the deployment target: /etc/roomsense/config.toml
        // For development: ~/.config/roomsense/config.toml
        #[cfg(target_os = "linux")]
        {
            PathBuf::from("/etc/roomsense/config.toml")
        }
        #[cfg(not(target_os = "linux"))]
        {
            directories::ProjectDirs::from("", "", "roomsense")
                .map(|dirs| dirs.config_dir().join("config.toml"))
                .unwrap_or_else(|| PathBuf::from("./roomsense.toml"))
        }
    }
}
