//! Configuration file support for skalene.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (SKALENE_*)
//! 3. Local config file (./skalene.toml)
//! 4. Global config file (~/.config/skalene/config.toml)
//!
//! ```toml
//! [connection]
//! port = "/dev/ttyUSB0"
//! baud = 115200
//!
//! [device]
//! debug_marker = "16"
//! address = "0x9D100000"
//! ```

use directories::ProjectDirs;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Name of the local configuration file.
pub const LOCAL_CONFIG_FILE: &str = "skalene.toml";

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Preferred serial port (e.g., "/dev/ttyUSB0" or "COM3").
    pub port: Option<String>,
    /// Baud rate.
    pub baud: Option<u32>,
}

/// Instrument configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// First token of debug lines ("16" on current firmware, "20" on older).
    pub debug_marker: Option<String>,
    /// Firmware flash address, hexadecimal.
    pub address: Option<String>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Instrument settings.
    #[serde(default)]
    pub device: DeviceConfig,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        // Load global config
        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Load local config (overrides global)
        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG_FILE)) {
            debug!("Loaded local config from {LOCAL_CONFIG_FILE}");
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

    /// Load configuration from a specific file.
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
        ProjectDirs::from("", "", "skalene").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        if other.connection.port.is_some() {
            self.connection.port = other.connection.port;
        }
        if other.connection.baud.is_some() {
            self.connection.baud = other.connection.baud;
        }
        if other.device.debug_marker.is_some() {
            self.device.debug_marker = other.device.debug_marker;
        }
        if other.device.address.is_some() {
            self.device.address = other.device.address;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.connection.port.is_none());
        assert!(config.connection.baud.is_none());
        assert!(config.device.debug_marker.is_none());
        assert!(config.device.address.is_none());
    }

    #[test]
    fn test_config_merge_overrides() {
        let mut base = Config::default();
        base.connection.baud = Some(9600);

        let mut other = Config::default();
        other.connection.port = Some("/dev/ttyUSB0".to_string());
        other.connection.baud = Some(115200);
        other.device.debug_marker = Some("20".to_string());

        base.merge(other);

        assert_eq!(base.connection.port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(base.connection.baud, Some(115200));
        assert_eq!(base.device.debug_marker.as_deref(), Some("20"));
    }

    #[test]
    fn test_config_merge_does_not_overwrite_with_none() {
        let mut base = Config::default();
        base.connection.port = Some("COM3".to_string());
        base.device.address = Some("0x9D100000".to_string());

        base.merge(Config::default());

        assert_eq!(base.connection.port.as_deref(), Some("COM3"));
        assert_eq!(base.device.address.as_deref(), Some("0x9D100000"));
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
[connection]
port = "/dev/ttyACM0"
baud = 115200

[device]
debug_marker = "20"
address = "0x9D000000"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.connection.port.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(config.connection.baud, Some(115200));
        assert_eq!(config.device.debug_marker.as_deref(), Some("20"));
        assert_eq!(config.device.address.as_deref(), Some("0x9D000000"));
    }

    #[test]
    fn test_config_from_partial_toml() {
        let config: Config = toml::from_str("[device]\ndebug_marker = \"16\"\n").unwrap();
        assert!(config.connection.port.is_none());
        assert_eq!(config.device.debug_marker.as_deref(), Some("16"));
    }

    #[test]
    fn test_config_roundtrip_toml() {
        let mut config = Config::default();
        config.connection.port = Some("COM3".to_string());
        config.connection.baud = Some(57600);

        let serialized = toml::to_string_pretty(&config).unwrap();
        let deserialized: Config = toml::from_str(&serialized).unwrap();
        assert_eq!(deserialized.connection.port.as_deref(), Some("COM3"));
        assert_eq!(deserialized.connection.baud, Some(57600));
    }

    #[test]
    fn test_load_from_path_valid() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("skalene.toml");
        fs::write(&path, "[connection]\nport = \"/dev/ttyUSB1\"\n").unwrap();

        let config = Config::load_from_path(&path);
        assert_eq!(config.connection.port.as_deref(), Some("/dev/ttyUSB1"));
    }

    #[test]
    fn test_load_from_path_invalid_toml_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "[connection\nport = ").unwrap();

        let config = Config::load_from_path(&path);
        assert!(config.connection.port.is_none());
    }

    #[test]
    fn test_load_from_path_nonexistent() {
        let config = Config::load_from_path(Path::new("/nonexistent/path/config.toml"));
        assert!(config.connection.port.is_none());
    }

    #[test]
    fn test_global_config_path() {
        if let Some(p) = Config::global_config_path() {
            assert!(p.to_str().unwrap().contains("skalene"));
            assert!(p.to_str().unwrap().ends_with("config.toml"));
        }
    }
}
