//! Device configuration loading and parsing.
//!
//! Parses `nanogl.toml` (or an override path provided by the binary) into a
//! [`DeviceConfig`]. Every field has a default matching the stock M2-Nano
//! setup, so an absent file and an empty file are both valid configurations.
//! Unknown fields are ignored (TOML deserialization tolerance) to allow
//! forward evolution without immediate warnings.

use serde::Deserialize;
use std::fs;
use std::path::Path;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// USB addressing criteria handed to the driver probe. `-1` means
/// "first device found".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct UsbConfig {
    pub index: i32,
    pub bus: i32,
    pub address: i32,
    pub serial: i32,
    pub version: i32,
}

impl Default for UsbConfig {
    fn default() -> Self {
        UsbConfig {
            index: -1,
            bus: -1,
            address: -1,
            serial: -1,
            version: -1,
        }
    }
}

/// Home corner and post-home adjustment, in motor steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct HomeConfig {
    /// Home corner is at bed-right rather than bed-left.
    pub right: bool,
    /// Home corner is at bed-bottom rather than bed-top.
    pub bottom: bool,
    pub adjust_x: i32,
    pub adjust_y: i32,
}

/// Board-wide axis permutation applied to the direction-code table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct AxisConfig {
    pub swap_xy: bool,
    pub flip_x: bool,
    pub flip_y: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Board name: M2, M1, M, B2, B1, B, A.
    pub board: String,
    /// Run without hardware; packets are timed but not transmitted.
    pub mock: bool,
    /// Rail motors lock after each default-mode burst. When off, every burst
    /// is followed by an `IS2P` release.
    pub autolock: bool,
    /// Pipe length above which the interpreter's hold gate engages.
    pub buffer_max: usize,
    /// Whether the hold gate is honored at all.
    pub buffer_limit: bool,
    pub bed_width_mm: u32,
    pub bed_height_mm: u32,
    /// Alternate-firmware speed calibration (the "fix speeds" boards).
    pub fix_speeds: bool,
    pub axis: AxisConfig,
    pub home: HomeConfig,
    pub usb: UsbConfig,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            board: "M2".to_string(),
            mock: false,
            autolock: true,
            buffer_max: 900,
            buffer_limit: true,
            bed_width_mm: 320,
            bed_height_mm: 220,
            fix_speeds: false,
            axis: AxisConfig::default(),
            home: HomeConfig::default(),
            usb: UsbConfig::default(),
        }
    }
}

impl DeviceConfig {
    /// Parse a TOML document.
    pub fn from_toml(path: &str, raw: &str) -> Result<DeviceConfig, ConfigError> {
        toml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    /// Load from `path`. A missing file yields the default configuration;
    /// an unreadable or malformed file is an error.
    pub fn load_from(path: &Path) -> Result<DeviceConfig, ConfigError> {
        match fs::read_to_string(path) {
            Ok(raw) => {
                let cfg = DeviceConfig::from_toml(&path.display().to_string(), &raw)?;
                info!(path = %path.display(), board = %cfg.board, "configuration loaded");
                Ok(cfg)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no configuration file, using defaults");
                Ok(DeviceConfig::default())
            }
            Err(source) => Err(ConfigError::Io {
                path: path.display().to_string(),
                source,
            }),
        }
    }
}
