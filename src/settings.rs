//! Persistent user settings

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::session::SessionConfig;

pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Baud rates offered for selection
pub const BAUD_RATES: &[u32] = &[9600, 19200, 38400, 57600, 115200, 230400, 460800, 921600];

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Could not determine config directory")]
    NoConfigDir,
    #[error("Failed to access settings file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse settings file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Failed to serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Unsupported baud rate {0}")]
    UnsupportedBaudRate(u32),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub baud_rate: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }
}

impl Settings {
    /// Load settings from the default location, falling back to defaults
    /// when no settings have been saved yet
    pub fn load() -> Result<Self, SettingsError> {
        Self::load_from(&Self::path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self, SettingsError> {
        if !path.exists() {
            debug!("No settings at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let settings: Settings = toml::from_str(&content)?;

        if !BAUD_RATES.contains(&settings.baud_rate) {
            warn!(
                "Ignoring unsupported baud rate {} from {}",
                settings.baud_rate,
                path.display()
            );
            return Ok(Self::default());
        }

        Ok(settings)
    }

    pub fn save(&self) -> Result<(), SettingsError> {
        self.save_to(&Self::path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), SettingsError> {
        let io_err = |source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(io_err)?;
        }

        let content = toml::to_string(self)?;
        std::fs::write(path, content).map_err(io_err)?;

        debug!("Saved settings to {}", path.display());
        Ok(())
    }

    /// Default settings file location
    pub fn path() -> Result<PathBuf, SettingsError> {
        let dir = dirs::config_dir()
            .ok_or(SettingsError::NoConfigDir)?
            .join(env!("CARGO_PKG_NAME"));

        Ok(dir.join("settings.toml"))
    }

    pub fn set_baud_rate(&mut self, baud_rate: u32) -> Result<(), SettingsError> {
        if !BAUD_RATES.contains(&baud_rate) {
            return Err(SettingsError::UnsupportedBaudRate(baud_rate));
        }
        self.baud_rate = baud_rate;
        Ok(())
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            baud_rate: self.baud_rate,
        }
    }
}
