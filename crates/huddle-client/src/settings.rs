//! User preferences kept between sessions, as JSON in the config directory

use anyhow::Context;
use huddle_protocol::BackgroundMode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Persistent user settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PersistentSettings {
    /// Name shown to other participants
    pub display_name: Option<String>,
    /// Background mode in effect when the last session ended
    #[serde(default)]
    pub background_mode: BackgroundMode,
    /// Selected video device index
    pub video_device: Option<u32>,
}

impl PersistentSettings {
    /// `<config dir>/huddle/settings.json`
    pub fn settings_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("huddle").join("settings.json"))
    }

    /// Load from the default location
    pub fn load() -> Self {
        match Self::settings_path() {
            Some(path) => Self::load_from(&path),
            None => {
                tracing::warn!("No config directory, using default settings");
                Self::default()
            }
        }
    }

    /// Missing or unreadable files yield the defaults
    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            tracing::debug!("No settings at {:?}, using defaults", path);
            return Self::default();
        }
        match Self::read(path) {
            Ok(settings) => {
                tracing::info!("Loaded settings from {:?}", path);
                settings
            }
            Err(e) => {
                tracing::error!("Ignoring settings at {:?}: {:#}", path, e);
                Self::default()
            }
        }
    }

    fn read(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path).context("read failed")?;
        serde_json::from_str(&contents).context("not valid settings JSON")
    }

    /// Save to the default location
    pub fn save(&self) {
        match Self::settings_path() {
            Some(path) => self.save_to(&path),
            None => tracing::warn!("No config directory, settings not saved"),
        }
    }

    pub fn save_to(&self, path: &Path) {
        match self.write(path) {
            Ok(()) => tracing::debug!("Saved settings to {:?}", path),
            Err(e) => tracing::error!("Failed to save settings to {:?}: {:#}", path, e),
        }
    }

    fn write(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("cannot create config directory")?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).context("write failed")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let settings = PersistentSettings {
            display_name: Some("Lin".to_string()),
            background_mode: BackgroundMode::Image,
            video_device: Some(1),
        };
        settings.save_to(&path);

        assert_eq!(PersistentSettings::load_from(&path), settings);
    }

    #[test]
    fn corrupt_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert_eq!(PersistentSettings::load_from(&path), PersistentSettings::default());
    }
}
