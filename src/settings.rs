use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::pdf::{CacheConfig, DEFAULT_EVICTION_GRACE, DEFAULT_SCALE_TOLERANCE};

pub const CURRENT_VERSION: u32 = 1;
const SETTINGS_FILENAME: &str = "config.yaml";
const APP_NAME: &str = "pagesplit";

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("cannot write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_version")]
    pub version: u32,

    /// Milliseconds an unreferenced page bitmap is kept before recycling
    #[serde(default = "default_eviction_grace_ms")]
    pub eviction_grace_ms: u64,

    #[serde(default = "default_scale_tolerance")]
    pub scale_tolerance: f64,

    #[serde(default = "default_true")]
    pub render_marker: bool,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_true() -> bool {
    true
}

fn default_version() -> u32 {
    CURRENT_VERSION
}

fn default_eviction_grace_ms() -> u64 {
    DEFAULT_EVICTION_GRACE.as_millis() as u64
}

fn default_scale_tolerance() -> f64 {
    DEFAULT_SCALE_TOLERANCE
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: CURRENT_VERSION,
            eviction_grace_ms: default_eviction_grace_ms(),
            scale_tolerance: default_scale_tolerance(),
            render_marker: true,
            log_level: default_log_level(),
        }
    }
}

impl Settings {
    /// Cache tunables described by these settings
    #[must_use]
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            eviction_grace: Duration::from_millis(self.eviction_grace_ms),
            scale_tolerance: self.scale_tolerance,
            render_marker: self.render_marker,
        }
    }
}

pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|config| config.join(APP_NAME).join(SETTINGS_FILENAME))
}

/// Load settings from the user config directory.
///
/// A missing file is created with defaults; an unreadable or malformed
/// file is reported and defaults are used instead.
pub fn load_settings() -> Settings {
    let Some(path) = config_path() else {
        warn!("Could not determine config directory, using default settings");
        return Settings::default();
    };
    load_settings_at(&path)
}

/// Like [`load_settings`], for a settings file at `path`
pub fn load_settings_at(path: &Path) -> Settings {
    if !path.exists() {
        info!("Settings file not found, creating with defaults at {path:?}");
        let settings = Settings::default();
        if let Err(e) = save_settings_to_file(&settings, path) {
            warn!("{e}");
        }
        return settings;
    }

    match load_settings_from(path) {
        Ok(settings) => settings,
        Err(e) => {
            warn!("{e}; using default settings");
            Settings::default()
        }
    }
}

pub fn load_settings_from(path: &Path) -> Result<Settings, SettingsError> {
    let content = fs::read_to_string(path).map_err(|source| SettingsError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut settings =
        serde_yaml::from_str::<Settings>(&content).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    debug!("Loaded settings from {path:?}");

    if settings.version < CURRENT_VERSION {
        migrate_settings(&mut settings);
        save_settings_to_file(&settings, path)?;
    }
    Ok(settings)
}

fn migrate_settings(settings: &mut Settings) {
    info!(
        "Migrating settings from v{} to v{}",
        settings.version, CURRENT_VERSION
    );
    settings.version = CURRENT_VERSION;
}

pub fn save_settings_to_file(settings: &Settings, path: &Path) -> Result<(), SettingsError> {
    let write_err = |source| SettingsError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
    }

    fs::write(path, generate_settings_yaml(settings)).map_err(write_err)?;
    debug!("Saved settings to {path:?}");
    Ok(())
}

fn generate_settings_yaml(settings: &Settings) -> String {
    let mut content = String::new();

    content.push_str(&format!("version: {}\n", settings.version));
    content.push_str("\n# How long (ms) an unused page bitmap is kept before its buffer is reused\n");
    content.push_str(&format!(
        "eviction_grace_ms: {}\n",
        settings.eviction_grace_ms
    ));
    content.push_str("\n# A bitmap rendered at scale S may serve requests up to S + tolerance\n");
    content.push_str(&format!("scale_tolerance: {:?}\n", settings.scale_tolerance));
    content.push_str("\n# Draw a small marker on cropped section copies\n");
    content.push_str(&format!("render_marker: {}\n", settings.render_marker));
    content.push_str("\n# off, error, warn, info, debug or trace\n");
    content.push_str(&format!("log_level: {}\n", settings.log_level));

    content
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_use_defaults() {
        let settings: Settings = serde_yaml::from_str("render_marker: false\n").unwrap();
        assert!(!settings.render_marker);
        assert_eq!(settings.eviction_grace_ms, 10_000);
        assert_eq!(settings.scale_tolerance, 0.001);
        assert_eq!(settings.log_level, "info");
    }

    #[test]
    fn saved_settings_load_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(SETTINGS_FILENAME);
        let settings = Settings {
            eviction_grace_ms: 250,
            scale_tolerance: 0.01,
            log_level: "debug".to_string(),
            ..Settings::default()
        };

        save_settings_to_file(&settings, &path).unwrap();
        assert_eq!(load_settings_from(&path).unwrap(), settings);
    }

    #[test]
    fn old_version_is_migrated_and_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILENAME);
        fs::write(&path, "version: 0\neviction_grace_ms: 5\n").unwrap();

        let settings = load_settings_from(&path).unwrap();
        assert_eq!(settings.version, CURRENT_VERSION);
        assert_eq!(settings.eviction_grace_ms, 5);
        let rewritten = fs::read_to_string(&path).unwrap();
        assert!(rewritten.contains(&format!("version: {CURRENT_VERSION}")));
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILENAME);
        fs::write(&path, "eviction_grace_ms: [not a number\n").unwrap();

        assert!(matches!(
            load_settings_from(&path),
            Err(SettingsError::Parse { .. })
        ));
    }

    #[test]
    fn missing_file_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pagesplit").join(SETTINGS_FILENAME);

        assert_eq!(load_settings_at(&path), Settings::default());
        assert_eq!(load_settings_from(&path).unwrap(), Settings::default());
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILENAME);
        fs::write(&path, "scale_tolerance: {broken\n").unwrap();

        assert_eq!(load_settings_at(&path), Settings::default());
    }

    #[test]
    fn cache_config_reflects_settings() {
        let settings = Settings {
            eviction_grace_ms: 1500,
            render_marker: false,
            ..Settings::default()
        };
        let config = settings.cache_config();
        assert_eq!(config.eviction_grace, Duration::from_millis(1500));
        assert!(!config.render_marker);
        assert_eq!(config.scale_tolerance, DEFAULT_SCALE_TOLERANCE);
    }
}
