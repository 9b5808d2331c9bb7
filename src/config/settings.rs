//! Server settings with XDG Base Directory compliance.
//!
//! Settings are stored as JSON. The autoscan section mirrors the
//! `<directory location mode level recursive interval hidden-files>`
//! entries of a classic media server configuration and is validated into
//! `AutoscanDirectory` values before the server starts.

use std::{
    collections::HashMap,
    env::var,
    fs::{create_dir_all, read_to_string, write},
    io::Error as StdError,
    path::{Path, PathBuf},
};

use {
    parking_lot::{RwLock, RwLockReadGuard},
    serde::{Deserialize, Serialize},
    serde_json::{Error as SerdeJsonError, from_str, to_string_pretty},
    thiserror::Error,
    tracing::debug,
};

use crate::{
    autoscan::{AutoscanDirectory, ScanLevel, ScanMode},
    error::domain::AutoscanError,
    update::DEFAULT_FLUSH_INTERVAL_MS,
    watcher::DEFAULT_RECHECK_INTERVAL_SECS,
};

/// Error type for settings operations.
#[derive(Error, Debug)]
pub enum SettingsError {
    /// Failed to read or write settings file.
    #[error("IO error: {0}")]
    IoError(#[from] StdError),
    /// Failed to serialize or deserialize settings.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] SerdeJsonError),
    /// Invalid settings value.
    #[error("Invalid settings value: {reason}")]
    InvalidValue { reason: String },
}

fn default_true() -> bool {
    true
}

/// One configured autoscan directory, as written in the settings file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoscanEntry {
    /// Absolute directory path.
    pub location: PathBuf,
    /// `"timed"` or `"inotify"`; mandatory.
    #[serde(default)]
    pub mode: Option<String>,
    /// `"basic"` or `"full"`; mandatory for timed entries.
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub recursive: bool,
    /// Rescan interval in seconds; mandatory for timed entries.
    #[serde(default)]
    pub interval: Option<u32>,
    #[serde(default)]
    pub hidden_files: bool,
    /// Configured entries survive temporary disappearance of their path.
    #[serde(default = "default_true")]
    pub persistent: bool,
}

/// Serializable server settings structure with default values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Catalog database file; defaults to the XDG data directory.
    pub database_path: Option<PathBuf>,
    /// Whether inotify autoscans are enabled at all.
    pub use_inotify: bool,
    /// Default hidden-file policy for user-initiated imports.
    pub import_hidden_files: bool,
    /// Whether symbolic links are followed during imports.
    pub follow_symlinks: bool,
    /// Skip files whose extension has no known mime type.
    pub ignore_unknown_extensions: bool,
    /// Scheduled flush interval of the update coalescer.
    pub update_interval_ms: u64,
    /// Seconds between checks of inotify roots for missed mounts and
    /// removals; `0` disables the checks.
    pub watch_recheck_secs: u64,
    /// Configured autoscan directories.
    pub autoscan: Vec<AutoscanEntry>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            database_path: None,
            use_inotify: true,
            import_hidden_files: false,
            follow_symlinks: true,
            ignore_unknown_extensions: false,
            update_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            watch_recheck_secs: DEFAULT_RECHECK_INTERVAL_SECS,
            autoscan: vec![],
        }
    }
}

impl ServerSettings {
    /// Turns the configured autoscan entries into directory values.
    ///
    /// # Errors
    ///
    /// Returns `AutoscanError` for any entry that would make startup
    /// ambiguous: missing mode, timed entries without interval or level, a
    /// zero interval, relative locations and duplicate locations within or
    /// across modes.
    pub fn validate(&self) -> Result<Vec<AutoscanDirectory>, AutoscanError> {
        let mut seen: HashMap<PathBuf, ScanMode> = HashMap::new();
        let mut dirs = Vec::with_capacity(self.autoscan.len());

        for entry in &self.autoscan {
            let location = entry.location.clone();
            if !location.is_absolute() {
                return Err(AutoscanError::RelativeLocation { location });
            }

            let mode: ScanMode = entry
                .mode
                .as_deref()
                .ok_or_else(|| AutoscanError::MissingAttribute {
                    location: location.clone(),
                    attribute: "mode",
                })?
                .parse()?;

            let mut dir = AutoscanDirectory::new(location.clone(), mode)
                .with_recursive(entry.recursive)
                .with_hidden(entry.hidden_files)
                .with_persistent(entry.persistent);

            if mode == ScanMode::Timed {
                let interval = entry.interval.ok_or_else(|| AutoscanError::MissingAttribute {
                    location: location.clone(),
                    attribute: "interval",
                })?;
                if interval == 0 {
                    return Err(AutoscanError::InvalidInterval { location, interval });
                }
                let level: ScanLevel = entry
                    .level
                    .as_deref()
                    .ok_or_else(|| AutoscanError::MissingAttribute {
                        location: location.clone(),
                        attribute: "level",
                    })?
                    .parse()?;
                dir = dir.with_interval(interval).with_level(level);
            }

            match seen.get(&location) {
                Some(existing) if *existing == mode => {
                    return Err(AutoscanError::DuplicateLocation { location });
                }
                Some(_) => return Err(AutoscanError::ConflictingModes { location }),
                None => {
                    seen.insert(location, mode);
                }
            }
            dirs.push(dir);
        }

        Ok(dirs)
    }

    /// Database file to open, falling back to the XDG data directory.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| get_data_dir().join("catalog.db"))
    }
}

/// Handles loading, saving, and validation of server settings.
#[derive(Debug)]
pub struct SettingsManager {
    /// Thread-safe settings storage.
    settings: RwLock<ServerSettings>,
    /// Path to the configuration file on disk.
    config_path: PathBuf,
}

impl SettingsManager {
    /// Creates a new settings manager with the default config path.
    ///
    /// # Errors
    ///
    /// Returns `SettingsError` if settings cannot be loaded from disk.
    pub fn new() -> Result<Self, SettingsError> {
        Self::with_config_path(get_config_path())
    }

    /// Creates a new settings manager with a custom config path.
    ///
    /// A missing file yields the default settings.
    ///
    /// # Errors
    ///
    /// Returns `SettingsError` if the file exists but cannot be read or
    /// parsed.
    pub fn with_config_path(config_path: PathBuf) -> Result<Self, SettingsError> {
        if let Some(parent) = config_path.parent() {
            create_dir_all(parent)?;
        }

        let settings = if config_path.exists() {
            debug!("Loading settings from existing file: {:?}", config_path);
            let contents = read_to_string(&config_path)?;
            from_str(&contents)?
        } else {
            debug!("Using default settings, no file at {:?}", config_path);
            ServerSettings::default()
        };

        Ok(SettingsManager {
            settings: RwLock::new(settings),
            config_path,
        })
    }

    /// Gets the current settings.
    pub fn get_settings(&self) -> RwLockReadGuard<'_, ServerSettings> {
        self.settings.read()
    }

    /// Gets the configuration file path.
    pub fn get_config_path(&self) -> &Path {
        &self.config_path
    }

    /// Replaces the settings and saves them to disk.
    ///
    /// # Errors
    ///
    /// Returns `SettingsError::InvalidValue` if the autoscan section does not
    /// validate, or an IO/serialization error if saving fails.
    pub fn update_settings(&self, new_settings: ServerSettings) -> Result<(), SettingsError> {
        new_settings
            .validate()
            .map_err(|e| SettingsError::InvalidValue {
                reason: e.to_string(),
            })?;
        *self.settings.write() = new_settings;
        self.save_settings()
    }

    fn save_settings(&self) -> Result<(), SettingsError> {
        debug!("Saving settings to file: {:?}", self.config_path);
        let contents = to_string_pretty(&*self.settings.read())?;
        write(&self.config_path, contents)?;
        Ok(())
    }
}

/// Path of the settings file under the XDG config home.
#[must_use]
pub fn get_config_path() -> PathBuf {
    let mut config_dir = xdg_home("XDG_CONFIG_HOME", ".config");
    config_dir.push("mediacat");
    config_dir.push("settings.json");
    config_dir
}

/// Directory for the catalog database under the XDG data home.
#[must_use]
pub fn get_data_dir() -> PathBuf {
    let mut data_dir = xdg_home("XDG_DATA_HOME", ".local/share");
    data_dir.push("mediacat");
    data_dir
}

/// Resolves an XDG base directory, falling back to `$HOME/<fallback>`.
fn xdg_home(variable: &str, fallback: &str) -> PathBuf {
    if let Ok(home) = var(variable)
        && !home.is_empty()
    {
        return PathBuf::from(home);
    }

    if let Ok(home) = var("HOME") {
        return PathBuf::from(home).join(fallback);
    }

    PathBuf::from(".")
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use {serde_json::from_str, tempfile::tempdir};

    use crate::{
        autoscan::{ScanLevel, ScanMode},
        config::settings::{AutoscanEntry, ServerSettings, SettingsError, SettingsManager},
        error::domain::AutoscanError,
    };

    fn entry(location: &str, mode: Option<&str>) -> AutoscanEntry {
        AutoscanEntry {
            location: PathBuf::from(location),
            mode: mode.map(str::to_string),
            level: Some("basic".to_string()),
            recursive: true,
            interval: Some(1800),
            hidden_files: false,
            persistent: true,
        }
    }

    fn settings_with(entries: Vec<AutoscanEntry>) -> ServerSettings {
        ServerSettings {
            autoscan: entries,
            ..ServerSettings::default()
        }
    }

    #[test]
    fn test_server_settings_default() {
        let settings = ServerSettings::default();
        assert!(settings.use_inotify);
        assert!(settings.follow_symlinks);
        assert!(!settings.import_hidden_files);
        assert_eq!(settings.update_interval_ms, 2000);
        assert_eq!(settings.watch_recheck_secs, 10);
        assert!(settings.autoscan.is_empty());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let settings: ServerSettings = from_str(
            r#"{"autoscan": [{"location": "/media", "mode": "inotify", "recursive": true}]}"#,
        )
        .unwrap();
        assert!(settings.use_inotify);
        assert!(settings.autoscan[0].persistent);

        let dirs = settings.validate().unwrap();
        assert_eq!(dirs[0].mode(), ScanMode::INotify);
        assert!(dirs[0].recursive());
        assert!(dirs[0].persistent());
    }

    #[test]
    fn test_validate_timed_entry() {
        let mut timed = entry("/media/music", Some("timed"));
        timed.level = Some("full".to_string());
        let dirs = settings_with(vec![timed]).validate().unwrap();
        assert_eq!(dirs[0].level(), ScanLevel::Full);
        assert_eq!(dirs[0].interval(), 1800);
    }

    #[test]
    fn test_validate_rejects_missing_attributes() {
        let result = settings_with(vec![entry("/media", None)]).validate();
        assert!(matches!(
            result,
            Err(AutoscanError::MissingAttribute {
                attribute: "mode",
                ..
            })
        ));

        let mut no_interval = entry("/media", Some("timed"));
        no_interval.interval = None;
        let result = settings_with(vec![no_interval]).validate();
        assert!(matches!(
            result,
            Err(AutoscanError::MissingAttribute {
                attribute: "interval",
                ..
            })
        ));

        let mut no_level = entry("/media", Some("timed"));
        no_level.level = None;
        let result = settings_with(vec![no_level]).validate();
        assert!(matches!(
            result,
            Err(AutoscanError::MissingAttribute {
                attribute: "level",
                ..
            })
        ));

        let mut zero = entry("/media", Some("timed"));
        zero.interval = Some(0);
        let result = settings_with(vec![zero]).validate();
        assert!(matches!(result, Err(AutoscanError::InvalidInterval { .. })));
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        let result = settings_with(vec![
            entry("/media", Some("inotify")),
            entry("/media", Some("inotify")),
        ])
        .validate();
        assert!(matches!(result, Err(AutoscanError::DuplicateLocation { .. })));

        let result = settings_with(vec![
            entry("/media", Some("inotify")),
            entry("/media", Some("timed")),
        ])
        .validate();
        assert!(matches!(result, Err(AutoscanError::ConflictingModes { .. })));

        let result = settings_with(vec![entry("media", Some("inotify"))]).validate();
        assert!(matches!(result, Err(AutoscanError::RelativeLocation { .. })));
    }

    #[test]
    fn test_settings_manager_saves_and_reloads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mediacat").join("settings.json");

        let manager = SettingsManager::with_config_path(path.clone()).unwrap();
        assert_eq!(*manager.get_settings(), ServerSettings::default());

        let mut settings = settings_with(vec![entry("/media", Some("inotify"))]);
        settings.update_interval_ms = 500;
        manager.update_settings(settings.clone()).unwrap();

        let reloaded = SettingsManager::with_config_path(path).unwrap();
        assert_eq!(*reloaded.get_settings(), settings);
    }

    #[test]
    fn test_update_settings_rejects_invalid_autoscan() {
        let dir = tempdir().unwrap();
        let manager = SettingsManager::with_config_path(dir.path().join("settings.json")).unwrap();
        let result = manager.update_settings(settings_with(vec![entry("/media", None)]));
        assert!(matches!(result, Err(SettingsError::InvalidValue { .. })));
        assert!(manager.get_settings().autoscan.is_empty());
    }
}
