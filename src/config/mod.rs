//! Server settings and autoscan configuration.
//!
//! This module provides settings management with XDG Base Directory
//! compliance and validation of the configured autoscan directories.

pub mod settings;

pub use settings::{
    AutoscanEntry, ServerSettings, SettingsError, SettingsManager, get_config_path, get_data_dir,
};
