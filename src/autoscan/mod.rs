//! Autoscan registry: which directories are kept in sync and how.

pub mod directory;
pub mod list;

pub use {
    directory::{
        AutoscanDirectory, AutoscanHandle, AutoscanRef, INVALID_STORAGE_ID, ScanLevel, ScanMode,
        is_hidden_name, normalize_path,
    },
    list::AutoscanList,
};
