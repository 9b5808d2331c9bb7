//! Mediacat - media catalog core
//!
//! Keeps the catalog of a UPnP media server in sync with the filesystem.
//! Autoscan directories are reconciled by periodic rescans or by a
//! filesystem watch engine, all catalog changes run on one task worker, and
//! container changes are coalesced into `id,generation` update strings for
//! subscribers.

pub mod autoscan;
pub mod config;
pub mod content;
pub mod error;
pub mod server;
pub mod storage;
pub mod update;
pub mod watcher;

// Re-export key types for convenience
pub use {
    autoscan::{AutoscanDirectory, AutoscanHandle, AutoscanList, ScanLevel, ScanMode},
    config::{ServerSettings, SettingsManager},
    content::{AutoscanKey, ContentManager, ContentOptions, OnlineService, TaskQueue},
    error::{AutoscanError, CatalogError, ContentError, UpdateError, WatchError},
    server::Server,
    storage::{CdsObject, MemoryStorage, ObjectId, SqliteStorage, Storage},
    update::{ChannelSink, LogSink, UpdateCoalescer, UpdateSink},
    watcher::WatchEngine,
};
