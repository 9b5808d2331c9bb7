//! Domain-specific error types using `thiserror`.
//!
//! Each subsystem of the catalog core has its own error enum: the storage
//! collaborator, the autoscan registry, the filesystem watch engine, the
//! content manager and the update coalescer.

use std::{io::Error as IoError, path::PathBuf, result::Result as StdResult};

use {anyhow::Error, sqlx::Error as SqlxError, thiserror::Error};

use crate::storage::{ObjectId, schema::SchemaError};

/// Errors raised by a `Storage` implementation.
#[derive(Error, Debug)]
pub enum CatalogError {
    /// Database connection or query error.
    #[error("Database error: {0}")]
    DatabaseError(#[from] SqlxError),
    /// Schema initialization error.
    #[error("Schema error: {0}")]
    SchemaError(#[from] SchemaError),
    /// The requested catalog object does not exist.
    #[error("Object not found: {id}")]
    NotFound { id: ObjectId },
    /// Stored data could not be interpreted.
    #[error("Invalid data: {reason}")]
    InvalidData { reason: String },
    /// The storage runtime could not be started.
    #[error("IO error: {0}")]
    IoError(#[from] IoError),
}

/// Errors raised by the autoscan registry and its configuration.
#[derive(Error, Debug)]
pub enum AutoscanError {
    /// The location is already registered in the list.
    #[error("Attempted to add same autoscan path twice: {location:?}")]
    DuplicateLocation { location: PathBuf },
    /// The same location is configured for both scan modes.
    #[error("Autoscan path configured for both timed and inotify mode: {location:?}")]
    ConflictingModes { location: PathBuf },
    /// A mandatory attribute is missing from an autoscan entry.
    #[error("Autoscan {location:?} is missing mandatory attribute '{attribute}'")]
    MissingAttribute {
        location: PathBuf,
        attribute: &'static str,
    },
    /// Timed autoscans need a positive interval.
    #[error("Autoscan {location:?} has an invalid interval: {interval}")]
    InvalidInterval { location: PathBuf, interval: u32 },
    /// Autoscan locations must be absolute.
    #[error("Autoscan location must be absolute: {location:?}")]
    RelativeLocation { location: PathBuf },
    /// The location of an autoscan entry can only be set once.
    #[error("Autoscan location already set to {location:?}")]
    LocationAlreadySet { location: PathBuf },
    /// Unknown scan mode string.
    #[error("Unknown scan mode: {value}")]
    UnknownMode { value: String },
    /// Unknown scan level string.
    #[error("Unknown scan level: {value}")]
    UnknownLevel { value: String },
}

/// Errors raised while registering OS watches.
#[derive(Error, Debug)]
pub enum WatchError {
    /// The directory cannot be watched because of missing permissions.
    #[error("Permission denied while watching {path:?}")]
    PermissionDenied { path: PathBuf },
    /// The system-wide watch limit is exhausted.
    #[error("Watch limit reached while watching {path:?}; raise fs.inotify.max_user_watches")]
    WatchLimit { path: PathBuf },
    /// The path does not exist.
    #[error("Path not found: {path:?}")]
    NotFound { path: PathBuf },
    /// The handle is not known to the backend.
    #[error("Unknown watch handle: {handle}")]
    UnknownHandle { handle: i32 },
    /// A request was rejected before reaching the engine.
    #[error("Invalid watch request: {reason}")]
    InvalidRequest { reason: String },
    /// Any other backend failure.
    #[error("Watch backend error: {reason}")]
    Backend { reason: String },
}

/// Errors raised by the rescan timer.
#[derive(Error, Debug)]
pub enum TimerError {
    /// Subscriptions need a positive interval.
    #[error("Timer subscription {key} has a zero interval")]
    ZeroInterval { key: String },
    /// The key already has a pending subscription.
    #[error("Timer subscription {key} is already scheduled")]
    AlreadyScheduled { key: String },
}

/// Errors returned synchronously by content manager operations.
#[derive(Error, Debug)]
pub enum ContentError {
    /// Storage failure.
    #[error("Catalog error: {0}")]
    CatalogError(#[from] CatalogError),
    /// Autoscan registry failure.
    #[error("Autoscan error: {0}")]
    AutoscanError(#[from] AutoscanError),
    /// Watch engine failure.
    #[error("Watch error: {0}")]
    WatchError(#[from] WatchError),
    /// Rescan timer failure.
    #[error("Timer error: {0}")]
    TimerError(#[from] TimerError),
    /// Filesystem failure.
    #[error("IO error: {0}")]
    IoError(#[from] IoError),
    /// The path does not exist on disk.
    #[error("Path not found: {path:?}")]
    PathNotFound { path: PathBuf },
    /// The path could not be normalized to an absolute path.
    #[error("Invalid path: {path:?}")]
    InvalidPath { path: PathBuf },
    /// Root containers can never be removed.
    #[error("Cannot remove protected object {id}")]
    ProtectedObject { id: ObjectId },
    /// The object is not a container with a filesystem location.
    #[error("Object {id} is not a filesystem container")]
    NotAContainer { id: ObjectId },
    /// No autoscan entry matches the request.
    #[error("Autoscan directory not found")]
    UnknownAutoscan,
    /// Persistent autoscans cannot be edited or removed at runtime.
    #[error("Autoscan {location:?} is persistent and cannot be changed")]
    PersistentAutoscan { location: PathBuf },
    /// Inotify mode was requested while the watcher is disabled.
    #[error("Inotify autoscans are disabled")]
    InotifyDisabled,
}

/// Errors raised while flushing container updates.
#[derive(Error, Debug)]
pub enum UpdateError {
    /// The storage failed to bump update generations.
    #[error("Catalog error: {0}")]
    CatalogError(#[from] CatalogError),
    /// The notification boundary refused the update.
    #[error("Update sink error: {reason}")]
    SinkError { reason: String },
}

/// Operational error context propagation with `anyhow`.
///
/// This type is used for operational errors that need rich context
/// but don't require specific handling logic.
pub type Result<T> = StdResult<T, Error>;
