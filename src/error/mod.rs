//! Error handling built on `thiserror` and `anyhow`.
//!
//! Domain enums give callers precise failure kinds; the operational half
//! adds context and central reporting for the background threads.

pub mod domain;
pub mod operational;

pub use {
    domain::{AutoscanError, CatalogError, ContentError, TimerError, UpdateError, WatchError},
    operational::{ErrorReporter, ResultExt},
};
