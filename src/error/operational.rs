//! Operational error context propagation with `anyhow`.
//!
//! Background threads never surface errors to a caller; they hand them to
//! the `ErrorReporter`, which logs them with the operation that failed.

use std::{error::Error as StdError, fmt::Display};

use {
    anyhow::{Context, Error, Result as AnyhowResult},
    tracing::{debug, error, warn},
};

/// Extension trait for enhanced error context.
pub trait ResultExt<T, E> {
    /// Adds context to an error with a static string.
    fn add_context(self, context: &'static str) -> AnyhowResult<T>
    where
        E: StdError + Send + Sync + 'static;

    /// Adds context to an error with a formatted string.
    fn add_contextf(self, format: impl Display) -> AnyhowResult<T>
    where
        E: StdError + Send + Sync + 'static;
}

impl<T, E> ResultExt<T, E> for Result<T, E> {
    fn add_context(self, context: &'static str) -> AnyhowResult<T>
    where
        E: StdError + Send + Sync + 'static,
    {
        self.context(context)
    }

    fn add_contextf(self, format: impl Display) -> AnyhowResult<T>
    where
        E: StdError + Send + Sync + 'static,
    {
        self.context(format.to_string())
    }
}

/// Centralized error reporting for worker loops.
///
/// Task failures, watch failures and flush failures all end up here so the
/// log format stays uniform across the three background threads.
pub struct ErrorReporter;

impl ErrorReporter {
    /// Reports an expected race (vanished path, object already removed).
    pub fn debug(error: &Error, context: &str) {
        debug!(context = context, error = %error, "Skipped operation");
    }

    /// Reports a recoverable failure; the calling loop continues.
    pub fn warn(error: &Error, context: &str) {
        warn!(context = context, error = %Self::chain_message(error), "Operation failed");
    }

    /// Reports a failure the operator has to act on.
    pub fn error(error: &Error, context: &str) {
        error!(context = context, error = %Self::chain_message(error), "Operation failed");
    }

    /// Formats the whole context chain on one line.
    ///
    /// `anyhow` renders only the outermost context with `{}`; log consumers
    /// want the root cause too.
    pub fn chain_message(error: &Error) -> String {
        error
            .chain()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(": ")
    }
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;

    use crate::error::{
        domain::CatalogError,
        operational::{ErrorReporter, ResultExt},
    };

    fn missing() -> Result<(), CatalogError> {
        Err(CatalogError::NotFound { id: 42 })
    }

    #[test]
    fn test_add_context_wraps_domain_error() {
        let error = missing().add_context("Rescan failed").unwrap_err();
        assert_eq!(error.to_string(), "Rescan failed");
        assert!(error.downcast_ref::<CatalogError>().is_some());
    }

    #[test]
    fn test_add_contextf_formats_path() {
        let error = missing()
            .add_contextf(format!("Failed to import {}", "/media/a.mp3"))
            .unwrap_err();
        assert!(error.to_string().contains("/media/a.mp3"));
    }

    #[test]
    fn test_chain_message_includes_root_cause() {
        let error = missing().add_context("Import failed").unwrap_err();
        assert_eq!(
            ErrorReporter::chain_message(&error),
            "Import failed: Object not found: 42"
        );
        assert_eq!(ErrorReporter::chain_message(&anyhow!("single")), "single");
    }
}
