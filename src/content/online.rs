//! Pluggable online content sources.
//!
//! A service publishes remote URL items under `/Online Services/<name>`.
//! Refreshes run as ordinary tasks on the content worker, scheduled by the
//! rescan timer.

use std::{fmt::Debug, time::Duration};

use anyhow::Result as AnyhowResult;

use crate::content::task::CancellationToken;

/// Title of the virtual container holding every service's items.
pub const ONLINE_ROOT_TITLE: &str = "Online Services";

/// One item published by a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnlineItem {
    pub title: String,
    pub url: String,
    pub mime_type: String,
}

impl OnlineItem {
    pub fn new(
        title: impl Into<String>,
        url: impl Into<String>,
        mime_type: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            url: url.into(),
            mime_type: mime_type.into(),
        }
    }
}

/// Remote feed producing URL items.
pub trait OnlineService: Send + Sync + Debug {
    /// Unique name, also used as the container title.
    fn name(&self) -> &str;

    /// Time between refreshes.
    fn refresh_interval(&self) -> Duration;

    /// Fetches the current item set.
    ///
    /// Long fetches should poll `token` and return early once it is
    /// cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error if the feed cannot be read; the previous items are
    /// kept.
    fn fetch(&self, token: &CancellationToken) -> AnyhowResult<Vec<OnlineItem>>;
}

/// Service serving a fixed item list, for configured playlists and tests.
#[derive(Debug, Clone)]
pub struct StaticService {
    name: String,
    interval: Duration,
    items: Vec<OnlineItem>,
}

impl StaticService {
    pub fn new(name: impl Into<String>, interval: Duration, items: Vec<OnlineItem>) -> Self {
        Self {
            name: name.into(),
            interval,
            items,
        }
    }
}

impl OnlineService for StaticService {
    fn name(&self) -> &str {
        &self.name
    }

    fn refresh_interval(&self) -> Duration {
        self.interval
    }

    fn fetch(&self, _token: &CancellationToken) -> AnyhowResult<Vec<OnlineItem>> {
        Ok(self.items.clone())
    }
}
