//! Wiring of the catalog core.
//!
//! The server owns the update coalescer and the content manager and hands
//! them their collaborators explicitly; nothing is reached through globals.

use std::{sync::Arc, time::Duration};

use tracing::info;

use crate::{
    config::ServerSettings,
    content::{ContentManager, ContentOptions},
    error::{domain::Result, operational::ResultExt},
    storage::Storage,
    update::{FatalHandler, UpdateCoalescer, UpdateSink},
};

/// The running catalog core.
pub struct Server {
    settings: ServerSettings,
    updates: Arc<UpdateCoalescer>,
    content: ContentManager,
}

impl Server {
    /// Builds the components; nothing runs until `start`.
    ///
    /// `fatal` is called if flushing container updates fails.
    pub fn new(
        settings: ServerSettings,
        storage: Arc<dyn Storage>,
        sink: Arc<dyn UpdateSink>,
        fatal: FatalHandler,
    ) -> Self {
        let updates = Arc::new(UpdateCoalescer::new(
            storage.clone(),
            sink,
            Duration::from_millis(settings.update_interval_ms),
            fatal,
        ));
        let content = ContentManager::new(storage, updates.clone(), ContentOptions::from(&settings));
        Self {
            settings,
            updates,
            content,
        }
    }

    /// Validates the autoscan configuration and starts every thread.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid autoscan entries or if a component
    /// cannot start.
    pub fn start(&self) -> Result<()> {
        let autoscans = self
            .settings
            .validate()
            .add_context("Invalid autoscan configuration")?;
        self.updates
            .start()
            .add_context("Failed to start update coalescer")?;
        self.content.start(autoscans)?;
        info!("Catalog server started");
        Ok(())
    }

    pub fn content(&self) -> &ContentManager {
        &self.content
    }

    /// Stops the components in reverse start order.
    pub fn shutdown(&self) {
        self.content.shutdown();
        self.updates.shutdown();
        info!("Catalog server stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::{
        fs::{File, create_dir},
        path::PathBuf,
        sync::Arc,
        thread,
        time::{Duration, Instant},
    };

    use tempfile::TempDir;

    use crate::{
        config::{AutoscanEntry, ServerSettings},
        error::domain::UpdateError,
        server::Server,
        storage::{INVALID_OBJECT_ID, MemoryStorage, Storage},
        update::ChannelSink,
    };

    fn timed_entry(location: PathBuf) -> AutoscanEntry {
        AutoscanEntry {
            location,
            mode: Some("timed".to_string()),
            level: Some("basic".to_string()),
            recursive: true,
            interval: Some(3600),
            hidden_files: false,
            persistent: true,
        }
    }

    #[test]
    fn test_server_imports_configured_autoscans() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("movies");
        create_dir(&root).unwrap();
        File::create(root.join("a.mkv")).unwrap();

        let settings = ServerSettings {
            use_inotify: false,
            update_interval_ms: 20,
            autoscan: vec![timed_entry(root.clone())],
            ..ServerSettings::default()
        };
        let storage = Arc::new(MemoryStorage::new());
        let (sink, updates) = ChannelSink::new(16);
        let server = Server::new(
            settings,
            storage.clone(),
            Arc::new(sink),
            Arc::new(|_: &UpdateError| {}),
        );
        server.start().unwrap();

        let imported = || {
            storage.find_object_id_by_path(&root.join("a.mkv")).unwrap() != INVALID_OBJECT_ID
        };
        let start = Instant::now();
        let mut update = None;
        while (update.is_none() || !imported()) && start.elapsed() < Duration::from_secs(5) {
            if let Ok(csv) = updates.try_recv() {
                update = Some(csv);
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(imported());
        assert!(update.is_some_and(|csv| !csv.is_empty()));
        server.shutdown();
    }

    #[test]
    fn test_server_rejects_conflicting_autoscans() {
        let dir = TempDir::new().unwrap();
        let mut inotify = timed_entry(dir.path().to_path_buf());
        inotify.mode = Some("inotify".to_string());
        let settings = ServerSettings {
            use_inotify: false,
            autoscan: vec![timed_entry(dir.path().to_path_buf()), inotify],
            ..ServerSettings::default()
        };
        let (sink, _updates) = ChannelSink::new(1);
        let server = Server::new(
            settings,
            Arc::new(MemoryStorage::new()),
            Arc::new(sink),
            Arc::new(|_: &UpdateError| {}),
        );
        assert!(server.start().is_err());
    }
}
