//! Mediacat - media catalog server
//!
//! Loads the settings, opens the catalog database and keeps the autoscan
//! directories in sync until interrupted.

use std::sync::Arc;

use {
    anyhow::{Context, Result},
    async_channel::bounded,
    tokio::{runtime::Builder, select, signal::ctrl_c},
    tracing::{error, info},
    tracing_subscriber::EnvFilter,
};

use mediacat::{LogSink, Server, SettingsManager, SqliteStorage, UpdateError, error::ErrorReporter};

/// Main entry point for the catalog server.
///
/// The storage drives its own runtime, so the signal runtime is only built
/// once everything else is running.
fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings_manager = SettingsManager::new().context("Failed to load settings")?;
    let settings = settings_manager.get_settings().clone();
    info!("Using settings from {:?}", settings_manager.get_config_path());

    let database = settings.database_path();
    let storage = Arc::new(
        SqliteStorage::open(&database)
            .with_context(|| format!("Failed to open catalog {}", database.display()))?,
    );

    let (fatal_sender, fatal_receiver) = bounded::<String>(1);
    let server = Server::new(
        settings,
        storage,
        Arc::new(LogSink),
        Arc::new(move |e: &UpdateError| {
            error!("Catalog updates can no longer be delivered: {}", e);
            if fatal_sender.try_send(e.to_string()).is_err() {
                error!("Shutdown already requested");
            }
        }),
    );
    if let Err(e) = server.start() {
        ErrorReporter::error(&e, "server startup");
        server.shutdown();
        return Err(e);
    }

    let runtime = Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build signal runtime")?;
    let fatal = runtime.block_on(async {
        select! {
            signal = ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                info!("Interrupted, shutting down");
                Ok::<_, anyhow::Error>(None)
            }
            reason = fatal_receiver.recv() => Ok(reason.ok()),
        }
    })?;

    server.shutdown();
    match fatal {
        Some(reason) => Err(anyhow::anyhow!("Update delivery failed: {reason}")),
        None => Ok(()),
    }
}
