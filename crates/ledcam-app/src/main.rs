//! ledcam binary - composition root.
//!
//! 1. Load configuration from TOML and apply CLI overrides
//! 2. Open the SQLite store (fatal if it cannot be opened)
//! 3. Start the directory watcher
//! 4. Stop it cleanly on SIGINT/SIGTERM and exit with status 0

mod cli;

use std::sync::Arc;

use clap::Parser;

use ledcam_core::config::LedcamConfig;
use ledcam_storage::{Database, MetadataRepository};
use ledcam_watcher::{DirectoryWatcher, ShutdownController};

use cli::CliArgs;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    // Config. A missing file means defaults; an unparseable one is fatal.
    let config_file = args.resolve_config_path();
    let mut config = if config_file.exists() {
        LedcamConfig::load(&config_file)?
    } else {
        LedcamConfig::default()
    };
    args.apply(&mut config);

    // Tracing.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.general.log_level)),
        )
        .init();

    tracing::info!("Starting ledcam v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(path = %config_file.display(), found = config_file.exists(), "Configuration resolved");

    // Storage.
    let db = match Database::with_busy_timeout(
        &config.storage.database_path,
        config.storage.busy_timeout(),
    ) {
        Ok(db) => Arc::new(db),
        Err(e) => {
            tracing::error!(path = %config.storage.database_path.display(), error = %e, "Unable to open database");
            return Err(e.into());
        }
    };
    let repo = Arc::new(
        MetadataRepository::new(db).with_metadata_extension(config.watcher.metadata_extension.clone()),
    );

    // Watcher.
    let shutdown = ShutdownController::new();
    let watcher = DirectoryWatcher::from_config(Arc::clone(&repo), &config, shutdown.token());

    if args.once {
        let report = watcher.poll_once().await?;
        tracing::info!(?report, "Single poll cycle complete");
        return Ok(());
    }

    let signals = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = signals.wait_for_signal().await {
            tracing::error!(error = %e, "Failed to install signal handlers");
        }
    });

    watcher.run().await;

    tracing::info!("ledcam stopped");
    Ok(())
}
