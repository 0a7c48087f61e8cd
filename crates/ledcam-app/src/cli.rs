//! CLI argument definitions for the ledcam service.
//!
//! Priority resolution: CLI args > env vars > config file > defaults.

use clap::Parser;
use std::path::PathBuf;

use ledcam_core::config::LedcamConfig;

/// ledcam — ingests camera-controller photo and run metadata into SQLite.
#[derive(Parser, Debug)]
#[command(name = "ledcam", version, about)]
pub struct CliArgs {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// SQLite database file.
    #[arg(short = 'd', long = "database")]
    pub database: Option<PathBuf>,

    /// Run root directory to watch (repeatable). Defaults to every run in the store.
    #[arg(short = 'r', long = "run-dir")]
    pub run_dirs: Vec<PathBuf>,

    /// Seconds between poll cycles.
    #[arg(short = 'i', long = "poll-interval")]
    pub poll_interval: Option<u64>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short = 'l', long = "log-level")]
    pub log_level: Option<String>,

    /// Run a single poll cycle and exit.
    #[arg(long = "once")]
    pub once: bool,
}

impl CliArgs {
    /// Resolve the configuration file path.
    ///
    /// Priority: --config flag > LEDCAM_CONFIG env var > ./ledcam.toml.
    pub fn resolve_config_path(&self) -> PathBuf {
        if let Some(ref p) = self.config {
            return p.clone();
        }
        if let Ok(p) = std::env::var("LEDCAM_CONFIG") {
            return PathBuf::from(p);
        }
        PathBuf::from("ledcam.toml")
    }

    /// Overlay command-line values onto the loaded configuration.
    pub fn apply(&self, config: &mut LedcamConfig) {
        if let Some(ref db) = self.database {
            config.storage.database_path = db.clone();
        }
        if !self.run_dirs.is_empty() {
            config.watcher.run_dirs = self.run_dirs.clone();
        }
        if let Some(secs) = self.poll_interval {
            config.watcher.poll_interval_secs = secs;
        }
        if let Some(ref level) = self.log_level {
            config.general.log_level = level.clone();
        }
    }
}
