//! Metadata file loading with bounded retry.
//!
//! The camera controller may still be writing a file when the watcher sees
//! it, so parse failures are retried a few times before the file is deferred
//! to the next poll cycle.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use ledcam_core::config::LoaderConfig;

/// Result of loading one metadata file.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome {
    /// The file parsed as JSON.
    Loaded(Value),
    /// The file exists but has no content yet. Not retried.
    Empty,
    /// Every attempt failed. The file should be retried on a later cycle.
    Unavailable,
}

/// Reads and parses metadata files.
#[derive(Debug, Clone)]
pub struct MetadataLoader {
    attempts: u32,
    retry_delay: Duration,
    cancel: CancellationToken,
}

impl Default for MetadataLoader {
    fn default() -> Self {
        Self::from_config(&LoaderConfig::default())
    }
}

impl MetadataLoader {
    /// `attempts` below one is treated as one.
    pub fn new(attempts: u32, retry_delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            retry_delay,
            cancel: CancellationToken::new(),
        }
    }

    pub fn from_config(config: &LoaderConfig) -> Self {
        Self::new(config.attempts, config.retry_delay())
    }

    /// Abandon the retry backoff when `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    /// Load and parse the file at `path`.
    ///
    /// Reads run on the blocking pool.
    pub async fn load(&self, path: &Path) -> LoadOutcome {
        self.load_with(path, read_blocking).await
    }

    /// Same as [`MetadataLoader::load`] with a custom reader.
    async fn load_with<F, Fut>(&self, path: &Path, mut read: F) -> LoadOutcome
    where
        F: FnMut(PathBuf) -> Fut,
        Fut: Future<Output = std::io::Result<String>>,
    {
        for attempt in 1..=self.attempts {
            match read(path.to_path_buf()).await {
                Ok(content) if content.is_empty() => {
                    warn!(path = %path.display(), "Metadata file is empty, skipping until it is written");
                    return LoadOutcome::Empty;
                }
                Ok(content) => match serde_json::from_str::<Value>(&content) {
                    Ok(value) => return LoadOutcome::Loaded(value),
                    Err(e) => {
                        debug!(path = %path.display(), attempt, error = %e, "Metadata file did not parse");
                    }
                },
                Err(e) => {
                    debug!(path = %path.display(), attempt, error = %e, "Metadata file unreadable");
                }
            }

            if attempt < self.attempts {
                warn!(
                    path = %path.display(),
                    attempt,
                    delay_secs = self.retry_delay.as_secs_f64(),
                    "Unable to load metadata file, retrying"
                );
                tokio::select! {
                    _ = tokio::time::sleep(self.retry_delay) => {}
                    _ = self.cancel.cancelled() => return LoadOutcome::Unavailable,
                }
            }
        }

        warn!(
            path = %path.display(),
            attempts = self.attempts,
            "Metadata file unavailable, will try again next cycle"
        );
        LoadOutcome::Unavailable
    }
}

async fn read_blocking(path: PathBuf) -> std::io::Result<String> {
    tokio::task::spawn_blocking(move || std::fs::read_to_string(path))
        .await
        .map_err(|e| std::io::Error::other(format!("Read task panicked: {}", e)))?
}
