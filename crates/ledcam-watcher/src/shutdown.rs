//! Signal-driven shutdown.
//!
//! A single cancellation token is shared by the watcher loop, the loader's
//! retry backoff, and the signal listener.

use tokio_util::sync::CancellationToken;
use tracing::info;

/// Owns the cancellation token that stops the watcher.
#[derive(Debug, Clone, Default)]
pub struct ShutdownController {
    token: CancellationToken,
}

impl ShutdownController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token to hand to the watcher. Clones share state.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Request shutdown. Safe to call from any task, any number of times.
    pub fn trigger(&self) {
        self.token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait for SIGINT or SIGTERM (ctrl-c elsewhere), then trigger shutdown.
    ///
    /// Returns early without a signal if shutdown was triggered some other way.
    pub async fn wait_for_signal(&self) -> std::io::Result<()> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let mut terminate = signal(SignalKind::terminate())?;
            let mut interrupt = signal(SignalKind::interrupt())?;

            tokio::select! {
                _ = terminate.recv() => info!("Received SIGTERM"),
                _ = interrupt.recv() => info!("Received SIGINT"),
                _ = self.token.cancelled() => return Ok(()),
            }
        }

        #[cfg(not(unix))]
        {
            tokio::select! {
                res = tokio::signal::ctrl_c() => {
                    res?;
                    info!("Received ctrl-c");
                }
                _ = self.token.cancelled() => return Ok(()),
            }
        }

        self.trigger();
        Ok(())
    }
}
