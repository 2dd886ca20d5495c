//! Graceful shutdown of the indexer's background tasks.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Owns the cancellation token handed to every background task and the
/// handles needed to wait for them.
pub struct ShutdownManager {
    cancel_token: CancellationToken,
    task_handles: Vec<JoinHandle<()>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self {
            cancel_token: CancellationToken::new(),
            task_handles: Vec::new(),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn register_task(&mut self, handle: JoinHandle<()>) {
        self.task_handles.push(handle);
    }

    /// Wait for Ctrl-C (or SIGTERM on unix), then shut down.
    pub async fn wait_for_shutdown(self) {
        if let Err(e) = wait_for_signal().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        tracing::info!("🛑 Shutdown signal received");
        self.shutdown().await;
    }

    /// Cancel every task and wait for them, giving up after a timeout.
    /// Returns whether all tasks finished in time.
    pub async fn shutdown(mut self) -> bool {
        self.cancel_token.cancel();

        let handles: Vec<_> = self.task_handles.drain(..).collect();
        let drain = async {
            for handle in handles {
                if let Err(e) = handle.await {
                    tracing::warn!("Task ended abnormally: {}", e);
                }
            }
        };

        match tokio::time::timeout(SHUTDOWN_TIMEOUT, drain).await {
            Ok(()) => {
                tracing::info!("✓ All tasks shut down gracefully");
                true
            }
            Err(_) => {
                tracing::warn!("⏱️  Shutdown timeout: Some tasks did not complete");
                false
            }
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_shutdown_cancels_and_waits_for_tasks() {
        let mut manager = ShutdownManager::new();
        let stopped = Arc::new(AtomicBool::new(false));

        let token = manager.token();
        let flag = stopped.clone();
        manager.register_task(tokio::spawn(async move {
            token.cancelled().await;
            flag.store(true, Ordering::SeqCst);
        }));

        assert!(manager.shutdown().await);
        assert!(stopped.load(Ordering::SeqCst));
    }
}
