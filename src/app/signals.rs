//! Signal handling for graceful shutdown
//!
//! A process interrupt (CTRL-C, SIGTERM) cancels the run's
//! [`CancellationToken`], which every in-flight request, transfer and decoder
//! process observes.

use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Cancels a run's token when the process is interrupted
pub struct SignalHandler {
    token: CancellationToken,
}

impl SignalHandler {
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Spawns the task watching for CTRL-C and SIGTERM
    ///
    /// The task also ends, without cancelling anything further, when the
    /// token is cancelled by other means.
    pub fn setup(&self) -> JoinHandle<()> {
        let token = self.token.clone();

        tokio::spawn(async move {
            let ctrl_c = async {
                if let Err(e) = signal::ctrl_c().await {
                    warn!("Failed to install Ctrl+C handler: {}", e);
                    std::future::pending::<()>().await;
                }
            };

            #[cfg(unix)]
            let terminate = async {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut stream) => {
                        stream.recv().await;
                    }
                    Err(e) => {
                        warn!("Failed to install SIGTERM handler: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            };

            #[cfg(not(unix))]
            let terminate = std::future::pending::<()>();

            tokio::select! {
                _ = ctrl_c => {
                    info!("Received Ctrl+C, cancelling run");
                },
                _ = terminate => {
                    info!("Received terminate signal, cancelling run");
                },
                _ = token.cancelled() => return,
            }

            token.cancel();
        })
    }
}

/// Token cancelled on process interrupt, with its watcher task
pub fn shutdown_token() -> (CancellationToken, JoinHandle<()>) {
    let handler = SignalHandler::new(CancellationToken::new());
    let handle = handler.setup();
    (handler.token, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_watcher_ends_when_token_cancelled_elsewhere() {
        let (token, handle) = shutdown_token();
        token.cancel();
        let result = timeout(Duration::from_millis(200), handle).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_child_tokens_observe_cancellation() {
        let handler = SignalHandler::new(CancellationToken::new());
        let _handle = handler.setup();
        let child = handler.token().child_token();

        let token = handler.token().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        });

        let result = timeout(Duration::from_millis(200), child.cancelled()).await;
        assert!(result.is_ok());
    }
}
