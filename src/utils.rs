use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Wait for a shutdown signal (Ctrl+C or SIGTERM), then cancel `shutdown`.
///
/// If a handler cannot be installed that signal source is ignored and the
/// other one still applies.
pub async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            warn!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            warn!("Received SIGTERM, initiating graceful shutdown...");
        }
        _ = shutdown.cancelled() => {}
    }

    // In-flight requests observe this through their cancellation token.
    shutdown.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_returns_when_token_cancelled_elsewhere() {
        let token = CancellationToken::new();
        token.cancel();
        shutdown_signal(token.clone()).await;
        assert!(token.is_cancelled());
    }
}
