//! Graceful shutdown utilities
//!
//! A capture must be stopped through its cancellation token so the
//! in-flight frame and pending transactions are flushed. These helpers
//! bridge OS signals to that token.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Which signal ended the wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// Ctrl+C (SIGINT)
    Interrupt,
    /// SIGTERM (Unix only)
    Terminate,
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM on Unix)
///
/// On Windows only Ctrl+C is observed. If the SIGTERM handler cannot be
/// installed the function keeps waiting for Ctrl+C alone.
pub async fn wait_for_shutdown() -> ShutdownSignal {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let term_signal = match signal(SignalKind::terminate()) {
            Ok(sig) => Some(sig),
            Err(e) => {
                warn!("SIGTERM handler unavailable: {}. Ctrl+C only", e);
                None
            },
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => ShutdownSignal::Interrupt,
            _ = async {
                match term_signal {
                    Some(mut sig) => {
                        sig.recv().await;
                    },
                    None => std::future::pending::<()>().await,
                }
            } => ShutdownSignal::Terminate,
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        ShutdownSignal::Interrupt
    }
}

/// Cancel `token` when a shutdown signal arrives
///
/// The watcher exits quietly if the token is cancelled by someone else
/// first (e.g. the capture ended because the port closed).
pub fn cancel_on_shutdown(token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            sig = wait_for_shutdown() => {
                info!("Shutdown signal: {:?}", sig);
                token.cancel();
            }
            () = token.cancelled() => {}
        }
    })
}
