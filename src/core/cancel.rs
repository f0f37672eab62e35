// src/core/cancel.rs — Interrupt handling for a run
//
// A run is cancelled through a `CancellationToken`. The controller checks it
// at iteration boundaries only, so a snippet in flight always finishes.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Cancel `token` on the first Ctrl+C (or SIGUSR1 on unix).
///
/// Spawns a listener on the current runtime and returns immediately. A
/// second Ctrl+C falls through to the default handler once the listener has
/// fired, which lets an impatient user kill a stuck backend call.
///
/// The listener ends once the token is cancelled from anywhere, so the
/// returned handle resolves when the run is over.
pub fn install_interrupt_handler(token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let user = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::user_defined1()) {
                Ok(mut sig) => {
                    sig.recv().await;
                }
                Err(e) => {
                    tracing::warn!("Failed to install SIGUSR1 handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let user = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = user => {},
            _ = token.cancelled() => return,
        }

        tracing::info!("Interrupt received, stopping at the next iteration boundary");
        token.cancel();
    })
}
